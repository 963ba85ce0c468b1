//! Scheduler query interface.
//!
//! A [`ScheduleSource`] answers three questions for one pool: which slots
//! heartbeated recently, which schedds exist, and which jobs on a schedd
//! match a constraint in either queue or history mode.

pub mod rest;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ad::{JobRecord, RawAd, JOB_FIELDS};

pub use rest::RestClient;

/// Whether jobs are read from the live queue or from completed history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMode {
    Queue,
    History,
}

impl QueryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::History => "history",
        }
    }
}

/// Watermark of the newest history ad already processed for a schedd.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryCursor {
    pub cluster_id: f64,
    pub entered_current_status: DateTime<Utc>,
}

impl HistoryCursor {
    /// Whether `job` entered its current status after this watermark.
    pub fn is_before(&self, job: &JobRecord) -> bool {
        job.entered_current_status > self.entered_current_status
    }

    /// Start of the next history scan: the watermark minus `overlap`.
    ///
    /// Jobs inside the overlap are read again so ones that could not be
    /// attributed or written last time get another chance; the ledger
    /// absorbs the repeats.
    pub fn scan_from(&self, overlap: Duration) -> Option<DateTime<Utc>> {
        let overlap = chrono::Duration::from_std(overlap).ok()?;
        self.entered_current_status.checked_sub_signed(overlap)
    }

    /// Moves the watermark forward to `job` if it is newer.
    pub fn advance(cursor: &mut Option<HistoryCursor>, job: &JobRecord) {
        let newer = match cursor {
            Some(current) => {
                (job.entered_current_status, job.cluster_id)
                    > (current.entered_current_status, current.cluster_id)
            }
            None => true,
        };

        if newer {
            *cursor = Some(HistoryCursor {
                cluster_id: job.cluster_id,
                entered_current_status: job.entered_current_status,
            });
        }
    }
}

/// A job query against one schedd.
#[derive(Debug, Clone, PartialEq)]
pub struct JobQuery {
    pub mode: QueryMode,
    pub constraint: String,
    pub projection: Vec<String>,
    /// Watermark the constraint was built from, if any.
    pub since: Option<HistoryCursor>,
    /// Maximum ads returned by a history query.
    pub limit: usize,
}

/// Source of raw ads for one pool.
pub trait ScheduleSource: Send + Sync {
    /// Pool name, used as a log and metric label.
    fn pool(&self) -> &str;

    /// Startd ads with `LastHeardFrom` at or after `since`.
    fn machines(
        &self,
        since: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<RawAd>>> + Send;

    /// Names of the pool's schedds.
    fn schedds(&self) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;

    /// Job ads on `schedd` matching `query`.
    fn jobs(
        &self,
        schedd: &str,
        query: &JobQuery,
    ) -> impl std::future::Future<Output = Result<Vec<RawAd>>> + Send;
}

/// Attributes requested for job ads.
pub fn job_projection() -> Vec<String> {
    JOB_FIELDS
        .iter()
        .map(|(key, _)| key.to_string())
        .chain(["RequestGpus", "RequestGPUs"].map(String::from))
        .collect()
}

/// Attributes requested for startd ads.
pub const MACHINE_PROJECTION: &[&str] = &[
    "Name",
    "DaemonStartTime",
    "LastHeardFrom",
    "TotalCpus",
    "TotalGPUs",
    "TotalMemory",
    "TotalDisk",
    "GLIDEIN_Site",
    "GLIDEIN_Country",
    "GLIDEIN_Institution",
    "GLIDEIN_ResourceName",
];

/// Queue constraint selecting recently evicted and recently held jobs.
pub fn queue_constraint(now: DateTime<Utc>, lookback: Duration, min_walltime: Duration) -> String {
    let after = now.timestamp() - lookback.as_secs() as i64;
    format!(
        "((LastVacateTime > {after}) && ((LastVacateTime-JobLastStartDate))>{})\
         || ((JobStatus == 5) && (EnteredCurrentStatus > {after}))",
        min_walltime.as_secs()
    )
}

/// History constraint: jobs that ran somewhere and entered their current
/// status at or after the scan start.
///
/// Without a watermark the scan starts `lookback` before `now`; with one it
/// starts `lookback` before the watermark.
pub fn history_constraint(
    now: DateTime<Utc>,
    lookback: Duration,
    since: Option<&HistoryCursor>,
) -> Result<String> {
    let start = match since {
        Some(cursor) => cursor.scan_from(lookback),
        None => chrono::Duration::from_std(lookback)
            .ok()
            .and_then(|d| now.checked_sub_signed(d)),
    }
    .context("history lookback out of range")?;

    Ok(format!(
        "!isUndefined(LastRemoteHost) && (EnteredCurrentStatus >= {})",
        start.timestamp()
    ))
}

/// Startd constraint for heartbeats at or after `since`.
pub fn machine_constraint(since: DateTime<Utc>) -> String {
    format!("LastHeardFrom >= {}", since.timestamp())
}
