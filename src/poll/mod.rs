//! One polling cycle against one pool.
//!
//! Machine heartbeats are written before any job claims, so a job can find
//! the epoch it ran in when that epoch was first seen in the same cycle.
//! Jobs come from two scans per schedd: recent evictions and holds in the
//! live queue, and terminated jobs in history since the schedd's cursor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ad::{normalize, JobRecord, MachineAd, NormalizeError, RawAd};
use crate::attribution::{attribute_batch, parent_slot_name};
use crate::config::{Config, PollConfig};
use crate::export::HealthMetrics;
use crate::ledger::{classify, classify_usage, ClaimRequest, GoodputRule, OutcomePolicy};
use crate::scheduler::{
    history_constraint, job_projection, queue_constraint, HistoryCursor, JobQuery, QueryMode,
    ScheduleSource,
};
use crate::store::{EpochUpdate, SlotStore};

/// History watermarks for the schedds of one pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursors(BTreeMap<String, HistoryCursor>);

impl Cursors {
    pub fn get(&self, schedd: &str) -> Option<HistoryCursor> {
        self.0.get(schedd).copied()
    }

    pub fn set(&mut self, schedd: &str, cursor: HistoryCursor) {
        self.0.insert(schedd.to_string(), cursor);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// JSON file holding the cursors of every pool, keyed by pool name.
pub struct CursorFile {
    path: PathBuf,
    pools: parking_lot::Mutex<BTreeMap<String, Cursors>>,
}

impl CursorFile {
    /// Opens `path`; a missing file starts with no cursors.
    pub fn open(path: &Path) -> Result<Self> {
        let pools = match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("parsing cursor file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading cursor file {}", path.display()))
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            pools: parking_lot::Mutex::new(pools),
        })
    }

    pub fn cursors(&self, pool: &str) -> Cursors {
        self.pools.lock().get(pool).cloned().unwrap_or_default()
    }

    /// Replaces `pool`'s cursors and rewrites the file.
    pub fn save(&self, pool: &str, cursors: &Cursors) -> Result<()> {
        let data = {
            let mut pools = self.pools.lock();
            pools.insert(pool.to_string(), cursors.clone());
            serde_json::to_vec_pretty(&*pools).context("serializing cursors")?
        };

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data)
            .with_context(|| format!("writing cursor file {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing cursor file {}", self.path.display()))
    }
}

/// Settings shared by every cycle.
pub struct PollContext<'a> {
    pub poll: &'a PollConfig,
    pub policy: OutcomePolicy,
    pub goodput: GoodputRule,
    pub history_limit: usize,
    pub projection: Vec<String>,
    pub health: Option<&'a HealthMetrics>,
}

impl<'a> PollContext<'a> {
    pub fn new(cfg: &'a Config, health: Option<&'a HealthMetrics>) -> Self {
        Self {
            poll: &cfg.poll,
            policy: cfg.outcome.policy(),
            goodput: cfg.outcome.goodput,
            history_limit: cfg.scheduler.history_match,
            projection: job_projection(),
            health,
        }
    }
}

/// Counts from one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub machines: usize,
    pub machines_invalid: usize,
    pub schedds: usize,
    pub schedd_errors: usize,
    pub jobs_seen: usize,
    pub jobs_dropped: usize,
    pub jobs_without_walltime: usize,
    pub jobs_unattributed: usize,
    pub jobs_counted: usize,
    pub claims_applied: usize,
    pub claims_duplicate: usize,
    pub claim_failures: usize,
}

/// Runs one cycle for `source`'s pool, advancing `cursors`.
///
/// Fails only when the machine scan cannot be read or written; errors on a
/// single schedd are logged and the remaining schedds are still polled.
pub async fn run_cycle<Src, S>(
    ctx: &PollContext<'_>,
    source: &Src,
    store: &S,
    cursors: &mut Cursors,
    now: DateTime<Utc>,
) -> Result<CycleReport>
where
    Src: ScheduleSource,
    S: SlotStore,
{
    let pool = source.pool();
    let mut report = CycleReport::default();

    upsert_machines(ctx, source, store, now, &mut report).await?;

    let schedds = source.schedds().await.context("listing schedds")?;
    report.schedds = schedds.len();

    for schedd in &schedds {
        if let Err(e) = poll_queue(ctx, source, store, schedd, now, &mut report).await {
            report.schedd_errors += 1;
            record_schedd_error(ctx, pool, QueryMode::Queue);
            warn!(pool, schedd = %schedd, error = %format!("{e:#}"), "queue scan failed");
        }

        let mut cursor = cursors.get(schedd);
        match poll_history(ctx, source, store, schedd, &mut cursor, now, &mut report).await {
            Ok(()) => {
                if let Some(c) = cursor {
                    cursors.set(schedd, c);
                }
            }
            Err(e) => {
                report.schedd_errors += 1;
                record_schedd_error(ctx, pool, QueryMode::History);
                warn!(pool, schedd = %schedd, error = %format!("{e:#}"), "history scan failed");
            }
        }
    }

    info!(
        pool,
        machines = report.machines,
        schedds = report.schedds,
        jobs = report.jobs_seen,
        claims = report.claims_applied,
        duplicates = report.claims_duplicate,
        unattributed = report.jobs_unattributed,
        failures = report.claim_failures,
        "poll cycle complete"
    );

    Ok(report)
}

async fn upsert_machines<Src: ScheduleSource, S: SlotStore>(
    ctx: &PollContext<'_>,
    source: &Src,
    store: &S,
    now: DateTime<Utc>,
    report: &mut CycleReport,
) -> Result<()> {
    let pool = source.pool();
    let since = now - chrono::Duration::from_std(ctx.poll.machine_lookback)
        .context("machine_lookback out of range")?;

    let raw = source.machines(since).await.context("querying machine ads")?;

    let mut updates = Vec::with_capacity(raw.len());
    for ad in &raw {
        match MachineAd::from_raw(ad) {
            Ok(machine) => updates.push(EpochUpdate::heartbeat(machine)),
            Err(e) => {
                report.machines_invalid += 1;
                debug!(pool, error = %e, "skipping machine ad");
            }
        }
    }

    let written = store
        .apply(updates)
        .await
        .context("writing machine heartbeats")?;
    written.log_failures("heartbeat");

    report.machines = written.succeeded();

    if let Some(h) = ctx.health {
        h.machines_upserted
            .with_label_values(&[pool])
            .inc_by(written.succeeded() as f64);
        h.machine_ads_invalid
            .with_label_values(&[pool])
            .inc_by(report.machines_invalid as f64);
    }

    Ok(())
}

async fn poll_queue<Src: ScheduleSource, S: SlotStore>(
    ctx: &PollContext<'_>,
    source: &Src,
    store: &S,
    schedd: &str,
    now: DateTime<Utc>,
    report: &mut CycleReport,
) -> Result<()> {
    let query = JobQuery {
        mode: QueryMode::Queue,
        constraint: queue_constraint(
            now,
            ctx.poll.eviction_lookback,
            ctx.poll.min_evicted_walltime,
        ),
        projection: ctx.projection.clone(),
        since: None,
        limit: ctx.history_limit,
    };

    let raw = source
        .jobs(schedd, &query)
        .await
        .with_context(|| format!("querying queue of {schedd}"))?;

    let jobs = normalize_all(ctx, source.pool(), &raw, now, report);
    claim_jobs(ctx, source.pool(), store, jobs, QueryMode::Queue, report).await
}

async fn poll_history<Src: ScheduleSource, S: SlotStore>(
    ctx: &PollContext<'_>,
    source: &Src,
    store: &S,
    schedd: &str,
    cursor: &mut Option<HistoryCursor>,
    now: DateTime<Utc>,
    report: &mut CycleReport,
) -> Result<()> {
    let since = *cursor;
    let query = JobQuery {
        mode: QueryMode::History,
        constraint: history_constraint(now, ctx.poll.history_lookback, since.as_ref())?,
        projection: ctx.projection.clone(),
        since,
        limit: ctx.history_limit,
    };

    let raw = source
        .jobs(schedd, &query)
        .await
        .with_context(|| format!("querying history of {schedd}"))?;

    let jobs = normalize_all(ctx, source.pool(), &raw, now, report);
    for job in &jobs {
        // Ads inside the overlap were counted by an earlier scan.
        if let Some(h) = ctx.health {
            if since.map_or(true, |c| c.is_before(job)) {
                h.record_job(job, classify_usage(job, &ctx.goodput));
            }
        }
        HistoryCursor::advance(cursor, job);
    }

    claim_jobs(ctx, source.pool(), store, jobs, QueryMode::History, report).await
}

/// Normalizes every ad, dropping those without a job id.
fn normalize_all(
    ctx: &PollContext<'_>,
    pool: &str,
    raw: &[RawAd],
    now: DateTime<Utc>,
    report: &mut CycleReport,
) -> Vec<JobRecord> {
    report.jobs_seen += raw.len();

    raw.iter()
        .filter_map(|ad| match normalize(ad, now) {
            Ok(job) => Some(job),
            Err(NormalizeError::MissingJobId) => {
                report.jobs_dropped += 1;
                if let Some(h) = ctx.health {
                    h.jobs_dropped
                        .with_label_values(&[pool, "missing_job_id"])
                        .inc();
                }
                warn!(
                    pool,
                    owner = ad.get("Owner").and_then(|v| v.as_str()).unwrap_or_default(),
                    cluster = ad.get("ClusterId").map(|v| v.to_string()).unwrap_or_default(),
                    "dropping job ad without GlobalJobId"
                );
                None
            }
        })
        .collect()
}

/// Classifies, attributes and records claims for a batch of jobs.
async fn claim_jobs<S: SlotStore>(
    ctx: &PollContext<'_>,
    pool: &str,
    store: &S,
    jobs: Vec<JobRecord>,
    mode: QueryMode,
    report: &mut CycleReport,
) -> Result<()> {
    let mut claimable = Vec::with_capacity(jobs.len());
    let mut classifications = Vec::with_capacity(jobs.len());
    for job in jobs {
        let classification = classify(&job, mode, &ctx.policy);
        if classification.walltime.is_nan() || classification.walltime <= 0.0 {
            report.jobs_without_walltime += 1;
            debug!(pool, job = %job.global_job_id, mode = mode.as_str(), "skipping job without walltime");
            continue;
        }
        claimable.push(job);
        classifications.push(classification);
    }

    if claimable.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    let epochs = attribute_batch(store, &claimable, mode)
        .await
        .context("attributing jobs to slot epochs")?;

    let mut updates = Vec::with_capacity(claimable.len());
    for ((job, classification), epoch) in claimable.iter().zip(classifications).zip(epochs) {
        match epoch {
            Some(epoch) => {
                updates.push(EpochUpdate::claim(epoch, ClaimRequest::new(job, classification)));
            }
            None => {
                report.jobs_unattributed += 1;
                if let Some(h) = ctx.health {
                    h.jobs_unattributed
                        .with_label_values(&[pool, mode.as_str()])
                        .inc();
                }
                debug!(
                    pool,
                    job = %job.global_job_id,
                    slot = %parent_slot_name(&job.last_remote_host),
                    mode = mode.as_str(),
                    "no slot epoch for job"
                );
            }
        }
    }

    report.jobs_counted += updates.len();

    let written = store.apply(updates).await.context("writing job claims")?;
    written.log_failures("claim");

    report.claims_applied += written.created + written.updated;
    report.claims_duplicate += written.noop;
    report.claim_failures += written.failures.len();

    if let Some(h) = ctx.health {
        h.record_claims(pool, mode, &written);
    }

    debug!(
        pool,
        mode = mode.as_str(),
        applied = written.updated,
        duplicate = written.noop,
        failed = written.failures.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "claims written"
    );

    Ok(())
}

fn record_schedd_error(ctx: &PollContext<'_>, pool: &str, mode: QueryMode) {
    if let Some(h) = ctx.health {
        h.schedd_errors.with_label_values(&[pool, mode.as_str()]).inc();
    }
}
