//! Slot attribution: which slot epoch hosted a job.
//!
//! Slot names are reused across startd restarts, so a job is matched to the
//! epoch of its (parent) slot that most recently started at or before the
//! job's reference time.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};

use crate::ad::JobRecord;
use crate::epoch::EpochId;
use crate::ledger::STATUS_HELD;
use crate::scheduler::QueryMode;
use crate::store::SlotStore;

/// Collapses a dynamic slot name onto its partitionable parent.
///
/// `slot1_3@host` becomes `slot1@host`; any other name is returned as is.
pub fn parent_slot_name(name: &str) -> String {
    let (slot, host) = match name.split_once('@') {
        Some((slot, host)) => (slot, Some(host)),
        None => (name, None),
    };

    let parent = collapse_dynamic(slot).unwrap_or(slot);
    match host {
        Some(host) => format!("{parent}@{host}"),
        None => parent.to_string(),
    }
}

/// `slotN_M...` to `slotN`, when `N` and `M` are both non-empty digit runs.
fn collapse_dynamic(slot: &str) -> Option<&str> {
    let digits = slot.strip_prefix("slot")?;
    let n_len = digits.bytes().take_while(u8::is_ascii_digit).count();
    if n_len == 0 {
        return None;
    }

    let rest = digits[n_len..].strip_prefix('_')?;
    if !rest.bytes().next().is_some_and(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(&slot[.."slot".len() + n_len])
}

/// Time at which the job last (re)started on its slot.
///
/// History jobs use `JobCurrentStartDate`. Queue jobs use it only while held;
/// otherwise the vacated run began at `JobLastStartDate`.
pub fn reference_time(job: &JobRecord, mode: QueryMode) -> DateTime<Utc> {
    match mode {
        QueryMode::History => job.job_current_start_date,
        QueryMode::Queue if job.job_status == STATUS_HELD => job.job_current_start_date,
        QueryMode::Queue => epoch_seconds(job.job_last_start_date),
    }
}

fn epoch_seconds(seconds: f64) -> DateTime<Utc> {
    if !seconds.is_finite() {
        return DateTime::<Utc>::UNIX_EPOCH;
    }
    Utc.timestamp_millis_opt((seconds * 1000.0).round() as i64)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Query for the latest epoch of `slot` that started at or before `not_after`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochLookup {
    pub slot: String,
    pub not_after: DateTime<Utc>,
}

impl EpochLookup {
    pub fn for_job(job: &JobRecord, mode: QueryMode) -> Self {
        Self {
            slot: parent_slot_name(&job.last_remote_host),
            not_after: reference_time(job, mode),
        }
    }
}

/// Epoch start times per slot name.
#[derive(Debug, Default)]
pub struct EpochIndex {
    by_slot: HashMap<String, BTreeMap<DateTime<Utc>, EpochId>>,
}

impl EpochIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: &str, daemon_start: DateTime<Utc>, id: EpochId) {
        self.by_slot
            .entry(slot.to_string())
            .or_default()
            .insert(daemon_start, id);
    }

    /// The epoch with the greatest start time `<= lookup.not_after`.
    pub fn find(&self, lookup: &EpochLookup) -> Option<&EpochId> {
        self.by_slot
            .get(&lookup.slot)?
            .range(..=lookup.not_after)
            .next_back()
            .map(|(_, id)| id)
    }

    pub fn len(&self) -> usize {
        self.by_slot.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slot.is_empty()
    }
}

/// Resolves the hosting epoch of every job with one batched store lookup.
///
/// Results pair with `jobs` by position. An empty batch makes no request.
pub async fn attribute_batch<S: SlotStore>(
    store: &S,
    jobs: &[JobRecord],
    mode: QueryMode,
) -> Result<Vec<Option<EpochId>>> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let lookups: Vec<EpochLookup> = jobs
        .iter()
        .map(|job| EpochLookup::for_job(job, mode))
        .collect();

    let found = store.find_epochs(&lookups).await?;
    if found.len() != lookups.len() {
        bail!(
            "epoch lookup returned {} results for {} jobs",
            found.len(),
            lookups.len()
        );
    }

    Ok(found)
}
