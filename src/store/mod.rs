//! Slot epoch storage.
//!
//! Every change to an epoch goes through [`apply_mutation`]: a heartbeat
//! creates or merges the epoch, a claim is recorded in the ledger, and
//! occupancy is recomputed in the same step. Backends only decide how that
//! read-modify-write is made atomic per document.

pub mod elastic;
pub mod memory;
pub mod retry;

use anyhow::Result;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::ad::MachineAd;
use crate::attribution::EpochLookup;
use crate::epoch::{EpochId, GroupKey, MachineAdRecord};
use crate::ledger::{record_claim, ClaimRequest, ClaimResult};
use crate::occupancy::recalculate;

pub use elastic::ElasticStore;
pub use memory::MemoryStore;

/// A change to one slot epoch.
#[derive(Debug, Clone, PartialEq)]
pub enum EpochMutation {
    Heartbeat(MachineAd),
    Claim(ClaimRequest),
}

/// A mutation addressed to an epoch document.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochUpdate {
    pub epoch: EpochId,
    pub mutation: EpochMutation,
}

impl EpochUpdate {
    pub fn heartbeat(ad: MachineAd) -> Self {
        Self {
            epoch: ad.epoch_id(),
            mutation: EpochMutation::Heartbeat(ad),
        }
    }

    pub fn claim(epoch: EpochId, claim: ClaimRequest) -> Self {
        Self {
            epoch,
            mutation: EpochMutation::Claim(claim),
        }
    }
}

/// Effect of one mutation on its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Created,
    Updated,
    Noop,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("epoch {0} not found")]
    NotFound(String),
    #[error("version conflict on {0}")]
    Conflict(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transient failure: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Applies `update` to the current state of its epoch.
///
/// A claim against a missing epoch fails with [`StoreError::NotFound`] and
/// leaves `current` untouched.
pub fn apply_mutation(
    current: &mut Option<MachineAdRecord>,
    update: &EpochUpdate,
) -> Result<MutationOutcome, StoreError> {
    let record = match current {
        Some(record) => record,
        None => {
            return match &update.mutation {
                EpochMutation::Heartbeat(ad) => {
                    let mut record = MachineAdRecord::from_ad(ad);
                    recalculate(&mut record);
                    *current = Some(record);
                    Ok(MutationOutcome::Created)
                }
                EpochMutation::Claim(_) => Err(StoreError::NotFound(update.epoch.to_string())),
            };
        }
    };

    match &update.mutation {
        EpochMutation::Heartbeat(ad) => {
            let before = record.clone();
            record.merge_heartbeat(ad);
            recalculate(record);
            if *record == before {
                Ok(MutationOutcome::Noop)
            } else {
                Ok(MutationOutcome::Updated)
            }
        }
        EpochMutation::Claim(claim) => match record_claim(record, claim) {
            ClaimResult::Duplicate => Ok(MutationOutcome::Noop),
            ClaimResult::Applied => {
                recalculate(record);
                Ok(MutationOutcome::Updated)
            }
        },
    }
}

/// A mutation that could not be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DocFailure {
    pub epoch: EpochId,
    pub error: StoreError,
}

/// Per-mutation results of a bulk apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    pub created: usize,
    pub updated: usize,
    pub noop: usize,
    pub failures: Vec<DocFailure>,
}

impl BulkReport {
    pub fn record(&mut self, outcome: MutationOutcome) {
        match outcome {
            MutationOutcome::Created => self.created += 1,
            MutationOutcome::Updated => self.updated += 1,
            MutationOutcome::Noop => self.noop += 1,
        }
    }

    pub fn fail(&mut self, epoch: EpochId, error: StoreError) {
        self.failures.push(DocFailure { epoch, error });
    }

    /// Mutations that took effect or were already in effect.
    pub fn succeeded(&self) -> usize {
        self.created + self.updated + self.noop
    }

    /// Logs every failed document individually.
    pub fn log_failures(&self, operation: &str) {
        for failure in &self.failures {
            warn!(
                operation,
                epoch = %failure.epoch,
                error = %failure.error,
                "epoch update failed",
            );
        }
    }
}

/// Epochs whose lifetime overlaps `[after, before)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub after: DateTime<Utc>,
    pub before: DateTime<Utc>,
}

impl ScanWindow {
    pub fn contains(&self, record: &MachineAdRecord) -> bool {
        record.daemon_start < self.before && record.last_heard_from >= self.after
    }
}

/// Position after the last epoch of a scan page.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScanCursor {
    pub key: GroupKey,
    pub epoch: EpochId,
}

impl ScanCursor {
    pub fn after(key: GroupKey, record: &MachineAdRecord) -> Self {
        Self {
            key,
            epoch: record.epoch_id.clone(),
        }
    }
}

/// One page of a scan, ordered by group key then epoch id.
#[derive(Debug, Clone, Default)]
pub struct EpochPage {
    pub records: Vec<MachineAdRecord>,
    /// Cursor for the next page; `None` when the scan is complete.
    pub next: Option<ScanCursor>,
}

/// Backing store for slot epochs.
pub trait SlotStore: Send + Sync {
    /// Applies updates in order, each atomically against its document.
    fn apply(
        &self,
        updates: Vec<EpochUpdate>,
    ) -> impl std::future::Future<Output = Result<BulkReport>> + Send;

    /// Resolves each lookup to an epoch id, in one round trip.
    fn find_epochs(
        &self,
        lookups: &[EpochLookup],
    ) -> impl std::future::Future<Output = Result<Vec<Option<EpochId>>>> + Send;

    /// Epochs in `window` with every grouping label set, in
    /// `(group key, epoch id)` order, starting after `cursor`.
    fn scan_epochs(
        &self,
        window: &ScanWindow,
        cursor: Option<&ScanCursor>,
        size: usize,
    ) -> impl std::future::Future<Output = Result<EpochPage>> + Send;
}

/// Configured store backend.
pub enum Backend {
    Memory(MemoryStore),
    Elastic(ElasticStore),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Elastic(_) => "elasticsearch",
        }
    }
}

impl SlotStore for Backend {
    async fn apply(&self, updates: Vec<EpochUpdate>) -> Result<BulkReport> {
        match self {
            Self::Memory(s) => s.apply(updates).await,
            Self::Elastic(s) => s.apply(updates).await,
        }
    }

    async fn find_epochs(&self, lookups: &[EpochLookup]) -> Result<Vec<Option<EpochId>>> {
        match self {
            Self::Memory(s) => s.find_epochs(lookups).await,
            Self::Elastic(s) => s.find_epochs(lookups).await,
        }
    }

    async fn scan_epochs(
        &self,
        window: &ScanWindow,
        cursor: Option<&ScanCursor>,
        size: usize,
    ) -> Result<EpochPage> {
        match self {
            Self::Memory(s) => s.scan_epochs(window, cursor, size).await,
            Self::Elastic(s) => s.scan_epochs(window, cursor, size).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::ledger::Outcome;
    use crate::resource::ResourceMap;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid ts")
    }

    fn heartbeat(last_heard: i64) -> EpochUpdate {
        EpochUpdate::heartbeat(MachineAd {
            name: "slotA@h1".to_string(),
            daemon_start: at(0),
            last_heard_from: at(last_heard),
            totals: ResourceMap {
                cpus: Some(4.0),
                ..Default::default()
            },
            site: None,
            country: None,
            institution: None,
            resource: None,
        })
    }

    fn claim(job_id: &str) -> EpochUpdate {
        EpochUpdate::claim(
            EpochId::new("slotA@h1", at(0)),
            ClaimRequest {
                job_id: job_id.to_string(),
                outcome: Outcome::Evicted,
                resource_time: ResourceMap {
                    cpus: 3_600.0,
                    ..Default::default()
                },
            },
        )
    }

    #[test]
    fn test_heartbeat_creates_then_updates() {
        let mut current = None;
        assert_eq!(
            apply_mutation(&mut current, &heartbeat(1_800)),
            Ok(MutationOutcome::Created)
        );
        assert_eq!(current.as_ref().and_then(|r| r.duration), Some(1_800));

        assert_eq!(
            apply_mutation(&mut current, &heartbeat(3_600)),
            Ok(MutationOutcome::Updated)
        );
        assert_eq!(
            apply_mutation(&mut current, &heartbeat(3_600)),
            Ok(MutationOutcome::Noop)
        );
    }

    #[test]
    fn test_claim_requires_existing_epoch() {
        let mut current = None;
        let err = apply_mutation(&mut current, &claim("j1")).expect_err("missing epoch");
        assert_eq!(err, StoreError::NotFound("0-slotA@h1".to_string()));
        assert!(current.is_none());
    }

    #[test]
    fn test_claim_recalculates_in_same_step() {
        let mut current = None;
        apply_mutation(&mut current, &heartbeat(3_600)).expect("create");

        assert_eq!(
            apply_mutation(&mut current, &claim("j1")),
            Ok(MutationOutcome::Updated)
        );
        let record = current.as_ref().expect("record");
        assert_eq!(record.claims.evicted.cpus, 3_600.0);
        assert!((record.occupancy.by_outcome.evicted.cpus - 0.25).abs() < 1e-12);
        assert_eq!(record.duration, Some(3_600));

        assert_eq!(
            apply_mutation(&mut current, &claim("j1")),
            Ok(MutationOutcome::Noop)
        );
    }

    #[test]
    fn test_bulk_report_counts() {
        let mut report = BulkReport::default();
        report.record(MutationOutcome::Created);
        report.record(MutationOutcome::Noop);
        report.fail(EpochId::from("x".to_string()), StoreError::Rejected("bad".to_string()));

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failures.len(), 1);
        report.log_failures("test");
    }

    #[test]
    fn test_scan_window_overlap() {
        let window = ScanWindow {
            after: at(100),
            before: at(200),
        };
        let mut current = None;
        apply_mutation(&mut current, &heartbeat(150)).expect("create");
        let mut record = current.expect("record");

        assert!(window.contains(&record));

        record.last_heard_from = at(99);
        assert!(!window.contains(&record));

        record.last_heard_from = at(300);
        record.daemon_start = at(200);
        assert!(!window.contains(&record));
    }
}
