//! Claims ledger: per slot epoch, resource-time claimed by each job outcome.
//!
//! Every job is classified exactly once into an [`Outcome`] by [`classify`],
//! turned into a [`ClaimRequest`], and recorded against its slot epoch with
//! [`record_claim`]. A per-outcome set of already-counted job ids makes the
//! operation idempotent under replay.

use std::collections::BTreeSet;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::ad::JobRecord;
use crate::epoch::MachineAdRecord;
use crate::resource::{Resource, ResourceMap};
use crate::scheduler::QueryMode;

/// JobStatus value of a removed job.
pub const STATUS_REMOVED: f64 = 3.0;
/// JobStatus value of a completed job.
pub const STATUS_COMPLETED: f64 = 4.0;
/// JobStatus value of a held job.
pub const STATUS_HELD: f64 = 5.0;

/// Outcome category a job's resource-time is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Evicted,
    Removed,
    Finished,
    Failed,
}

impl Outcome {
    pub const ALL: [Outcome; 4] = [
        Outcome::Evicted,
        Outcome::Removed,
        Outcome::Finished,
        Outcome::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Evicted => "evicted",
            Self::Removed => "removed",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// One value per outcome category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ByOutcome<T> {
    #[serde(default)]
    pub evicted: T,
    #[serde(default)]
    pub removed: T,
    #[serde(default)]
    pub finished: T,
    #[serde(default)]
    pub failed: T,
}

impl<T> ByOutcome<T> {
    pub fn iter(&self) -> impl Iterator<Item = (Outcome, &T)> {
        Outcome::ALL.into_iter().map(move |o| (o, &self[o]))
    }
}

impl<T> Index<Outcome> for ByOutcome<T> {
    type Output = T;

    fn index(&self, outcome: Outcome) -> &T {
        match outcome {
            Outcome::Evicted => &self.evicted,
            Outcome::Removed => &self.removed,
            Outcome::Finished => &self.finished,
            Outcome::Failed => &self.failed,
        }
    }
}

impl<T> IndexMut<Outcome> for ByOutcome<T> {
    fn index_mut(&mut self, outcome: Outcome) -> &mut T {
        match outcome {
            Outcome::Evicted => &mut self.evicted,
            Outcome::Removed => &mut self.removed,
            Outcome::Finished => &mut self.finished,
            Outcome::Failed => &mut self.failed,
        }
    }
}

/// Checks applied, in configured order, before the exit code decides a
/// terminated job's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryCheck {
    /// `JobStatus == 3` classifies as removed.
    RemovedStatus,
    /// `ExitBySignal` classifies as failed.
    ExitSignal,
}

/// Outcome classification policy for terminated (history) jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomePolicy {
    pub history_checks: Vec<HistoryCheck>,
}

impl Default for OutcomePolicy {
    fn default() -> Self {
        Self {
            history_checks: vec![HistoryCheck::RemovedStatus],
        }
    }
}

/// Result of classifying a job: its outcome and the seconds it occupied the slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub outcome: Outcome,
    pub walltime: f64,
}

/// Classifies a job into exactly one outcome.
///
/// Queue jobs are either held (folded into removed, so a later removal is not
/// counted twice) or evicted. History jobs run through the policy's checks
/// and are finished or failed by exit code otherwise.
pub fn classify(job: &JobRecord, mode: QueryMode, policy: &OutcomePolicy) -> Classification {
    let since_current_start = job.entered_current_status.timestamp() as f64
        - job.job_current_start_date.timestamp() as f64;

    match mode {
        QueryMode::Queue if job.job_status == STATUS_HELD => Classification {
            outcome: Outcome::Removed,
            walltime: since_current_start,
        },
        QueryMode::Queue => Classification {
            outcome: Outcome::Evicted,
            walltime: job.last_vacate_time - job.job_last_start_date,
        },
        QueryMode::History => {
            let decided = policy.history_checks.iter().find_map(|check| match check {
                HistoryCheck::RemovedStatus if job.job_status == STATUS_REMOVED => {
                    Some(Outcome::Removed)
                }
                HistoryCheck::ExitSignal if job.exit_by_signal => Some(Outcome::Failed),
                _ => None,
            });

            let outcome = decided.unwrap_or(if job.exit_code == 0.0 {
                Outcome::Finished
            } else {
                Outcome::Failed
            });

            Classification {
                outcome,
                walltime: since_current_start,
            }
        }
    }
}

/// Good/bad usage label for job metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Goodput,
    Badput,
}

impl Usage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Goodput => "goodput",
            Self::Badput => "badput",
        }
    }
}

/// Which conditions a job must meet to count as goodput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct GoodputRule {
    #[serde(default = "default_true")]
    pub zero_exit_code: bool,
    #[serde(default = "default_true")]
    pub no_exit_signal: bool,
    #[serde(default = "default_true")]
    pub completed_status: bool,
}

impl Default for GoodputRule {
    fn default() -> Self {
        Self {
            zero_exit_code: true,
            no_exit_signal: true,
            completed_status: true,
        }
    }
}

fn default_true() -> bool {
    true
}

pub fn classify_usage(job: &JobRecord, rule: &GoodputRule) -> Usage {
    let good = (!rule.zero_exit_code || job.exit_code == 0.0)
        && (!rule.no_exit_signal || !job.exit_by_signal)
        && (!rule.completed_status || job.job_status == STATUS_COMPLETED);

    if good {
        Usage::Goodput
    } else {
        Usage::Badput
    }
}

/// A job's resource-time claim against one outcome category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub job_id: String,
    pub outcome: Outcome,
    /// Resource-seconds: request quantity times walltime, zero for unrequested kinds.
    pub resource_time: ResourceMap<f64>,
}

impl ClaimRequest {
    pub fn new(job: &JobRecord, classification: Classification) -> Self {
        Self {
            job_id: ledger_job_id(&job.global_job_id),
            outcome: classification.outcome,
            resource_time: job.requests.scaled(classification.walltime),
        }
    }
}

/// Job id as stored in the seen-job sets (`#` and `.` replaced by `-`).
pub fn ledger_job_id(global_job_id: &str) -> String {
    global_job_id.replace(['#', '.'], "-")
}

/// Whether a claim changed the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    Applied,
    Duplicate,
}

/// Records a claim against an epoch, at most once per job and outcome.
///
/// On first sight the job id joins the outcome's seen set, every resource's
/// claim grows by the request's resource-time, and the stored duration is
/// cleared so occupancy is recomputed in the same update.
pub fn record_claim(record: &mut MachineAdRecord, claim: &ClaimRequest) -> ClaimResult {
    let seen: &mut BTreeSet<String> = &mut record.jobs[claim.outcome];
    if !seen.insert(claim.job_id.clone()) {
        return ClaimResult::Duplicate;
    }

    let claims = &mut record.claims[claim.outcome];
    for resource in Resource::ALL {
        let amount = claim.resource_time[resource];
        if amount.is_finite() {
            claims[resource] += amount;
        }
    }

    record.duration = None;

    ClaimResult::Applied
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::ad::MachineAd;
    use crate::test_support::job;

    fn record() -> MachineAdRecord {
        MachineAdRecord::from_ad(&MachineAd {
            name: "slotA@h1".to_string(),
            daemon_start: Utc.timestamp_opt(0, 0).single().expect("valid ts"),
            last_heard_from: Utc.timestamp_opt(3_600, 0).single().expect("valid ts"),
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

    fn claim(job_id: &str, cpus: f64) -> ClaimRequest {
        ClaimRequest {
            job_id: job_id.to_string(),
            outcome: Outcome::Evicted,
            resource_time: ResourceMap {
                cpus,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_record_claim_is_idempotent() {
        let mut rec = record();
        assert_eq!(record_claim(&mut rec, &claim("s-1-0", 3600.0)), ClaimResult::Applied);
        let after_first = rec.clone();

        assert_eq!(
            record_claim(&mut rec, &claim("s-1-0", 3600.0)),
            ClaimResult::Duplicate
        );
        assert_eq!(rec, after_first);
        assert_eq!(rec.claims.evicted.cpus, 3600.0);
        assert_eq!(rec.jobs.evicted.len(), 1);
    }

    #[test]
    fn test_same_job_counts_once_per_outcome() {
        let mut rec = record();
        record_claim(&mut rec, &claim("s-1-0", 100.0));

        let mut removed = claim("s-1-0", 50.0);
        removed.outcome = Outcome::Removed;
        assert_eq!(record_claim(&mut rec, &removed), ClaimResult::Applied);

        assert_eq!(rec.claims.evicted.cpus, 100.0);
        assert_eq!(rec.claims.removed.cpus, 50.0);
    }

    #[test]
    fn test_record_claim_clears_duration() {
        let mut rec = record();
        rec.duration = Some(3600);
        record_claim(&mut rec, &claim("s-2-0", 1.0));
        assert_eq!(rec.duration, None);
    }

    #[test]
    fn test_unrequested_resources_accumulate_zero() {
        let mut rec = record();
        record_claim(&mut rec, &claim("s-3-0", 10.0));
        assert_eq!(rec.claims.evicted.gpus, 0.0);
        assert_eq!(rec.claims.evicted.memory, 0.0);
    }

    #[test]
    fn test_ledger_job_id() {
        assert_eq!(
            ledger_job_id("submit.example.org#123.4#1700000000"),
            "submit-example-org-123-4-1700000000"
        );
    }

    #[test]
    fn test_classify_queue_held_is_removed() {
        let mut j = job("s#1.0#1");
        j.job_status = STATUS_HELD;
        j.job_current_start_date = Utc.timestamp_opt(1_000, 0).single().expect("valid ts");
        j.entered_current_status = Utc.timestamp_opt(1_600, 0).single().expect("valid ts");

        let c = classify(&j, QueryMode::Queue, &OutcomePolicy::default());
        assert_eq!(c.outcome, Outcome::Removed);
        assert_eq!(c.walltime, 600.0);
    }

    #[test]
    fn test_classify_queue_vacated_is_evicted() {
        let mut j = job("s#1.0#1");
        j.job_status = 1.0;
        j.job_last_start_date = 1_000.0;
        j.last_vacate_time = 2_800.0;

        let c = classify(&j, QueryMode::Queue, &OutcomePolicy::default());
        assert_eq!(c.outcome, Outcome::Evicted);
        assert_eq!(c.walltime, 1_800.0);
    }

    #[test]
    fn test_classify_history_default_precedence() {
        let policy = OutcomePolicy::default();

        let mut removed = job("s#1.0#1");
        removed.job_status = STATUS_REMOVED;
        removed.exit_code = 0.0;
        assert_eq!(
            classify(&removed, QueryMode::History, &policy).outcome,
            Outcome::Removed
        );

        let mut finished = job("s#2.0#1");
        finished.job_status = STATUS_COMPLETED;
        finished.exit_code = 0.0;
        assert_eq!(
            classify(&finished, QueryMode::History, &policy).outcome,
            Outcome::Finished
        );

        let mut failed = job("s#3.0#1");
        failed.job_status = STATUS_COMPLETED;
        failed.exit_code = 2.0;
        assert_eq!(
            classify(&failed, QueryMode::History, &policy).outcome,
            Outcome::Failed
        );
    }

    #[test]
    fn test_classify_history_precedence_is_configurable() {
        let mut j = job("s#1.0#1");
        j.job_status = STATUS_REMOVED;
        j.exit_by_signal = true;

        let removed_first = OutcomePolicy {
            history_checks: vec![HistoryCheck::RemovedStatus, HistoryCheck::ExitSignal],
        };
        let signal_first = OutcomePolicy {
            history_checks: vec![HistoryCheck::ExitSignal, HistoryCheck::RemovedStatus],
        };

        assert_eq!(
            classify(&j, QueryMode::History, &removed_first).outcome,
            Outcome::Removed
        );
        assert_eq!(
            classify(&j, QueryMode::History, &signal_first).outcome,
            Outcome::Failed
        );
    }

    #[test]
    fn test_classify_history_walltime() {
        let mut j = job("s#1.0#1");
        j.job_current_start_date = Utc.timestamp_opt(10_000, 0).single().expect("valid ts");
        j.entered_current_status = Utc.timestamp_opt(13_600, 0).single().expect("valid ts");
        let c = classify(&j, QueryMode::History, &OutcomePolicy::default());
        assert_eq!(c.walltime, 3_600.0);
    }

    #[test]
    fn test_claim_request_scales_requests() {
        let mut j = job("sched#7.0#99");
        j.requests = ResourceMap {
            gpus: 1.0,
            cpus: 2.0,
            memory: 1000.0,
            disk: 0.0,
        };
        let c = ClaimRequest::new(
            &j,
            Classification {
                outcome: Outcome::Finished,
                walltime: 10.0,
            },
        );
        assert_eq!(c.job_id, "sched-7-0-99");
        assert_eq!(c.resource_time.gpus, 10.0);
        assert_eq!(c.resource_time.cpus, 20.0);
        assert_eq!(c.resource_time.memory, 10_000.0);
    }

    #[test]
    fn test_classify_usage() {
        let rule = GoodputRule::default();

        let mut good = job("s#1.0#1");
        good.job_status = STATUS_COMPLETED;
        good.exit_code = 0.0;
        assert_eq!(classify_usage(&good, &rule), Usage::Goodput);

        let mut signalled = good.clone();
        signalled.exit_by_signal = true;
        assert_eq!(classify_usage(&signalled, &rule), Usage::Badput);

        let mut removed = good.clone();
        removed.job_status = STATUS_REMOVED;
        assert_eq!(classify_usage(&removed, &rule), Usage::Badput);

        let lenient = GoodputRule {
            completed_status: false,
            ..GoodputRule::default()
        };
        assert_eq!(classify_usage(&removed, &lenient), Usage::Goodput);
    }
}
