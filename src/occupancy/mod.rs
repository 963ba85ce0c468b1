//! Occupancy recalculation for a slot epoch.

use serde::{Deserialize, Serialize};

use crate::epoch::MachineAdRecord;
use crate::ledger::{ByOutcome, Outcome};
use crate::resource::{Resource, ResourceMap};

/// Claimed fraction of capacity × elapsed time, per outcome and in total.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Occupancy {
    #[serde(flatten)]
    pub by_outcome: ByOutcome<ResourceMap<f64>>,
    #[serde(default)]
    pub total: ResourceMap<f64>,
}

/// Recomputes the epoch's occupancy if its elapsed duration grew.
///
/// Returns `false` without touching the record when the elapsed duration is
/// not newer than the one occupancy was last computed for. Resources without
/// advertised capacity, or with a non-positive normalizer, keep their
/// previous values.
pub fn recalculate(record: &mut MachineAdRecord) -> bool {
    let elapsed = record.elapsed_seconds();
    if matches!(record.duration, Some(stored) if elapsed <= stored) {
        return false;
    }

    record.duration = Some(elapsed);

    for resource in Resource::ALL {
        let Some(capacity) = record.totals[resource] else {
            continue;
        };

        let norm = elapsed as f64 * capacity;
        if !(norm > 0.0) {
            continue;
        }

        let mut total = 0.0;
        for outcome in Outcome::ALL {
            let fraction = record.claims[outcome][resource] / norm;
            record.occupancy.by_outcome[outcome][resource] = fraction;
            total += fraction;
        }
        record.occupancy.total[resource] = total;
    }

    true
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::ad::MachineAd;

    fn record(elapsed: i64, cpus: Option<f64>) -> MachineAdRecord {
        let start = Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid ts");
        MachineAdRecord::from_ad(&MachineAd {
            name: "slotA@h1".to_string(),
            daemon_start: start,
            last_heard_from: start + Duration::seconds(elapsed),
            totals: ResourceMap {
                cpus,
                gpus: Some(0.0),
                ..Default::default()
            },
            site: None,
            country: None,
            institution: None,
            resource: None,
        })
    }

    #[test]
    fn test_recalculate_normalizes_claims() {
        let mut rec = record(3_600, Some(4.0));
        rec.claims.evicted.cpus = 3_600.0;
        rec.claims.finished.cpus = 7_200.0;

        assert!(recalculate(&mut rec));
        assert_eq!(rec.duration, Some(3_600));
        assert!((rec.occupancy.by_outcome.evicted.cpus - 0.25).abs() < 1e-12);
        assert!((rec.occupancy.by_outcome.finished.cpus - 0.5).abs() < 1e-12);
        assert_eq!(rec.occupancy.by_outcome.failed.cpus, 0.0);
        assert!((rec.occupancy.total.cpus - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_recalculate_noop_when_duration_unchanged() {
        let mut rec = record(3_600, Some(4.0));
        assert!(recalculate(&mut rec));

        rec.claims.evicted.cpus = 3_600.0;
        assert!(!recalculate(&mut rec));
        assert_eq!(rec.occupancy.by_outcome.evicted.cpus, 0.0);
    }

    #[test]
    fn test_recalculate_after_cleared_duration() {
        let mut rec = record(3_600, Some(4.0));
        assert!(recalculate(&mut rec));

        rec.claims.evicted.cpus = 3_600.0;
        rec.duration = None;
        assert!(recalculate(&mut rec));
        assert!((rec.occupancy.by_outcome.evicted.cpus - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_recalculate_skips_unknown_or_zero_capacity() {
        let mut rec = record(3_600, None);
        rec.claims.evicted.cpus = 100.0;
        rec.claims.evicted.gpus = 100.0;

        assert!(recalculate(&mut rec));
        assert_eq!(rec.occupancy.by_outcome.evicted.cpus, 0.0);
        assert_eq!(rec.occupancy.by_outcome.evicted.gpus, 0.0);
        assert_eq!(rec.occupancy.total.gpus, 0.0);
    }

    #[test]
    fn test_recalculate_zero_elapsed() {
        let mut rec = record(0, Some(4.0));
        rec.claims.evicted.cpus = 10.0;
        assert!(recalculate(&mut rec));
        assert_eq!(rec.occupancy.total.cpus, 0.0);
    }

    #[test]
    fn test_occupancy_serializes_flat_outcomes() {
        let mut occupancy = Occupancy::default();
        occupancy.by_outcome.evicted.cpus = 0.25;
        occupancy.total.cpus = 0.25;

        let json = serde_json::to_value(&occupancy).expect("serialize");
        assert_eq!(json["evicted"]["Cpus"], 0.25);
        assert_eq!(json["total"]["Cpus"], 0.25);
    }
}
