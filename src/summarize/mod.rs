//! Time-bucket aggregation of slot epochs.
//!
//! Each epoch's `[DaemonStartTime, LastHeardFrom]` interval is spread over the
//! fixed-width buckets it touches. Under the default [`OverlapRule::Average`]
//! every touched bucket receives the same weight: the epoch's length divided
//! by the width of all buckets it touches. [`OverlapRule::Exact`] weights each
//! bucket by the part of it the interval actually covers.

mod window;

use std::collections::{BTreeMap, VecDeque};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::epoch::{GroupKey, MachineAdRecord};
use crate::ledger::Outcome;
use crate::occupancy::Occupancy;
use crate::resource::{Resource, ResourceMap};
use crate::store::{ScanCursor, ScanWindow, SlotStore};

pub use window::{parse_instant, parse_timedelta, snap_to_interval, SummaryWindow};

/// Format of bucket timestamps in summary ids and documents.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// How an epoch's interval is weighted across the buckets it touches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapRule {
    /// Same weight in every touched bucket, averaged over the epoch's lifetime.
    #[default]
    Average,
    /// Per-bucket covered fraction.
    Exact,
}

/// The buckets touched by one epoch interval, in milliseconds.
#[derive(Debug, Clone, Copy)]
struct Span {
    left: i64,
    right: i64,
    interval: i64,
    rule: OverlapRule,
}

impl Span {
    fn new(left: i64, right: i64, interval: i64, rule: OverlapRule) -> Option<Self> {
        (interval > 0 && right >= left).then_some(Self {
            left,
            right,
            interval,
            rule,
        })
    }

    fn first(&self) -> i64 {
        self.left.div_euclid(self.interval)
    }

    fn last(&self) -> i64 {
        self.right.div_euclid(self.interval)
    }

    fn weight(&self, bucket: i64) -> f64 {
        match self.rule {
            OverlapRule::Average => {
                let total = self.interval * (self.last() - self.first() + 1);
                (self.right - self.left) as f64 / total as f64
            }
            OverlapRule::Exact => {
                let start = bucket * self.interval;
                let end = start + self.interval;
                let covered = self.right.min(end) - self.left.max(start);
                covered.max(0) as f64 / self.interval as f64
            }
        }
    }
}

/// Bucket start (ms) and weight for every bucket `[left_ms, right_ms]` touches.
pub fn bucket_weights(
    left_ms: i64,
    right_ms: i64,
    interval_ms: i64,
    rule: OverlapRule,
) -> Vec<(i64, f64)> {
    let Some(span) = Span::new(left_ms, right_ms, interval_ms, rule) else {
        return Vec::new();
    };
    (span.first()..=span.last())
        .map(|b| (b * interval_ms, span.weight(b)))
        .collect()
}

/// Offered and claimed resource-time of one group in one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationBucket {
    pub timestamp: DateTime<Utc>,
    pub key: GroupKey,
    /// Epochs that contributed.
    pub count: u64,
    pub offered: ResourceMap<f64>,
    pub claimed: Occupancy,
}

impl AggregationBucket {
    pub fn timestamp_label(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Document id: `timestamp.resource.site.slot_type`.
    pub fn id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.timestamp_label(),
            self.key.resource,
            self.key.site,
            self.key.slot_type.as_str()
        )
    }
}

#[derive(Debug, Default)]
struct Partial {
    count: u64,
    offered: ResourceMap<f64>,
    claimed: Occupancy,
}

impl Partial {
    fn add(&mut self, record: &MachineAdRecord, weight: f64) {
        self.count += 1;
        for resource in Resource::ALL {
            let Some(capacity) = record.totals[resource] else {
                continue;
            };
            self.offered[resource] += weight * capacity;
            for outcome in Outcome::ALL {
                self.claimed.by_outcome[outcome][resource] +=
                    weight * record.occupancy.by_outcome[outcome][resource] * capacity;
            }
            self.claimed.total[resource] += weight * record.occupancy.total[resource] * capacity;
        }
    }
}

struct GroupAccumulator {
    key: GroupKey,
    buckets: BTreeMap<i64, Partial>,
}

/// Lazy, finite sequence of buckets over the store's current epochs.
///
/// Epochs are read a page at a time in group-key order, so only one group's
/// buckets are held in memory at once.
pub struct BucketScan<'a, S> {
    store: &'a S,
    window: SummaryWindow,
    rule: OverlapRule,
    page_size: usize,
    cursor: Option<ScanCursor>,
    exhausted: bool,
    group: Option<GroupAccumulator>,
    ready: VecDeque<AggregationBucket>,
    epochs: usize,
}

/// Starts an aggregation pass over `window`.
pub fn aggregate<S: SlotStore>(
    store: &S,
    window: SummaryWindow,
    rule: OverlapRule,
    page_size: usize,
) -> BucketScan<'_, S> {
    BucketScan {
        store,
        window,
        rule,
        page_size: page_size.max(1),
        cursor: None,
        exhausted: false,
        group: None,
        ready: VecDeque::new(),
        epochs: 0,
    }
}

impl<'a, S: SlotStore> BucketScan<'a, S> {
    /// Epochs folded so far.
    pub fn epochs_read(&self) -> usize {
        self.epochs
    }

    /// The next bucket, or `None` once every epoch has been folded.
    pub async fn next(&mut self) -> Result<Option<AggregationBucket>> {
        loop {
            if let Some(bucket) = self.ready.pop_front() {
                return Ok(Some(bucket));
            }

            if self.exhausted {
                match self.group.take() {
                    Some(group) => self.flush(group),
                    None => return Ok(None),
                }
                continue;
            }

            self.fetch_page().await?;
        }
    }

    /// Drains the scan into a vector.
    pub async fn collect(mut self) -> Result<Vec<AggregationBucket>> {
        let mut out = Vec::new();
        while let Some(bucket) = self.next().await? {
            out.push(bucket);
        }
        Ok(out)
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let scan = ScanWindow {
            after: self.window.after,
            before: self.window.before,
        };

        let page = self
            .store
            .scan_epochs(&scan, self.cursor.as_ref(), self.page_size)
            .await
            .context("scanning slot epochs")?;

        debug!(epochs = page.records.len(), more = page.next.is_some(), "summary page");

        self.exhausted = page.next.is_none();
        self.cursor = page.next;

        for record in &page.records {
            self.fold(record);
        }

        Ok(())
    }

    fn fold(&mut self, record: &MachineAdRecord) {
        let Some(key) = record.group_key() else {
            return;
        };

        if self.group.as_ref().is_some_and(|g| g.key != key) {
            if let Some(done) = self.group.take() {
                self.flush(done);
            }
        }

        let Some(span) = Span::new(
            record.daemon_start.timestamp_millis(),
            record.last_heard_from.timestamp_millis(),
            self.window.interval.num_milliseconds(),
            self.rule,
        ) else {
            return;
        };

        self.epochs += 1;

        let first = span
            .first()
            .max(self.window.after.timestamp_millis().div_euclid(span.interval));
        let last = span
            .last()
            .min((self.window.before.timestamp_millis() - 1).div_euclid(span.interval));

        let group = self.group.get_or_insert_with(|| GroupAccumulator {
            key,
            buckets: BTreeMap::new(),
        });

        for bucket in first..=last {
            group
                .buckets
                .entry(bucket * span.interval)
                .or_default()
                .add(record, span.weight(bucket));
        }
    }

    fn flush(&mut self, group: GroupAccumulator) {
        for (start, partial) in group.buckets {
            let Some(timestamp) = DateTime::from_timestamp_millis(start) else {
                continue;
            };
            if timestamp < self.window.after || timestamp >= self.window.before || partial.count == 0 {
                continue;
            }
            self.ready.push_back(AggregationBucket {
                timestamp,
                key: group.key.clone(),
                count: partial.count,
                offered: partial.offered,
                claimed: partial.claimed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::ad::MachineAd;
    use crate::epoch::SlotType;
    use crate::ledger::ClaimRequest;
    use crate::store::{EpochUpdate, MemoryStore};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid ts")
    }

    fn ad(name: &str, start: i64, end: i64, site: &str, gpus: f64) -> MachineAd {
        MachineAd {
            name: name.to_string(),
            daemon_start: at(start),
            last_heard_from: at(end),
            totals: ResourceMap {
                cpus: Some(4.0),
                gpus: Some(gpus),
                ..Default::default()
            },
            site: Some(site.to_string()),
            country: Some("US".to_string()),
            institution: Some("UW".to_string()),
            resource: Some(format!("{site}-CE")),
        }
    }

    fn window(after: i64, before: i64, interval: i64) -> SummaryWindow {
        SummaryWindow {
            after: at(after),
            before: at(before),
            interval: Duration::seconds(interval),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_bucket_weights_average() {
        let weights = bucket_weights(0, 150_000, 100_000, OverlapRule::Average);
        assert_eq!(weights.len(), 2);
        assert_eq!(weights[0].0, 0);
        assert_eq!(weights[1].0, 100_000);
        assert!(close(weights[0].1, 0.75));
        assert!(close(weights[1].1, 0.75));
        assert!(close(weights.iter().map(|w| w.1).sum(), 1.5));
    }

    #[test]
    fn test_bucket_weights_exact() {
        let weights = bucket_weights(0, 150_000, 100_000, OverlapRule::Exact);
        assert!(close(weights[0].1, 1.0));
        assert!(close(weights[1].1, 0.5));
        assert!(weights[0].1 > weights[1].1);
        assert!(close(weights.iter().map(|w| w.1).sum(), 1.5));
    }

    #[test]
    fn test_bucket_weights_degenerate() {
        assert!(bucket_weights(0, 100, 0, OverlapRule::Average).is_empty());
        assert!(bucket_weights(200, 100, 100, OverlapRule::Average).is_empty());

        let point = bucket_weights(50, 50, 100, OverlapRule::Average);
        assert_eq!(point, vec![(0, 0.0)]);
    }

    #[test]
    fn test_bucket_id() {
        let bucket = AggregationBucket {
            timestamp: at(1_700_000_400),
            key: GroupKey {
                site: "UW".to_string(),
                country: "US".to_string(),
                institution: "UW-Madison".to_string(),
                resource: "CHTC".to_string(),
                slot_type: SlotType::Gpu,
            },
            count: 1,
            offered: ResourceMap::default(),
            claimed: Occupancy::default(),
        };
        assert_eq!(bucket.id(), "2023-11-14T22:20:00.CHTC.UW.GPU");
    }

    #[tokio::test]
    async fn test_aggregate_weights_offered_and_claimed() {
        let store = MemoryStore::new();
        let slot = ad("slot1@h", 0, 150, "A", 0.0);
        store
            .apply(vec![
                EpochUpdate::heartbeat(slot.clone()),
                EpochUpdate::claim(
                    slot.epoch_id(),
                    ClaimRequest {
                        job_id: "s#1.0#1".to_string(),
                        outcome: Outcome::Evicted,
                        resource_time: ResourceMap {
                            cpus: 300.0,
                            ..Default::default()
                        },
                    },
                ),
            ])
            .await
            .expect("apply");

        let buckets = aggregate(&store, window(0, 200, 100), OverlapRule::Average, 10)
            .collect()
            .await
            .expect("aggregate");

        assert_eq!(buckets.len(), 2);
        for bucket in &buckets {
            assert_eq!(bucket.count, 1);
            assert!(close(bucket.offered.cpus, 3.0));
            assert!(close(bucket.offered.gpus, 0.0));
            assert!(close(bucket.claimed.by_outcome.evicted.cpus, 1.5));
            assert!(close(bucket.claimed.total.cpus, 1.5));
            assert_eq!(bucket.key.slot_type, SlotType::Cpu);
        }

        let exact = aggregate(&store, window(0, 200, 100), OverlapRule::Exact, 10)
            .collect()
            .await
            .expect("aggregate");
        assert!(close(exact[0].offered.cpus, 4.0));
        assert!(close(exact[1].offered.cpus, 2.0));
    }

    #[tokio::test]
    async fn test_aggregate_groups_across_pages() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                EpochUpdate::heartbeat(ad("slot1@h", 0, 50, "B", 0.0)),
                EpochUpdate::heartbeat(ad("slot2@h", 0, 50, "A", 0.0)),
                EpochUpdate::heartbeat(ad("slot3@h", 0, 50, "A", 0.0)),
                EpochUpdate::heartbeat(ad("slot4@h", 0, 50, "A", 1.0)),
            ])
            .await
            .expect("apply");

        let mut scan = aggregate(&store, window(0, 100, 100), OverlapRule::Average, 1);
        let mut seen = Vec::new();
        while let Some(bucket) = scan.next().await.expect("next") {
            seen.push((bucket.key.site.clone(), bucket.key.slot_type, bucket.count));
        }

        assert_eq!(
            seen,
            vec![
                ("A".to_string(), SlotType::Cpu, 2),
                ("A".to_string(), SlotType::Gpu, 1),
                ("B".to_string(), SlotType::Cpu, 1),
            ]
        );
        assert_eq!(scan.epochs_read(), 4);
    }

    #[tokio::test]
    async fn test_aggregate_keeps_buckets_inside_window() {
        let store = MemoryStore::new();
        let mut unlabeled = ad("slot9@h", 0, 1_000, "C", 0.0);
        unlabeled.institution = None;
        store
            .apply(vec![
                EpochUpdate::heartbeat(ad("slot1@h", 0, 1_000, "A", 0.0)),
                EpochUpdate::heartbeat(unlabeled),
            ])
            .await
            .expect("apply");

        let buckets = aggregate(&store, window(300, 600, 100), OverlapRule::Average, 10)
            .collect()
            .await
            .expect("aggregate");

        let stamps: Vec<_> = buckets.iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![at(300), at(400), at(500)]);
        assert!(buckets.iter().all(|b| b.key.site == "A"));
        // 1000s over 11 touched buckets of 100s
        assert!(close(buckets[0].offered.cpus, 4.0 * 1_000.0 / 1_100.0));
    }
}
