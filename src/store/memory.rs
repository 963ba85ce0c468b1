use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{apply_mutation, BulkReport, EpochPage, EpochUpdate, ScanCursor, ScanWindow, SlotStore};
use crate::attribution::{EpochIndex, EpochLookup};
use crate::epoch::{EpochId, MachineAdRecord};

/// Process-local slot epoch store.
///
/// Each document is mutated under its map entry lock, which gives the same
/// per-document atomicity a remote store provides with versioned writes.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<EpochId, MachineAdRecord>,
    index: RwLock<EpochIndex>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one epoch.
    pub fn get(&self, id: &EpochId) -> Option<MachineAdRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn apply_one(&self, update: &EpochUpdate, report: &mut BulkReport) {
        match self.records.entry(update.epoch.clone()) {
            Entry::Occupied(mut occupied) => {
                let mut current = Some(occupied.get().clone());
                match apply_mutation(&mut current, update) {
                    Ok(outcome) => {
                        if let Some(record) = current {
                            occupied.insert(record);
                        }
                        report.record(outcome);
                    }
                    Err(err) => report.fail(update.epoch.clone(), err),
                }
            }
            Entry::Vacant(vacant) => {
                let mut current = None;
                match apply_mutation(&mut current, update) {
                    Ok(outcome) => {
                        if let Some(record) = current {
                            self.index.write().insert(
                                &record.name,
                                record.daemon_start,
                                record.epoch_id.clone(),
                            );
                            vacant.insert(record);
                        }
                        report.record(outcome);
                    }
                    Err(err) => report.fail(update.epoch.clone(), err),
                }
            }
        }
    }
}

impl SlotStore for MemoryStore {
    async fn apply(&self, updates: Vec<EpochUpdate>) -> Result<BulkReport> {
        let mut report = BulkReport::default();
        for update in &updates {
            self.apply_one(update, &mut report);
        }
        Ok(report)
    }

    async fn find_epochs(&self, lookups: &[EpochLookup]) -> Result<Vec<Option<EpochId>>> {
        let index = self.index.read();
        Ok(lookups
            .iter()
            .map(|lookup| index.find(lookup).cloned())
            .collect())
    }

    async fn scan_epochs(
        &self,
        window: &ScanWindow,
        cursor: Option<&ScanCursor>,
        size: usize,
    ) -> Result<EpochPage> {
        let mut matching: Vec<(ScanCursor, MachineAdRecord)> = self
            .records
            .iter()
            .filter(|entry| window.contains(entry.value()))
            .filter_map(|entry| {
                let record = entry.value();
                let key = record.group_key()?;
                Some((ScanCursor::after(key, record), record.clone()))
            })
            .filter(|(position, _)| cursor.map_or(true, |c| position > c))
            .collect();

        matching.sort_by(|a, b| a.0.cmp(&b.0));

        let more = matching.len() > size;
        matching.truncate(size);

        let next = if more {
            matching.last().map(|(position, _)| position.clone())
        } else {
            None
        };

        Ok(EpochPage {
            records: matching.into_iter().map(|(_, record)| record).collect(),
            next,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::ad::MachineAd;
    use crate::ledger::{ClaimRequest, Outcome};
    use crate::resource::ResourceMap;
    use crate::store::StoreError;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid ts")
    }

    fn ad(name: &str, start: i64, last: i64, site: &str) -> MachineAd {
        MachineAd {
            name: name.to_string(),
            daemon_start: at(start),
            last_heard_from: at(last),
            totals: ResourceMap {
                cpus: Some(4.0),
                ..Default::default()
            },
            site: Some(site.to_string()),
            country: Some("US".to_string()),
            institution: Some("UW".to_string()),
            resource: Some(site.to_string()),
        }
    }

    #[tokio::test]
    async fn test_apply_reports_per_mutation() {
        let store = MemoryStore::new();
        let report = store
            .apply(vec![
                EpochUpdate::heartbeat(ad("slot1@h", 0, 100, "A")),
                EpochUpdate::heartbeat(ad("slot1@h", 0, 200, "A")),
                EpochUpdate::claim(
                    EpochId::new("slot9@h", at(0)),
                    ClaimRequest {
                        job_id: "j".to_string(),
                        outcome: Outcome::Failed,
                        resource_time: ResourceMap::default(),
                    },
                ),
            ])
            .await
            .expect("apply");

        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].error, StoreError::NotFound(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_find_epochs_uses_index() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                EpochUpdate::heartbeat(ad("slot1@h", 100, 400, "A")),
                EpochUpdate::heartbeat(ad("slot1@h", 500, 900, "A")),
            ])
            .await
            .expect("apply");

        let found = store
            .find_epochs(&[
                EpochLookup {
                    slot: "slot1@h".to_string(),
                    not_after: at(450),
                },
                EpochLookup {
                    slot: "slot1@h".to_string(),
                    not_after: at(50),
                },
            ])
            .await
            .expect("find");

        assert_eq!(found[0], Some(EpochId::new("slot1@h", at(100))));
        assert_eq!(found[1], None);
    }

    #[tokio::test]
    async fn test_scan_pages_in_group_order() {
        let store = MemoryStore::new();
        let mut unlabeled = ad("slot9@h", 0, 100, "C");
        unlabeled.country = None;
        store
            .apply(vec![
                EpochUpdate::heartbeat(ad("slot1@h", 0, 100, "B")),
                EpochUpdate::heartbeat(ad("slot2@h", 0, 100, "A")),
                EpochUpdate::heartbeat(ad("slot3@h", 0, 100, "A")),
                EpochUpdate::heartbeat(unlabeled),
                EpochUpdate::heartbeat(ad("slot4@h", 5_000, 6_000, "A")),
            ])
            .await
            .expect("apply");

        let window = ScanWindow {
            after: at(0),
            before: at(1_000),
        };

        let first = store.scan_epochs(&window, None, 2).await.expect("scan");
        let names: Vec<_> = first.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["slot2@h", "slot3@h"]);
        let cursor = first.next.expect("more pages");

        let second = store
            .scan_epochs(&window, Some(&cursor), 2)
            .await
            .expect("scan");
        let names: Vec<_> = second.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["slot1@h"]);
        assert!(second.next.is_none());
    }
}
