//! Slot epochs: one observed lifetime of a named machine slot.
//!
//! An epoch is identified by `(slot name, daemon start time)`. The stored
//! record carries the slot's advertised capacity and grouping labels plus the
//! accounting state owned by the claims ledger and occupancy recalculator.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ad::MachineAd;
use crate::ledger::ByOutcome;
use crate::occupancy::Occupancy;
use crate::resource::{Capacity, ResourceMap};

/// Document id of a slot epoch: `"{daemon_start_epoch}-{name}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochId(String);

impl EpochId {
    pub fn new(name: &str, daemon_start: DateTime<Utc>) -> Self {
        Self(format!("{}-{}", daemon_start.timestamp(), name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EpochId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// CPU or GPU partition of a slot, decided by whether it advertises GPUs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlotType {
    #[default]
    #[serde(rename = "CPU")]
    Cpu,
    #[serde(rename = "GPU")]
    Gpu,
}

impl SlotType {
    pub fn from_capacity(totals: &Capacity) -> Self {
        match totals.gpus {
            Some(gpus) if gpus > 0.0 => Self::Gpu,
            _ => Self::Cpu,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
        }
    }
}

/// Grouping key for time-bucket aggregation.
///
/// Field order defines the scan order used for cursor pagination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub site: String,
    pub country: String,
    pub institution: String,
    pub resource: String,
    pub slot_type: SlotType,
}

/// Stored state of one slot epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineAdRecord {
    pub epoch_id: EpochId,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "DaemonStartTime")]
    pub daemon_start: DateTime<Utc>,
    #[serde(rename = "LastHeardFrom")]
    pub last_heard_from: DateTime<Utc>,
    #[serde(rename = "Total", default)]
    pub totals: Capacity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub slot_type: SlotType,
    /// Job ids already counted, per outcome.
    #[serde(default)]
    pub jobs: ByOutcome<BTreeSet<String>>,
    /// Accumulated resource-seconds, per outcome.
    #[serde(default)]
    pub claims: ByOutcome<ResourceMap<f64>>,
    #[serde(default)]
    pub occupancy: Occupancy,
    /// Elapsed seconds the current occupancy was computed for; `None` forces a recompute.
    #[serde(default)]
    pub duration: Option<i64>,
}

impl MachineAdRecord {
    /// Creates the record for the first sighting of an epoch.
    pub fn from_ad(ad: &MachineAd) -> Self {
        Self {
            epoch_id: ad.epoch_id(),
            name: ad.name.clone(),
            daemon_start: ad.daemon_start,
            last_heard_from: ad.last_heard_from,
            totals: ad.totals,
            site: ad.site.clone(),
            country: ad.country.clone(),
            institution: ad.institution.clone(),
            resource: ad.resource.clone(),
            slot_type: SlotType::from_capacity(&ad.totals),
            jobs: ByOutcome::default(),
            claims: ByOutcome::default(),
            occupancy: Occupancy::default(),
            duration: None,
        }
    }

    /// Merges a later heartbeat into the record.
    ///
    /// `last_heard_from` never moves backwards, so elapsed duration stays
    /// monotonic under out-of-order delivery. Accounting state is untouched.
    pub fn merge_heartbeat(&mut self, ad: &MachineAd) {
        if ad.last_heard_from > self.last_heard_from {
            self.last_heard_from = ad.last_heard_from;
        }

        for (resource, total) in ad.totals.iter() {
            if total.is_some() {
                self.totals[resource] = *total;
            }
        }

        merge_label(&mut self.site, &ad.site);
        merge_label(&mut self.country, &ad.country);
        merge_label(&mut self.institution, &ad.institution);
        merge_label(&mut self.resource, &ad.resource);

        self.slot_type = SlotType::from_capacity(&self.totals);
    }

    /// Seconds between daemon start and the last heartbeat.
    pub fn elapsed_seconds(&self) -> i64 {
        (self.last_heard_from - self.daemon_start).num_seconds()
    }

    /// Grouping key, or `None` when any grouping label is missing.
    pub fn group_key(&self) -> Option<GroupKey> {
        Some(GroupKey {
            site: self.site.clone()?,
            country: self.country.clone()?,
            institution: self.institution.clone()?,
            resource: self.resource.clone()?,
            slot_type: self.slot_type,
        })
    }
}

fn merge_label(current: &mut Option<String>, update: &Option<String>) {
    if update.is_some() {
        current.clone_from(update);
    }
}
