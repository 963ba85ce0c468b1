use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use super::RawAd;
use crate::epoch::EpochId;
use crate::resource::{Capacity, Resource};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MachineAdError {
    #[error("machine ad is missing {0}")]
    Missing(&'static str),
    #[error("machine ad has invalid {0}")]
    Invalid(&'static str),
}

/// One startd heartbeat for a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineAd {
    pub name: String,
    pub daemon_start: DateTime<Utc>,
    pub last_heard_from: DateTime<Utc>,
    pub totals: Capacity,
    pub site: Option<String>,
    pub country: Option<String>,
    pub institution: Option<String>,
    pub resource: Option<String>,
}

impl MachineAd {
    /// Parses a startd status ad.
    ///
    /// `Name`, `DaemonStartTime` and `LastHeardFrom` are required. `Total*`
    /// capacities are matched case-insensitively, and grouping labels fall
    /// back to their `GLIDEIN_*` spellings.
    pub fn from_raw(raw: &RawAd) -> Result<Self, MachineAdError> {
        let name = match raw.get("Name") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            Some(_) => return Err(MachineAdError::Invalid("Name")),
            None => return Err(MachineAdError::Missing("Name")),
        };

        let totals = Capacity::from_fn(|resource| total(raw, resource));

        Ok(Self {
            name,
            daemon_start: timestamp(raw, "DaemonStartTime")?,
            last_heard_from: timestamp(raw, "LastHeardFrom")?,
            totals,
            site: label(raw, "site", "GLIDEIN_Site"),
            country: label(raw, "country", "GLIDEIN_Country"),
            institution: label(raw, "institution", "GLIDEIN_Institution"),
            resource: label(raw, "resource", "GLIDEIN_ResourceName"),
        })
    }

    pub fn epoch_id(&self) -> EpochId {
        EpochId::new(&self.name, self.daemon_start)
    }
}

fn timestamp(raw: &RawAd, key: &'static str) -> Result<DateTime<Utc>, MachineAdError> {
    let seconds = match raw.get(key) {
        // Some daemons publish epoch seconds as floats.
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .ok_or(MachineAdError::Invalid(key))?,
        Some(_) => return Err(MachineAdError::Invalid(key)),
        None => return Err(MachineAdError::Missing(key)),
    };

    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or(MachineAdError::Invalid(key))
}

fn total(raw: &RawAd, resource: Resource) -> Option<f64> {
    raw.iter()
        .find(|(key, _)| {
            key.strip_prefix("Total").and_then(Resource::from_suffix) == Some(resource)
        })
        .and_then(|(_, value)| value.as_f64())
}

fn label(raw: &RawAd, key: &str, fallback: &str) -> Option<String> {
    [key, fallback].into_iter().find_map(|k| match raw.get(k) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn raw(value: Value) -> RawAd {
        match value {
            Value::Object(map) => map,
            _ => panic!("test ad must be an object"),
        }
    }

    #[test]
    fn test_from_raw_parses_capacity_and_labels() {
        let ad = MachineAd::from_raw(&raw(json!({
            "Name": "slot1@node1.icecube.wisc.edu",
            "DaemonStartTime": 1_700_000_000,
            "LastHeardFrom": 1_700_003_600,
            "TotalCpus": 8,
            "TotalGpus": 1,
            "TotalMemory": 32_000,
            "GLIDEIN_Site": "NPX",
            "country": "US",
            "GLIDEIN_Country": "CA",
        })))
        .expect("parse");

        assert_eq!(ad.totals.cpus, Some(8.0));
        assert_eq!(ad.totals.gpus, Some(1.0));
        assert_eq!(ad.totals.memory, Some(32_000.0));
        assert_eq!(ad.totals.disk, None);
        assert_eq!(ad.site.as_deref(), Some("NPX"));
        assert_eq!(ad.country.as_deref(), Some("US"));
        assert_eq!(ad.institution, None);
        assert_eq!(
            ad.epoch_id().as_str(),
            "1700000000-slot1@node1.icecube.wisc.edu"
        );
    }

    #[test]
    fn test_from_raw_requires_identity() {
        let err = MachineAd::from_raw(&raw(json!({"DaemonStartTime": 1, "LastHeardFrom": 2})))
            .expect_err("missing name");
        assert_eq!(err, MachineAdError::Missing("Name"));

        let err = MachineAd::from_raw(&raw(json!({
            "Name": "slot1@h",
            "DaemonStartTime": "soon",
            "LastHeardFrom": 2,
        })))
        .expect_err("bad start");
        assert_eq!(err, MachineAdError::Invalid("DaemonStartTime"));
    }

    #[test]
    fn test_from_raw_truncates_float_timestamps() {
        let ad = MachineAd::from_raw(&raw(json!({
            "Name": "slot1@h",
            "DaemonStartTime": 1.7e9,
            "LastHeardFrom": 1_700_003_600.75,
        })))
        .expect("parse");
        assert_eq!(ad.daemon_start.timestamp(), 1_700_000_000);
        assert_eq!(ad.last_heard_from.timestamp(), 1_700_003_600);
        assert_eq!(ad.epoch_id().as_str(), "1700000000-slot1@h");

        let err = MachineAd::from_raw(&raw(json!({
            "Name": "slot1@h",
            "DaemonStartTime": 1e300,
            "LastHeardFrom": 2,
        })))
        .expect_err("out of range");
        assert_eq!(err, MachineAdError::Invalid("DaemonStartTime"));
    }
}
