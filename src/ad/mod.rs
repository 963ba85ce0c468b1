//! Raw scheduler ads and their canonical forms.
//!
//! Job ads go through [`normalize`] to become a [`JobRecord`]; startd ads are
//! parsed into a [`MachineAd`] heartbeat.

mod machine;
mod normalize;
pub mod sites;

pub use machine::{MachineAd, MachineAdError};
pub use normalize::{normalize, FieldKind, FieldValue, JobRecord, NormalizeError, JOB_FIELDS};

/// An ad as delivered by the scheduler: arbitrary keys, untyped values.
pub type RawAd = serde_json::Map<String, serde_json::Value>;
