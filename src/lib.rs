//! Claim attribution and occupancy accounting for HTCondor pools.
//!
//! Startd ads become slot epochs, job ads are attributed to the epoch they
//! ran in and recorded as claims by outcome, and epochs are folded into
//! time-bucket summaries of offered and claimed capacity.

pub mod ad;
pub mod agent;
pub mod attribution;
pub mod config;
pub mod epoch;
pub mod export;
pub mod ledger;
pub mod migrate;
pub mod occupancy;
pub mod poll;
pub mod resource;
pub mod scheduler;
pub mod store;
pub mod summarize;
