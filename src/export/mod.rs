//! Outbound surfaces: Prometheus health metrics and summary bucket exporters.

pub mod health;
pub mod summary;

pub use health::HealthMetrics;
pub use summary::{ClickHouseSummaryExporter, StdoutExporter, SummaryExporter};
