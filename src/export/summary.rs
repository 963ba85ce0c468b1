use std::fmt::Write as _;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::health::HealthMetrics;
use crate::config::ClickHouseConfig;
use crate::ledger::Outcome;
use crate::migrate;
use crate::resource::{Resource, ResourceMap};
use crate::summarize::AggregationBucket;

/// Exporter dispatches summary buckets to ClickHouse or stdout.
///
/// Uses enum dispatch rather than trait objects for zero-cost async dispatch.
pub enum SummaryExporter {
    ClickHouse(ClickHouseSummaryExporter),
    Stdout(StdoutExporter),
}

impl SummaryExporter {
    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::ClickHouse(e) => e.name(),
            Self::Stdout(e) => e.name(),
        }
    }

    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        match self {
            Self::ClickHouse(e) => e.start(ctx).await,
            Self::Stdout(e) => e.start(ctx).await,
        }
    }

    /// Export a batch of buckets.
    pub async fn export(&self, buckets: &[AggregationBucket]) -> Result<()> {
        match self {
            Self::ClickHouse(e) => e.export(buckets).await,
            Self::Stdout(e) => e.export(buckets).await,
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Self::ClickHouse(e) => e.stop().await,
            Self::Stdout(e) => e.stop().await,
        }
    }
}

/// Writes buckets into the ClickHouse summary table, replacing earlier rows
/// for the same bucket on merge.
///
/// Owns the native TCP pool: `start` connects and applies the schema,
/// `stop` releases the pool.
pub struct ClickHouseSummaryExporter {
    cfg: ClickHouseConfig,
    pool: Option<Pool>,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseSummaryExporter {
    pub fn new(cfg: ClickHouseConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            cfg,
            pool: None,
            health,
        }
    }

    pub fn name(&self) -> &str {
        "clickhouse"
    }

    /// Database-qualified summary table.
    pub fn table(&self) -> String {
        format!("{}.{}", self.cfg.database, self.cfg.table)
    }

    /// Opens the pool, pings, and applies pending schema migrations when enabled.
    pub async fn start(&mut self, _ctx: CancellationToken) -> Result<()> {
        let pool = Pool::new(summary_dsn(&self.cfg));
        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;
        handle.ping().await.context("pinging ClickHouse")?;

        let table = self.table();
        if self.cfg.migrations.enabled {
            migrate::apply(&mut handle, &table)
                .await
                .context("applying summary schema")?;
        }

        info!(endpoint = %self.cfg.endpoint, table = %table, "ClickHouse summary exporter connected");

        self.pool = Some(pool);
        self.set_connected(true);

        Ok(())
    }

    pub async fn export(&self, buckets: &[AggregationBucket]) -> Result<()> {
        let pool = self
            .pool
            .as_ref()
            .context("ClickHouse summary exporter not started")?;
        let table = self.table();
        let updated = Utc::now();

        for chunk in buckets.chunks(self.cfg.batch_size.max(1)) {
            let sql = insert_sql(&table, chunk, updated);

            let mut handle = pool
                .get_handle()
                .await
                .context("getting handle for summary insert")?;

            if let Err(e) = handle.execute(sql.as_str()).await {
                self.record_batch_error("insert");
                return Err(e).context("sending summary batch");
            }

            if let Some(ref h) = self.health {
                h.summary_buckets_exported
                    .with_label_values(&[self.name()])
                    .inc_by(chunk.len() as f64);
            }
        }

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if self.pool.take().is_some() {
            self.set_connected(false);
        }
        Ok(())
    }

    fn set_connected(&self, connected: bool) {
        if let Some(ref h) = self.health {
            h.clickhouse_connected
                .with_label_values(&[self.name()])
                .set(if connected { 1.0 } else { 0.0 });
        }
    }

    fn record_batch_error(&self, error_type: &str) {
        if let Some(ref h) = self.health {
            h.export_batch_errors
                .with_label_values(&[self.name(), error_type])
                .inc();
        }
    }
}

/// clickhouse-rs TCP DSN: `tcp://[user[:pass]@]host:port/database?options`,
/// LZ4 compressed, pool of 2 to 5 connections.
fn summary_dsn(cfg: &ClickHouseConfig) -> String {
    let auth = match (cfg.username.is_empty(), cfg.password.is_empty()) {
        (true, _) => String::new(),
        (false, true) => format!("{}@", cfg.username),
        (false, false) => format!("{}:{}@", cfg.username, cfg.password),
    };

    format!(
        "tcp://{auth}{}/{}?compression=lz4&pool_min=2&pool_max=5",
        cfg.endpoint, cfg.database
    )
}

const SUMMARY_COLUMNS: &str = "id, updated_date_time, timestamp, site, country, institution, \
     resource, slot_type, count, offered, claimed";

fn insert_sql(table: &str, buckets: &[AggregationBucket], updated: DateTime<Utc>) -> String {
    let updated = format_datetime(updated);
    let mut sql = String::with_capacity(64 + table.len() + buckets.len() * 512);
    let _ = write!(sql, "INSERT INTO {table} ({SUMMARY_COLUMNS}) VALUES ");

    for (idx, b) in buckets.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }

        let mut claimed = Vec::with_capacity((Outcome::ALL.len() + 1) * Resource::ALL.len());
        for outcome in Outcome::ALL {
            for (resource, v) in b.claimed.by_outcome[outcome].iter() {
                claimed.push((format!("{}.{}", outcome.as_str(), resource.as_str()), *v));
            }
        }
        for (resource, v) in b.claimed.total.iter() {
            claimed.push((format!("total.{}", resource.as_str()), *v));
        }
        let claimed = format_map(claimed.into_iter());

        let _ = write!(
            sql,
            "('{}', {updated}, '{}', '{}', '{}', '{}', '{}', '{}', {}, {}, {claimed})",
            escape_sql(&b.id()),
            b.timestamp.format("%Y-%m-%d %H:%M:%S"),
            escape_sql(&b.key.site),
            escape_sql(&b.key.country),
            escape_sql(&b.key.institution),
            escape_sql(&b.key.resource),
            b.key.slot_type.as_str(),
            b.count,
            format_resource_map(&b.offered),
        );
    }

    sql
}

fn format_resource_map(map: &ResourceMap<f64>) -> String {
    format_map(map.iter().map(|(resource, v)| (resource.as_str().to_string(), *v)))
}

/// ClickHouse map literal: `{'k': v, ...}`. Non-finite values become 0.
fn format_map(entries: impl Iterator<Item = (String, f64)>) -> String {
    let mut out = String::from("{");
    for (idx, (key, value)) in entries.enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        let value = if value.is_finite() { value } else { 0.0 };
        let _ = write!(out, "'{}': {value}", escape_sql(&key));
    }
    out.push('}');
    out
}

fn format_datetime(dt: DateTime<Utc>) -> String {
    format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Summary document as written to stdout.
pub fn summary_document(bucket: &AggregationBucket) -> Value {
    json!({
        "_id": bucket.id(),
        "timestamp": bucket.timestamp_label(),
        "site": bucket.key.site,
        "country": bucket.key.country,
        "institution": bucket.key.institution,
        "resource": bucket.key.resource,
        "slot_type": bucket.key.slot_type,
        "count": bucket.count,
        "offered": bucket.offered,
        "claimed": bucket.claimed,
    })
}

/// Writes buckets as newline-delimited JSON.
pub struct StdoutExporter {
    out: parking_lot::Mutex<Box<dyn Write + Send>>,
}

impl Default for StdoutExporter {
    fn default() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

impl StdoutExporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: parking_lot::Mutex::new(out),
        }
    }

    pub fn name(&self) -> &str {
        "stdout"
    }

    pub async fn start(&mut self, _ctx: CancellationToken) -> Result<()> {
        Ok(())
    }

    pub async fn export(&self, buckets: &[AggregationBucket]) -> Result<()> {
        let mut out = self.out.lock();
        for bucket in buckets {
            serde_json::to_writer(&mut *out, &summary_document(bucket))
                .context("writing summary document")?;
            out.write_all(b"\n").context("writing summary document")?;
        }
        out.flush().context("flushing stdout")
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.out.lock().flush().context("flushing stdout")
    }
}
