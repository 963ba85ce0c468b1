use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::ledger::{GoodputRule, HistoryCheck, OutcomePolicy};
use crate::summarize::{parse_timedelta, OverlapRule};

/// Top-level configuration for the occupancy accountant.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Slot epoch document store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Scheduler pools to poll.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Polling cadence and lookback windows.
    #[serde(default)]
    pub poll: PollConfig,

    /// Job outcome classification.
    #[serde(default)]
    pub outcome: OutcomeConfig,

    /// Time-bucket summaries.
    #[serde(default)]
    pub summary: SummaryConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Which backing store holds slot epochs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process-local store; state is lost on restart.
    Memory,
    #[default]
    Elasticsearch,
}

/// Slot epoch document store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Base URL of the document store (e.g., "http://localhost:9200").
    #[serde(default)]
    pub address: String,

    /// Index holding slot epoch documents. Default: "condor_status".
    #[serde(default = "default_index")]
    pub index: String,

    /// Bearer token sent with every request.
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Request timeout. Default: 300s.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Documents per search page. Default: 500.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Request body compression (none, gzip). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Backoff for transient write failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Optimistic-concurrency retries per document. Default: 5.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt. Default: 20.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, doubled each attempt. Default: 2s.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on a single delay. Default: 1h.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

/// Scheduler pools and request settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    /// Request timeout. Default: 60s.
    #[serde(default = "default_scheduler_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum history ads fetched per schedd per cycle. Default: 10000.
    #[serde(default = "default_history_match")]
    pub history_match: usize,
}

/// One pool served by an HTCondor REST daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Pool name used in logs and metric labels.
    pub name: String,

    /// REST daemon base URL (e.g., "http://collector.example.org:8080").
    pub address: String,
}

/// Polling cadence and lookback windows.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Time between polling cycles. Default: 5m.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Startd heartbeats older than this are ignored. Default: 1h.
    #[serde(default = "default_machine_lookback", with = "humantime_serde")]
    pub machine_lookback: Duration,

    /// Queue scan window for evicted and held jobs. Default: 10m.
    #[serde(default = "default_eviction_lookback", with = "humantime_serde")]
    pub eviction_lookback: Duration,

    /// Minimum run time before a vacate counts as an eviction. Default: 60s.
    #[serde(default = "default_min_evicted_walltime", with = "humantime_serde")]
    pub min_evicted_walltime: Duration,

    /// History scan window: how far before `now` a schedd without a cursor
    /// is read, and how far behind its cursor a known schedd is re-read.
    /// Default: 10m.
    #[serde(default = "default_history_lookback", with = "humantime_serde")]
    pub history_lookback: Duration,

    /// File persisting per-schedd history cursors between restarts.
    #[serde(default)]
    pub cursor_file: Option<PathBuf>,
}

/// Job outcome classification configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeConfig {
    /// Checks applied to history jobs before the exit code. Default: [removed_status].
    #[serde(default = "default_history_precedence")]
    pub history_precedence: Vec<HistoryCheck>,

    /// Goodput rule for job metrics.
    #[serde(default)]
    pub goodput: GoodputRule,
}

/// Time-bucket summary configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryConfig {
    /// Bucket width as a timedelta (e.g., "20m"). Default: "20m".
    #[serde(default = "default_summary_interval")]
    pub interval: String,

    /// Window start, as a timedelta before now or an RFC 3339 time. Default: "2d".
    #[serde(default = "default_summary_after")]
    pub after: String,

    /// Window end, as a timedelta before now or an RFC 3339 time. Default: "0d".
    #[serde(default = "default_summary_before")]
    pub before: String,

    /// How an epoch's lifetime is spread across buckets. Default: average.
    #[serde(default)]
    pub overlap: OverlapRule,

    /// Epochs per store page while scanning. Default: 1000.
    #[serde(default = "default_summary_page_size")]
    pub page_size: usize,

    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    #[serde(default)]
    pub stdout: StdoutConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Enable the ClickHouse exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Target table name. Default: "resource_summaries".
    #[serde(default = "default_table")]
    pub table: String,

    /// Rows per insert statement. Default: 10000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// NDJSON summary output on stdout.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StdoutConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_index() -> String {
    "condor_status".to_string()
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_page_size() -> usize {
    500
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_conflict_retries() -> u32 {
    5
}

fn default_max_retries() -> u32 {
    20
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(3600)
}

fn default_scheduler_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_history_match() -> usize {
    10_000
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_machine_lookback() -> Duration {
    Duration::from_secs(3600)
}

fn default_eviction_lookback() -> Duration {
    Duration::from_secs(600)
}

fn default_min_evicted_walltime() -> Duration {
    Duration::from_secs(60)
}

fn default_history_lookback() -> Duration {
    Duration::from_secs(600)
}

fn default_history_precedence() -> Vec<HistoryCheck> {
    OutcomePolicy::default().history_checks
}

fn default_summary_interval() -> String {
    "20m".to_string()
}

fn default_summary_after() -> String {
    "2d".to_string()
}

fn default_summary_before() -> String {
    "0d".to_string()
}

fn default_summary_page_size() -> usize {
    1000
}

fn default_database() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "resource_summaries".to_string()
}

fn default_batch_size() -> usize {
    10_000
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            poll: PollConfig::default(),
            outcome: OutcomeConfig::default(),
            summary: SummaryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            address: String::new(),
            index: default_index(),
            bearer_token: None,
            timeout: default_store_timeout(),
            page_size: default_page_size(),
            compression: default_compression(),
            retry: RetryConfig::default(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            timeout: default_scheduler_timeout(),
            history_match: default_history_match(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            machine_lookback: default_machine_lookback(),
            eviction_lookback: default_eviction_lookback(),
            min_evicted_walltime: default_min_evicted_walltime(),
            history_lookback: default_history_lookback(),
            cursor_file: None,
        }
    }
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            history_precedence: default_history_precedence(),
            goodput: GoodputRule::default(),
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            interval: default_summary_interval(),
            after: default_summary_after(),
            before: default_summary_before(),
            overlap: OverlapRule::default(),
            page_size: default_summary_page_size(),
            clickhouse: ClickHouseConfig::default(),
            stdout: StdoutConfig::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            batch_size: default_batch_size(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.store.kind == StoreKind::Elasticsearch && self.store.address.is_empty() {
            bail!("store.address is required for the elasticsearch store");
        }

        if self.store.page_size == 0 {
            bail!("store.page_size must be positive");
        }

        match self.store.compression.as_str() {
            "none" | "gzip" => {}
            other => bail!("invalid store compression type: {other}"),
        }

        if self.store.retry.initial_backoff > self.store.retry.max_backoff {
            bail!("store.retry.initial_backoff must not exceed max_backoff");
        }

        let mut pool_names = HashSet::new();
        for pool in &self.scheduler.pools {
            if pool.name.is_empty() {
                bail!("scheduler pool name is required");
            }
            if pool.address.is_empty() {
                bail!("scheduler pool {} has no address", pool.name);
            }
            if !pool_names.insert(pool.name.as_str()) {
                bail!("scheduler pool appears more than once: {}", pool.name);
            }
        }

        if self.scheduler.history_match == 0 {
            bail!("scheduler.history_match must be positive");
        }

        if self.poll.interval.is_zero() {
            bail!("poll.interval must be positive");
        }

        let mut checks = HashSet::new();
        for check in &self.outcome.history_precedence {
            if !checks.insert(*check) {
                bail!("outcome.history_precedence lists {check:?} more than once");
            }
        }

        let interval = parse_timedelta(&self.summary.interval)
            .with_context(|| format!("parsing summary.interval {:?}", self.summary.interval))?;
        if interval.num_milliseconds() <= 0 {
            bail!("summary.interval must be positive");
        }

        if self.summary.page_size == 0 {
            bail!("summary.page_size must be positive");
        }

        if self.summary.clickhouse.enabled {
            if self.summary.clickhouse.endpoint.is_empty() {
                bail!("summary.clickhouse.endpoint is required when enabled");
            }
            if self.summary.clickhouse.batch_size == 0 {
                bail!("summary.clickhouse.batch_size must be positive when enabled");
            }
        }

        Ok(())
    }

    /// Additional checks for the polling loop.
    pub fn validate_polling(&self) -> Result<()> {
        if self.scheduler.pools.is_empty() {
            bail!("at least one scheduler pool is required");
        }

        Ok(())
    }
}

impl OutcomeConfig {
    pub fn policy(&self) -> OutcomePolicy {
        OutcomePolicy {
            history_checks: self.history_precedence.clone(),
        }
    }
}
