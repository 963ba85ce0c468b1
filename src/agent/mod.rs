use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, StoreConfig, StoreKind};
use crate::export::health::HealthMetrics;
use crate::export::{ClickHouseSummaryExporter, StdoutExporter, SummaryExporter};
use crate::poll::{run_cycle, CursorFile, Cursors, PollContext};
use crate::scheduler::rest::RestClient;
use crate::scheduler::ScheduleSource;
use crate::store::{Backend, ElasticStore, MemoryStore, SlotStore};
use crate::summarize::{aggregate, OverlapRule, SummaryWindow};

/// Buckets handed to the exporters per call.
const DEFAULT_EXPORT_BATCH: usize = 1000;

/// Window and output of one summarize pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRequest {
    pub after: String,
    pub before: String,
    pub interval: String,
    /// Write buckets to stdout only.
    pub dry_run: bool,
}

/// Counts from one summarize pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryReport {
    pub epochs: usize,
    pub buckets: usize,
}

/// Agent wires the store, schedulers, poll loops and exporters together.
pub struct Agent {
    cfg: Arc<Config>,
    health: Arc<HealthMetrics>,
    store: Option<Arc<Backend>>,
    pollers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg: Arc::new(cfg),
            health,
            store: None,
            pollers: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Starts the health server and one poll loop per pool.
    pub async fn start(&mut self) -> Result<()> {
        self.cfg.validate_polling()?;

        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let store = Arc::new(open_store(&self.cfg.store, &self.health).await?);
        info!(store = store.name(), "slot store ready");

        let cursor_file = match &self.cfg.poll.cursor_file {
            Some(path) => Some(Arc::new(CursorFile::open(path)?)),
            None => None,
        };

        for pool in &self.cfg.scheduler.pools {
            let health = Arc::clone(&self.health);
            let source = RestClient::new(pool, self.cfg.scheduler.timeout, self.cfg.scheduler.history_match)
                .with_context(|| format!("creating scheduler client for pool {}", pool.name))?
                .with_metrics(Box::new(move |endpoint, status, duration| {
                    health.record_scheduler_request(endpoint, status, duration);
                }));

            info!(pool = %pool.name, address = %pool.address, "starting poll loop");

            self.pollers.push(tokio::spawn(poll_loop(
                Arc::clone(&self.cfg),
                Arc::clone(&self.health),
                Arc::clone(&store),
                source,
                cursor_file.clone(),
                self.cancel.child_token(),
            )));
        }

        self.store = Some(store);

        info!(pools = self.pollers.len(), "agent fully started");

        Ok(())
    }

    /// Stops the poll loops, waiting for in-flight writes to settle.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for handle in self.pollers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "poll loop panicked");
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    /// Runs one aggregation pass and exports its buckets.
    pub async fn summarize(&self, req: &SummaryRequest) -> Result<SummaryReport> {
        let window = SummaryWindow::resolve(&req.after, &req.before, &req.interval, Utc::now())
            .context("resolving summary window")?;

        let store = match &self.store {
            Some(store) => Arc::clone(store),
            None => Arc::new(open_store(&self.cfg.store, &self.health).await?),
        };

        let mut exporters = Vec::new();
        let summary = &self.cfg.summary;

        if req.dry_run || summary.stdout.enabled {
            exporters.push(SummaryExporter::Stdout(StdoutExporter::default()));
        }

        if !req.dry_run && summary.clickhouse.enabled {
            exporters.push(SummaryExporter::ClickHouse(ClickHouseSummaryExporter::new(
                summary.clickhouse.clone(),
                Some(Arc::clone(&self.health)),
            )));
        }

        if exporters.is_empty() {
            bail!("no summary exporter enabled (enable summary.clickhouse or summary.stdout, or pass --dry-run)");
        }

        for exporter in &mut exporters {
            exporter
                .start(self.cancel.child_token())
                .await
                .with_context(|| format!("starting {} exporter", exporter.name()))?;
        }

        info!(
            after = %window.after,
            before = %window.before,
            interval_secs = window.interval.num_seconds(),
            exporters = exporters.len(),
            "starting summary pass"
        );

        let result = export_summary(
            store.as_ref(),
            window,
            summary.overlap,
            summary.page_size,
            &exporters,
            Some(self.health.as_ref()),
        )
        .await;

        for exporter in &mut exporters {
            if let Err(e) = exporter.stop().await {
                error!(exporter = exporter.name(), error = %e, "error stopping exporter");
            }
        }

        let report = result?;
        info!(
            epochs = report.epochs,
            buckets = report.buckets,
            "summary pass complete"
        );

        Ok(report)
    }
}

/// Aggregates `window` and hands buckets to every exporter in batches.
pub async fn export_summary<S: SlotStore>(
    store: &S,
    window: SummaryWindow,
    rule: OverlapRule,
    page_size: usize,
    exporters: &[SummaryExporter],
    health: Option<&HealthMetrics>,
) -> Result<SummaryReport> {
    let mut scan = aggregate(store, window, rule, page_size);
    let mut batch = Vec::with_capacity(DEFAULT_EXPORT_BATCH);
    let mut buckets = 0;

    while let Some(bucket) = scan.next().await.context("aggregating summary buckets")? {
        batch.push(bucket);
        if batch.len() >= DEFAULT_EXPORT_BATCH {
            buckets += batch.len();
            export_batch(exporters, &batch).await?;
            batch.clear();
        }
    }

    if !batch.is_empty() {
        buckets += batch.len();
        export_batch(exporters, &batch).await?;
    }

    let epochs = scan.epochs_read();
    if let Some(h) = health {
        h.summary_epochs_scanned.inc_by(epochs as f64);
    }

    Ok(SummaryReport { epochs, buckets })
}

async fn export_batch(
    exporters: &[SummaryExporter],
    batch: &[crate::summarize::AggregationBucket],
) -> Result<()> {
    for exporter in exporters {
        exporter
            .export(batch)
            .await
            .with_context(|| format!("exporting to {}", exporter.name()))?;
    }
    Ok(())
}

/// Opens the configured store; an unreachable store is fatal.
async fn open_store(cfg: &StoreConfig, health: &Arc<HealthMetrics>) -> Result<Backend> {
    match cfg.kind {
        StoreKind::Memory => {
            warn!("using in-memory store, slot epochs are lost on exit");
            Ok(Backend::Memory(MemoryStore::new()))
        }
        StoreKind::Elasticsearch => {
            let health = Arc::clone(health);
            let store = ElasticStore::new(cfg)
                .context("creating store client")?
                .with_metrics(Box::new(move |operation, status, duration| {
                    health.record_store_request(operation, status, duration);
                }));

            store.ping().await?;
            store.ensure_index().await?;

            Ok(Backend::Elastic(store))
        }
    }
}

/// Polls one pool every `poll.interval` until cancelled.
async fn poll_loop(
    cfg: Arc<Config>,
    health: Arc<HealthMetrics>,
    store: Arc<Backend>,
    source: RestClient,
    cursor_file: Option<Arc<CursorFile>>,
    cancel: CancellationToken,
) {
    let ctx = PollContext::new(&cfg, Some(health.as_ref()));
    let pool = source.pool().to_string();
    let mut cursors = cursor_file
        .as_ref()
        .map(|file| file.cursors(&pool))
        .unwrap_or_else(Cursors::default);

    let mut ticker = tokio::time::interval(cfg.poll.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let start = Instant::now();

                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(pool = %pool, "poll cycle interrupted by shutdown");
                        return;
                    }
                    result = run_cycle(&ctx, &source, store.as_ref(), &mut cursors, Utc::now()) => result,
                };

                health
                    .poll_cycle_duration
                    .with_label_values(&[&pool])
                    .observe(start.elapsed().as_secs_f64());

                match result {
                    Ok(_) => {
                        health.poll_cycles.with_label_values(&[&pool, "ok"]).inc();

                        if let Some(file) = &cursor_file {
                            if let Err(e) = file.save(&pool, &cursors) {
                                warn!(pool = %pool, error = %format!("{e:#}"), "saving history cursors failed");
                            }
                        }
                    }
                    Err(e) => {
                        health.poll_cycles.with_label_values(&[&pool, "error"]).inc();
                        warn!(pool = %pool, error = %format!("{e:#}"), "poll cycle failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::{DateTime, Duration, TimeZone};

    use super::*;
    use crate::ad::MachineAd;
    use crate::resource::Capacity;
    use crate::store::EpochUpdate;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid ts")
    }

    #[derive(Clone, Default)]
    struct Buffer(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn ad(name: &str, site: &str) -> MachineAd {
        MachineAd {
            name: name.to_string(),
            daemon_start: at(0),
            last_heard_from: at(1_200),
            totals: Capacity {
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
    async fn test_export_summary_streams_buckets() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                EpochUpdate::heartbeat(ad("slot1@a", "NPX")),
                EpochUpdate::heartbeat(ad("slot1@b", "CHTC")),
            ])
            .await
            .expect("seed");

        let buffer = Buffer::default();
        let exporters = vec![SummaryExporter::Stdout(StdoutExporter::new(Box::new(
            buffer.clone(),
        )))];
        let window = SummaryWindow {
            after: at(0),
            before: at(1_200),
            interval: Duration::seconds(600),
        };
        let health = HealthMetrics::new(":0").expect("metrics");

        let report = export_summary(&store, window, OverlapRule::Average, 1, &exporters, Some(&health))
            .await
            .expect("export");

        assert_eq!(report, SummaryReport { epochs: 2, buckets: 4 });
        assert_eq!(health.summary_epochs_scanned.get(), 2.0);

        let text = String::from_utf8(buffer.0.lock().clone()).expect("utf8");
        assert_eq!(text.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_summarize_requires_exporter() {
        let mut cfg = Config::default();
        cfg.store.kind = StoreKind::Memory;
        let agent = Agent::new(cfg).expect("agent");

        let req = SummaryRequest {
            after: "1h".to_string(),
            before: "0s".to_string(),
            interval: "20m".to_string(),
            dry_run: false,
        };
        let err = agent.summarize(&req).await.expect_err("no exporters");
        assert!(err.to_string().contains("no summary exporter"));
    }
}
