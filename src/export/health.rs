use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::ad::JobRecord;
use crate::ledger::Usage;
use crate::scheduler::QueryMode;
use crate::store::BulkReport;

const NAMESPACE: &str = "condor_occupancy";

/// Prometheus metrics for the agent and for the jobs it observes.
///
/// All metrics use the "condor_occupancy" namespace. Organized into groups:
/// - Polling: cycle, machine, claim and drop counters per pool
/// - Clients: request counters and latencies for the store and schedulers
/// - Summary: aggregation and exporter counters
/// - Jobs: per-job counters and histograms from history ads
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Polling ===
    /// Polling cycles by pool and result (ok/error).
    pub poll_cycles: CounterVec,
    /// Polling cycle duration by pool.
    pub poll_cycle_duration: HistogramVec,
    /// Machine heartbeats written by pool.
    pub machines_upserted: CounterVec,
    /// Startd ads rejected for missing or invalid identity fields.
    pub machine_ads_invalid: CounterVec,
    /// Claims that changed an epoch, by pool and query mode.
    pub claims_applied: CounterVec,
    /// Claims already present in the ledger, by pool.
    pub claims_duplicate: CounterVec,
    /// Job ads dropped before attribution, by pool and reason.
    pub jobs_dropped: CounterVec,
    /// Jobs with no matching slot epoch, by pool and query mode.
    pub jobs_unattributed: CounterVec,
    /// Epoch mutations that failed to write, by pool.
    pub store_write_failures: CounterVec,
    /// Schedd queries that failed, by pool and query mode.
    pub schedd_errors: CounterVec,

    // === Clients ===
    /// Store requests by operation and status.
    pub store_requests_total: CounterVec,
    /// Store request duration by operation.
    pub store_request_duration: HistogramVec,
    /// Scheduler requests by endpoint and status.
    pub scheduler_requests_total: CounterVec,
    /// Scheduler request duration by endpoint.
    pub scheduler_request_duration: HistogramVec,

    // === Summary ===
    /// Epochs folded into summary buckets.
    pub summary_epochs_scanned: Counter,
    /// Summary buckets written by exporter.
    pub summary_buckets_exported: CounterVec,
    /// Export batch errors by exporter and error_type.
    pub export_batch_errors: CounterVec,
    /// ClickHouse connection state per exporter (1=connected, 0=disconnected).
    pub clickhouse_connected: GaugeVec,

    // === Jobs ===
    /// Jobs seen in history, by job labels.
    pub job_count: CounterVec,
    /// Job walltime in hours, by job labels.
    pub job_walltime_hours: CounterVec,
    /// Requested resource times walltime, in GPU or CPU hours.
    pub job_resource_hours: CounterVec,
    /// Requested GPUs or CPUs per job.
    pub job_resource_request: HistogramVec,
    /// Requested memory per job in GB.
    pub job_memory_request_gb: HistogramVec,
    /// Peak resident memory per job in GB.
    pub job_memory_used_gb: HistogramVec,
}

/// Label names shared by the per-job counters.
const JOB_LABELS: &[&str] = &["owner", "site", "schedd", "kind", "device", "usage"];

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<CounterVec> {
    Ok(CounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        labels,
    )?)
}

fn histogram_vec(name: &str, help: &str, buckets: Vec<f64>, labels: &[&str]) -> Result<HistogramVec> {
    Ok(HistogramVec::new(
        HistogramOpts::new(name, help)
            .namespace(NAMESPACE)
            .buckets(buckets),
        labels,
    )?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Polling ===
        let poll_cycles = counter_vec(
            "poll_cycles_total",
            "Polling cycles by pool and result.",
            &["pool", "result"],
        )?;
        let poll_cycle_duration = histogram_vec(
            "poll_cycle_duration_seconds",
            "Polling cycle duration by pool.",
            vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0],
            &["pool"],
        )?;
        let machines_upserted = counter_vec(
            "machines_upserted_total",
            "Machine heartbeats written by pool.",
            &["pool"],
        )?;
        let machine_ads_invalid = counter_vec(
            "machine_ads_invalid_total",
            "Startd ads rejected for missing or invalid identity fields.",
            &["pool"],
        )?;
        let claims_applied = counter_vec(
            "claims_applied_total",
            "Claims that changed a slot epoch.",
            &["pool", "mode"],
        )?;
        let claims_duplicate = counter_vec(
            "claims_duplicate_total",
            "Claims already recorded for their epoch and outcome.",
            &["pool"],
        )?;
        let jobs_dropped = counter_vec(
            "jobs_dropped_total",
            "Job ads dropped before attribution.",
            &["pool", "reason"],
        )?;
        let jobs_unattributed = counter_vec(
            "jobs_unattributed_total",
            "Jobs with no matching slot epoch.",
            &["pool", "mode"],
        )?;
        let store_write_failures = counter_vec(
            "store_write_failures_total",
            "Epoch mutations that failed to write.",
            &["pool"],
        )?;
        let schedd_errors = counter_vec(
            "schedd_errors_total",
            "Schedd queries that failed.",
            &["pool", "mode"],
        )?;

        // === Clients ===
        let store_requests_total = counter_vec(
            "store_requests_total",
            "Store requests by operation and status.",
            &["operation", "status"],
        )?;
        let store_request_duration = histogram_vec(
            "store_request_duration_seconds",
            "Store request duration by operation.",
            vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            &["operation"],
        )?;
        let scheduler_requests_total = counter_vec(
            "scheduler_requests_total",
            "Scheduler requests by endpoint and status.",
            &["endpoint", "status"],
        )?;
        let scheduler_request_duration = histogram_vec(
            "scheduler_request_duration_seconds",
            "Scheduler request duration by endpoint.",
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            &["endpoint"],
        )?;

        // === Summary ===
        let summary_epochs_scanned = Counter::with_opts(
            Opts::new(
                "summary_epochs_scanned_total",
                "Epochs folded into summary buckets.",
            )
            .namespace(NAMESPACE),
        )?;
        let summary_buckets_exported = counter_vec(
            "summary_buckets_exported_total",
            "Summary buckets written by exporter.",
            &["exporter"],
        )?;
        let export_batch_errors = counter_vec(
            "export_batch_errors_total",
            "Export batch errors by exporter and error type.",
            &["exporter", "error_type"],
        )?;
        let clickhouse_connected = GaugeVec::new(
            Opts::new(
                "clickhouse_connected",
                "ClickHouse connection state per exporter (1=connected, 0=disconnected).",
            )
            .namespace(NAMESPACE),
            &["exporter"],
        )?;

        // === Jobs ===
        let job_count = counter_vec("job_count_total", "Jobs seen in history.", JOB_LABELS)?;
        let job_walltime_hours = counter_vec(
            "job_walltime_hours_total",
            "Job walltime in hours.",
            JOB_LABELS,
        )?;
        let job_resource_hours = counter_vec(
            "job_resource_hours_total",
            "Requested GPUs or CPUs times walltime, in hours.",
            JOB_LABELS,
        )?;
        let job_resource_request = histogram_vec(
            "job_resource_request",
            "Requested GPUs or CPUs per job.",
            vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0],
            &["kind"],
        )?;
        let job_memory_request_gb = histogram_vec(
            "job_memory_request_gb",
            "Requested memory per job in GB.",
            vec![0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0],
            &["kind"],
        )?;
        let job_memory_used_gb = histogram_vec(
            "job_memory_used_gb",
            "Peak resident memory per job in GB.",
            vec![0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0],
            &["kind"],
        )?;

        // Polling
        registry.register(Box::new(poll_cycles.clone()))?;
        registry.register(Box::new(poll_cycle_duration.clone()))?;
        registry.register(Box::new(machines_upserted.clone()))?;
        registry.register(Box::new(machine_ads_invalid.clone()))?;
        registry.register(Box::new(claims_applied.clone()))?;
        registry.register(Box::new(claims_duplicate.clone()))?;
        registry.register(Box::new(jobs_dropped.clone()))?;
        registry.register(Box::new(jobs_unattributed.clone()))?;
        registry.register(Box::new(store_write_failures.clone()))?;
        registry.register(Box::new(schedd_errors.clone()))?;

        // Clients
        registry.register(Box::new(store_requests_total.clone()))?;
        registry.register(Box::new(store_request_duration.clone()))?;
        registry.register(Box::new(scheduler_requests_total.clone()))?;
        registry.register(Box::new(scheduler_request_duration.clone()))?;

        // Summary
        registry.register(Box::new(summary_epochs_scanned.clone()))?;
        registry.register(Box::new(summary_buckets_exported.clone()))?;
        registry.register(Box::new(export_batch_errors.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;

        // Jobs
        registry.register(Box::new(job_count.clone()))?;
        registry.register(Box::new(job_walltime_hours.clone()))?;
        registry.register(Box::new(job_resource_hours.clone()))?;
        registry.register(Box::new(job_resource_request.clone()))?;
        registry.register(Box::new(job_memory_request_gb.clone()))?;
        registry.register(Box::new(job_memory_used_gb.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            poll_cycles,
            poll_cycle_duration,
            machines_upserted,
            machine_ads_invalid,
            claims_applied,
            claims_duplicate,
            jobs_dropped,
            jobs_unattributed,
            store_write_failures,
            schedd_errors,
            store_requests_total,
            store_request_duration,
            scheduler_requests_total,
            scheduler_request_duration,
            summary_epochs_scanned,
            summary_buckets_exported,
            export_batch_errors,
            clickhouse_connected,
            job_count,
            job_walltime_hours,
            job_resource_hours,
            job_resource_request,
            job_memory_request_gb,
            job_memory_used_gb,
        })
    }

    /// Records one store request.
    pub fn record_store_request(&self, operation: &str, status: &str, duration: Duration) {
        self.store_requests_total
            .with_label_values(&[operation, status])
            .inc();
        self.store_request_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Records one scheduler request.
    pub fn record_scheduler_request(&self, endpoint: &str, status: &str, duration: Duration) {
        self.scheduler_requests_total
            .with_label_values(&[endpoint, status])
            .inc();
        self.scheduler_request_duration
            .with_label_values(&[endpoint])
            .observe(duration.as_secs_f64());
    }

    /// Records the results of a claim batch for `pool`.
    pub fn record_claims(&self, pool: &str, mode: QueryMode, report: &BulkReport) {
        self.claims_applied
            .with_label_values(&[pool, mode.as_str()])
            .inc_by(report.updated as f64);
        self.claims_duplicate
            .with_label_values(&[pool])
            .inc_by(report.noop as f64);
        self.store_write_failures
            .with_label_values(&[pool])
            .inc_by(report.failures.len() as f64);
    }

    /// Records the job metrics for one history ad.
    ///
    /// Jobs with negative walltime and DAGMan jobs are skipped. Returns
    /// whether the job was counted.
    pub fn record_job(&self, job: &JobRecord, usage: Usage) -> bool {
        if job.walltime_hrs < 0.0 || job.cmd == DAGMAN_CMD {
            return false;
        }

        let gpu = job.requests.gpus > 0.0;
        let kind = if gpu { "GPU" } else { "CPU" };
        let labels = [
            job.owner.as_str(),
            job.site.as_str(),
            job.schedd(),
            kind,
            job.gpu_device_name.as_str(),
            usage.as_str(),
        ];

        self.job_count.with_label_values(&labels).inc();
        self.job_walltime_hours
            .with_label_values(&labels)
            .inc_by(job.walltime_hrs);

        let (request, hours) = if gpu {
            (job.requests.gpus, job.gpu_hrs)
        } else {
            (job.requests.cpus, job.cpu_hrs)
        };
        if hours >= 0.0 {
            self.job_resource_hours.with_label_values(&labels).inc_by(hours);
        }

        self.job_resource_request
            .with_label_values(&[kind])
            .observe(request);
        self.job_memory_request_gb
            .with_label_values(&[kind])
            .observe(job.requests.memory / 1024.0);
        self.job_memory_used_gb
            .with_label_values(&[kind])
            .observe(job.resident_set_size_raw / 1_048_576.0);

        true
    }

    /// Renders all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Command of DAGMan jobs, which hold no slot of their own.
const DAGMAN_CMD: &str = "/usr/bin/condor_dagman";

fn render_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
