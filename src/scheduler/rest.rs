use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::{machine_constraint, JobQuery, QueryMode, ScheduleSource, MACHINE_PROJECTION};
use crate::ad::RawAd;
use crate::config::PoolConfig;

/// Callback type for recording scheduler request metrics.
/// Receives (endpoint_name, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// HTTP client for an HTCondor REST daemon.
pub struct RestClient {
    http: reqwest::Client,
    pool: String,
    endpoint: String,
    history_limit: usize,
    metrics: Option<MetricsCallback>,
}

impl RestClient {
    /// Create a client for one pool.
    pub fn new(pool: &PoolConfig, timeout: Duration, history_limit: usize) -> Result<Self> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(60)
        } else {
            timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            pool: pool.name.clone(),
            endpoint: pool.address.trim_end_matches('/').to_string(),
            history_limit,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    /// Perform a GET request and return the ads in the response.
    async fn get_ads(&self, endpoint: &str, path: &str, query: &[(&str, String)]) -> Result<Vec<RawAd>> {
        let start = Instant::now();
        let url = format!("{}{}", self.endpoint, path);

        let response = self
            .http
            .get(&url)
            .query(query)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting {path}"))?;

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, path, body);
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))?;

        self.record_request(endpoint, "success", start.elapsed());

        extract_ads(body).with_context(|| format!("reading ads from {path}"))
    }
}

/// Pulls ads out of a REST daemon response.
///
/// Entries are either `{"classad": {...}}` wrappers or bare ad objects.
fn extract_ads(body: Value) -> Result<Vec<RawAd>> {
    let Value::Array(entries) = body else {
        bail!("expected a JSON array of ads");
    };

    let mut ads = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::Object(mut obj) => match obj.remove("classad") {
                Some(Value::Object(ad)) => ads.push(ad),
                Some(_) => bail!("classad entry is not an object"),
                None => ads.push(obj),
            },
            other => bail!("unexpected ad entry: {other}"),
        }
    }

    Ok(ads)
}

fn ad_name(ad: &RawAd) -> Option<String> {
    ["Name", "name"]
        .into_iter()
        .find_map(|key| ad.get(key).and_then(Value::as_str))
        .map(str::to_string)
}

impl ScheduleSource for RestClient {
    fn pool(&self) -> &str {
        &self.pool
    }

    async fn machines(&self, since: DateTime<Utc>) -> Result<Vec<RawAd>> {
        debug!(pool = %self.pool, "fetching startd ads");

        self.get_ads(
            "status",
            "/v1/status",
            &[
                ("query", "startd".to_string()),
                ("constraint", machine_constraint(since)),
                ("projection", MACHINE_PROJECTION.join(",")),
            ],
        )
        .await
        .context("fetching startd ads")
    }

    async fn schedds(&self) -> Result<Vec<String>> {
        debug!(pool = %self.pool, "fetching schedd ads");

        let ads = self
            .get_ads(
                "status",
                "/v1/status",
                &[
                    ("query", "schedd".to_string()),
                    ("projection", "Name".to_string()),
                ],
            )
            .await
            .context("fetching schedd ads")?;

        Ok(ads.iter().filter_map(ad_name).collect())
    }

    async fn jobs(&self, schedd: &str, query: &JobQuery) -> Result<Vec<RawAd>> {
        debug!(pool = %self.pool, schedd, mode = query.mode.as_str(), "fetching job ads");

        let mut params = vec![
            ("schedd", schedd.to_string()),
            ("constraint", query.constraint.clone()),
            ("projection", query.projection.join(",")),
        ];

        let (endpoint, path) = match query.mode {
            QueryMode::Queue => ("jobs", "/v1/jobs"),
            QueryMode::History => {
                params.push(("limit", query.limit.min(self.history_limit).to_string()));
                ("history", "/v1/history")
            }
        };

        self.get_ads(endpoint, path, &params)
            .await
            .with_context(|| format!("fetching {} ads from {schedd}", query.mode.as_str()))
    }
}
