use std::collections::HashMap;
use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::{
    apply_mutation, BulkReport, EpochPage, EpochUpdate, MutationOutcome, ScanCursor, ScanWindow,
    SlotStore, StoreError,
};
use crate::attribution::EpochLookup;
use crate::config::StoreConfig;
use crate::epoch::{EpochId, MachineAdRecord};

/// Callback type for recording store request metrics.
/// Receives (operation, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Grouping fields every summarized epoch must carry, in scan sort order.
const GROUP_FIELDS: [&str; 4] = ["site", "country", "institution", "resource"];

/// Document store speaking the Elasticsearch/OpenSearch REST API.
///
/// Epoch updates are optimistic read-modify-write cycles: documents are read
/// with their sequence numbers, mutated locally, and written back with
/// `if_seq_no`/`if_primary_term`. Version conflicts re-read and retry.
pub struct ElasticStore {
    http: reqwest::Client,
    endpoint: String,
    index: String,
    bearer_token: Option<String>,
    compression: String,
    retry: RetryPolicy,
    conflict_retries: u32,
    metrics: Option<MetricsCallback>,
}

struct Body {
    bytes: Vec<u8>,
    content_type: &'static str,
}

impl Body {
    fn json(value: &Value) -> Result<Self, StoreError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StoreError::Rejected(format!("serializing request: {e}")))?;
        Ok(Self {
            bytes,
            content_type: "application/json",
        })
    }

    fn ndjson(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: "application/x-ndjson",
        }
    }
}

impl ElasticStore {
    /// Create a store client from configuration.
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(300)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.address.trim_end_matches('/').to_string(),
            index: cfg.index.clone(),
            bearer_token: cfg.bearer_token.clone(),
            compression: cfg.compression.clone(),
            retry: RetryPolicy::from(cfg.retry),
            conflict_retries: cfg.conflict_retries,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, operation: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(operation, status, duration);
        }
    }

    /// Verifies the store is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.call("ping", Method::GET, "/", None)
            .await
            .with_context(|| format!("pinging store at {}", self.endpoint))?;
        Ok(())
    }

    /// Creates the epoch index with its mapping if it does not exist.
    pub async fn ensure_index(&self) -> Result<()> {
        let path = format!("/{}", self.index);

        match self.call("index_exists", Method::HEAD, &path, None).await {
            Ok(_) => {
                debug!(index = %self.index, "epoch index exists");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => {
                let body = Body::json(&index_mapping())?;
                self.call("create_index", Method::PUT, &path, Some(&body))
                    .await
                    .with_context(|| format!("creating index {}", self.index))?;
                info!(index = %self.index, "created epoch index");
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("checking index {}", self.index)),
        }
    }

    /// One request with transient failures retried.
    async fn call(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&Body>,
    ) -> Result<Value, StoreError> {
        self.retry
            .run(operation, || self.send(operation, method.clone(), path, body))
            .await
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&Body>,
    ) -> Result<Value, StoreError> {
        let start = Instant::now();
        let url = format!("{}{}", self.endpoint, path);

        let mut request = self
            .http
            .request(method, &url)
            .header("Accept", "application/json");

        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        if let Some(body) = body {
            let payload = compress(&body.bytes, &self.compression)
                .map_err(|e| StoreError::Rejected(format!("{operation}: {e:#}")))?;
            request = request
                .header("Content-Type", body.content_type)
                .body(payload);
            if let Some(encoding) = content_encoding(&self.compression) {
                request = request.header("Content-Encoding", encoding);
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.record_request(operation, "error", start.elapsed());
                return Err(StoreError::Transient(format!("{operation}: {e}")));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                self.record_request(operation, "error", start.elapsed());
                return Err(StoreError::Transient(format!("{operation}: reading body: {e}")));
            }
        };

        if !status.is_success() {
            self.record_request(operation, "error", start.elapsed());
            return Err(classify_status(status, format!("{operation}: {status}: {text}")));
        }

        self.record_request(operation, "success", start.elapsed());

        if text.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&text)
            .map_err(|e| StoreError::Rejected(format!("{operation}: decoding response: {e}")))
    }

    async fn mget(&self, groups: &[UpdateGroup]) -> Result<Vec<Result<Option<StoredDoc>, StoreError>>> {
        let ids: Vec<&str> = groups.iter().map(|g| g.epoch.as_str()).collect();
        let body = Body::json(&json!({ "ids": ids }))?;

        let response = self
            .call("mget", Method::POST, &format!("/{}/_mget", self.index), Some(&body))
            .await
            .context("reading epoch documents")?;

        parse_mget(response, groups.len())
    }
}

/// Maps an HTTP error status onto the store error taxonomy.
fn classify_status(status: StatusCode, message: String) -> StoreError {
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::CONFLICT => StoreError::Conflict(message),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => StoreError::Transient(message),
        _ => StoreError::Rejected(message),
    }
}

fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "epoch_id": {"type": "keyword"},
                "Name": {"type": "keyword"},
                "DaemonStartTime": {"type": "date"},
                "LastHeardFrom": {"type": "date"},
                "site": {"type": "keyword"},
                "country": {"type": "keyword"},
                "institution": {"type": "keyword"},
                "resource": {"type": "keyword"},
                "slot_type": {"type": "keyword"},
                "duration": {"type": "long"},
                "jobs": {"type": "object", "enabled": false},
            },
            "dynamic_templates": [
                {"accounting": {
                    "path_match": "claims.*",
                    "mapping": {"type": "double"},
                }},
                {"fractions": {
                    "path_match": "occupancy.*",
                    "mapping": {"type": "double"},
                }},
            ],
        }
    })
}

/// Updates for one epoch, in submission order.
#[derive(Debug)]
struct UpdateGroup {
    epoch: EpochId,
    updates: Vec<EpochUpdate>,
}

fn group_updates(updates: Vec<EpochUpdate>) -> Vec<UpdateGroup> {
    let mut positions: HashMap<EpochId, usize> = HashMap::new();
    let mut groups: Vec<UpdateGroup> = Vec::new();

    for update in updates {
        match positions.get(&update.epoch) {
            Some(&i) => groups[i].updates.push(update),
            None => {
                positions.insert(update.epoch.clone(), groups.len());
                groups.push(UpdateGroup {
                    epoch: update.epoch.clone(),
                    updates: vec![update],
                });
            }
        }
    }

    groups
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Version {
    seq_no: u64,
    primary_term: u64,
}

#[derive(Debug)]
struct StoredDoc {
    record: MachineAdRecord,
    version: Version,
}

#[derive(Deserialize)]
struct MgetResponse {
    docs: Vec<MgetDoc>,
}

#[derive(Deserialize)]
struct MgetDoc {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    found: bool,
    #[serde(rename = "_seq_no")]
    seq_no: Option<u64>,
    #[serde(rename = "_primary_term")]
    primary_term: Option<u64>,
    #[serde(rename = "_source")]
    source: Option<Value>,
}

fn parse_mget(response: Value, expected: usize) -> Result<Vec<Result<Option<StoredDoc>, StoreError>>> {
    let parsed: MgetResponse =
        serde_json::from_value(response).context("decoding mget response")?;

    if parsed.docs.len() != expected {
        bail!(
            "mget returned {} documents for {} ids",
            parsed.docs.len(),
            expected
        );
    }

    Ok(parsed
        .docs
        .into_iter()
        .map(|doc| {
            if !doc.found {
                return Ok(None);
            }

            let (Some(seq_no), Some(primary_term), Some(source)) =
                (doc.seq_no, doc.primary_term, doc.source)
            else {
                return Err(StoreError::Rejected(format!(
                    "document {} has no version or source",
                    doc.id
                )));
            };

            let record: MachineAdRecord = serde_json::from_value(source).map_err(|e| {
                StoreError::Rejected(format!("decoding document {}: {e}", doc.id))
            })?;

            Ok(Some(StoredDoc {
                record,
                version: Version {
                    seq_no,
                    primary_term,
                },
            }))
        })
        .collect())
}

/// A group whose mutations have been applied locally, awaiting its write.
struct PreparedWrite {
    group: UpdateGroup,
    version: Option<Version>,
    record: MachineAdRecord,
    outcomes: Vec<MutationOutcome>,
    errors: Vec<StoreError>,
}

/// Applies a group's mutations to the stored document.
///
/// Returns the write to perform, or `None` when nothing changed, in which
/// case the group's results are already in `report`.
fn prepare_write(
    group: UpdateGroup,
    stored: Option<StoredDoc>,
    report: &mut BulkReport,
) -> Option<PreparedWrite> {
    let (mut current, version) = match stored {
        Some(doc) => (Some(doc.record), Some(doc.version)),
        None => (None, None),
    };

    let mut outcomes = Vec::with_capacity(group.updates.len());
    let mut errors = Vec::new();
    for update in &group.updates {
        match apply_mutation(&mut current, update) {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => errors.push(err),
        }
    }

    let changed = outcomes.iter().any(|o| *o != MutationOutcome::Noop);
    match current {
        Some(record) if changed => Some(PreparedWrite {
            group,
            version,
            record,
            outcomes,
            errors,
        }),
        _ => {
            finish(report, &group.epoch, outcomes, errors);
            None
        }
    }
}

fn finish(
    report: &mut BulkReport,
    epoch: &EpochId,
    outcomes: Vec<MutationOutcome>,
    errors: Vec<StoreError>,
) {
    for outcome in outcomes {
        report.record(outcome);
    }
    for error in errors {
        report.fail(epoch.clone(), error);
    }
}

fn bulk_body(writes: &[PreparedWrite]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(writes.len() * 1024);

    for write in writes {
        let action = match write.version {
            Some(v) => json!({"index": {
                "_id": write.group.epoch.as_str(),
                "if_seq_no": v.seq_no,
                "if_primary_term": v.primary_term,
            }}),
            None => json!({"create": {"_id": write.group.epoch.as_str()}}),
        };
        serde_json::to_writer(&mut buf, &action).context("serializing bulk action")?;
        buf.push(b'\n');
        serde_json::to_writer(&mut buf, &write.record).context("serializing epoch document")?;
        buf.push(b'\n');
    }

    Ok(buf)
}

/// Per-item results of a `_bulk` response, in request order.
fn parse_bulk_items(response: &Value, expected: usize) -> Result<Vec<Result<(), StoreError>>> {
    let items = response
        .get("items")
        .and_then(Value::as_array)
        .context("bulk response has no items")?;

    if items.len() != expected {
        bail!("bulk returned {} items for {} writes", items.len(), expected);
    }

    items
        .iter()
        .map(|item| {
            let result = item
                .as_object()
                .and_then(|obj| obj.values().next())
                .context("empty bulk item")?;

            let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
            if (200..300).contains(&status) {
                return Ok(Ok(()));
            }

            let reason = result
                .get("error")
                .map(|e| {
                    e.get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| e.to_string())
                })
                .unwrap_or_else(|| format!("status {status}"));

            let code = u16::try_from(status)
                .ok()
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

            Ok(Err(classify_status(code, reason)))
        })
        .collect()
}

fn msearch_body(lookups: &[EpochLookup]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(lookups.len() * 256);

    for lookup in lookups {
        buf.extend_from_slice(b"{}\n");
        let query = json!({
            "size": 1,
            "_source": false,
            "query": {"bool": {"filter": [
                {"term": {"Name": lookup.slot}},
                {"range": {"DaemonStartTime": {"lte": lookup.not_after.to_rfc3339()}}},
            ]}},
            "sort": [{"DaemonStartTime": {"order": "desc"}}],
        });
        serde_json::to_writer(&mut buf, &query).context("serializing epoch lookup")?;
        buf.push(b'\n');
    }

    Ok(buf)
}

fn parse_msearch(response: &Value, expected: usize) -> Result<Vec<Option<EpochId>>> {
    let responses = response
        .get("responses")
        .and_then(Value::as_array)
        .context("msearch response has no responses")?;

    if responses.len() != expected {
        bail!(
            "msearch returned {} responses for {} lookups",
            responses.len(),
            expected
        );
    }

    Ok(responses
        .iter()
        .map(|r| {
            if let Some(error) = r.get("error") {
                warn!(error = %error, "epoch lookup failed");
                return None;
            }
            r.pointer("/hits/hits/0/_id")
                .and_then(Value::as_str)
                .map(|id| EpochId::from(id.to_string()))
        })
        .collect())
}

fn scan_query(window: &ScanWindow, cursor: Option<&ScanCursor>, size: usize) -> Value {
    let mut filters: Vec<Value> = GROUP_FIELDS
        .iter()
        .map(|field| json!({"exists": {"field": field}}))
        .collect();
    filters.push(json!({"range": {"DaemonStartTime": {"lt": window.before.to_rfc3339()}}}));
    filters.push(json!({"range": {"LastHeardFrom": {"gte": window.after.to_rfc3339()}}}));

    let mut sort: Vec<Value> = GROUP_FIELDS
        .iter()
        .map(|field| json!({ *field: "asc" }))
        .collect();
    sort.push(json!({"slot_type": "asc"}));
    sort.push(json!({"epoch_id": "asc"}));

    let mut query = json!({
        "size": size + 1,
        "query": {"bool": {"filter": filters}},
        "sort": sort,
    });

    if let Some(c) = cursor {
        query["search_after"] = json!([
            c.key.site,
            c.key.country,
            c.key.institution,
            c.key.resource,
            c.key.slot_type.as_str(),
            c.epoch.as_str(),
        ]);
    }

    query
}

fn parse_scan(response: Value, size: usize) -> Result<EpochPage> {
    let hits = match response.pointer("/hits/hits") {
        Some(Value::Array(hits)) => hits.clone(),
        _ => bail!("search response has no hits"),
    };

    let mut records = Vec::with_capacity(hits.len());
    for hit in hits {
        let source = hit.get("_source").cloned().context("search hit has no _source")?;
        let record: MachineAdRecord =
            serde_json::from_value(source).context("decoding epoch document")?;
        records.push(record);
    }

    let more = records.len() > size;
    records.truncate(size);

    let next = if more {
        records
            .last()
            .and_then(|r| r.group_key().map(|key| ScanCursor::after(key, r)))
    } else {
        None
    };

    Ok(EpochPage { records, next })
}

impl SlotStore for ElasticStore {
    async fn apply(&self, updates: Vec<EpochUpdate>) -> Result<BulkReport> {
        let mut report = BulkReport::default();
        let mut pending = group_updates(updates);
        let mut round: u32 = 0;

        while !pending.is_empty() {
            // After the first round some documents are already written, so a
            // failed call fails only what is still pending.
            let docs = match self.mget(&pending).await {
                Ok(docs) => docs,
                Err(e) if round > 0 => {
                    fail_groups(&mut report, pending.iter(), &e);
                    break;
                }
                Err(e) => return Err(e),
            };

            let mut writes = Vec::new();
            for (group, doc) in pending.into_iter().zip(docs) {
                match doc {
                    Ok(stored) => {
                        if let Some(write) = prepare_write(group, stored, &mut report) {
                            writes.push(write);
                        }
                    }
                    Err(err) => {
                        for _ in &group.updates {
                            report.fail(group.epoch.clone(), err.clone());
                        }
                    }
                }
            }

            if writes.is_empty() {
                break;
            }

            let body = Body::ndjson(bulk_body(&writes)?);
            let path = format!("/{}/_bulk?refresh=wait_for", self.index);
            let results = match self
                .call("bulk", Method::POST, &path, Some(&body))
                .await
                .context("writing epoch documents")
                .and_then(|response| parse_bulk_items(&response, writes.len()))
            {
                Ok(results) => results,
                Err(e) if round > 0 => {
                    fail_groups(&mut report, writes.iter().map(|w| &w.group), &e);
                    break;
                }
                Err(e) => return Err(e),
            };

            let mut retry = Vec::new();
            let mut backoff = false;
            for (write, result) in writes.into_iter().zip(results) {
                match result {
                    Ok(()) => finish(&mut report, &write.group.epoch, write.outcomes, write.errors),
                    Err(err)
                        if (matches!(err, StoreError::Conflict(_)) || err.is_transient())
                            && round < self.conflict_retries =>
                    {
                        debug!(epoch = %write.group.epoch, error = %err, "retrying epoch write");
                        backoff |= err.is_transient();
                        retry.push(write.group);
                    }
                    Err(err) => {
                        for _ in &write.group.updates {
                            report.fail(write.group.epoch.clone(), err.clone());
                        }
                    }
                }
            }

            if backoff {
                tokio::time::sleep(self.retry.delay(round)).await;
            }

            pending = retry;
            round += 1;
        }

        Ok(report)
    }

    async fn find_epochs(&self, lookups: &[EpochLookup]) -> Result<Vec<Option<EpochId>>> {
        if lookups.is_empty() {
            return Ok(Vec::new());
        }

        let body = Body::ndjson(msearch_body(lookups)?);
        let response = self
            .call(
                "msearch",
                Method::POST,
                &format!("/{}/_msearch", self.index),
                Some(&body),
            )
            .await
            .context("looking up slot epochs")?;

        parse_msearch(&response, lookups.len())
    }

    async fn scan_epochs(
        &self,
        window: &ScanWindow,
        cursor: Option<&ScanCursor>,
        size: usize,
    ) -> Result<EpochPage> {
        let body = Body::json(&scan_query(window, cursor, size))?;
        let response = self
            .call(
                "search",
                Method::POST,
                &format!("/{}/_search", self.index),
                Some(&body),
            )
            .await
            .context("scanning slot epochs")?;

        parse_scan(response, size)
    }
}

/// Fails every update in `groups` with the error of the call that carried them.
fn fail_groups<'a>(
    report: &mut BulkReport,
    groups: impl Iterator<Item = &'a UpdateGroup>,
    error: &anyhow::Error,
) {
    let error = StoreError::Transient(format!("{error:#}"));
    for group in groups {
        warn!(epoch = %group.epoch, error = %error, "epoch write abandoned");
        for _ in &group.updates {
            report.fail(group.epoch.clone(), error.clone());
        }
    }
}

fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => {
            use flate2::write::GzEncoder;
            use flate2::Compression;

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).context("gzip write")?;
            encoder.finish().context("gzip finish")
        }
        other => bail!("unsupported compression: {other}"),
    }
}

fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}
