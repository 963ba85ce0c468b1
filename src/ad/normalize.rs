use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::sites;
use super::RawAd;
use crate::resource::ResourceMap;

const RESOURCE_NAME_KEY: &str = "MATCH_EXP_JOBGLIDEIN_ResourceName";

/// Declared type and default of a whitelisted job attribute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    Number(f64),
    Bool(bool),
    Text(&'static str),
    /// Epoch-seconds timestamp, defaulting to the normalization time.
    Date,
}

/// A coerced attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Date(DateTime<Utc>),
}

/// Job attributes kept after normalization. Everything else is discarded.
pub static JOB_FIELDS: &[(&str, FieldKind)] = &[
    ("JobStatus", FieldKind::Number(0.0)),
    ("Cmd", FieldKind::Text("")),
    ("Owner", FieldKind::Text("")),
    ("AccountingGroup", FieldKind::Text("")),
    ("ImageSize_RAW", FieldKind::Number(0.0)),
    ("DiskUsage_RAW", FieldKind::Number(0.0)),
    ("ExecutableSize_RAW", FieldKind::Number(0.0)),
    ("BytesSent", FieldKind::Number(0.0)),
    ("BytesRecvd", FieldKind::Number(0.0)),
    ("ResidentSetSize_RAW", FieldKind::Number(0.0)),
    ("RequestCpus", FieldKind::Number(1.0)),
    ("Requestgpus", FieldKind::Number(0.0)),
    ("RequestMemory", FieldKind::Number(1000.0)),
    ("RequestDisk", FieldKind::Number(1_000_000.0)),
    ("NumJobStarts", FieldKind::Number(0.0)),
    ("NumShadowStarts", FieldKind::Number(0.0)),
    ("GlobalJobId", FieldKind::Text("")),
    ("ClusterId", FieldKind::Number(0.0)),
    ("ProcId", FieldKind::Number(0.0)),
    ("ExitBySignal", FieldKind::Bool(false)),
    ("ExitCode", FieldKind::Number(0.0)),
    ("ExitSignal", FieldKind::Number(0.0)),
    ("ExitStatus", FieldKind::Number(0.0)),
    ("CumulativeSlotTime", FieldKind::Number(0.0)),
    ("LastRemoteHost", FieldKind::Text("")),
    ("QDate", FieldKind::Date),
    ("JobStartDate", FieldKind::Date),
    ("JobCurrentStartDate", FieldKind::Date),
    ("EnteredCurrentStatus", FieldKind::Date),
    ("RemoteUserCpu", FieldKind::Number(0.0)),
    ("RemoteSysCpu", FieldKind::Number(0.0)),
    ("CompletionDate", FieldKind::Date),
    ("CommittedTime", FieldKind::Number(0.0)),
    ("RemoteWallClockTime", FieldKind::Number(0.0)),
    (RESOURCE_NAME_KEY, FieldKind::Text("other")),
    ("MachineAttrGLIDEIN_SiteResource0", FieldKind::Text("other")),
    ("MachineAttrGPU_NAMES0", FieldKind::Text("")),
    ("StartdPrincipal", FieldKind::Text("")),
    ("DAGManJobId", FieldKind::Number(0.0)),
    ("LastJobStatus", FieldKind::Number(0.0)),
    ("LastVacateTime", FieldKind::Number(0.0)),
    ("LastMatchTime", FieldKind::Number(0.0)),
    ("JobLastStartDate", FieldKind::Number(0.0)),
    ("LastHoldReason", FieldKind::Text("")),
    ("LastRemotePool", FieldKind::Text("")),
];

/// Spellings of the GPU request folded onto `Requestgpus`; later entries win.
const GPU_REQUEST_ALIASES: [&str; 2] = ["RequestGpus", "RequestGPUs"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("job ad has no GlobalJobId")]
    MissingJobId,
}

/// A job ad coerced to the fixed schema, with derived accounting fields.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub global_job_id: String,
    pub cluster_id: f64,
    pub job_status: f64,
    pub exit_code: f64,
    pub exit_by_signal: bool,
    pub qdate: DateTime<Utc>,
    pub job_current_start_date: DateTime<Utc>,
    pub entered_current_status: DateTime<Utc>,
    pub completion_date: DateTime<Utc>,
    /// Epoch seconds; zero when the job never restarted.
    pub job_last_start_date: f64,
    /// Epoch seconds; zero when the job was never vacated.
    pub last_vacate_time: f64,
    pub committed_time: f64,
    pub remote_wall_clock_time: f64,
    pub resident_set_size_raw: f64,
    /// `Requestgpus`, `RequestCpus`, `RequestMemory` and `RequestDisk`.
    pub requests: ResourceMap<f64>,
    pub owner: String,
    pub cmd: String,
    pub last_remote_host: String,
    pub gpu_device_name: String,
    /// Glidein resource name after domain/IP fallback.
    pub resource_name: String,
    pub site: String,

    pub date: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub queue_time_hrs: f64,
    pub total_walltime_hrs: f64,
    pub walltime_hrs: f64,
    pub gpu_hrs: f64,
    pub cpu_hrs: f64,
    pub retry_time_hrs: f64,

    /// Every whitelisted attribute after coercion.
    pub fields: BTreeMap<&'static str, FieldValue>,
}

impl JobRecord {
    /// Scheduler name: the `GlobalJobId` prefix before the first `#`.
    pub fn schedd(&self) -> &str {
        self.global_job_id
            .split('#')
            .next()
            .unwrap_or(&self.global_job_id)
    }
}

/// Normalizes a raw job ad.
///
/// Coercion never fails the record: a value of the wrong type takes the
/// field's default, and an unreadable timestamp becomes the Unix epoch.
/// Only a missing or empty `GlobalJobId` drops the ad.
pub fn normalize(raw: &RawAd, now: DateTime<Utc>) -> Result<JobRecord, NormalizeError> {
    let gpu_request = GPU_REQUEST_ALIASES
        .iter()
        .rev()
        .find_map(|alias| raw.get(*alias));

    let mut fields = BTreeMap::new();
    for (key, kind) in JOB_FIELDS {
        let value = match (*key, gpu_request) {
            ("Requestgpus", Some(alias)) => Some(alias),
            _ => raw.get(*key),
        };
        fields.insert(*key, coerce(key, value, *kind, now));
    }

    let view = Fields(&fields);

    let global_job_id = view.text("GlobalJobId").to_string();
    if global_job_id.is_empty() {
        return Err(NormalizeError::MissingJobId);
    }

    let last_remote_host = view.text("LastRemoteHost").to_string();
    let resource_name = resolve_resource_name(
        view.text(RESOURCE_NAME_KEY),
        &last_remote_host,
        view.text("StartdPrincipal"),
    );
    fields.insert(RESOURCE_NAME_KEY, FieldValue::Text(resource_name.clone()));
    let view = Fields(&fields);

    let zero = epoch_zero();
    let completion_date = view.date("CompletionDate");
    let entered_current_status = view.date("EnteredCurrentStatus");
    let job_current_start_date = view.date("JobCurrentStartDate");
    let qdate = view.date("QDate");

    let date = if completion_date != zero {
        completion_date
    } else if entered_current_status != zero {
        entered_current_status
    } else {
        now
    };

    let queue_end = if job_current_start_date != zero {
        job_current_start_date
    } else {
        now
    };
    let queue_time_hrs = (queue_end - qdate).num_milliseconds() as f64 / 3_600_000.0;

    let committed_time = view.number("CommittedTime");
    let last_vacate_time = view.number("LastVacateTime");
    let job_last_start_date = view.number("JobLastStartDate");
    let remote_wall_clock_time = view.number("RemoteWallClockTime");

    let total_walltime_hrs = remote_wall_clock_time / 3600.0;
    let walltime_hrs = if committed_time != 0.0 {
        committed_time / 3600.0
    } else if last_vacate_time != 0.0 && job_last_start_date != 0.0 {
        (last_vacate_time - job_last_start_date) / 3600.0
    } else {
        0.0
    };

    let requests = ResourceMap {
        gpus: view.number("Requestgpus"),
        cpus: view.number("RequestCpus"),
        memory: view.number("RequestMemory"),
        disk: view.number("RequestDisk"),
    };

    Ok(JobRecord {
        global_job_id,
        cluster_id: view.number("ClusterId"),
        job_status: view.number("JobStatus"),
        exit_code: view.number("ExitCode"),
        exit_by_signal: view.flag("ExitBySignal"),
        qdate,
        job_current_start_date,
        entered_current_status,
        completion_date,
        job_last_start_date,
        last_vacate_time,
        committed_time,
        remote_wall_clock_time,
        resident_set_size_raw: view.number("ResidentSetSize_RAW"),
        requests,
        owner: view.text("Owner").to_string(),
        cmd: view.text("Cmd").to_string(),
        last_remote_host,
        gpu_device_name: view.text("MachineAttrGPU_NAMES0").to_string(),
        site: sites::canonical_site(&resource_name).to_string(),
        resource_name,
        date,
        timestamp: now,
        queue_time_hrs,
        total_walltime_hrs,
        walltime_hrs,
        gpu_hrs: requests.gpus * total_walltime_hrs,
        cpu_hrs: requests.cpus * total_walltime_hrs,
        retry_time_hrs: total_walltime_hrs - walltime_hrs,
        fields,
    })
}

fn resolve_resource_name(current: &str, last_remote_host: &str, startd_principal: &str) -> String {
    if !sites::is_bad_resource_name(Some(current)) {
        return current.to_string();
    }

    let host = last_remote_host.rsplit('@').next().unwrap_or_default();
    let ip = startd_principal.rsplit('/').next().unwrap_or_default();

    sites::site_from_domain(host)
        .or_else(|| sites::site_from_ip(ip))
        .map(str::to_string)
        .unwrap_or_else(|| current.to_string())
}

fn epoch_zero() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn coerce(key: &str, value: Option<&Value>, kind: FieldKind, now: DateTime<Utc>) -> FieldValue {
    let value = value.filter(|v| !v.is_null());

    match kind {
        FieldKind::Number(default) => FieldValue::Number(match value {
            None => default,
            Some(v) => as_number(v).unwrap_or_else(|| {
                debug!(key, value = %v, "bad number, using default");
                default
            }),
        }),
        FieldKind::Bool(default) => FieldValue::Bool(match value {
            None => default,
            Some(v) => as_bool(v).unwrap_or_else(|| {
                debug!(key, value = %v, "bad bool, using default");
                default
            }),
        }),
        FieldKind::Text(default) => FieldValue::Text(match value {
            None => default.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => other.to_string(),
        }),
        FieldKind::Date => FieldValue::Date(match value {
            None => now,
            Some(v) => as_date(v).unwrap_or_else(|| {
                debug!(key, value = %v, "bad date, using epoch");
                epoch_zero()
            }),
        }),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    let seconds = match value {
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    if !seconds.is_finite() {
        return None;
    }

    let millis = (seconds * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

struct Fields<'a>(&'a BTreeMap<&'static str, FieldValue>);

impl<'a> Fields<'a> {
    fn number(&self, key: &str) -> f64 {
        match self.0.get(key) {
            Some(FieldValue::Number(n)) => *n,
            _ => 0.0,
        }
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(FieldValue::Bool(true)))
    }

    fn text(&self, key: &str) -> &'a str {
        match self.0.get(key) {
            Some(FieldValue::Text(s)) => s.as_str(),
            _ => "",
        }
    }

    fn date(&self, key: &str) -> DateTime<Utc> {
        match self.0.get(key) {
            Some(FieldValue::Date(d)) => *d,
            _ => epoch_zero(),
        }
    }
}
