use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};

use crate::errors::ProbeError;

/// Coarse classification of why a probe failed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    NotFound,
    Permission,
    Inspector,
    Internal,
    Cancelled,
}

impl ErrorKind {
    /// Guess a kind from inspector diagnostic text.
    pub fn from_diagnostic(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            ErrorKind::Timeout
        } else if lower.contains("404") || lower.contains("not found") {
            ErrorKind::NotFound
        } else if lower.contains("permission") || lower.contains("403") {
            ErrorKind::Permission
        } else if lower.contains("connection") || lower.contains("refused") {
            ErrorKind::Connection
        } else {
            ErrorKind::Inspector
        }
    }
}

impl From<&ProbeError> for ErrorKind {
    fn from(err: &ProbeError) -> Self {
        match err {
            ProbeError::Timeout(_) => ErrorKind::Timeout,
            ProbeError::Reachability(_) => ErrorKind::Connection,
            ProbeError::Cancelled => ErrorKind::Cancelled,
            ProbeError::Process(text) => ErrorKind::from_diagnostic(text),
            ProbeError::Parse(_) | ProbeError::Io(_) => ErrorKind::Inspector,
        }
    }
}

/// Outcome of probing one address. `valid` is true iff a resolution was found.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub address: String,
    pub valid: bool,
    pub latency_ms: Option<u64>,
    pub resolution: Option<String>,
    pub codec: Option<String>,
    pub bitrate: Option<String>,
    pub raw_service_name: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl ProbeResult {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            valid: false,
            latency_ms: None,
            resolution: None,
            codec: None,
            bitrate: None,
            raw_service_name: None,
            error: None,
            error_kind: None,
        }
    }

    /// An invalid result carrying the given probe error.
    pub fn failed(address: impl Into<String>, err: &ProbeError, latency_ms: u64) -> Self {
        let mut r = Self::new(address);
        r.latency_ms = Some(latency_ms);
        r.error = Some(err.to_string());
        r.error_kind = Some(ErrorKind::from(err));
        r
    }

    /// Recompute validity from the resolution field.
    pub fn settle(mut self) -> Self {
        self.valid = self.resolution.is_some();
        self
    }
}

/// One finalized record handed to the result sink.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub name: String,
    pub address: String,
    pub valid: bool,
    pub latency_ms: Option<u64>,
    pub resolution: Option<String>,
    pub codec: Option<String>,
    pub bitrate: Option<String>,
    pub raw_name: Option<String>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ChannelRecord {
    pub fn from_probe(result: ProbeResult, name: String) -> Self {
        Self {
            name,
            address: result.address,
            valid: result.valid,
            latency_ms: result.latency_ms,
            resolution: result.resolution,
            codec: result.codec,
            bitrate: result.bitrate,
            raw_name: result.raw_service_name,
            error: result.error,
            timestamp: now_iso_like(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Scan,
    Validation,
}

/// Aggregate counters posted to the stats sink.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    /// Controller-assigned id of the session this snapshot belongs to.
    pub session: u64,
    pub total: u64,
    pub valid: u64,
    pub invalid: u64,
    pub elapsed_seconds: f64,
    pub started_at: String,
    pub is_validation: bool,
    pub finished: bool,
}

pub(crate) fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
