use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::errors::ProbeError;
use crate::inspector::{self, InspectFailure, InspectorConfig, ProbeHeaders, StreamMetadata};
use crate::types::{ErrorKind, ProbeResult};

const MULTICAST_SCHEMES: &[&str] = &["rtp", "udp", "rtsp"];
const MULTICAST_PATH_MARKERS: &[&str] = &["/rtp/", "/udp/", "/rtsp/"];
const TIER_SUFFIXES: &[&str] = &["FHD", "HD", "SD", "4K", "8K"];
/// Bytes read while waiting for the HEAD status line.
const STATUS_LINE_LIMIT: usize = 1024;

/// Anything that can turn one address into a `ProbeResult`.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        address: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Multicast,
    Unicast,
}

/// Multicast schemes and udpxy-style relay paths skip the reachability check.
pub fn classify(address: &str) -> Delivery {
    let lower = address.to_ascii_lowercase();
    let by_scheme = MULTICAST_SCHEMES
        .iter()
        .any(|s| lower.starts_with(&format!("{s}://")));
    if by_scheme || MULTICAST_PATH_MARKERS.iter().any(|m| lower.contains(m)) {
        Delivery::Multicast
    } else {
        Delivery::Unicast
    }
}

/// Strip one trailing resolution tier (`-HD`, `FHD`, `-4K`, ...) from a service name.
pub fn clean_service_name(name: &str) -> String {
    let trimmed = name.trim();
    let upper = trimmed.to_ascii_uppercase();
    for suffix in TIER_SUFFIXES {
        if upper.len() > suffix.len() && upper.ends_with(suffix) {
            let mut cut = trimmed.len() - suffix.len();
            if trimmed[..cut].ends_with('-') {
                cut -= 1;
            }
            let base = trimmed[..cut].trim_end();
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    trimmed.to_string()
}

/// ffprobe-backed stream probe.
#[derive(Debug, Clone, Default)]
pub struct StreamProbe {
    inspector: InspectorConfig,
    headers: ProbeHeaders,
}

impl StreamProbe {
    pub fn new(inspector: InspectorConfig, headers: ProbeHeaders) -> Self {
        Self { inspector, headers }
    }

    async fn probe_multicast(
        &self,
        address: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StreamMetadata, ProbeError> {
        match inspector::inspect(&self.inspector, address, timeout, &self.headers, cancel).await {
            Ok(meta) => Ok(meta),
            Err(InspectFailure { error, diagnostic }) => match inspector::recover_resolution(&diagnostic) {
                Some(resolution) => {
                    debug!(%address, %resolution, "recovered resolution from inspector diagnostics");
                    Ok(StreamMetadata {
                        resolution: Some(resolution),
                        ..StreamMetadata::default()
                    })
                }
                None => Err(error),
            },
        }
    }

    async fn probe_unicast(
        &self,
        address: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StreamMetadata, ProbeError> {
        let started = Instant::now();
        let budget = timeout / 2;
        tokio::select! {
            res = check_reachable(address, budget, &self.headers) => res?,
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
        }
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout.as_secs_f64()));
        }
        inspector::inspect(&self.inspector, address, remaining, &self.headers, cancel)
            .await
            .map_err(|f| match f.error {
                ProbeError::Timeout(_) => ProbeError::Timeout(timeout.as_secs_f64()),
                other => other,
            })
    }
}

#[async_trait]
impl Prober for StreamProbe {
    async fn probe(
        &self,
        address: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeResult {
        let start = Instant::now();
        let outcome = match classify(address) {
            Delivery::Multicast => self.probe_multicast(address, timeout, cancel).await,
            Delivery::Unicast => self.probe_unicast(address, timeout, cancel).await,
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(meta) => {
                let mut r = ProbeResult::new(address);
                r.latency_ms = Some(latency_ms);
                r.resolution = meta.resolution;
                r.codec = meta.codec;
                r.bitrate = meta.bitrate;
                r.raw_service_name = meta.service_name.as_deref().map(clean_service_name);
                let r = r.settle();
                if !r.valid {
                    return ProbeResult {
                        error: Some("no video resolution found".into()),
                        error_kind: Some(ErrorKind::Inspector),
                        ..r
                    };
                }
                r
            }
            Err(err) => {
                debug!(%address, error = %err, "probe failed");
                ProbeResult::failed(address, &err, latency_ms)
            }
        }
    }
}

/// Unicast pre-check: an HTTP(S) HEAD request, or a plain TCP connect for other schemes.
pub async fn check_reachable(
    address: &str,
    budget: Duration,
    headers: &ProbeHeaders,
) -> Result<(), ProbeError> {
    let url = Url::parse(address).map_err(|e| ProbeError::Reachability(format!("bad address: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| ProbeError::Reachability("address has no host".into()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .or_else(|| default_port(url.scheme()))
        .ok_or_else(|| ProbeError::Reachability(format!("no port for scheme {}", url.scheme())))?;

    let attempt = async {
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| ProbeError::Reachability(format!("connect {host}:{port}: {e}")))?;
        match url.scheme() {
            "http" => head_request(stream, &url, headers).await,
            "https" => {
                // Reachability only; certificates and host names are not verified.
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()
                    .map_err(|e| ProbeError::Reachability(format!("tls setup: {e}")))?;
                let connector = tokio_native_tls::TlsConnector::from(connector);
                let tls = connector
                    .connect(&host, stream)
                    .await
                    .map_err(|e| ProbeError::Reachability(format!("tls handshake: {e}")))?;
                head_request(tls, &url, headers).await
            }
            _ => Ok(()),
        }
    };

    match time::timeout(budget, attempt).await {
        Ok(res) => res,
        Err(_) => Err(ProbeError::Reachability(format!(
            "no response within {:.1}s",
            budget.as_secs_f64()
        ))),
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "rtmp" => Some(1935),
        "rtsp" => Some(554),
        "mms" | "mmsh" => Some(1755),
        _ => None,
    }
}

async fn head_request<S>(mut stream: S, url: &Url, headers: &ProbeHeaders) -> Result<(), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut path = url.path().to_string();
    if let Some(q) = url.query() {
        path.push('?');
        path.push_str(q);
    }
    let host = match url.port() {
        Some(p) => format!("{}:{p}", url.host_str().unwrap_or_default()),
        None => url.host_str().unwrap_or_default().to_string(),
    };
    let mut req = format!("HEAD {path} HTTP/1.1\r\nHost: {host}\r\nAccept: */*\r\nConnection: close\r\n");
    if let Some(ua) = &headers.user_agent {
        req.push_str(&format!("User-Agent: {ua}\r\n"));
    }
    if let Some(referer) = &headers.referer {
        req.push_str(&format!("Referer: {referer}\r\n"));
    }
    req.push_str("\r\n");

    stream
        .write_all(req.as_bytes())
        .await
        .map_err(|e| ProbeError::Reachability(format!("send HEAD: {e}")))?;

    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    while buf.len() < STATUS_LINE_LIMIT && !buf.windows(2).any(|w| w == b"\r\n") {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ProbeError::Reachability(format!("read HEAD response: {e}")))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf);
    let status = parse_status(&head)
        .ok_or_else(|| ProbeError::Reachability("no HTTP status line in response".into()))?;
    if status == 404 || status == 410 {
        return Err(ProbeError::Reachability(format!("HTTP {status}")));
    }
    Ok(())
}

fn parse_status(head: &str) -> Option<u16> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let proto = parts.next()?;
    if !proto.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
