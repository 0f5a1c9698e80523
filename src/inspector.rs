//! External stream inspector (ffprobe) invocation and output parsing.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::errors::ProbeError;

static RESOLUTION_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{2,5})x(\d{2,5})\b").expect("static regex"));

/// How the inspector process is launched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    pub program: PathBuf,
    /// Arguments placed before the generated ones, e.g. for a wrapper command.
    pub leading_args: Vec<String>,
    pub probe_size: Option<u64>,
    pub analyze_duration_us: Option<u64>,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffprobe"),
            leading_args: Vec::new(),
            probe_size: None,
            analyze_duration_us: None,
        }
    }
}

/// Optional HTTP request headers forwarded to the reachability check and the inspector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProbeHeaders {
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

impl ProbeHeaders {
    pub fn is_empty(&self) -> bool {
        self.user_agent.is_none() && self.referer.is_none()
    }
}

/// Technical metadata extracted from one successful inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    pub resolution: Option<String>,
    pub codec: Option<String>,
    pub bitrate: Option<String>,
    pub service_name: Option<String>,
}

/// Failed inspection; `diagnostic` keeps stderr for best-effort recovery.
#[derive(Debug)]
pub struct InspectFailure {
    pub error: ProbeError,
    pub diagnostic: String,
}

impl From<ProbeError> for InspectFailure {
    fn from(error: ProbeError) -> Self {
        Self {
            error,
            diagnostic: String::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeOutput {
    streams: Vec<ProbeStream>,
    programs: Vec<ProbeProgram>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    coded_width: Option<u32>,
    coded_height: Option<u32>,
    bit_rate: Option<String>,
    tags: Option<ProbeTags>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeProgram {
    tags: Option<ProbeTags>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeFormat {
    bit_rate: Option<String>,
    tags: Option<ProbeTags>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeTags {
    service_name: Option<String>,
}

impl ProbeTags {
    fn service_name(tags: &Option<ProbeTags>) -> Option<&str> {
        tags.as_ref()
            .and_then(|t| t.service_name.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl ProbeStream {
    fn resolution(&self) -> Option<String> {
        let dims = match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => match (self.coded_width, self.coded_height) {
                (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
                _ => None,
            },
        };
        dims.map(|(w, h)| format!("{w}x{h}"))
    }
}

/// Parse inspector JSON into metadata.
///
/// The first video stream (or the first stream if none is tagged video) supplies
/// resolution, codec and bitrate. The service name comes from the first program,
/// then any stream, then the container.
pub fn parse_output(stdout: &str) -> Result<StreamMetadata, ProbeError> {
    if stdout.trim().is_empty() {
        return Err(ProbeError::Parse("empty output".into()));
    }
    let out: ProbeOutput =
        serde_json::from_str(stdout).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let stream = out
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .or_else(|| out.streams.first());

    let service_name = out
        .programs
        .first()
        .and_then(|p| ProbeTags::service_name(&p.tags))
        .or_else(|| out.streams.iter().find_map(|s| ProbeTags::service_name(&s.tags)))
        .or_else(|| out.format.as_ref().and_then(|f| ProbeTags::service_name(&f.tags)))
        .map(str::to_string);

    let bitrate = stream
        .and_then(|s| s.bit_rate.clone())
        .or_else(|| out.format.as_ref().and_then(|f| f.bit_rate.clone()));

    Ok(StreamMetadata {
        resolution: stream.and_then(ProbeStream::resolution),
        codec: stream.and_then(|s| s.codec_name.clone()),
        bitrate,
        service_name,
    })
}

/// Find a `WxH` token in free-form diagnostic text.
pub fn recover_resolution(diagnostic: &str) -> Option<String> {
    RESOLUTION_TOKEN
        .captures_iter(diagnostic)
        .find_map(|caps| {
            let w: u32 = caps[1].parse().ok()?;
            let h: u32 = caps[2].parse().ok()?;
            (w > 0 && h > 0).then(|| format!("{w}x{h}"))
        })
}

pub(crate) fn build_args(
    config: &InspectorConfig,
    address: &str,
    timeout: Duration,
    headers: &ProbeHeaders,
) -> Vec<String> {
    let mut args = config.leading_args.clone();
    args.extend(
        [
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "-show_programs",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push("-timeout".into());
    args.push(timeout.as_micros().to_string());
    if let Some(size) = config.probe_size {
        args.push("-probesize".into());
        args.push(size.to_string());
    }
    if let Some(dur) = config.analyze_duration_us {
        args.push("-analyzeduration".into());
        args.push(dur.to_string());
    }
    if is_http(address) {
        if let Some(ua) = &headers.user_agent {
            args.push("-user_agent".into());
            args.push(ua.clone());
        }
        if let Some(referer) = &headers.referer {
            args.push("-headers".into());
            args.push(format!("Referer: {referer}\r\n"));
        }
    }
    args.push(address.to_string());
    args
}

fn is_http(address: &str) -> bool {
    let lower = address.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Run the inspector against `address`.
///
/// The child is spawned with `kill_on_drop`, so losing the race against the
/// timeout or the cancellation token kills it.
pub async fn inspect(
    config: &InspectorConfig,
    address: &str,
    timeout: Duration,
    headers: &ProbeHeaders,
    cancel: &CancellationToken,
) -> Result<StreamMetadata, InspectFailure> {
    let mut cmd = Command::new(&config.program);
    cmd.args(build_args(config, address, timeout, headers))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(ProbeError::from)?;

    let output = tokio::select! {
        res = time::timeout(timeout, child.wait_with_output()) => match res {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ProbeError::from(e).into()),
            Err(_) => return Err(ProbeError::Timeout(timeout.as_secs_f64()).into()),
        },
        _ = cancel.cancelled() => return Err(ProbeError::Cancelled.into()),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        let message = if stderr.is_empty() {
            match output.status.code() {
                Some(code) => format!("inspector exited with code {code}"),
                None => "inspector terminated by signal".to_string(),
            }
        } else {
            truncate(&stderr, 200)
        };
        return Err(InspectFailure {
            error: ProbeError::Process(message),
            diagnostic: stderr,
        });
    }

    parse_output(&stdout).map_err(|error| InspectFailure {
        error,
        diagnostic: stderr,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_video_stream_and_program_name() {
        let json = r#"{
            "programs": [{"tags": {"service_name": "CCTV-1HD"}}],
            "streams": [
                {"codec_type": "audio", "codec_name": "mp2"},
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080, "bit_rate": "8000000"}
            ],
            "format": {"bit_rate": "9000000"}
        }"#;
        let meta = parse_output(json).unwrap();
        assert_eq!(meta.resolution.as_deref(), Some("1920x1080"));
        assert_eq!(meta.codec.as_deref(), Some("h264"));
        assert_eq!(meta.bitrate.as_deref(), Some("8000000"));
        assert_eq!(meta.service_name.as_deref(), Some("CCTV-1HD"));
    }

    #[test]
    fn falls_back_to_coded_dimensions_and_format_bitrate() {
        let json = r#"{"streams": [{"codec_type": "video", "coded_width": 720, "coded_height": 576}],
                       "format": {"bit_rate": "2000000", "tags": {"service_name": "News"}}}"#;
        let meta = parse_output(json).unwrap();
        assert_eq!(meta.resolution.as_deref(), Some("720x576"));
        assert_eq!(meta.bitrate.as_deref(), Some("2000000"));
        assert_eq!(meta.service_name.as_deref(), Some("News"));
    }

    #[test]
    fn audio_only_has_no_resolution() {
        let meta = parse_output(r#"{"streams": [{"codec_type": "audio", "codec_name": "aac"}]}"#).unwrap();
        assert_eq!(meta.resolution, None);
        assert_eq!(meta.codec.as_deref(), Some("aac"));
    }

    #[test]
    fn malformed_output_is_parse_error() {
        assert!(matches!(parse_output("not json"), Err(ProbeError::Parse(_))));
        assert!(matches!(parse_output("  "), Err(ProbeError::Parse(_))));
    }

    #[test]
    fn recovers_resolution_from_diagnostics() {
        let text = "Stream #0:0: Video: h264, yuv420p, 1280x720 [SAR 1:1], 25 fps\nerror: timeout";
        assert_eq!(recover_resolution(text).as_deref(), Some("1280x720"));
        assert_eq!(recover_resolution("0x1f is not a size"), None);
    }

    #[test]
    fn headers_only_for_http() {
        let headers = ProbeHeaders {
            user_agent: Some("UA".into()),
            referer: Some("http://r/".into()),
        };
        let cfg = InspectorConfig::default();
        let http = build_args(&cfg, "http://h/1.ts", Duration::from_secs(2), &headers);
        assert!(http.contains(&"-user_agent".to_string()));
        assert!(http.contains(&"2000000".to_string()));
        assert_eq!(http.last().map(String::as_str), Some("http://h/1.ts"));

        let udp = build_args(&cfg, "udp://239.0.0.1:1234", Duration::from_secs(2), &headers);
        assert!(!udp.contains(&"-user_agent".to_string()));
    }
}
