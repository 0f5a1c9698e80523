//! Consumer-facing delivery points. The scan core only ever "posts" to these;
//! implementations decide which thread or task consumes the data.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;

use crate::types::{ChannelRecord, ProbeResult, StatsSnapshot};

static CHANNEL_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"/channel(\d+)/").expect("static regex"));
static SMIL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(\d+)\.(?:smil|smail)$").expect("static regex"));

pub trait ResultSink: Send + Sync {
    fn post_result(&self, record: ChannelRecord);
}

pub trait ProgressSink: Send + Sync {
    fn post_progress(&self, processed: u64, total: u64);
}

pub trait StatsSink: Send + Sync {
    fn post_stats(&self, snapshot: StatsSnapshot);
}

/// Maps a raw probe result to the display name attached to its record.
pub trait NameResolver: Send + Sync {
    fn display_name(&self, result: &ProbeResult) -> String;
}

impl<F> NameResolver for F
where
    F: Fn(&ProbeResult) -> String + Send + Sync,
{
    fn display_name(&self, result: &ProbeResult) -> String {
        self(result)
    }
}

/// Uses the stream's own service name, else a name derived from the address.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNames;

impl NameResolver for DefaultNames {
    fn display_name(&self, result: &ProbeResult) -> String {
        match result.raw_service_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => name_from_address(&result.address),
        }
    }
}

/// Best-effort channel name from an address.
pub fn name_from_address(address: &str) -> String {
    let lower = address.to_ascii_lowercase();
    for marker in ["/rtp/", "/stp/", "/udp/", "/rtsp/"] {
        if let Some(idx) = lower.find(marker) {
            let rest = &address[idx + marker.len()..];
            return strip_query(rest).trim().to_string();
        }
    }
    if let Some(caps) = CHANNEL_ID.captures(&lower) {
        return format!("CHANNEL{}", &caps[1]);
    }
    let clean = strip_query(address);
    if let Some(caps) = SMIL_ID.captures(&clean.to_ascii_lowercase()) {
        return caps[1].to_string();
    }
    if let Some((_, rest)) = clean.split_once("://") {
        let segment = rest.rsplit('/').find(|p| !p.is_empty()).unwrap_or(rest);
        return segment
            .rsplit_once('.')
            .filter(|(stem, _)| !stem.is_empty() && rest.contains('/'))
            .map(|(stem, _)| stem)
            .unwrap_or(segment)
            .to_string();
    }
    clean.to_string()
}

fn strip_query(s: &str) -> &str {
    s.split(['?', '#']).next().unwrap_or(s)
}

/// Everything a session posts, as one message type.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Result(ChannelRecord),
    Progress { processed: u64, total: u64 },
    Stats(StatsSnapshot),
}

/// Sink that forwards every post onto an unbounded tokio channel, so the
/// consumer can live on any runtime or thread.
#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl EventChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn post(&self, event: ScanEvent) {
        // The consumer hanging up is not an error for the scan.
        let _ = self.tx.send(event);
    }
}

impl ResultSink for EventChannel {
    fn post_result(&self, record: ChannelRecord) {
        self.post(ScanEvent::Result(record));
    }
}

impl ProgressSink for EventChannel {
    fn post_progress(&self, processed: u64, total: u64) {
        self.post(ScanEvent::Progress { processed, total });
    }
}

impl StatsSink for EventChannel {
    fn post_stats(&self, snapshot: StatsSnapshot) {
        self.post(ScanEvent::Stats(snapshot));
    }
}

/// The collaborators a controller delivers to.
#[derive(Clone)]
pub struct Sinks {
    pub results: Arc<dyn ResultSink>,
    pub progress: Arc<dyn ProgressSink>,
    pub stats: Arc<dyn StatsSink>,
    pub names: Arc<dyn NameResolver>,
}

impl Sinks {
    /// Route all three streams through one `EventChannel`, naming with `DefaultNames`.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (chan, rx) = EventChannel::new();
        let chan = Arc::new(chan);
        let sinks = Self {
            results: chan.clone(),
            progress: chan.clone(),
            stats: chan,
            names: Arc::new(DefaultNames),
        };
        (sinks, rx)
    }

    pub fn with_names(mut self, names: Arc<dyn NameResolver>) -> Self {
        self.names = names;
        self
    }
}
