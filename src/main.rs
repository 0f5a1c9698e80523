use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iptv_scan_rs::addrlist;
use iptv_scan_rs::config::{ScanConfig, WorkerCount};
use iptv_scan_rs::controller::ScanController;
use iptv_scan_rs::inspector::ProbeHeaders;
use iptv_scan_rs::server;
use iptv_scan_rs::sink::{ScanEvent, Sinks};
use iptv_scan_rs::types::{ChannelRecord, StatsSnapshot};

/// iptv-scan-rs: expand templated stream addresses and probe each one with ffprobe.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "iptv-scan-rs",
    version,
    about = "Expand templated stream addresses and probe each one with ffprobe.",
    long_about = None
)]
struct Cli {
    /// Address template with [start-end] ranges, e.g. http://10.0.0.1:4022/rtp/239.3.1.[1-255]:8000
    #[arg(long, conflicts_with = "list")]
    template: Option<String>,

    /// File with one address per line to validate instead of scanning a template.
    #[arg(long)]
    list: Option<PathBuf>,

    /// Worker threads; 0 picks min(2 x cores, 20). Explicit values are capped at 50.
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Per-address probe timeout in seconds.
    #[arg(long = "timeout-s", default_value_t = 10.0)]
    timeout_s: f64,

    /// User-Agent sent with HTTP reachability checks and to ffprobe.
    #[arg(long = "user-agent")]
    user_agent: Option<String>,

    /// Referer sent with HTTP reachability checks and to ffprobe.
    #[arg(long)]
    referer: Option<String>,

    /// Path to the ffprobe binary (overrides the config file).
    #[arg(long)]
    ffprobe: Option<PathBuf>,

    /// JSON file with scan tuning; missing fields use defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the HTTP API on this address instead of running one scan, e.g. 127.0.0.1:8080.
    #[arg(long)]
    serve: Option<String>,
}

#[derive(Debug, Serialize)]
struct ScanReport {
    stats: Option<StatsSnapshot>,
    records: Vec<ChannelRecord>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iptv_scan_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config.as_deref() {
        Some(path) => ScanConfig::from_json_file(path)?,
        None => ScanConfig::default(),
    };
    if let Some(ffprobe) = cli.ffprobe.clone() {
        config.inspector.program = ffprobe;
    }

    if let Some(bind) = cli.serve.as_deref() {
        info!("API server starting at http://{} (Ctrl+C to stop)", bind);
        tokio::select! {
            res = server::spawn_server(bind, config) => res?,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
        return Ok(());
    }

    if !(cli.timeout_s.is_finite() && cli.timeout_s > 0.0) {
        bail!("--timeout-s must be a positive number");
    }
    let timeout = Duration::from_secs_f64(cli.timeout_s);
    let workers = WorkerCount::from_flag(cli.workers);
    let headers = ProbeHeaders {
        user_agent: cli.user_agent.clone(),
        referer: cli.referer.clone(),
    };

    let (sinks, mut events) = Sinks::channel();
    let controller = Arc::new(ScanController::new(config, sinks));

    match (cli.template.as_deref(), cli.list.as_deref()) {
        (Some(template), _) => {
            println!("Scanning {} ({} workers)", template, workers.resolve());
            controller
                .start_scan(template, workers, timeout, headers)
                .context("cannot start scan")?;
        }
        (None, Some(path)) => {
            let addresses = addrlist::load_address_list(path)?;
            println!("Validating {} addresses from {}", addresses.len(), path.display());
            controller.set_probe_headers(headers);
            controller
                .start_validation(addresses, workers, timeout)
                .context("cannot start validation")?;
        }
        (None, None) => bail!("either --template or --list is required (or --serve)"),
    }

    let mut records = Vec::new();
    let mut last_stats = None;
    let mut last_pct = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ScanEvent::Result(record)) => records.push(record),
                Some(ScanEvent::Progress { processed, total }) => {
                    let pct = processed * 100 / total.max(1);
                    if last_pct != Some(pct) {
                        last_pct = Some(pct);
                        eprint!("\rprogress: {processed}/{total} ({pct}%)   ");
                    }
                }
                Some(ScanEvent::Stats(snapshot)) => {
                    let done = snapshot.finished;
                    last_stats = Some(snapshot);
                    if done {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, stopping");
                let c = controller.clone();
                tokio::task::spawn_blocking(move || {
                    c.stop_scan();
                    c.stop_validation();
                })
                .await?;
            }
        }
    }
    eprintln!();

    let report = ScanReport {
        stats: last_stats,
        records,
    };
    print_results_table(&report);
    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_results_json(path, &report) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }
    Ok(())
}

fn print_results_table(report: &ScanReport) {
    let mut name_w = "name".len();
    let mut addr_w = "address".len();
    for r in &report.records {
        name_w = name_w.max(r.name.chars().count().min(30));
        addr_w = addr_w.max(r.address.len().min(70));
    }
    let res_w = "resolution".len();
    let lat_w = "latency_ms".len();

    if let Some(s) = &report.stats {
        println!(
            "\nValid: {}  Invalid: {}  Total: {}  Elapsed: {:.1}s",
            s.valid, s.invalid, s.total, s.elapsed_seconds
        );
    }
    println!(
        "{:<name_w$}  {:<addr_w$}  {:<res_w$}  {:>lat_w$}  codec",
        "name",
        "address",
        "resolution",
        "latency_ms",
        name_w = name_w,
        addr_w = addr_w,
        res_w = res_w,
        lat_w = lat_w
    );
    println!(
        "{:-<name_w$}  {:-<addr_w$}  {:-<res_w$}  {:-<lat_w$}  -----",
        "",
        "",
        "",
        "",
        name_w = name_w,
        addr_w = addr_w,
        res_w = res_w,
        lat_w = lat_w
    );
    for r in &report.records {
        let name: String = r.name.chars().take(30).collect();
        let mut addr = r.address.clone();
        if addr.len() > 70 {
            addr = addr.chars().take(70).collect();
        }
        println!(
            "{:<name_w$}  {:<addr_w$}  {:<res_w$}  {:>lat_w$}  {}",
            name,
            addr,
            r.resolution.as_deref().unwrap_or("-"),
            r.latency_ms.map(|l| l.to_string()).unwrap_or_else(|| "-".into()),
            r.codec.as_deref().unwrap_or("-"),
            name_w = name_w,
            addr_w = addr_w,
            res_w = res_w,
            lat_w = lat_w
        );
    }
}

fn write_results_json(path: &std::path::Path, report: &ScanReport) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
