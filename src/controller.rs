use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ScanConfig, WorkerCount};
use crate::errors::ScanError;
use crate::inspector::ProbeHeaders;
use crate::pool::{AddressSource, PoolSettings, WorkerPool, WorkerState};
use crate::probe::{Prober, StreamProbe};
use crate::sink::Sinks;
use crate::stats::{self, StatsAggregator};
use crate::template::AddressTemplate;
use crate::types::{ScanMode, StatsSnapshot};

/// One running range scan or list validation.
struct ScanSession {
    mode: ScanMode,
    stop: CancellationToken,
    pool: WorkerPool,
    stats: Arc<StatsAggregator>,
    // Detached on teardown; it posts the final snapshot on its own.
    _ticker: JoinHandle<()>,
}

enum ProberKind {
    Ffprobe,
    Custom(Arc<dyn Prober>),
}

/// Owns at most one `ScanSession` and every thread that belongs to it.
pub struct ScanController {
    config: ScanConfig,
    sinks: Sinks,
    prober: ProberKind,
    headers: Mutex<ProbeHeaders>,
    session: Mutex<Option<ScanSession>>,
    /// Stats of the most recent session, kept after teardown.
    last_stats: Mutex<Option<Arc<StatsAggregator>>>,
    /// Id of the most recently launched session; 0 before the first.
    session_id: AtomicU64,
    lifecycle: Mutex<()>,
}

impl ScanController {
    pub fn new(config: ScanConfig, sinks: Sinks) -> Self {
        Self::build(config, sinks, ProberKind::Ffprobe)
    }

    /// Use a custom prober instead of ffprobe.
    pub fn with_prober(config: ScanConfig, sinks: Sinks, prober: Arc<dyn Prober>) -> Self {
        Self::build(config, sinks, ProberKind::Custom(prober))
    }

    fn build(config: ScanConfig, sinks: Sinks, prober: ProberKind) -> Self {
        Self {
            config,
            sinks,
            prober,
            headers: Mutex::new(ProbeHeaders::default()),
            session: Mutex::new(None),
            last_stats: Mutex::new(None),
            session_id: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Headers used by later sessions, including validations.
    pub fn set_probe_headers(&self, headers: ProbeHeaders) {
        *self.headers.lock() = headers;
    }

    /// Start a range scan. Any running session is stopped first.
    ///
    /// Returns once the threads are running; template errors are reported
    /// here, before anything is probed.
    pub fn start_scan(
        &self,
        template: &str,
        workers: WorkerCount,
        timeout: Duration,
        probe_headers: ProbeHeaders,
    ) -> Result<(), ScanError> {
        let _lc = self.lifecycle.lock();
        self.teardown_current();

        let parsed = AddressTemplate::parse_with_limit(template, self.config.max_addresses)?;
        info!(
            template = parsed.as_str(),
            addresses = parsed.address_count() as u64,
            "starting range scan"
        );
        *self.headers.lock() = probe_headers;
        let source = AddressSource::Template(parsed.batches(self.config.batch_size));
        self.launch(ScanMode::Scan, source, workers, timeout)
    }

    /// Re-probe a fixed list of addresses. Every result reaches the result sink.
    pub fn start_validation(
        &self,
        addresses: Vec<String>,
        workers: WorkerCount,
        timeout: Duration,
    ) -> Result<(), ScanError> {
        let _lc = self.lifecycle.lock();
        self.teardown_current();

        info!(addresses = addresses.len(), "starting validation");
        self.launch(ScanMode::Validation, AddressSource::List(addresses), workers, timeout)
    }

    fn launch(
        &self,
        mode: ScanMode,
        source: AddressSource,
        workers: WorkerCount,
        timeout: Duration,
    ) -> Result<(), ScanError> {
        let id = self.session_id.fetch_add(1, Ordering::AcqRel) + 1;
        let stats = Arc::new(StatsAggregator::new(mode, self.sinks.clone()).with_session(id));
        *self.last_stats.lock() = Some(stats.clone());

        if source.known_total() == Some(0) {
            info!("no addresses to probe, session ends immediately");
            stats.begin();
            stats.finish();
            return Ok(());
        }

        let prober: Arc<dyn Prober> = match &self.prober {
            ProberKind::Ffprobe => Arc::new(StreamProbe::new(
                self.config.inspector.clone(),
                self.headers.lock().clone(),
            )),
            ProberKind::Custom(p) => p.clone(),
        };
        let settings = PoolSettings {
            workers: workers.resolve(),
            probe_timeout: timeout,
            pop_wait: self.config.pop_wait(),
            high_water: self.config.queue_high_water,
            batch_size: self.config.batch_size,
        };

        let stop = CancellationToken::new();
        stats.begin();
        let (pool, done) = WorkerPool::start(source, prober, stats.clone(), stop.clone(), &settings)?;
        let ticker = match stats::spawn_ticker(
            stats.clone(),
            done,
            stop.clone(),
            self.config.stats_interval(),
            self.config.final_snapshot_wait(),
        ) {
            Ok(t) => t,
            Err(e) => {
                stats.close();
                stop.cancel();
                pool.join(self.config.stop_join_wait());
                stats.finish();
                return Err(ScanError::Spawn(e));
            }
        };

        *self.session.lock() = Some(ScanSession {
            mode,
            stop,
            pool,
            stats,
            _ticker: ticker,
        });
        Ok(())
    }

    /// Stop a running range scan. Idempotent.
    pub fn stop_scan(&self) {
        self.stop_mode(ScanMode::Scan);
    }

    /// Stop a running validation. Idempotent.
    pub fn stop_validation(&self) {
        self.stop_mode(ScanMode::Validation);
    }

    fn stop_mode(&self, mode: ScanMode) {
        let _lc = self.lifecycle.lock();
        let matches = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.mode == mode)
            .unwrap_or(false);
        if matches {
            self.teardown_current();
        }
    }

    fn teardown_current(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        let running = session.pool.alive() > 0 && !session.stop.is_cancelled();

        session.stats.close();
        session.stop.cancel();
        let discarded = session.pool.discard_pending();
        let abandoned = session.pool.join(self.config.stop_join_wait());
        if running {
            info!(mode = ?session.mode, discarded, abandoned, "session stopped");
        }
        if abandoned > 0 {
            warn!(abandoned, "abandoned workers will exit on their own");
        }
    }

    /// True while at least one worker is alive and no stop was requested.
    pub fn is_scanning(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.pool.alive() > 0 && !s.stop.is_cancelled())
            .unwrap_or(false)
    }

    /// Id carried by the snapshots of the latest session. Snapshots with any
    /// other id come from a session that has already been replaced.
    pub fn current_session(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> Option<ScanMode> {
        self.session.lock().as_ref().map(|s| s.mode)
    }

    /// Counters of the current or most recent session.
    pub fn snapshot(&self) -> Option<StatsSnapshot> {
        self.last_stats.lock().as_ref().map(|s| s.snapshot())
    }

    /// Workers currently running a probe.
    pub fn active_probes(&self) -> usize {
        self.session
            .lock()
            .as_ref()
            .map(|s| {
                s.pool
                    .states()
                    .into_iter()
                    .filter(|st| *st == WorkerState::Probing)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Addresses found invalid by the current or most recent session, for a retry pass.
    pub fn invalid_addresses(&self) -> Vec<String> {
        self.last_stats
            .lock()
            .as_ref()
            .map(|s| s.invalid_addresses())
            .unwrap_or_default()
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.teardown_current();
    }
}
