//! Bounded address queue, its filler thread, and the probing worker threads.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::ScanError;
use crate::probe::Prober;
use crate::stats::StatsAggregator;
use crate::template::Batches;
use crate::types::{ErrorKind, ProbeResult};

/// Where a session's addresses come from.
pub enum AddressSource {
    Template(Batches),
    List(Vec<String>),
}

impl AddressSource {
    /// Total known before probing starts (lists only).
    pub fn known_total(&self) -> Option<u64> {
        match self {
            AddressSource::Template(_) => None,
            AddressSource::List(v) => Some(v.len() as u64),
        }
    }

    fn into_batches(self, batch_size: usize) -> Box<dyn Iterator<Item = Vec<String>> + Send> {
        match self {
            AddressSource::Template(b) => Box::new(b),
            AddressSource::List(v) => {
                let size = batch_size.max(1);
                let mut it = v.into_iter();
                Box::new(std::iter::from_fn(move || {
                    let chunk: Vec<String> = it.by_ref().take(size).collect();
                    (!chunk.is_empty()).then_some(chunk)
                }))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Probing = 1,
    Reporting = 2,
    Exiting = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Probing,
            2 => WorkerState::Reporting,
            _ => WorkerState::Exiting,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub probe_timeout: Duration,
    pub pop_wait: Duration,
    pub high_water: usize,
    pub batch_size: usize,
}

/// Decrements the live-worker count and releases the worker's `done` sender
/// when a worker thread ends, however it ends.
struct LiveGuard {
    alive: Arc<AtomicUsize>,
    state: Arc<Vec<AtomicU8>>,
    id: usize,
    _done: Sender<()>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.state[self.id].store(WorkerState::Exiting as u8, Ordering::Relaxed);
        self.alive.fetch_sub(1, Ordering::AcqRel);
    }
}

struct WorkerCtx {
    id: usize,
    queue: Receiver<String>,
    prober: Arc<dyn Prober>,
    stats: Arc<StatsAggregator>,
    stop: CancellationToken,
    probe_timeout: Duration,
    pop_wait: Duration,
    guard: LiveGuard,
}

impl WorkerCtx {
    fn set(&self, s: WorkerState) {
        self.guard.state[self.id].store(s as u8, Ordering::Relaxed);
    }
}

/// Filler plus N workers sharing one bounded queue.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    filler: Option<JoinHandle<()>>,
    queue: Receiver<String>,
    done: Receiver<()>,
    alive: Arc<AtomicUsize>,
    states: Arc<Vec<AtomicU8>>,
}

impl WorkerPool {
    /// Spawn the filler and the workers. The returned receiver disconnects when
    /// the last worker exits.
    pub fn start(
        source: AddressSource,
        prober: Arc<dyn Prober>,
        stats: Arc<StatsAggregator>,
        stop: CancellationToken,
        settings: &PoolSettings,
    ) -> Result<(Self, Receiver<()>), ScanError> {
        let (tx, rx) = bounded::<String>(settings.high_water.max(1));
        let (done_tx, done_rx) = bounded::<()>(0);

        let known_total = source.known_total();
        if let Some(n) = known_total {
            stats.add_enqueued(n);
        }

        let filler = {
            let batches = source.into_batches(settings.batch_size);
            let stats = stats.clone();
            let stop = stop.clone();
            let wait = settings.pop_wait;
            thread::Builder::new()
                .name("queue-filler".into())
                .spawn(move || fill_queue(batches, tx, stats, stop, wait, known_total.is_none()))?
        };

        let n = settings.workers.max(1);
        let alive = Arc::new(AtomicUsize::new(0));
        let states: Arc<Vec<AtomicU8>> =
            Arc::new((0..n).map(|_| AtomicU8::new(WorkerState::Idle as u8)).collect());

        let mut workers = Vec::with_capacity(n);
        for id in 0..n {
            alive.fetch_add(1, Ordering::AcqRel);
            let ctx = WorkerCtx {
                id,
                queue: rx.clone(),
                prober: prober.clone(),
                stats: stats.clone(),
                stop: stop.clone(),
                probe_timeout: settings.probe_timeout,
                pop_wait: settings.pop_wait,
                guard: LiveGuard {
                    alive: alive.clone(),
                    state: states.clone(),
                    id,
                    _done: done_tx.clone(),
                },
            };
            let spawned = thread::Builder::new()
                .name(format!("probe-worker-{id}"))
                .spawn(move || run_worker(ctx));
            match spawned {
                Ok(h) => workers.push(h),
                Err(e) => {
                    // The ctx (and its guard) was dropped with the failed spawn.
                    error!(worker = id, error = %e, "failed to spawn worker");
                    if workers.is_empty() {
                        stop.cancel();
                        return Err(ScanError::Spawn(e));
                    }
                    break;
                }
            }
        }
        drop(done_tx);
        info!(workers = workers.len(), "worker pool started");

        let pool = Self {
            workers,
            filler: Some(filler),
            queue: rx,
            done: done_rx.clone(),
            alive,
            states,
        };
        Ok((pool, done_rx))
    }

    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.states
            .iter()
            .map(|s| WorkerState::from_u8(s.load(Ordering::Relaxed)))
            .collect()
    }

    /// Addresses queued but not yet taken by a worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drop every queued-but-unprocessed address.
    pub fn discard_pending(&self) -> usize {
        self.queue.try_iter().count()
    }

    /// Wait up to `wait` for workers to exit, then join the finished ones and
    /// abandon the rest. Returns the number abandoned.
    pub fn join(self, wait: Duration) -> usize {
        let deadline = Instant::now() + wait;
        loop {
            match self.done.recv_deadline(deadline) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) | Err(RecvTimeoutError::Timeout) => break,
            }
        }

        let mut abandoned = 0;
        for handle in self.workers {
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("worker thread ended with a panic");
                }
            } else {
                abandoned += 1;
            }
        }
        if let Some(filler) = self.filler {
            if filler.is_finished() {
                let _ = filler.join();
            }
        }
        if abandoned > 0 {
            warn!(abandoned, "workers still running after stop; they exit once their probe returns");
        }
        abandoned
    }
}

fn fill_queue(
    batches: Box<dyn Iterator<Item = Vec<String>> + Send>,
    tx: Sender<String>,
    stats: Arc<StatsAggregator>,
    stop: CancellationToken,
    wait: Duration,
    count_batches: bool,
) {
    let mut produced = 0u64;
    for batch in batches {
        if stop.is_cancelled() {
            break;
        }
        if count_batches {
            stats.add_enqueued(batch.len() as u64);
        }
        for address in batch {
            let mut item = address;
            // A full queue blocks here, which is the high-water pause.
            loop {
                match tx.send_timeout(item, wait) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Timeout(back)) => {
                        if stop.is_cancelled() {
                            debug!(produced, "filler stopped");
                            return;
                        }
                        item = back;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => return,
                }
            }
            produced += 1;
        }
    }
    debug!(produced, "filler finished");
}

fn run_worker(ctx: WorkerCtx) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = ctx.id, error = %e, "failed to build worker runtime");
            return;
        }
    };

    loop {
        if ctx.stop.is_cancelled() {
            break;
        }
        ctx.set(WorkerState::Idle);
        let address = match ctx.queue.recv_timeout(ctx.pop_wait) {
            Ok(a) => a,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if ctx.stop.is_cancelled() {
            break;
        }

        ctx.set(WorkerState::Probing);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            rt.block_on(ctx.prober.probe(&address, ctx.probe_timeout, &ctx.stop))
        }));

        ctx.set(WorkerState::Reporting);
        let result = match outcome {
            Ok(r) => r,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!(worker = ctx.id, %address, "probe failed internally: {msg}");
                internal_failure(address, &msg)
            }
        };
        debug!(worker = ctx.id, address = %result.address, valid = result.valid, "probed");
        if !ctx.stats.record(result) {
            break;
        }
    }

    rt.shutdown_background();
}

fn internal_failure(address: String, msg: &str) -> ProbeResult {
    let mut r = ProbeResult::new(address);
    r.error = Some(format!("worker internal error: {msg}"));
    r.error_kind = Some(ErrorKind::Internal);
    r
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProbeError;
    use crate::sink::Sinks;
    use crate::template::AddressTemplate;
    use crate::types::ScanMode;
    use async_trait::async_trait;

    /// Holds every address until the session is cancelled.
    struct Stalled;

    #[async_trait]
    impl Prober for Stalled {
        async fn probe(&self, address: &str, _timeout: Duration, cancel: &CancellationToken) -> ProbeResult {
            cancel.cancelled().await;
            ProbeResult::failed(address, &ProbeError::Cancelled, 0)
        }
    }

    #[test]
    fn filler_pauses_at_high_water() {
        let (sinks, _rx) = Sinks::channel();
        let stats = Arc::new(StatsAggregator::new(ScanMode::Scan, sinks));
        let template = AddressTemplate::parse("http://10.0.[0-255].[0-255]/x").unwrap();
        let settings = PoolSettings {
            workers: 2,
            probe_timeout: Duration::from_secs(30),
            pop_wait: Duration::from_millis(20),
            high_water: 8,
            batch_size: 4,
        };
        let stop = CancellationToken::new();
        let (pool, _done) = WorkerPool::start(
            AddressSource::Template(template.batches(settings.batch_size)),
            Arc::new(Stalled),
            stats.clone(),
            stop.clone(),
            &settings,
        )
        .unwrap();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(pool.pending(), settings.high_water);
        let probing = pool
            .states()
            .into_iter()
            .filter(|s| *s == WorkerState::Probing)
            .count();
        assert_eq!(probing, 2);

        // Two in flight, eight queued, and at most the batch holding the next address.
        let total = stats.snapshot().total;
        assert!(total <= (2 + 8 + 4) as u64, "expanded {total} of 65536");
        thread::sleep(Duration::from_millis(200));
        assert_eq!(stats.snapshot().total, total);

        stats.close();
        stop.cancel();
        assert!(pool.discard_pending() <= settings.high_water);
        assert_eq!(pool.join(Duration::from_secs(2)), 0);
    }
}
