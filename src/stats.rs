use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sink::Sinks;
use crate::types::{now_iso_like, ChannelRecord, ProbeResult, ScanMode, StatsSnapshot};

#[derive(Debug)]
struct Counters {
    total_enqueued: u64,
    valid: u64,
    invalid: u64,
    /// Cleared on stop; outcomes arriving afterwards are dropped.
    open: bool,
    finished: bool,
}

/// Running totals for one session, guarded by a single mutex.
///
/// Result and progress posts happen while the lock is held, so once `close`
/// returns nothing else reaches the sinks except the final snapshot.
pub struct StatsAggregator {
    counters: Mutex<Counters>,
    invalid_addresses: Mutex<Vec<String>>,
    session: u64,
    mode: ScanMode,
    started: Instant,
    started_at: String,
    sinks: Sinks,
}

impl StatsAggregator {
    pub fn new(mode: ScanMode, sinks: Sinks) -> Self {
        Self {
            counters: Mutex::new(Counters {
                total_enqueued: 0,
                valid: 0,
                invalid: 0,
                open: true,
                finished: false,
            }),
            invalid_addresses: Mutex::new(Vec::new()),
            session: 0,
            mode,
            started: Instant::now(),
            started_at: now_iso_like(),
            sinks,
        }
    }

    pub fn with_session(mut self, session: u64) -> Self {
        self.session = session;
        self
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn add_enqueued(&self, n: u64) {
        self.counters.lock().total_enqueued += n;
    }

    /// Post the opening `(0, total)` progress.
    pub fn begin(&self) {
        let c = self.counters.lock();
        self.sinks.progress.post_progress(0, c.total_enqueued.max(1));
    }

    /// Count one probe outcome and deliver it. Returns false once closed.
    pub fn record(&self, result: ProbeResult) -> bool {
        let mut c = self.counters.lock();
        if !c.open {
            return false;
        }
        if result.valid {
            c.valid += 1;
        } else {
            c.invalid += 1;
            self.invalid_addresses.lock().push(result.address.clone());
        }
        let current = c.valid + c.invalid;
        let total = c.total_enqueued.max(1);

        let deliver = result.valid || self.mode == ScanMode::Validation;
        if deliver {
            let name = self.sinks.names.display_name(&result);
            self.sinks
                .results
                .post_result(ChannelRecord::from_probe(result, name));
        }
        self.sinks.progress.post_progress(current, total);
        true
    }

    /// Stop accepting outcomes.
    pub fn close(&self) {
        self.counters.lock().open = false;
    }

    pub fn is_open(&self) -> bool {
        self.counters.lock().open
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.counters.lock();
        self.snapshot_locked(&c)
    }

    fn snapshot_locked(&self, c: &Counters) -> StatsSnapshot {
        StatsSnapshot {
            session: self.session,
            total: c.total_enqueued,
            valid: c.valid,
            invalid: c.invalid,
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            started_at: self.started_at.clone(),
            is_validation: self.mode == ScanMode::Validation,
            finished: c.finished,
        }
    }

    pub fn tick(&self) {
        let c = self.counters.lock();
        if c.finished {
            return;
        }
        self.sinks.stats.post_stats(self.snapshot_locked(&c));
    }

    /// Post the terminating snapshot. Only the first call has an effect.
    pub fn finish(&self) -> bool {
        let mut c = self.counters.lock();
        if c.finished {
            return false;
        }
        c.finished = true;
        c.open = false;
        let snap = self.snapshot_locked(&c);
        info!(
            session = snap.session,
            total = snap.total,
            valid = snap.valid,
            invalid = snap.invalid,
            elapsed_s = snap.elapsed_seconds,
            "session finished"
        );
        self.sinks.stats.post_stats(snap);
        true
    }

    pub fn invalid_addresses(&self) -> Vec<String> {
        self.invalid_addresses.lock().clone()
    }
}

/// Spawn the stats ticker.
///
/// `workers_done` is never sent on; it disconnects once every worker has
/// dropped its sender, which ends the loop. After `stop` fires the ticker
/// waits at most `final_wait` for stragglers before posting the final snapshot.
pub fn spawn_ticker(
    stats: Arc<StatsAggregator>,
    workers_done: Receiver<()>,
    stop: CancellationToken,
    interval: Duration,
    final_wait: Duration,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("stats-ticker".into())
        .spawn(move || {
            let mut stop_deadline: Option<Instant> = None;
            loop {
                match workers_done.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if stop.is_cancelled() {
                            let deadline =
                                *stop_deadline.get_or_insert_with(|| Instant::now() + final_wait);
                            if Instant::now() >= deadline {
                                warn!("workers still running after stop, posting final stats anyway");
                                break;
                            }
                        }
                        stats.tick();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("stats ticker exiting");
            stats.finish();
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ScanEvent;

    fn result(addr: &str, valid: bool) -> ProbeResult {
        let mut r = ProbeResult::new(addr);
        if valid {
            r.resolution = Some("1920x1080".into());
        }
        r.settle()
    }

    #[test]
    fn scan_mode_posts_only_valid_records() {
        let (sinks, mut rx) = Sinks::channel();
        let stats = StatsAggregator::new(ScanMode::Scan, sinks);
        stats.add_enqueued(2);
        assert!(stats.record(result("a", true)));
        assert!(stats.record(result("b", false)));

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        let records = events
            .iter()
            .filter(|e| matches!(e, ScanEvent::Result(_)))
            .count();
        assert_eq!(records, 1);
        assert!(matches!(
            events.last(),
            Some(ScanEvent::Progress { processed: 2, total: 2 })
        ));
        assert_eq!(stats.invalid_addresses(), vec!["b".to_string()]);
    }

    #[test]
    fn total_guards_against_zero() {
        let (sinks, mut rx) = Sinks::channel();
        let stats = StatsAggregator::new(ScanMode::Validation, sinks);
        stats.record(result("a", false));
        let mut saw_progress = false;
        while let Ok(e) = rx.try_recv() {
            if let ScanEvent::Progress { processed, total } = e {
                assert_eq!((processed, total), (1, 1));
                saw_progress = true;
            }
        }
        assert!(saw_progress);
    }

    #[test]
    fn closed_aggregator_drops_outcomes_and_finishes_once() {
        let (sinks, mut rx) = Sinks::channel();
        let stats = StatsAggregator::new(ScanMode::Validation, sinks);
        stats.close();
        assert!(!stats.record(result("a", true)));
        assert!(stats.finish());
        assert!(!stats.finish());

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ScanEvent::Stats(s) => {
                assert!(s.finished);
                assert_eq!(s.valid + s.invalid, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn ticker_finishes_when_workers_hang_up() {
        let (sinks, mut rx) = Sinks::channel();
        let stats = Arc::new(StatsAggregator::new(ScanMode::Scan, sinks));
        let (tx, done) = crossbeam_channel::bounded::<()>(0);
        let handle = spawn_ticker(
            stats.clone(),
            done,
            CancellationToken::new(),
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(tx);
        handle.join().unwrap();

        let snaps: Vec<StatsSnapshot> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                ScanEvent::Stats(s) => Some(s),
                _ => None,
            })
            .collect();
        assert!(snaps.len() >= 2);
        assert!(snaps.last().unwrap().finished);
        assert_eq!(snaps.iter().filter(|s| s.finished).count(), 1);
    }
}
