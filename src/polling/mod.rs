//! Polling Engine (`spec.md` §4.4).
//!
//! Four independent cooperative loops sharing one `OperationQueue`. Each
//! loop is its own `tokio::spawn`ed task guarded by a hand-rolled
//! [`CancelToken`] rather than an external cancellation crate — the same
//! choice the teacher makes by never pulling in `tokio-util`'s
//! `CancellationToken` even though one listener task (`listen_to_peripheral`)
//! would have been a natural fit for it. Loops publish what they decode onto
//! bounded broadcast channels; nothing here parses further than
//! `protocol::parsers`' pure functions, and nothing here decides what the
//! numbers mean — that is `processing`'s job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use btleplug::api::{Peripheral, WriteType};
use log::{trace, warn};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::core::constants::{
    DIAGNOSTIC_POLL_INTERVAL_MS, DISCO_STEP_INTERVAL_MS, HEARTBEAT_POLL_INTERVAL_MS,
    POLL_RATE_AGGREGATE_WINDOW, POLL_RATE_WARN_THRESHOLD_MS,
};
use crate::model::types::{DiagnosticPacket, HeuristicStatistics, MonitorPacket, PollRateStats};
use crate::protocol::factory::{build_color, build_heartbeat_noop};
use crate::protocol::parsers::{parse_diagnostic_frame, parse_heuristic_frame, parse_monitor_frame};
use crate::transport::connection::TrainerCharacteristics;
use crate::transport::operation_queue::OperationQueue;

/// One monitor-frame read plus the mode the polling engine read it under.
/// `for_auto_start = true` tells the orchestrator's handle detector to run
/// its auto-start logic; `false` means an active workout, where the detector
/// only tracks grab/release transitions for the safety supervisor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSample {
    pub packet: MonitorPacket,
    pub for_auto_start: bool,
}

#[derive(Clone)]
struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first.
    async fn sleep_or_cancel(&self, duration: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

struct Loop {
    handle: JoinHandle<()>,
    token: CancelToken,
}

impl Loop {
    fn stop(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

/// Aggregates per-sample poll intervals into `PollRateStats` every
/// `POLL_RATE_AGGREGATE_WINDOW` samples, per §4.4.
#[derive(Debug, Default)]
struct PollRateAggregator {
    last_sample_at: Option<Instant>,
    intervals_ms: Vec<f64>,
    running_avg_ms: f64,
    running_count: u64,
}

impl PollRateAggregator {
    fn record(&mut self, now: Instant) -> Option<PollRateStats> {
        if let Some(last) = self.last_sample_at {
            let interval_ms = now.duration_since(last).as_secs_f64() * 1000.0;
            self.intervals_ms.push(interval_ms);
            self.running_count += 1;
            self.running_avg_ms +=
                (interval_ms - self.running_avg_ms) / self.running_count as f64;
        }
        self.last_sample_at = Some(now);

        if self.intervals_ms.len() < POLL_RATE_AGGREGATE_WINDOW as usize {
            return None;
        }
        let sum: f64 = self.intervals_ms.iter().sum();
        let avg = sum / self.intervals_ms.len() as f64;
        let min = self.intervals_ms.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = self.intervals_ms.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        self.intervals_ms.clear();

        if avg > POLL_RATE_WARN_THRESHOLD_MS {
            warn!("poll rate degraded: avg {avg:.1}ms over last window");
        }
        Some(PollRateStats {
            avg_ms: avg,
            min_ms: min,
            max_ms: max,
            running_avg_ms: self.running_avg_ms,
            sample_count: self.running_count as u32,
        })
    }
}

/// Runs the four polling loops against a connected peripheral's GATT
/// characteristics. Owns no peripheral itself — `ConnectionManager` does —
/// only the `OperationQueue` handle and the characteristics resolved by its
/// on-ready sequence.
pub struct PollingEngine<P: Peripheral + 'static> {
    operation_queue: Arc<OperationQueue<P>>,
    characteristics: TrainerCharacteristics,

    monitor_tx: broadcast::Sender<MonitorSample>,
    diagnostic_tx: broadcast::Sender<DiagnosticPacket>,
    heuristic_tx: watch::Sender<HeuristicStatistics>,
    poll_rate_tx: watch::Sender<PollRateStats>,

    monitor_loop: Option<Loop>,
    diagnostic_loop: Option<Loop>,
    heartbeat_loop: Option<Loop>,
    disco_loop: Option<Loop>,
}

impl<P: Peripheral + 'static> PollingEngine<P> {
    pub fn new(
        operation_queue: Arc<OperationQueue<P>>,
        characteristics: TrainerCharacteristics,
        monitor_capacity: usize,
        diagnostic_capacity: usize,
    ) -> Self {
        let (monitor_tx, _) = broadcast::channel(monitor_capacity);
        let (diagnostic_tx, _) = broadcast::channel(diagnostic_capacity);
        let (heuristic_tx, _) = watch::channel(HeuristicStatistics::default());
        let (poll_rate_tx, _) = watch::channel(PollRateStats::default());
        Self {
            operation_queue,
            characteristics,
            monitor_tx,
            diagnostic_tx,
            heuristic_tx,
            poll_rate_tx,
            monitor_loop: None,
            diagnostic_loop: None,
            heartbeat_loop: None,
            disco_loop: None,
        }
    }

    pub fn subscribe_monitor(&self) -> broadcast::Receiver<MonitorSample> {
        self.monitor_tx.subscribe()
    }

    pub fn subscribe_diagnostic(&self) -> broadcast::Receiver<DiagnosticPacket> {
        self.diagnostic_tx.subscribe()
    }

    /// §6 `heuristicData`: latest `HeuristicStatistics` snapshot, refreshed
    /// on the same cadence as the diagnostic loop (§4.4's table has no
    /// separate row for it).
    pub fn watch_heuristic(&self) -> watch::Receiver<HeuristicStatistics> {
        self.heuristic_tx.subscribe()
    }

    pub fn watch_poll_rate(&self) -> watch::Receiver<PollRateStats> {
        self.poll_rate_tx.subscribe()
    }

    pub fn is_monitor_running(&self) -> bool {
        self.monitor_loop.is_some()
    }

    pub fn start_monitor(&mut self, for_auto_start: bool) {
        self.stop_monitor();
        let token = CancelToken::new();
        let queue = self.operation_queue.clone();
        let characteristic = self.characteristics.monitor.clone();
        let tx = self.monitor_tx.clone();
        let loop_token = token.clone();
        let mut aggregator = PollRateAggregator::default();
        let poll_rate_tx = self.poll_rate_tx.clone();

        let handle = tokio::spawn(async move {
            while !loop_token.is_cancelled() {
                match queue.read(&characteristic).await {
                    Ok(bytes) => {
                        if let Some(stats) = aggregator.record(Instant::now()) {
                            let _ = poll_rate_tx.send(stats);
                        }
                        match parse_monitor_frame(&bytes) {
                            Ok(packet) => {
                                let _ = tx.send(MonitorSample { packet, for_auto_start });
                            }
                            Err(e) => trace!("monitor frame parse error: {e}"),
                        }
                    }
                    Err(e) => trace!("monitor read error: {e}"),
                }
            }
        });
        self.monitor_loop = Some(Loop { handle, token });
    }

    pub fn stop_monitor(&mut self) {
        if let Some(l) = self.monitor_loop.take() {
            l.stop();
        }
    }

    /// Stops and restarts the monitor loop under a (possibly new) auto-start mode.
    pub fn restart_monitor_polling(&mut self, for_auto_start: bool) {
        self.start_monitor(for_auto_start);
    }

    pub fn start_diagnostic(&mut self) {
        self.stop_diagnostic();
        let token = CancelToken::new();
        let queue = self.operation_queue.clone();
        let characteristic = self.characteristics.diagnostic.clone();
        let heuristic_characteristic = self.characteristics.heuristic.clone();
        let tx = self.diagnostic_tx.clone();
        let heuristic_tx = self.heuristic_tx.clone();
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            while !loop_token.is_cancelled() {
                if let Ok(bytes) = queue.read(&characteristic).await {
                    if let Ok(packet) = parse_diagnostic_frame(&bytes) {
                        let _ = tx.send(packet);
                    }
                }
                if let Ok(bytes) = queue.read(&heuristic_characteristic).await {
                    if let Ok(stats) = parse_heuristic_frame(&bytes) {
                        let _ = heuristic_tx.send(stats);
                    }
                }
                loop_token
                    .sleep_or_cancel(Duration::from_millis(DIAGNOSTIC_POLL_INTERVAL_MS))
                    .await;
            }
        });
        self.diagnostic_loop = Some(Loop { handle, token });
    }

    pub fn stop_diagnostic(&mut self) {
        if let Some(l) = self.diagnostic_loop.take() {
            l.stop();
        }
    }

    /// On a failed read, falls back to a 4-byte no-op write to TX, per §4.4's table.
    pub fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        let token = CancelToken::new();
        let queue = self.operation_queue.clone();
        let monitor_characteristic = self.characteristics.monitor.clone();
        let tx_characteristic = self.characteristics.tx.clone();
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            while !loop_token.is_cancelled() {
                if queue.read(&monitor_characteristic).await.is_err() {
                    let _ = queue
                        .write(&tx_characteristic, &build_heartbeat_noop(), WriteType::WithResponse)
                        .await;
                }
                loop_token
                    .sleep_or_cancel(Duration::from_millis(HEARTBEAT_POLL_INTERVAL_MS))
                    .await;
            }
        });
        self.heartbeat_loop = Some(Loop { handle, token });
    }

    pub fn stop_heartbeat(&mut self) {
        if let Some(l) = self.heartbeat_loop.take() {
            l.stop();
        }
    }

    /// Starts monitor, diagnostic, and heartbeat together. Never touches disco.
    pub fn start_all(&mut self, for_auto_start: bool) {
        self.start_monitor(for_auto_start);
        self.start_diagnostic();
        self.start_heartbeat();
    }

    /// Stops monitor, diagnostic, and heartbeat together. Never touches disco.
    pub fn stop_all(&mut self) {
        self.stop_monitor();
        self.stop_diagnostic();
        self.stop_heartbeat();
    }

    /// Stops and restarts monitor, diagnostic, and heartbeat. Never touches disco.
    pub fn restart_all(&mut self, for_auto_start: bool) {
        self.stop_all();
        self.start_all(for_auto_start);
    }

    /// Cycles through `scheme_sequence` writing color frames at
    /// `DISCO_STEP_INTERVAL_MS`. Mutually exclusive with a workout: the
    /// sequencer stops this before any workout-start choreography runs.
    pub fn start_disco(&mut self, scheme_sequence: Vec<u8>) {
        self.stop_disco();
        if scheme_sequence.is_empty() {
            return;
        }
        let token = CancelToken::new();
        let queue = self.operation_queue.clone();
        let tx_characteristic = self.characteristics.tx.clone();
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut index = 0usize;
            while !loop_token.is_cancelled() {
                let scheme = scheme_sequence[index % scheme_sequence.len()];
                let _ = queue
                    .write(&tx_characteristic, &build_color(scheme), WriteType::WithResponse)
                    .await;
                index = index.wrapping_add(1);
                loop_token
                    .sleep_or_cancel(Duration::from_millis(DISCO_STEP_INTERVAL_MS))
                    .await;
            }
        });
        self.disco_loop = Some(Loop { handle, token });
    }

    pub fn stop_disco(&mut self) {
        if let Some(l) = self.disco_loop.take() {
            l.stop();
        }
    }
}

impl<P: Peripheral + 'static> Drop for PollingEngine<P> {
    fn drop(&mut self) {
        self.stop_all();
        self.stop_disco();
    }
}
