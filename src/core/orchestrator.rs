//! Orchestrator (`spec.md` §5, §6).
//!
//! Wires the connection manager, polling engine, command sequencer, and the
//! pure processing pipeline (monitor processor, handle detector, rep
//! counter, safety supervisor) into one coherent unit, exposing the
//! external stream/command surface named in `spec.md` §6. Mirrors the
//! teacher's `controller::application::AppController`: one struct holding
//! every collaborator and a background task that drains a live stream and
//! fans results out over several broadcast/watch channels — generalized
//! here from one stream (heart-rate measurements) to several (metrics,
//! reps, deload, ROM, handle detection).
//!
//! State shared with the background tasks lives behind a single
//! `tokio::sync::Mutex<Inner<A>>`, the same "one lock around the mutable
//! core" shape `components::bluetooth::BluetoothComponent` uses for its own
//! fields — the difference here is that two tasks (monitor forwarding,
//! notification listening) read and write it instead of none.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{Central, Peripheral};
use futures::StreamExt;
use log::{info, warn};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::core::constants::{
    DELOAD_CHANNEL_CAPACITY, DIAGNOSTIC_CHANNEL_CAPACITY, METRICS_CHANNEL_CAPACITY,
    OVERFLOW_LOG_EVERY, REPS_CHANNEL_CAPACITY, ROM_CHANNEL_CAPACITY,
};
use crate::core::events::{ConnectionControlApi, WorkoutControlApi};
use crate::model::types::{
    now_ms, AdapterDescriptor, ConnectionLogEvent, ConnectionState, DeloadEvent, HandleDetection,
    HeuristicStatistics, RepEvent, RomViolationEvent, ScannedDevice, WorkoutMetric, WorkoutParameters,
};
use crate::polling::PollingEngine;
use crate::processing::handle::HandleStateDetector;
use crate::processing::monitor::MonitorProcessor;
use crate::processing::reps::RepCounter;
use crate::processing::safety::SafetySupervisor;
use crate::protocol::parsers::parse_rep_frame;
use crate::sequencer::CommandSequencer;
use crate::transport::connection::{
    AdapterDiscovery, ConnectionLogRepository, ConnectionManager, DisplayName,
};
use crate::transport::operation_queue::OperationQueue;
use crate::model::types::SafetyDecision;

/// Receives complete sessions and batched metrics/reps on set completion.
pub trait WorkoutRepository: Send + Sync {
    fn save_session(&self, session: crate::model::types::WorkoutSession);
}

#[derive(Debug, Default)]
struct OverflowCounters {
    metrics: u64,
    reps: u64,
    deload: u64,
    rom: u64,
}

impl OverflowCounters {
    /// `spec.md` §5 calls for overflow to be "logged every 100 dropped
    /// items". `broadcast::Sender::send` returning `Err` here means there
    /// were no active subscribers at all — the nearest observable stand-in
    /// for a full ring buffer, since `tokio::sync::broadcast` itself already
    /// implements drop-oldest once a receiver falls behind its capacity.
    fn record(&mut self, stream: &'static str, count: impl FnOnce(&mut Self) -> &mut u64) {
        let slot = count(self);
        *slot += 1;
        if *slot % OVERFLOW_LOG_EVERY == 0 {
            warn!("{stream} stream: {slot} events published with no active subscriber");
        }
    }
}

struct Inner<A>
where
    A: Central + DisplayName + AdapterDiscovery<A> + 'static,
    A::Peripheral: DisplayName + 'static,
{
    connection: ConnectionManager<A>,
    polling: Option<PollingEngine<A::Peripheral>>,
    sequencer: Option<CommandSequencer<A::Peripheral>>,
    monitor_processor: MonitorProcessor,
    handle_detector: HandleStateDetector,
    rep_counter: RepCounter,
    safety: SafetySupervisor,
    active_params: Option<WorkoutParameters>,
    pending_auto_start: Option<WorkoutParameters>,
    monitor_task: Option<JoinHandle<()>>,
    notification_task: Option<JoinHandle<()>>,
}

impl<A> Inner<A>
where
    A: Central + DisplayName + AdapterDiscovery<A> + 'static,
    A::Peripheral: DisplayName + 'static,
{
    fn sequencer_and_polling_mut(
        &mut self,
    ) -> Option<(&mut CommandSequencer<A::Peripheral>, &mut PollingEngine<A::Peripheral>)> {
        match (self.sequencer.as_mut(), self.polling.as_mut()) {
            (Some(s), Some(p)) => Some((s, p)),
            _ => None,
        }
    }

    fn teardown_session_tasks(&mut self) {
        if let Some(handle) = self.monitor_task.take() {
            handle.abort();
        }
        if let Some(handle) = self.notification_task.take() {
            handle.abort();
        }
        if let Some(polling) = self.polling.as_mut() {
            polling.stop_all();
            polling.stop_disco();
        }
        self.polling = None;
        self.sequencer = None;
        self.active_params = None;
    }
}

/// Top-level facade. Generic over the adapter type for the same reason
/// `ConnectionManager<A>` is: production code drives it with
/// `btleplug::platform::Adapter`, tests drive it with a `mockall` double.
pub struct TrainerCore<A>
where
    A: Central + DisplayName + AdapterDiscovery<A> + 'static,
    A::Peripheral: DisplayName + 'static,
{
    inner: Arc<Mutex<Inner<A>>>,
    metrics_tx: broadcast::Sender<WorkoutMetric>,
    reps_tx: broadcast::Sender<RepEvent>,
    deload_tx: broadcast::Sender<DeloadEvent>,
    rom_tx: broadcast::Sender<RomViolationEvent>,
    handle_tx: watch::Sender<HandleDetection>,
    overflow: Arc<Mutex<OverflowCounters>>,
    log_repo: Arc<dyn ConnectionLogRepository>,
}

impl<A> TrainerCore<A>
where
    A: Central + DisplayName + AdapterDiscovery<A> + 'static,
    A::Peripheral: DisplayName + 'static,
{
    pub fn new(log_repo: Arc<dyn ConnectionLogRepository>) -> Self {
        let (metrics_tx, _) = broadcast::channel(METRICS_CHANNEL_CAPACITY);
        let (reps_tx, _) = broadcast::channel(REPS_CHANNEL_CAPACITY);
        let (deload_tx, _) = broadcast::channel(DELOAD_CHANNEL_CAPACITY);
        let (rom_tx, _) = broadcast::channel(ROM_CHANNEL_CAPACITY);
        let (handle_tx, _) = watch::channel(HandleDetection {
            state: crate::model::types::HandleState::Disabled,
            max_position_mm: 0.0,
            max_abs_velocity_mm_s: 0.0,
        });

        let inner = Inner {
            connection: ConnectionManager::new(log_repo.clone()),
            polling: None,
            sequencer: None,
            monitor_processor: MonitorProcessor::new(true),
            handle_detector: HandleStateDetector::new(),
            rep_counter: RepCounter::new(),
            safety: SafetySupervisor::new(),
            active_params: None,
            pending_auto_start: None,
            monitor_task: None,
            notification_task: None,
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
            metrics_tx,
            reps_tx,
            deload_tx,
            rom_tx,
            handle_tx,
            overflow: Arc::new(Mutex::new(OverflowCounters::default())),
            log_repo,
        }
    }

    pub async fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.lock().await.connection.watch_state()
    }

    pub async fn subscribe_reconnection_requests(
        &self,
    ) -> broadcast::Receiver<crate::model::types::ReconnectionRequest> {
        self.inner.lock().await.connection.subscribe_reconnection_requests()
    }

    pub async fn scanned_devices(&self) -> Vec<ScannedDevice> {
        self.inner.lock().await.connection.scanned_devices().await
    }

    pub async fn adapters(&self) -> Vec<AdapterDescriptor> {
        self.inner.lock().await.connection.adapters().to_vec()
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<WorkoutMetric> {
        self.metrics_tx.subscribe()
    }

    pub fn subscribe_reps(&self) -> broadcast::Receiver<RepEvent> {
        self.reps_tx.subscribe()
    }

    pub fn subscribe_deload(&self) -> broadcast::Receiver<DeloadEvent> {
        self.deload_tx.subscribe()
    }

    pub fn subscribe_rom_violations(&self) -> broadcast::Receiver<RomViolationEvent> {
        self.rom_tx.subscribe()
    }

    pub fn watch_handle_detection(&self) -> watch::Receiver<HandleDetection> {
        self.handle_tx.subscribe()
    }

    pub async fn watch_poll_rate(&self) -> Option<watch::Receiver<crate::model::types::PollRateStats>> {
        self.inner.lock().await.polling.as_ref().map(|p| p.watch_poll_rate())
    }

    /// §6 `heuristicData`: latest `HeuristicStatistics` snapshot, `None` before a
    /// connection has been established.
    pub async fn watch_heuristic_data(&self) -> Option<watch::Receiver<HeuristicStatistics>> {
        self.inner.lock().await.polling.as_ref().map(|p| p.watch_heuristic())
    }

    /// Starts a repeating color-scheme rotation, cycling through
    /// `scheme_sequence` every `DISCO_STEP_INTERVAL_MS`. Distinct from
    /// `WorkoutControlApi::set_color`'s single one-shot frame.
    pub async fn start_disco(&self, scheme_sequence: Vec<u8>) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let poll = guard.polling.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        poll.start_disco(scheme_sequence);
        Ok(())
    }

    pub async fn stop_disco(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let poll = guard.polling.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        poll.stop_disco();
        Ok(())
    }

    /// Arms just-lift auto-start: the next `Grabbed` transition observed
    /// while monitor polling is running in `for_auto_start` mode runs the
    /// workout-start choreography with these parameters. `spec.md` §8's S6
    /// scenario describes the detector/sequencer handoff but leaves the
    /// arming call implicit; this is this crate's resolution (`DESIGN.md`).
    pub async fn arm_just_lift(&self, weight_per_cable_kg: f64) {
        let mut inner = self.inner.lock().await;
        inner.pending_auto_start = Some(WorkoutParameters::just_lift(weight_per_cable_kg));
    }

    pub async fn disarm_auto_start(&self) {
        self.inner.lock().await.pending_auto_start = None;
    }

    /// Spawns the monitor-sample consumer: runs each sample through the
    /// processing pipeline, publishes metrics/deload/ROM/handle-detection
    /// events, and drives both the just-lift auto-start handoff and the
    /// safety supervisor's auto-stop choreography.
    fn spawn_monitor_forwarder(&self, mut monitor_rx: broadcast::Receiver<crate::polling::MonitorSample>) {
        let inner = self.inner.clone();
        let metrics_tx = self.metrics_tx.clone();
        let deload_tx = self.deload_tx.clone();
        let rom_tx = self.rom_tx.clone();
        let handle_tx = self.handle_tx.clone();
        let overflow = self.overflow.clone();

        let handle = tokio::spawn(async move {
            loop {
                let sample = match monitor_rx.recv().await {
                    Ok(sample) => sample,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let mut guard = inner.lock().await;
                let timestamp_ms = now_ms();
                let outcome = guard.monitor_processor.process_sample(sample.packet, timestamp_ms);

                if let Some(direction) = outcome.rom_violation {
                    let event = RomViolationEvent { direction, timestamp_ms };
                    if rom_tx.send(event).is_err() {
                        overflow.lock().await.record("rom", |c| &mut c.rom);
                    }
                }
                if outcome.deload_occurred {
                    let event = DeloadEvent { timestamp_ms };
                    if deload_tx.send(event).is_err() {
                        overflow.lock().await.record("deload", |c| &mut c.deload);
                    }
                }

                let Some(metric) = outcome.metric else {
                    continue;
                };

                guard.rep_counter.update_position_ranges_continuously(metric.pos_a_mm, metric.pos_b_mm);
                let detection = guard.handle_detector.update(
                    metric.pos_a_mm,
                    metric.pos_b_mm,
                    metric.smoothed_vel_a_mm_s,
                    metric.smoothed_vel_b_mm_s,
                    timestamp_ms,
                );
                let _ = handle_tx.send(detection);

                if sample.for_auto_start
                    && detection.state == crate::model::types::HandleState::Grabbed
                    && guard.active_params.is_none()
                {
                    if let Some(params) = guard.pending_auto_start.take() {
                        if let Some((seq, poll)) = guard.sequencer_and_polling_mut() {
                            match seq.start_workout(poll, &params).await {
                                Ok(_) => {
                                    guard.monitor_processor.reset_session_state();
                                    guard.rep_counter.reset_session();
                                    guard.safety.reset();
                                    guard.active_params = Some(params);
                                    info!("just-lift auto-start triggered by handle grab");
                                }
                                Err(e) => warn!("auto-start choreography failed: {e}"),
                            }
                        }
                    }
                }

                if let Some(params) = guard.active_params.clone() {
                    let in_danger = guard.rep_counter.is_in_danger_zone(metric.pos_a_mm, metric.pos_b_mm);
                    let decision = guard.safety.evaluate(&metric, in_danger);
                    if let SafetyDecision::Stop(reason) = decision {
                        warn!("safety supervisor requested stop: {reason:?}");
                        if let Some((seq, poll)) = guard.sequencer_and_polling_mut() {
                            if let Err(e) = seq.stop_workout(poll, params.is_just_lift).await {
                                warn!("auto-stop choreography failed: {e}");
                            }
                        }
                        guard.active_params = None;
                    }
                }

                drop(guard);

                if metrics_tx.send(metric).is_err() {
                    overflow.lock().await.record("metrics", |c| &mut c.metrics);
                }
            }
        });

        tokio::spawn({
            let inner = self.inner.clone();
            async move {
                inner.lock().await.monitor_task = Some(handle);
            }
        });
    }

    /// Spawns the REPS-characteristic notification listener, mirroring the
    /// teacher's `listen_to_peripheral` notification-stream loop. Every
    /// notification's opcode (first byte) is republished on the operation
    /// queue's received-opcode broadcast so `await_response` can observe it
    /// regardless of which characteristic it arrived on.
    fn spawn_notification_listener(
        &self,
        peripheral: A::Peripheral,
        operation_queue: Arc<OperationQueue<A::Peripheral>>,
        reps_uuid: uuid::Uuid,
    ) {
        let inner = self.inner.clone();
        let reps_tx = self.reps_tx.clone();
        let overflow = self.overflow.clone();
        let log_repo = self.log_repo.clone();

        let handle = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("failed to subscribe to notification stream: {e}");
                    return;
                }
            };
            while let Some(data) = notifications.next().await {
                if let Some(opcode) = data.value.first().copied() {
                    operation_queue.publish_received_opcode(opcode);
                }
                log_repo.log(
                    ConnectionLogEvent::Notification,
                    format!("notification on {} ({} bytes)", data.uuid, data.value.len()),
                );

                if data.uuid != reps_uuid {
                    continue;
                }
                let Ok(notification) = parse_rep_frame(&data.value) else {
                    continue;
                };
                let event = {
                    let mut guard = inner.lock().await;
                    guard.rep_counter.ingest_notification(notification)
                };
                log_repo.log(ConnectionLogEvent::RepReceived, format!("{event:?}"));
                if reps_tx.send(event).is_err() {
                    overflow.lock().await.record("reps", |c| &mut c.reps);
                }
            }
            warn!("notification stream terminated");
        });

        tokio::spawn({
            let inner = self.inner.clone();
            async move {
                inner.lock().await.notification_task = Some(handle);
            }
        });
    }
}

#[async_trait]
impl<A> ConnectionControlApi for TrainerCore<A>
where
    A: Central + DisplayName + AdapterDiscovery<A> + 'static,
    A::Peripheral: DisplayName + 'static,
{
    async fn select_adapter(&mut self, adapter: AdapterDescriptor) -> Result<()> {
        self.inner.lock().await.connection.select_adapter(adapter).await
    }

    async fn start_scan(&mut self) -> Result<()> {
        self.inner.lock().await.connection.start_scan().await
    }

    async fn stop_scan(&mut self) -> Result<()> {
        self.inner.lock().await.connection.stop_scan().await
    }

    async fn connect(&mut self, device: ScannedDevice) -> Result<()> {
        let (operation_queue, characteristics, reps_uuid) = {
            let mut guard = self.inner.lock().await;
            guard.connection.connect(device).await?;
            let characteristics = guard
                .connection
                .characteristics()
                .cloned()
                .ok_or_else(|| anyhow!("characteristics missing after a successful connect"))?;
            let operation_queue = guard.connection.operation_queue();

            let mut polling = PollingEngine::new(
                operation_queue.clone(),
                characteristics.clone(),
                METRICS_CHANNEL_CAPACITY,
                DIAGNOSTIC_CHANNEL_CAPACITY,
            );
            polling.start_all(true);
            let monitor_rx = polling.subscribe_monitor();
            let sequencer =
                CommandSequencer::new(operation_queue.clone(), &characteristics, guard.connection.log_repo());

            guard.polling = Some(polling);
            guard.sequencer = Some(sequencer);
            drop(guard);
            self.spawn_monitor_forwarder(monitor_rx);

            let reps_uuid = characteristics.reps.uuid;
            (operation_queue, characteristics, reps_uuid)
        };

        if let Some(peripheral) = operation_queue.peripheral().await {
            self.spawn_notification_listener(peripheral, operation_queue.clone(), reps_uuid);
        }
        let _ = characteristics;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard.teardown_session_tasks();
        guard.connection.disconnect().await
    }
}

#[async_trait]
impl<A> WorkoutControlApi for TrainerCore<A>
where
    A: Central + DisplayName + AdapterDiscovery<A> + 'static,
    A::Peripheral: DisplayName + 'static,
{
    async fn start_workout(&mut self, params: WorkoutParameters) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let (seq, poll) = guard
            .sequencer_and_polling_mut()
            .ok_or_else(|| anyhow!("not connected"))?;
        seq.start_workout(poll, &params).await?;
        guard.monitor_processor.reset_session_state();
        guard.rep_counter.reset_session();
        guard.safety.reset();
        guard.active_params = Some(params);
        Ok(())
    }

    async fn stop_workout(&mut self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let is_just_lift = guard.active_params.as_ref().map(|p| p.is_just_lift).unwrap_or(false);
        if let Some((seq, poll)) = guard.sequencer_and_polling_mut() {
            seq.stop_workout(poll, is_just_lift).await?;
        }
        guard.active_params = None;
        Ok(())
    }

    async fn change_weight(&mut self, weight_per_cable_kg: f64) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let seq = guard.sequencer.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        seq.change_weight(weight_per_cable_kg).await?;
        if let Some(params) = guard.active_params.as_mut() {
            params.weight_per_cable_kg = weight_per_cable_kg;
        }
        Ok(())
    }

    async fn set_color(&mut self, scheme_index: u8) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let seq = guard.sequencer.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        seq.set_color(scheme_index).await?;
        Ok(())
    }
}
