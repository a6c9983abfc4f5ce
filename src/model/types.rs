//! Core data model (`spec.md` §3).
//!
//! Every entity listed in §3 is represented here as a plain, serializable
//! value type. Units are documented per field since the wire format mixes
//! scales (centi-mm, centi-kg, deci-mm/s) that are normalized away by the
//! time a value reaches one of these structs.

use crate::error::RomDirection;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A Bluetooth adapter discovered on the host, analogous to the teacher's
/// `model::bluetooth::AdapterDescriptor`: a stable locally-generated id plus
/// a display name, so a host application can let the user pick an adapter
/// before scanning starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    name: String,
    uuid: Uuid,
}

impl AdapterDescriptor {
    pub fn new(name: String) -> Self {
        Self {
            name,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_uuid(&self) -> &Uuid {
        &self.uuid
    }
}

/// A device observed while scanning. Lifetime is the current scan session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub rssi: i8,
}

/// Connection lifecycle, single-writer (the connection manager), multi-reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected {
        name: String,
        address: String,
        hardware_model: Option<String>,
    },
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// Raw monitor frame, decoded but not yet validated/smoothed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonitorPacket {
    pub ticks: u32,
    pub pos_a_mm: f64,
    pub pos_b_mm: f64,
    pub load_a_kg: f64,
    pub load_b_kg: f64,
    pub fw_vel_a: i16,
    pub fw_vel_b: i16,
    pub status: u16,
}

/// Status flag bit positions within [`MonitorPacket::status`].
pub mod status_flags {
    pub const OUTSIDE_HIGH: u16 = 1 << 0;
    pub const OUTSIDE_LOW: u16 = 1 << 1;
    pub const DELOAD_OCCURRED: u16 = 1 << 2;
    pub const DELOAD_WARN: u16 = 1 << 3;
    pub const SPOTTER_ACTIVE: u16 = 1 << 4;
    pub const REP_READY: u16 = 1 << 5;
}

/// `MonitorPacket` plus smoothed velocities and a wall-clock timestamp.
/// Invariants are enforced by `processing::monitor::MonitorProcessor` before
/// a value of this type is ever constructed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkoutMetric {
    pub ticks: u32,
    pub pos_a_mm: f64,
    pub pos_b_mm: f64,
    pub load_a_kg: f64,
    pub load_b_kg: f64,
    pub fw_vel_a_mm_s: f64,
    pub fw_vel_b_mm_s: f64,
    pub smoothed_vel_a_mm_s: f64,
    pub smoothed_vel_b_mm_s: f64,
    pub status: u16,
    pub timestamp_ms: u64,
}

/// Rep notification, tagged by which of the two wire shapes produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RepNotification {
    Legacy6 {
        top: u16,
        complete: u16,
    },
    Modern24 {
        top: u16,
        complete: u16,
        warmup_done: u16,
        warmup_target: u16,
        working_done: u16,
        working_target: u16,
        range_top: u16,
        range_bottom: u16,
    },
}

/// A rep event emitted by `processing::reps::RepCounter`. Carries both
/// interpretations of the Legacy6 `complete` field per the open question in
/// `SPEC_FULL.md` §9/§4.7: `complete_counter_raw` is verbatim off the wire,
/// `complete_delta` is the non-negative increase since the previous sighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepEvent {
    pub source: RepEventSource,
    pub warmup_done: u16,
    pub warmup_target: u16,
    pub working_done: u16,
    pub working_target: u16,
    pub complete_counter_raw: u16,
    pub complete_delta: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepEventSource {
    Legacy6,
    Modern24,
    PositionFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticPacket {
    pub faults: [i16; 4],
    pub temps: [i8; 8],
    pub has_faults: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub kg_avg: f32,
    pub kg_max: f32,
    pub vel_avg: f32,
    pub vel_max: f32,
    pub watt_avg: f32,
    pub watt_max: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicStatistics {
    pub concentric: PhaseStats,
    pub eccentric: PhaseStats,
}

/// §4.6 handle detector states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleState {
    Disabled,
    WaitingForRest,
    Released,
    Grabbed,
}

impl Default for HandleState {
    fn default() -> Self {
        HandleState::Disabled
    }
}

/// Summary emitted alongside `HandleState` transitions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandleDetection {
    pub state: HandleState,
    pub max_position_mm: f64,
    pub max_abs_velocity_mm_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramMode {
    OldSchool,
    Pump,
    Endurance,
    Strength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressionRule {
    Flat,
    LinearPerSet { step_centi_kg: u16 },
    Pyramid,
}

/// Immutable per-session configuration; only `weight_per_cable_kg` is
/// live-updatable (`sequencer::CommandSequencer::change_weight`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutParameters {
    pub program_mode: ProgramMode,
    pub weight_per_cable_kg: f64,
    pub warmup_reps: u16,
    pub working_reps: u16,
    pub progression: ProgressionRule,
    pub is_just_lift: bool,
    pub is_echo_mode: bool,
    pub echo_level: Option<u8>,
    pub eccentric_load_kg: Option<f64>,
}

impl WorkoutParameters {
    pub fn just_lift(weight_per_cable_kg: f64) -> Self {
        Self {
            program_mode: ProgramMode::OldSchool,
            weight_per_cable_kg,
            warmup_reps: 0,
            working_reps: 0,
            progression: ProgressionRule::Flat,
            is_just_lift: true,
            is_echo_mode: false,
            echo_level: None,
            eccentric_load_kg: None,
        }
    }
}

/// Surfaced to `WorkoutRepository` on set completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkoutSession {
    pub id: Uuid,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub params: WorkoutParameters,
    pub metrics: Vec<WorkoutMetric>,
    pub reps: Vec<RepEvent>,
    pub phase_stats: Option<HeuristicStatistics>,
    pub notes: String,
}

impl WorkoutSession {
    pub fn new(params: WorkoutParameters, started_at_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at_ms,
            ended_at_ms: None,
            params,
            metrics: Vec::new(),
            reps: Vec::new(),
            phase_stats: None,
            notes: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconnectionReason {
    UnexpectedDisconnect,
}

impl fmt::Display for ReconnectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectionReason::UnexpectedDisconnect => write!(f, "unexpected_disconnect"),
        }
    }
}

/// Emitted when a connection drops while `was_ever_connected ∧ ¬explicit_disconnect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionRequest {
    pub device_name: String,
    pub address: String,
    pub reason: ReconnectionReason,
    pub timestamp_ms: u64,
}

/// §4.4 poll-rate telemetry, aggregated every `POLL_RATE_AGGREGATE_WINDOW` samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PollRateStats {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub running_avg_ms: f64,
    pub sample_count: u32,
}

/// Closed set of structured log events a `ConnectionLogRepository` keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionLogEvent {
    ScanStart,
    DeviceFound,
    ConnectSuccess,
    Notification,
    CommandSent,
    RepReceived,
    MtuChanged,
    Disconnected,
    ReconnectRequested,
    DiagnosticFault,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub event: ConnectionLogEvent,
    pub message: String,
    pub timestamp_ms: u64,
}

/// §4.9 safety decision. `SafetySupervisor` is a pure function of its inputs;
/// acting on `Stop` (invoking the stop choreography) is the orchestrator's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyDecision {
    Continue,
    Stop(SafetyStopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyStopReason {
    StallDetected,
    PositionDanger,
}

/// Rare-event notification, emitted at most once per `DELOAD_EVENT_DEBOUNCE_MS`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeloadEvent {
    pub timestamp_ms: u64,
}

/// Rare-event notification; surfaced without forcing a stop (`spec.md` §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RomViolationEvent {
    pub direction: RomDirection,
    pub timestamp_ms: u64,
}

/// Wall-clock "now" in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    let now = time::OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as u64
}
