//! Protocol and tuning constants shared across the pipeline.
//!
//! Every constant here is referenced by name in `spec.md`/`SPEC_FULL.md`; keeping
//! them in one module mirrors how the teacher crate centralizes
//! `HEARTRATE_MEASUREMENT_UUID` in `core::constants` rather than scattering magic
//! numbers through the components that use them.

use btleplug::api::bleuuid::uuid_from_u16;
use uuid::{uuid, Uuid};

// --- GATT service/characteristic UUIDs -------------------------------------

/// Nordic UART Service. The trainer uses NUS framing even though it never
/// subscribes to the standard RX characteristic (see `NUS_RX_UUID`).
pub const NUS_SERVICE_UUID: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");
/// Characteristic the core writes commands to.
pub const NUS_TX_UUID: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");
/// Present in GATT discovery assertions only — the core must never subscribe here.
pub const NUS_RX_UUID: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// 16-bit service/service-data UUID that also qualifies an advertisement.
pub const TRAINER_SERVICE_DATA_UUID: Uuid = uuid_from_u16(0xfef3);

/// Proprietary notification/read characteristics, referenced by constant per
/// `spec.md` §6. These are vendor-specific, not part of any SIG-assigned
/// service, and are documented here rather than invented ad hoc at each call
/// site.
pub const MONITOR_CHARACTERISTIC_UUID: Uuid = uuid!("6e400010-b5a3-f393-e0a9-e50e24dcca9e");
pub const REPS_CHARACTERISTIC_UUID: Uuid = uuid!("6e400011-b5a3-f393-e0a9-e50e24dcca9e");
pub const DIAGNOSTIC_CHARACTERISTIC_UUID: Uuid = uuid!("6e400012-b5a3-f393-e0a9-e50e24dcca9e");
pub const HEURISTIC_CHARACTERISTIC_UUID: Uuid = uuid!("6e400013-b5a3-f393-e0a9-e50e24dcca9e");
pub const VERSION_CHARACTERISTIC_UUID: Uuid = uuid!("6e400014-b5a3-f393-e0a9-e50e24dcca9e");
pub const MODE_CHARACTERISTIC_UUID: Uuid = uuid!("6e400015-b5a3-f393-e0a9-e50e24dcca9e");

/// Standard Device Information Service firmware revision characteristic.
pub const FIRMWARE_REVISION_UUID: Uuid = uuid_from_u16(0x2a26);

// --- Opcodes (first byte of every TX write / RX notification) -------------

pub const OPCODE_MONITOR: u8 = 0x01;
pub const OPCODE_REP: u8 = 0x02;
pub const OPCODE_START: u8 = 0x03;
pub const OPCODE_PROGRAM_CONFIG: u8 = 0x04;
pub const OPCODE_RESET: u8 = 0x0A;
pub const OPCODE_COLOR: u8 = 0x10;
pub const OPCODE_ECHO_CONFIG: u8 = 0x4E;
pub const OPCODE_OFFICIAL_STOP: u8 = 0x50;

// --- Frame sizes -------------------------------------------------------

pub const PROGRAM_CONFIG_LEN: usize = 96;
pub const ECHO_CONFIG_LEN: usize = 32;
pub const COLOR_FRAME_LEN: usize = 4;
pub const MONITOR_FRAME_MIN_LEN: usize = 16;
pub const REP_FRAME_LEGACY_LEN: usize = 6;
pub const REP_FRAME_MODERN_LEN: usize = 24;
pub const DIAGNOSTIC_FRAME_LEN: usize = 4 * 2 + 8;
pub const HEURISTIC_FRAME_LEN: usize = 48;

// --- Position / load / velocity scaling ------------------------------------

/// Positions arrive as centi-millimeter big-endian u16; divide by this to get mm.
pub const POSITION_SCALE: f64 = 10.0;
/// Loads arrive as centi-kg big-endian u16; divide by this to get kg.
///
/// Open question resolved (SPEC_FULL.md §9 / §4.3): the source had a second,
/// raw/10 interpretation in its RX path. We standardize on raw/100 — it is the
/// interpretation the `spec.md` §8 S1 test vector uses.
pub const LOAD_SCALE: f64 = 100.0;
/// Firmware velocity arrives as signed deci-mm/s; divide by this to get mm/s.
///
/// `spec.md` §4.3 prose calls the two velocity fields little-endian, but the
/// §8 S1 test vector only reproduces (`+800`, `-544`) when both are read
/// big-endian. We follow the vector; see `protocol::parsers`.
pub const VELOCITY_SCALE: f64 = 10.0;

// --- Physical envelope & validation -----------------------------------------

pub const MIN_POSITION_MM: f64 = 0.0;
pub const MAX_POSITION_MM: f64 = 800.0;
pub const MAX_WEIGHT_KG: f64 = 100.0;
/// Maximum allowed |Δposition| between consecutive samples under strict validation.
pub const POSITION_JUMP_THRESHOLD_MM: f64 = 20.0;
/// EMA smoothing factor applied to firmware-reported velocity.
pub const VELOCITY_SMOOTHING_ALPHA: f64 = 0.3;

// --- Safety supervisor -------------------------------------------------

pub const STALL_VELOCITY_LOW_MM_S: f64 = 2.5;
pub const STALL_DURATION_SECONDS: f64 = 5.0;
pub const AUTO_STOP_DURATION_SECONDS: f64 = 2.5;
/// Fraction of observed ROM, from the bottom, considered the "danger zone".
pub const DANGER_ZONE_FRACTION: f64 = 0.05;
pub const DELOAD_EVENT_DEBOUNCE_MS: u64 = 2000;

// --- Handle state detector ----------------------------------------------

pub const HANDLE_REST_THRESHOLD_MM: f64 = 5.0;
pub const HANDLE_GRAB_POSITION_THRESHOLD_MM: f64 = 8.0;
pub const HANDLE_GRAB_VELOCITY_THRESHOLD_MM_S: f64 = 50.0;
pub const HANDLE_GRAB_SUSTAIN_MS: u64 = 200;

// --- Connection manager ---------------------------------------------------

pub const CONNECTION_RETRY_COUNT: u32 = 3;
pub const CONNECTION_TIMEOUT_MS: u64 = 10_000;
pub const CONNECTION_RETRY_DELAY_MS: u64 = 1_000;
pub const DESIRED_MTU: u16 = 247;
pub const AWAIT_RESPONSE_DEFAULT_TIMEOUT_MS: u64 = 1_000;
pub const FIRMWARE_REVISION_READ_TIMEOUT_MS: u64 = 2_000;
pub const POST_ECHO_CONFIG_SETTLE_MS: u64 = 200;
pub const POST_PROGRAM_CONFIG_SETTLE_MS: u64 = 350;
pub const POST_CONFIG_DIAGNOSTIC_TIMEOUT_MS: u64 = 500;
pub const STOP_RESET_SETTLE_MS: u64 = 50;

/// Name prefixes (case-insensitive) that qualify an advertisement.
pub const DEVICE_NAME_PREFIXES: [&str; 2] = ["vee_", "vit"];
/// How often the scan loop refreshes its peripheral snapshot. Not pinned by
/// `spec.md`; chosen to keep discovery responsive without hammering the adapter.
pub const SCAN_POLL_INTERVAL_MS: u64 = 2_000;

// --- Operation queue -------------------------------------------------------

pub const OPERATION_RETRY_COUNT: u32 = 2;
pub const OPERATION_RETRY_DELAY_MS: u64 = 50;

// --- Polling engine ------------------------------------------------------

pub const DIAGNOSTIC_POLL_INTERVAL_MS: u64 = 500;
pub const HEARTBEAT_POLL_INTERVAL_MS: u64 = 2_000;
pub const POLL_RATE_WARN_THRESHOLD_MS: f64 = 30.0;
pub const POLL_RATE_AGGREGATE_WINDOW: u32 = 100;
/// Cadence between disco color-scheme writes. Not pinned by `spec.md`
/// ("mode-specific"); chosen as a readable default for a visible rotation.
pub const DISCO_STEP_INTERVAL_MS: u64 = 150;

// --- Bounded channel capacities (§5) ---------------------------------------

pub const METRICS_CHANNEL_CAPACITY: usize = 64;
pub const REPS_CHANNEL_CAPACITY: usize = 64;
pub const DELOAD_CHANNEL_CAPACITY: usize = 8;
pub const ROM_CHANNEL_CAPACITY: usize = 8;
pub const RECONNECTION_CHANNEL_CAPACITY: usize = 4;
pub const DIAGNOSTIC_CHANNEL_CAPACITY: usize = 16;
/// §4.2: "a bounded-buffer broadcast of received opcodes supports
/// `await_response`" — sized for the operation queue's received-opcode feed,
/// not the polling engine's diagnostic snapshots (a prior mix-up).
pub const COMMAND_RESPONSE_CHANNEL_CAPACITY: usize = 16;
pub const OVERFLOW_LOG_EVERY: u64 = 100;

pub const DATE_TIME_STRING_FORMAT: &str = "[year]-[month]-[day] [hour]:[minute]:[second]";
