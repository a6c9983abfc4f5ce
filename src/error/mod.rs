//! Error taxonomy (`spec.md` §7).
//!
//! `CoreError` names every error kind the spec calls out. Transport and
//! protocol call sites return it directly; orchestration-level methods that
//! compose several fallible sub-operations return `anyhow::Result` and
//! convert with `?` via the `#[from]` below, mirroring the teacher's own
//! split between typed model errors (`model::acquisition` returns plain
//! `Result<(), String>`-shaped errors at the FFI boundary) and `anyhow`
//! at the controller boundary (`components::bluetooth`, `controller::acquisition`).
//!
//! Sample-validation and safety variants are never returned from a function —
//! per §7 they are logged and/or emitted on their dedicated event streams —
//! but are still named here so logs and tests share one vocabulary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a range-of-motion violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RomDirection {
    OutsideHigh,
    OutsideLow,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    // --- Transport ---
    #[error("no peripheral connected")]
    NotConnected,
    #[error("scan failed: {0}")]
    ScanFailed(String),
    #[error("connect failed after {after_attempts} attempt(s)")]
    ConnectFailed { after_attempts: u32 },
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("write failed: {cause}")]
    WriteFailed { cause: String },
    #[error("read failed: {cause}")]
    ReadFailed { cause: String },
    #[error("characteristic missing: {uuid}")]
    CharacteristicMissing { uuid: Uuid },

    // --- Protocol ---
    #[error("frame too short: need {need}, got {got}")]
    FrameTooShort { need: usize, got: usize },
    #[error("unknown opcode: {opcode:#04x}")]
    UnknownOpcode { opcode: u8 },
    #[error("command rejected: opcode {opcode:#04x}")]
    CommandRejected { opcode: u8 },
    #[error("no response for opcode {opcode:#04x}")]
    ResponseTimeout { opcode: u8 },

    // --- Sample validation (never returned, see module docs) ---
    #[error("position out of range")]
    PositionOutOfRange,
    #[error("load out of range")]
    LoadOutOfRange,
    #[error("position jump exceeded threshold")]
    PositionJumpExceeded,

    // --- Safety (never returned, see module docs) ---
    #[error("stall detected")]
    StallDetected,
    #[error("rom violation: {direction:?}")]
    RomViolation { direction: RomDirection },
    #[error("deload occurred")]
    DeloadOccurred,

    // --- Resource ---
    #[error("event buffer overflow on stream {stream}")]
    EventBufferOverflow { stream: &'static str },
}

pub type CoreResult<T> = Result<T, CoreError>;
