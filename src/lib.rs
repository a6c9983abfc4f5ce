//! BLE protocol core and real-time monitoring pipeline for a cable-resistance
//! strength-training machine.
//!
//! The crate is organized in the same layers a host application drives it
//! through: `transport` owns the BLE link itself, `protocol` turns bytes into
//! typed frames and back, `polling`/`sequencer` turn those frames into the
//! machine's two command rhythms (background polling, foreground
//! choreography), `processing` turns a raw sample stream into workout
//! semantics, and `core::orchestrator` wires all of it behind the public
//! event API declared in `core::events`.

/// Core utilities and traits used throughout the crate.
pub mod core {
    /// Crate-wide constants: UUIDs, opcodes, frame sizes, scaling factors,
    /// timeouts, and channel capacities.
    pub mod constants;
    /// Public event/command API surface (`ConnectionControlApi`, `WorkoutControlApi`).
    pub mod events;
    /// `TrainerCore`, the facade wiring every collaborator together.
    pub mod orchestrator;
}

/// The error taxonomy returned across transport, protocol, and orchestration.
pub mod error;

/// Plain data types shared across every layer.
pub mod model {
    pub mod types;
}

/// BLE link management: adapter/scan discovery, connection lifecycle, and
/// the serialized operation queue sitting on top of the raw peripheral.
pub mod transport {
    pub mod connection;
    pub mod operation_queue;
}

/// Wire-frame encoding and decoding.
pub mod protocol {
    pub mod factory;
    pub mod parsers;
}

/// Background polling loops (monitor/diagnostic/heartbeat/disco).
pub mod polling;

/// Foreground command choreography (workout start/stop, live weight change).
pub mod sequencer;

/// Pure, synchronous workout-semantics pipeline: sample validation and
/// smoothing, handle-state detection, rep counting, and the safety supervisor.
pub mod processing {
    pub mod handle;
    pub mod monitor;
    pub mod reps;
    pub mod safety;
}

pub use core::events::{ConnectionControlApi, ConnectionEvent, WorkoutControlApi, WorkoutEvent};
pub use core::orchestrator::{TrainerCore, WorkoutRepository};
pub use error::{CoreError, CoreResult};
