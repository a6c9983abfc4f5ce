//! Core Events
//!
//! This module defines the `ConnectionControlApi`/`WorkoutControlApi` traits
//! `TrainerCore` implements, and the `ConnectionEvent`/`WorkoutEvent` enums
//! `event_bridge::EventBridge` derives a dispatch impl for. A caller that
//! wants a uniform event type (rather than calling trait methods directly)
//! can match on these enums and forward to the trait; nothing in this crate
//! currently does, but a UI layer driving `TrainerCore` over a channel would.

use anyhow::Result;
use async_trait::async_trait;
use event_bridge::EventBridge;

use crate::model::types::{AdapterDescriptor, ScannedDevice, WorkoutParameters};

type HandlerResult = Result<()>;

/// Mutating operations on adapter selection and scanning.
#[async_trait]
pub trait ConnectionControlApi: Send + Sync {
    /// Select a Bluetooth adapter to scan and connect through.
    async fn select_adapter(&mut self, adapter: AdapterDescriptor) -> Result<()>;
    /// Begin scanning for devices matching `DEVICE_NAME_PREFIXES`.
    async fn start_scan(&mut self) -> Result<()>;
    /// Stop an in-progress scan.
    async fn stop_scan(&mut self) -> Result<()>;
    /// Connect to a device previously surfaced via scanning.
    async fn connect(&mut self, device: ScannedDevice) -> Result<()>;
    /// Disconnect, marking the next drop as explicit (suppresses reconnection requests).
    async fn disconnect(&mut self) -> Result<()>;
}

/// Mutating operations on the active workout.
#[async_trait]
pub trait WorkoutControlApi: Send + Sync {
    /// Run the on-connect/on-start choreography and begin a workout session.
    async fn start_workout(&mut self, params: WorkoutParameters) -> Result<()>;
    /// Run the official-stop choreography and close out the active session.
    async fn stop_workout(&mut self) -> Result<()>;
    /// Change the live per-cable weight without restarting the set.
    async fn change_weight(&mut self, weight_per_cable_kg: f64) -> Result<()>;
    /// Set the handle disco color scheme by index.
    async fn set_color(&mut self, scheme_index: u8) -> Result<()>;
}

#[derive(Debug, Clone, EventBridge)]
#[forward_to_trait(ConnectionControlApi)]
#[trait_returned_type(HandlerResult)]
pub enum ConnectionEvent {
    SelectAdapter(AdapterDescriptor),
    StartScan,
    StopScan,
    Connect(ScannedDevice),
    Disconnect,
}

#[derive(Debug, Clone, EventBridge)]
#[forward_to_trait(WorkoutControlApi)]
#[trait_returned_type(HandlerResult)]
pub enum WorkoutEvent {
    Start(WorkoutParameters),
    Stop,
    ChangeWeight(f64),
    SetColor(u8),
}
