//! Command Sequencer (`spec.md` §4.8).
//!
//! Owns the ordered choreography of a workout start/stop — the piece the
//! operation queue and polling engine deliberately don't know about. Neither
//! of those collaborators has an opinion on "send RESET, then CONFIG, wait,
//! probe diagnostics, then START, then flip polling mode"; that sequencing
//! lives here, one level up, the way the teacher keeps `BluetoothComponent`
//! ignorant of what a heart-rate *session* is.

use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{Characteristic, Peripheral, WriteType};
use log::info;

use crate::core::constants::{
    OPCODE_PROGRAM_CONFIG, POST_CONFIG_DIAGNOSTIC_TIMEOUT_MS, POST_ECHO_CONFIG_SETTLE_MS,
    POST_PROGRAM_CONFIG_SETTLE_MS, PROGRAM_CONFIG_LEN, STOP_RESET_SETTLE_MS,
};
use crate::error::{CoreError, CoreResult};
use crate::model::types::{DiagnosticPacket, WorkoutParameters};
use crate::polling::PollingEngine;
use crate::protocol::factory::{
    build_color, build_echo_config, build_program_config, build_reset, build_start, rebuild_weight_only,
};
use crate::protocol::parsers::parse_diagnostic_frame;
use crate::transport::connection::{ConnectionLogRepository, TrainerCharacteristics};
use crate::transport::operation_queue::OperationQueue;
use crate::model::types::ConnectionLogEvent;

pub struct CommandSequencer<P: Peripheral> {
    operation_queue: Arc<OperationQueue<P>>,
    tx: Characteristic,
    diagnostic: Characteristic,
    last_program_config: Option<[u8; PROGRAM_CONFIG_LEN]>,
    log_repo: Arc<dyn ConnectionLogRepository>,
}

impl<P: Peripheral + 'static> CommandSequencer<P> {
    pub fn new(
        operation_queue: Arc<OperationQueue<P>>,
        characteristics: &TrainerCharacteristics,
        log_repo: Arc<dyn ConnectionLogRepository>,
    ) -> Self {
        Self {
            operation_queue,
            tx: characteristics.tx.clone(),
            diagnostic: characteristics.diagnostic.clone(),
            last_program_config: None,
            log_repo,
        }
    }

    /// Runs the full workout-start choreography and switches the polling
    /// engine to active-workout mode. Returns the post-CONFIG diagnostic
    /// probe result, if one was read within its timeout.
    pub async fn start_workout(
        &mut self,
        polling: &mut PollingEngine<P>,
        params: &WorkoutParameters,
    ) -> CoreResult<Option<DiagnosticPacket>> {
        polling.stop_disco();

        self.operation_queue.write(&self.tx, &build_reset(), WriteType::WithResponse).await?;

        let settle_ms = if params.is_echo_mode {
            let frame = build_echo_config(params);
            self.operation_queue.write(&self.tx, &frame, WriteType::WithResponse).await?;
            POST_ECHO_CONFIG_SETTLE_MS
        } else {
            let frame = build_program_config(params);
            self.operation_queue.write(&self.tx, &frame, WriteType::WithResponse).await?;
            self.last_program_config = Some(frame);
            POST_PROGRAM_CONFIG_SETTLE_MS
        };
        tokio::time::sleep(Duration::from_millis(settle_ms)).await;

        let diagnostic = tokio::time::timeout(
            Duration::from_millis(POST_CONFIG_DIAGNOSTIC_TIMEOUT_MS),
            self.operation_queue.read(&self.diagnostic),
        )
        .await
        .ok()
        .and_then(|r| r.ok())
        .and_then(|bytes| parse_diagnostic_frame(&bytes).ok());

        if let Some(packet) = &diagnostic {
            if packet.has_faults {
                info!("post-config diagnostic probe reported faults: {:?}", packet.faults);
                self.log_repo.log(
                    ConnectionLogEvent::DiagnosticFault,
                    format!("post-config diagnostic probe reported faults: {:?}", packet.faults),
                );
            }
        }

        self.operation_queue.write(&self.tx, &build_start(), WriteType::WithResponse).await?;
        polling.restart_monitor_polling(false);
        Ok(diagnostic)
    }

    /// Live weight change: rebuilds only the weight bytes of the last-sent
    /// Program CONFIG and resends it. Requires a prior `start_workout` call
    /// in Program mode — there is nothing to rebuild from in Echo mode or
    /// before any workout has started.
    pub async fn change_weight(&mut self, weight_per_cable_kg: f64) -> CoreResult<()> {
        let mut frame = self.last_program_config.ok_or(CoreError::CommandRejected {
            opcode: OPCODE_PROGRAM_CONFIG,
        })?;
        rebuild_weight_only(&mut frame, weight_per_cable_kg);
        self.last_program_config = Some(frame);
        self.operation_queue.write(&self.tx, &frame, WriteType::WithResponse).await
    }

    /// Sends one color-scheme frame. Distinct from the polling engine's disco
    /// loop (§4.4): this is a single write, not a supervised rotation, so it
    /// neither starts nor interferes with an in-progress disco sequence.
    pub async fn set_color(&mut self, scheme_index: u8) -> CoreResult<()> {
        self.operation_queue
            .write(&self.tx, &build_color(scheme_index), WriteType::WithResponse)
            .await
    }

    /// Runs the workout-stop choreography. In just-lift sessions the monitor
    /// loop is restarted immediately afterward — the trainer needs active
    /// reads flowing to actually leave its red-fault state post-RESET.
    pub async fn stop_workout(&mut self, polling: &mut PollingEngine<P>, is_just_lift: bool) -> CoreResult<()> {
        self.operation_queue.write(&self.tx, &build_reset(), WriteType::WithResponse).await?;
        tokio::time::sleep(Duration::from_millis(STOP_RESET_SETTLE_MS)).await;
        polling.stop_all();
        if is_just_lift {
            polling.restart_monitor_polling(true);
        }
        self.last_program_config = None;
        Ok(())
    }
}
