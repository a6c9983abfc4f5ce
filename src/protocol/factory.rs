//! BLE Packet Factory (`spec.md` §4.8).
//!
//! Pure frame builders consumed by `sequencer::CommandSequencer`. Unlike
//! `protocol::parsers` these are never fallible — every input is already a
//! validated `WorkoutParameters`, so there is nothing here to reject.
//!
//! Byte layouts beyond what `spec.md` pins down (program-mode tag, the
//! progression-rule encoding, echo-mode field order) are this crate's own
//! choice, not part of the compatibility surface; only frame length, opcode
//! position, and the weight field's encoding are load-bearing.

use crate::core::constants::{
    COLOR_FRAME_LEN, ECHO_CONFIG_LEN, OPCODE_COLOR, OPCODE_ECHO_CONFIG, OPCODE_PROGRAM_CONFIG,
    OPCODE_RESET, OPCODE_START, PROGRAM_CONFIG_LEN,
};
use crate::model::types::{ProgramMode, ProgressionRule, WorkoutParameters};

const WEIGHT_OFFSET: usize = 2;

fn program_mode_tag(mode: ProgramMode) -> u8 {
    match mode {
        ProgramMode::OldSchool => 0,
        ProgramMode::Pump => 1,
        ProgramMode::Endurance => 2,
        ProgramMode::Strength => 3,
    }
}

/// `[0x0A]` — idempotent clean-state reset. Sent at the start of every
/// workout-start and workout-stop choreography.
pub fn build_reset() -> Vec<u8> {
    vec![OPCODE_RESET]
}

/// `[0x03]` — engages the motors under the most recently sent CONFIG.
pub fn build_start() -> Vec<u8> {
    vec![OPCODE_START]
}

/// 4-byte no-op written to TX when a heartbeat read fails.
pub fn build_heartbeat_noop() -> [u8; 4] {
    [0, 0, 0, 0]
}

/// `[0x10, scheme_index, 0x00, 0x00]`.
pub fn build_color(scheme_index: u8) -> [u8; COLOR_FRAME_LEN] {
    [OPCODE_COLOR, scheme_index, 0x00, 0x00]
}

/// Builds a 96-byte Program-mode CONFIG frame (first byte `0x04`).
pub fn build_program_config(params: &WorkoutParameters) -> [u8; PROGRAM_CONFIG_LEN] {
    let mut frame = [0u8; PROGRAM_CONFIG_LEN];
    frame[0] = OPCODE_PROGRAM_CONFIG;
    frame[1] = program_mode_tag(params.program_mode);
    write_weight(&mut frame, params.weight_per_cable_kg);
    frame[4..6].copy_from_slice(&params.warmup_reps.to_le_bytes());
    frame[6..8].copy_from_slice(&params.working_reps.to_le_bytes());
    match params.progression {
        ProgressionRule::Flat => frame[8] = 0,
        ProgressionRule::LinearPerSet { step_centi_kg } => {
            frame[8] = 1;
            frame[9..11].copy_from_slice(&step_centi_kg.to_le_bytes());
        }
        ProgressionRule::Pyramid => frame[8] = 2,
    }
    frame
}

/// Builds a 32-byte Echo-mode CONFIG frame (first byte `0x4E`).
pub fn build_echo_config(params: &WorkoutParameters) -> [u8; ECHO_CONFIG_LEN] {
    let mut frame = [0u8; ECHO_CONFIG_LEN];
    frame[0] = OPCODE_ECHO_CONFIG;
    frame[1] = params.echo_level.unwrap_or(0);
    frame[2..4].copy_from_slice(&params.warmup_reps.to_le_bytes());
    let eccentric_centi_kg = (params.eccentric_load_kg.unwrap_or(0.0) * 100.0).round() as u16;
    frame[4..6].copy_from_slice(&eccentric_centi_kg.to_le_bytes());
    frame
}

fn write_weight(frame: &mut [u8], weight_per_cable_kg: f64) {
    let centi_kg = (weight_per_cable_kg * 100.0).round() as u16;
    frame[WEIGHT_OFFSET..WEIGHT_OFFSET + 2].copy_from_slice(&centi_kg.to_le_bytes());
}

/// Rebuilds only the weight bytes of an already-sent Program CONFIG frame,
/// leaving mode, rep targets, and progression untouched — the live
/// weight-change path never sends INIT or START.
pub fn rebuild_weight_only(existing_config: &mut [u8; PROGRAM_CONFIG_LEN], weight_per_cable_kg: f64) {
    write_weight(existing_config, weight_per_cable_kg);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program_params() -> WorkoutParameters {
        WorkoutParameters {
            program_mode: ProgramMode::OldSchool,
            weight_per_cable_kg: 40.0,
            warmup_reps: 3,
            working_reps: 8,
            progression: ProgressionRule::Flat,
            is_just_lift: false,
            is_echo_mode: false,
            echo_level: None,
            eccentric_load_kg: None,
        }
    }

    /// S5 — Workout start/stop (Program mode), `spec.md` §8.
    #[test]
    fn s5_program_config_frame_shape() {
        let frame = build_program_config(&program_params());
        assert_eq!(frame.len(), PROGRAM_CONFIG_LEN);
        assert_eq!(frame[0], OPCODE_PROGRAM_CONFIG);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 4000);
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), 3);
        assert_eq!(u16::from_le_bytes([frame[6], frame[7]]), 8);

        assert_eq!(build_reset(), vec![OPCODE_RESET]);
        assert_eq!(build_start(), vec![OPCODE_START]);
    }

    #[test]
    fn weight_change_only_touches_weight_bytes() {
        let mut frame = build_program_config(&program_params());
        let warmup_before = frame[4..6].to_vec();
        rebuild_weight_only(&mut frame, 45.0);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 4500);
        assert_eq!(frame[4..6], warmup_before[..]);
    }

    #[test]
    fn echo_config_frame_shape() {
        let params = WorkoutParameters {
            is_echo_mode: true,
            echo_level: Some(3),
            eccentric_load_kg: Some(12.5),
            ..program_params()
        };
        let frame = build_echo_config(&params);
        assert_eq!(frame.len(), ECHO_CONFIG_LEN);
        assert_eq!(frame[0], OPCODE_ECHO_CONFIG);
        assert_eq!(frame[1], 3);
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), 1250);
    }

    #[test]
    fn color_frame_shape() {
        assert_eq!(build_color(2), [OPCODE_COLOR, 2, 0x00, 0x00]);
    }
}
