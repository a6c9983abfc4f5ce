//! Packet Parsers (`spec.md` §4.3).
//!
//! Pure, side-effect-free decoders: no I/O, no clock reads, no allocation
//! beyond the returned value. Every parser fails with `FrameTooShort`
//! instead of panicking on a short slice, mirroring how `model::bluetooth`'s
//! `HeartrateMessage::new` validates length up front before indexing.

use crate::core::constants::{
    DIAGNOSTIC_FRAME_LEN, HEURISTIC_FRAME_LEN, LOAD_SCALE, MONITOR_FRAME_MIN_LEN, POSITION_SCALE,
    REP_FRAME_LEGACY_LEN, REP_FRAME_MODERN_LEN, VELOCITY_SCALE,
};
use crate::error::{CoreError, CoreResult};
use crate::model::types::{DiagnosticPacket, MonitorPacket, PhaseStats, HeuristicStatistics, RepNotification};

fn need(data: &[u8], need: usize) -> CoreResult<()> {
    if data.len() < need {
        Err(CoreError::FrameTooShort {
            need,
            got: data.len(),
        })
    } else {
        Ok(())
    }
}

/// Decodes a monitor frame (opcode `0x01`). `data` is the notification
/// payload with any opcode byte already stripped.
///
/// Position and load fields are big-endian per `spec.md` §4.3. The firmware
/// velocity fields are documented there as little-endian but the §8 S1 test
/// vector only reproduces `(+800, -544)` when read big-endian; we follow the
/// vector (see `core::constants::VELOCITY_SCALE`).
pub fn parse_monitor_frame(data: &[u8]) -> CoreResult<MonitorPacket> {
    need(data, MONITOR_FRAME_MIN_LEN)?;

    let ticks = u16::from_be_bytes([data[0], data[1]]) as u32;
    let pos_a_raw = u16::from_be_bytes([data[2], data[3]]);
    let pos_b_raw = u16::from_be_bytes([data[4], data[5]]);
    let fw_vel_a = i16::from_be_bytes([data[6], data[7]]);
    let load_a_raw = u16::from_be_bytes([data[8], data[9]]);
    let load_b_raw = u16::from_be_bytes([data[10], data[11]]);
    let fw_vel_b = i16::from_be_bytes([data[12], data[13]]);
    let status = if data.len() >= 18 {
        u16::from_be_bytes([data[16], data[17]])
    } else {
        0
    };

    Ok(MonitorPacket {
        ticks,
        pos_a_mm: pos_a_raw as f64 / POSITION_SCALE,
        pos_b_mm: pos_b_raw as f64 / POSITION_SCALE,
        load_a_kg: load_a_raw as f64 / LOAD_SCALE,
        load_b_kg: load_b_raw as f64 / LOAD_SCALE,
        fw_vel_a,
        fw_vel_b,
        status,
    })
}

/// Converts a parsed monitor frame's firmware velocity fields into mm/s.
pub fn monitor_velocities_mm_s(packet: &MonitorPacket) -> (f64, f64) {
    (
        packet.fw_vel_a as f64 / VELOCITY_SCALE,
        packet.fw_vel_b as f64 / VELOCITY_SCALE,
    )
}

/// Decodes a rep frame, dispatching on length per §4.3. `data` must already
/// have any RX opcode byte stripped; REPS-characteristic notifications carry
/// no prefix to begin with.
pub fn parse_rep_frame(data: &[u8]) -> CoreResult<RepNotification> {
    if data.len() >= REP_FRAME_MODERN_LEN {
        let top = u16::from_be_bytes([data[0], data[1]]);
        let complete = u16::from_be_bytes([data[2], data[3]]);
        let warmup_done = u16::from_be_bytes([data[4], data[5]]);
        let warmup_target = u16::from_be_bytes([data[6], data[7]]);
        let working_done = u16::from_be_bytes([data[8], data[9]]);
        let working_target = u16::from_be_bytes([data[10], data[11]]);
        let range_top = u16::from_be_bytes([data[12], data[13]]);
        let range_bottom = u16::from_be_bytes([data[14], data[15]]);
        Ok(RepNotification::Modern24 {
            top,
            complete,
            warmup_done,
            warmup_target,
            working_done,
            working_target,
            range_top,
            range_bottom,
        })
    } else if data.len() >= REP_FRAME_LEGACY_LEN {
        let top = u16::from_be_bytes([data[0], data[1]]);
        let complete = u16::from_be_bytes([data[2], data[3]]);
        Ok(RepNotification::Legacy6 { top, complete })
    } else {
        Err(CoreError::FrameTooShort {
            need: REP_FRAME_LEGACY_LEN,
            got: data.len(),
        })
    }
}

/// Decodes a diagnostic frame: 4 signed fault shorts then 8 signed
/// temperature bytes, big-endian.
pub fn parse_diagnostic_frame(data: &[u8]) -> CoreResult<DiagnosticPacket> {
    need(data, DIAGNOSTIC_FRAME_LEN)?;

    let mut faults = [0i16; 4];
    for (i, slot) in faults.iter_mut().enumerate() {
        let off = i * 2;
        *slot = i16::from_be_bytes([data[off], data[off + 1]]);
    }
    let mut temps = [0i8; 8];
    for (i, slot) in temps.iter_mut().enumerate() {
        *slot = data[8 + i] as i8;
    }
    let has_faults = faults.iter().any(|&f| f != 0);

    Ok(DiagnosticPacket {
        faults,
        temps,
        has_faults,
    })
}

fn parse_phase_stats(data: &[u8]) -> PhaseStats {
    let f = |off: usize| f32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
    PhaseStats {
        kg_avg: f(0),
        kg_max: f(4),
        vel_avg: f(8),
        vel_max: f(12),
        watt_avg: f(16),
        watt_max: f(20),
    }
}

/// Decodes a 48-byte heuristic frame: concentric `PhaseStats` then eccentric, little-endian.
pub fn parse_heuristic_frame(data: &[u8]) -> CoreResult<HeuristicStatistics> {
    need(data, HEURISTIC_FRAME_LEN)?;
    Ok(HeuristicStatistics {
        concentric: parse_phase_stats(&data[0..24]),
        eccentric: parse_phase_stats(&data[24..48]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S1 — Monitor parse (`spec.md` §8).
    #[test]
    fn s1_monitor_parse() {
        let data = [
            0x00, 0x01, 0x00, 0x64, 0x00, 0x6E, 0x03, 0x20, 0x00, 0x0A, 0x00, 0x0F, 0xFD, 0xE0,
            0x00, 0x00, 0x00, 0x04,
        ];
        let packet = parse_monitor_frame(&data).unwrap();
        assert_eq!(packet.ticks, 1);
        assert_eq!(packet.pos_a_mm, 10.0);
        assert_eq!(packet.pos_b_mm, 11.0);
        assert_eq!(packet.fw_vel_a, 800);
        assert_eq!(packet.fw_vel_b, -544);
        assert_eq!(packet.load_a_kg, 0.10);
        assert_eq!(packet.load_b_kg, 0.15);
        assert_eq!(packet.status, 0x0004);

        let (vel_a, vel_b) = monitor_velocities_mm_s(&packet);
        assert_eq!(vel_a, 80.0);
        assert_eq!(vel_b, -54.4);
    }

    #[test]
    fn monitor_frame_too_short_is_reported() {
        let err = parse_monitor_frame(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, CoreError::FrameTooShort { need: 16, got: 10 }));
    }

    #[test]
    fn legacy_rep_frame() {
        let data = [0x00, 0x05, 0x00, 0x03, 0x00, 0x00];
        match parse_rep_frame(&data).unwrap() {
            RepNotification::Legacy6 { top, complete } => {
                assert_eq!(top, 5);
                assert_eq!(complete, 3);
            }
            _ => panic!("expected Legacy6"),
        }
    }

    #[test]
    fn modern_rep_frame() {
        let mut data = vec![0u8; REP_FRAME_MODERN_LEN];
        data[0..2].copy_from_slice(&10u16.to_be_bytes());
        data[2..4].copy_from_slice(&7u16.to_be_bytes());
        data[8..10].copy_from_slice(&4u16.to_be_bytes());
        data[10..12].copy_from_slice(&8u16.to_be_bytes());
        match parse_rep_frame(&data).unwrap() {
            RepNotification::Modern24 {
                top,
                complete,
                working_done,
                working_target,
                ..
            } => {
                assert_eq!(top, 10);
                assert_eq!(complete, 7);
                assert_eq!(working_done, 4);
                assert_eq!(working_target, 8);
            }
            _ => panic!("expected Modern24"),
        }
    }

    #[test]
    fn diagnostic_frame_reports_faults() {
        let mut data = [0u8; DIAGNOSTIC_FRAME_LEN];
        data[2..4].copy_from_slice(&7i16.to_be_bytes());
        let packet = parse_diagnostic_frame(&data).unwrap();
        assert!(packet.has_faults);
        assert_eq!(packet.faults[1], 7);
    }

    #[test]
    fn diagnostic_frame_no_faults() {
        let data = [0u8; DIAGNOSTIC_FRAME_LEN];
        let packet = parse_diagnostic_frame(&data).unwrap();
        assert!(!packet.has_faults);
    }

    #[test]
    fn heuristic_frame_round_trip() {
        let mut data = [0u8; HEURISTIC_FRAME_LEN];
        data[0..4].copy_from_slice(&12.5f32.to_le_bytes());
        data[24..28].copy_from_slice(&3.25f32.to_le_bytes());
        let stats = parse_heuristic_frame(&data).unwrap();
        assert_eq!(stats.concentric.kg_avg, 12.5);
        assert_eq!(stats.eccentric.kg_avg, 3.25);
    }
}
