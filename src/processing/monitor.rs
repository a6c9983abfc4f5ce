//! Monitor Processor (`spec.md` §4.5).
//!
//! Turns a raw [`MonitorPacket`] into a validated [`WorkoutMetric`] in seven
//! ordered stages, each documented inline since the ordering itself is the
//! invariant (see the Issue #210 note on `process_sample`). Pure state
//! machine: no I/O, no channel sends — `core::orchestrator` is responsible
//! for publishing the returned [`MonitorOutcome`] onto the event streams.

use crate::core::constants::{
    DELOAD_EVENT_DEBOUNCE_MS, MAX_POSITION_MM, MAX_WEIGHT_KG, MIN_POSITION_MM,
    POSITION_JUMP_THRESHOLD_MM, VELOCITY_SMOOTHING_ALPHA,
};
use crate::error::RomDirection;
use crate::model::types::{status_flags, MonitorPacket, WorkoutMetric};
use crate::protocol::parsers::monitor_velocities_mm_s;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cable {
    A,
    B,
}

/// Everything a processed sample can produce, besides the metric itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorOutcome {
    /// `None` when the sample failed validation (filtered).
    pub metric: Option<WorkoutMetric>,
    pub rom_violation: Option<RomDirection>,
    pub deload_occurred: bool,
}

#[derive(Debug)]
pub struct MonitorProcessor {
    last_good_pos_a: Option<f64>,
    last_good_pos_b: Option<f64>,
    previous_pos_a: Option<f64>,
    previous_pos_b: Option<f64>,
    vel_ema_a: Option<f64>,
    vel_ema_b: Option<f64>,
    last_sample_was_filtered: bool,
    last_deload_time_ms: Option<u64>,
    strict_validation: bool,
    notification_count: u64,
}

impl MonitorProcessor {
    pub fn new(strict_validation: bool) -> Self {
        Self {
            last_good_pos_a: None,
            last_good_pos_b: None,
            previous_pos_a: None,
            previous_pos_b: None,
            vel_ema_a: None,
            vel_ema_b: None,
            last_sample_was_filtered: false,
            last_deload_time_ms: None,
            strict_validation,
            notification_count: 0,
        }
    }

    pub fn set_strict_validation(&mut self, strict: bool) {
        self.strict_validation = strict;
    }

    pub fn notification_count(&self) -> u64 {
        self.notification_count
    }

    /// Clears position tracking, velocity EMA, the filtered flag, and the
    /// notification counter between sessions. Last-good positions, the
    /// last-deload timestamp, and the strict-validation toggle survive —
    /// they describe the machine and the operator's configuration, not the
    /// session that just ended.
    pub fn reset_session_state(&mut self) {
        self.previous_pos_a = None;
        self.previous_pos_b = None;
        self.vel_ema_a = None;
        self.vel_ema_b = None;
        self.last_sample_was_filtered = false;
        self.notification_count = 0;
    }

    fn clamp(&mut self, raw: f64, cable: Cable) -> f64 {
        let in_range = (MIN_POSITION_MM..=MAX_POSITION_MM).contains(&raw);
        let last_good = match cable {
            Cable::A => &mut self.last_good_pos_a,
            Cable::B => &mut self.last_good_pos_b,
        };
        if in_range {
            *last_good = Some(raw);
            raw
        } else {
            last_good.unwrap_or_else(|| raw.clamp(MIN_POSITION_MM, MAX_POSITION_MM))
        }
    }

    fn apply_ema(&mut self, raw_a: f64, raw_b: f64) -> (f64, f64) {
        if self.last_sample_was_filtered {
            self.last_sample_was_filtered = false;
            return (
                self.vel_ema_a.unwrap_or(raw_a),
                self.vel_ema_b.unwrap_or(raw_b),
            );
        }
        let a = match self.vel_ema_a {
            None => raw_a,
            Some(prev) => VELOCITY_SMOOTHING_ALPHA * raw_a + (1.0 - VELOCITY_SMOOTHING_ALPHA) * prev,
        };
        let b = match self.vel_ema_b {
            None => raw_b,
            Some(prev) => VELOCITY_SMOOTHING_ALPHA * raw_b + (1.0 - VELOCITY_SMOOTHING_ALPHA) * prev,
        };
        self.vel_ema_a = Some(a);
        self.vel_ema_b = Some(b);
        (a, b)
    }

    /// Runs the full pipeline on one sample. `timestamp_ms` is supplied by
    /// the caller (the orchestrator, reading the wall clock) rather than
    /// read here, keeping this type a pure function of its inputs.
    pub fn process_sample(&mut self, packet: MonitorPacket, timestamp_ms: u64) -> MonitorOutcome {
        // Stage 1: position clamp.
        let pos_a = self.clamp(packet.pos_a_mm, Cable::A);
        let pos_b = self.clamp(packet.pos_b_mm, Cable::B);

        // Stage 2: status-flag processing.
        let rom_violation = if packet.status & status_flags::OUTSIDE_HIGH != 0 {
            Some(RomDirection::OutsideHigh)
        } else if packet.status & status_flags::OUTSIDE_LOW != 0 {
            Some(RomDirection::OutsideLow)
        } else {
            None
        };

        let mut deload_occurred = false;
        if packet.status & status_flags::DELOAD_OCCURRED != 0 {
            let may_fire = match self.last_deload_time_ms {
                Some(last) => timestamp_ms.saturating_sub(last) >= DELOAD_EVENT_DEBOUNCE_MS,
                None => true,
            };
            if may_fire {
                deload_occurred = true;
                self.last_deload_time_ms = Some(timestamp_ms);
            }
        }

        // Stage 3: Issue #210 invariant — `previous_pos_{a,b}` is the jump-check
        // reference and only ever advances to a position that passed
        // validation. A filtered sample must not become the next sample's
        // jump reference, or a single spike cascades into filtering every
        // sample after it (spec.md §8 S2: 12 -> 200 -> 13 must filter only
        // the 200 sample, not the 13 that follows it).
        let prev_a = self.previous_pos_a;
        let prev_b = self.previous_pos_b;
        let is_first_sample = prev_a.is_none();

        // Stage 4: sample validation.
        let mut filtered = !(MIN_POSITION_MM..=MAX_POSITION_MM).contains(&pos_a)
            || !(MIN_POSITION_MM..=MAX_POSITION_MM).contains(&pos_b)
            || !(0.0..=MAX_WEIGHT_KG).contains(&packet.load_a_kg)
            || !(0.0..=MAX_WEIGHT_KG).contains(&packet.load_b_kg);

        if !filtered && self.strict_validation && !is_first_sample {
            let jump_a = (pos_a - prev_a.unwrap()).abs();
            let jump_b = (pos_b - prev_b.unwrap()).abs();
            if jump_a > POSITION_JUMP_THRESHOLD_MM || jump_b > POSITION_JUMP_THRESHOLD_MM {
                filtered = true;
            }
        }

        self.notification_count += 1;

        if filtered {
            self.last_sample_was_filtered = true;
            return MonitorOutcome {
                metric: None,
                rom_violation,
                deload_occurred,
            };
        }

        self.previous_pos_a = Some(pos_a);
        self.previous_pos_b = Some(pos_b);

        // Stage 5 & 6: velocity + EMA smoothing.
        let (raw_vel_a, raw_vel_b) = monitor_velocities_mm_s(&packet);
        let (smoothed_vel_a_mm_s, smoothed_vel_b_mm_s) = self.apply_ema(raw_vel_a, raw_vel_b);

        // Stage 7: construct the metric.
        let metric = WorkoutMetric {
            ticks: packet.ticks,
            pos_a_mm: pos_a,
            pos_b_mm: pos_b,
            load_a_kg: packet.load_a_kg,
            load_b_kg: packet.load_b_kg,
            fw_vel_a_mm_s: raw_vel_a,
            fw_vel_b_mm_s: raw_vel_b,
            smoothed_vel_a_mm_s,
            smoothed_vel_b_mm_s,
            status: packet.status,
            timestamp_ms,
        };

        MonitorOutcome {
            metric: Some(metric),
            rom_violation,
            deload_occurred,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pos_a: f64, pos_b: f64, vel_a: i16, vel_b: i16, status: u16) -> MonitorPacket {
        MonitorPacket {
            ticks: 1,
            pos_a_mm: pos_a,
            pos_b_mm: pos_b,
            load_a_kg: 0.1,
            load_b_kg: 0.1,
            fw_vel_a: vel_a,
            fw_vel_b: vel_b,
            status,
        }
    }

    /// S1 — first sample seeds the EMA directly.
    #[test]
    fn s1_first_sample_seeds_ema() {
        let mut proc = MonitorProcessor::new(true);
        let outcome = proc.process_sample(packet(10.0, 11.0, 800, -544, 0x0004), 1000);
        let metric = outcome.metric.expect("valid sample");
        assert_eq!(metric.smoothed_vel_a_mm_s, 80.0);
        assert_eq!(metric.smoothed_vel_b_mm_s, -54.4);
    }

    #[test]
    fn issue_210_spike_does_not_cascade() {
        let mut proc = MonitorProcessor::new(true);
        assert!(proc.process_sample(packet(10.0, 10.0, 0, 0, 0), 0).metric.is_some());
        // Huge jump: this sample is filtered...
        let spiked = proc.process_sample(packet(500.0, 10.0, 0, 0, 0), 10);
        assert!(spiked.metric.is_none());
        // ...and tracking stays at 10.0 (the last *valid* position), so a
        // sample near 500 is still a jump and is filtered too, rather than
        // the spike itself becoming the next jump reference.
        let still_filtered = proc.process_sample(packet(505.0, 10.0, 0, 0, 0), 20);
        assert!(still_filtered.metric.is_none());
        // Recovery back near the last good position is accepted.
        let recovers = proc.process_sample(packet(13.0, 10.0, 0, 0, 0), 30);
        assert!(recovers.metric.is_some());
    }

    /// S2 — spec.md §8: 12 -> 200 -> 13, threshold 20, strict on. The 200
    /// sample is filtered; 13 is a small jump relative to 12 (the last valid
    /// position, not 200) and must be emitted. One spike filters exactly one
    /// metric (testable property #2).
    #[test]
    fn s2_single_spike_filters_exactly_one_metric() {
        let mut proc = MonitorProcessor::new(true);
        let first = proc.process_sample(packet(12.0, 12.0, 0, 0, 0), 0);
        assert!(first.metric.is_some());

        let spiked = proc.process_sample(packet(200.0, 12.0, 0, 0, 0), 10);
        assert!(spiked.metric.is_none());

        let recovered = proc.process_sample(packet(13.0, 12.0, 0, 0, 0), 20);
        let metric = recovered.metric.expect("sample after a single spike must be emitted");
        assert_eq!(metric.pos_a_mm, 13.0);
    }

    #[test]
    fn strict_validation_filters_large_jumps() {
        let mut proc = MonitorProcessor::new(true);
        proc.process_sample(packet(10.0, 10.0, 0, 0, 0), 0);
        let outcome = proc.process_sample(packet(40.0, 10.0, 0, 0, 0), 10);
        assert!(outcome.metric.is_none());
    }

    #[test]
    fn non_strict_validation_allows_large_jumps() {
        let mut proc = MonitorProcessor::new(false);
        proc.process_sample(packet(10.0, 10.0, 0, 0, 0), 0);
        let outcome = proc.process_sample(packet(40.0, 10.0, 0, 0, 0), 10);
        assert!(outcome.metric.is_some());
    }

    #[test]
    fn out_of_range_position_falls_back_to_last_good() {
        let mut proc = MonitorProcessor::new(false);
        proc.process_sample(packet(10.0, 10.0, 0, 0, 0), 0);
        let outcome = proc.process_sample(packet(-5.0, 10.0, 0, 0, 0), 10);
        // Clamped back to 10.0, so this does not register as a jump either.
        assert_eq!(outcome.metric.unwrap().pos_a_mm, 10.0);
    }

    #[test]
    fn deload_debounced_within_window() {
        let mut proc = MonitorProcessor::new(false);
        let first = proc.process_sample(packet(10.0, 10.0, 0, 0, status_flags::DELOAD_OCCURRED), 0);
        assert!(first.deload_occurred);
        let second = proc.process_sample(
            packet(10.0, 10.0, 0, 0, status_flags::DELOAD_OCCURRED),
            DELOAD_EVENT_DEBOUNCE_MS / 2,
        );
        assert!(!second.deload_occurred);
        let third = proc.process_sample(
            packet(10.0, 10.0, 0, 0, status_flags::DELOAD_OCCURRED),
            DELOAD_EVENT_DEBOUNCE_MS + 1,
        );
        assert!(third.deload_occurred);
    }

    #[test]
    fn rom_violation_fires_every_sample() {
        let mut proc = MonitorProcessor::new(false);
        let outcome = proc.process_sample(packet(10.0, 10.0, 0, 0, status_flags::OUTSIDE_HIGH), 0);
        assert_eq!(outcome.rom_violation, Some(RomDirection::OutsideHigh));
    }

    #[test]
    fn reset_preserves_last_good_and_strict_flag() {
        let mut proc = MonitorProcessor::new(true);
        proc.process_sample(packet(10.0, 10.0, 5, 5, 0), 0);
        proc.reset_session_state();
        assert_eq!(proc.notification_count(), 0);
        // last_good_pos still primes clamping: an out-of-range sample right
        // after reset should fall back to 10.0, not to raw.
        let outcome = proc.process_sample(packet(-1.0, 10.0, 0, 0, 0), 100);
        assert_eq!(outcome.metric.unwrap().pos_a_mm, 10.0);
    }
}
