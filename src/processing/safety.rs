//! Safety Supervisor (`spec.md` §4.9).
//!
//! A pure function of its inputs: given the latest `WorkoutMetric` and
//! whether the rep counter's ROM tracker places the cables in the danger
//! zone, decides whether the workout should stop. Acting on [`SafetyDecision::Stop`]
//! (invoking `sequencer::CommandSequencer`'s stop choreography) is the
//! orchestrator's job, not this module's — keeping it side-effect-free
//! makes the two stop conditions independently testable without a fake BLE
//! stack.

use crate::core::constants::{
    AUTO_STOP_DURATION_SECONDS, STALL_DURATION_SECONDS, STALL_VELOCITY_LOW_MM_S,
};
use crate::model::types::{SafetyDecision, SafetyStopReason, WorkoutMetric};

#[derive(Debug, Default)]
pub struct SafetySupervisor {
    stall_since_ms: Option<u64>,
    danger_since_ms: Option<u64>,
}

impl SafetySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.stall_since_ms = None;
        self.danger_since_ms = None;
    }

    /// `in_danger_zone` should come from `processing::reps::RepCounter::is_in_danger_zone`.
    pub fn evaluate(&mut self, metric: &WorkoutMetric, in_danger_zone: bool) -> SafetyDecision {
        let max_abs_velocity = metric
            .smoothed_vel_a_mm_s
            .abs()
            .max(metric.smoothed_vel_b_mm_s.abs());

        let stall_triggered = self.update_latch(true, max_abs_velocity < STALL_VELOCITY_LOW_MM_S, metric.timestamp_ms, STALL_DURATION_SECONDS);
        let danger_triggered = self.update_latch(false, in_danger_zone, metric.timestamp_ms, AUTO_STOP_DURATION_SECONDS);

        if stall_triggered {
            SafetyDecision::Stop(SafetyStopReason::StallDetected)
        } else if danger_triggered {
            SafetyDecision::Stop(SafetyStopReason::PositionDanger)
        } else {
            SafetyDecision::Continue
        }
    }

    fn update_latch(&mut self, is_stall: bool, condition: bool, now_ms: u64, duration_seconds: f64) -> bool {
        let since = if is_stall {
            &mut self.stall_since_ms
        } else {
            &mut self.danger_since_ms
        };
        if !condition {
            *since = None;
            return false;
        }
        let started = *since.get_or_insert(now_ms);
        let elapsed_s = now_ms.saturating_sub(started) as f64 / 1000.0;
        elapsed_s >= duration_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(vel_a: f64, vel_b: f64, timestamp_ms: u64) -> WorkoutMetric {
        WorkoutMetric {
            ticks: 0,
            pos_a_mm: 100.0,
            pos_b_mm: 100.0,
            load_a_kg: 10.0,
            load_b_kg: 10.0,
            fw_vel_a_mm_s: vel_a,
            fw_vel_b_mm_s: vel_b,
            smoothed_vel_a_mm_s: vel_a,
            smoothed_vel_b_mm_s: vel_b,
            status: 0,
            timestamp_ms,
        }
    }

    #[test]
    fn stall_requires_sustained_low_velocity() {
        let mut supervisor = SafetySupervisor::new();
        assert_eq!(supervisor.evaluate(&metric(1.0, 1.0, 0), false), SafetyDecision::Continue);
        assert_eq!(
            supervisor.evaluate(&metric(1.0, 1.0, 4_999), false),
            SafetyDecision::Continue
        );
        assert_eq!(
            supervisor.evaluate(&metric(1.0, 1.0, 5_001), false),
            SafetyDecision::Stop(SafetyStopReason::StallDetected)
        );
    }

    #[test]
    fn movement_resets_stall_latch() {
        let mut supervisor = SafetySupervisor::new();
        supervisor.evaluate(&metric(1.0, 1.0, 0), false);
        supervisor.evaluate(&metric(100.0, 100.0, 3_000), false);
        assert_eq!(
            supervisor.evaluate(&metric(1.0, 1.0, 8_000), false),
            SafetyDecision::Continue
        );
    }

    #[test]
    fn danger_zone_requires_sustained_duration() {
        let mut supervisor = SafetySupervisor::new();
        assert_eq!(
            supervisor.evaluate(&metric(100.0, 100.0, 0), true),
            SafetyDecision::Continue
        );
        assert_eq!(
            supervisor.evaluate(&metric(100.0, 100.0, 2_501), true),
            SafetyDecision::Stop(SafetyStopReason::PositionDanger)
        );
    }

    #[test]
    fn leaving_danger_zone_resets_latch() {
        let mut supervisor = SafetySupervisor::new();
        supervisor.evaluate(&metric(100.0, 100.0, 0), true);
        supervisor.evaluate(&metric(100.0, 100.0, 1_000), false);
        assert_eq!(
            supervisor.evaluate(&metric(100.0, 100.0, 3_600), true),
            SafetyDecision::Continue
        );
    }
}
