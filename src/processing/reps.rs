//! Rep Counter (`spec.md` §4.7).
//!
//! Fuses machine-originated rep notifications with a position-based
//! range-of-motion tracker. The latter runs continuously while no workout is
//! active (typically during just-lift) so the safety supervisor can reason
//! about "bottom of ROM" without depending on rep counts the trainer
//! sometimes suppresses entirely in that mode.

use crate::core::constants::DANGER_ZONE_FRACTION;
use crate::model::types::{RepEvent, RepEventSource, RepNotification};

#[derive(Debug, Default)]
struct Envelope {
    min: Option<f64>,
    max: Option<f64>,
}

impl Envelope {
    fn observe(&mut self, value: f64) {
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    /// Position at or below which a cable is in the bottom `fraction` of its observed range.
    fn danger_threshold(&self, fraction: f64) -> Option<f64> {
        match (self.min, self.max) {
            (Some(min), Some(max)) => Some(min + fraction * (max - min)),
            _ => None,
        }
    }
}

fn non_negative_delta(prev: Option<u16>, raw: u16) -> u16 {
    match prev {
        Some(p) if raw >= p => raw - p,
        _ => 0,
    }
}

#[derive(Debug, Default)]
pub struct RepCounter {
    prev_legacy_complete: Option<u16>,
    prev_modern_complete: Option<u16>,
    range_a: Envelope,
    range_b: Envelope,
}

impl RepCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears counters and position envelopes for a new session. Counts and
    /// ROM tracking are both session-scoped per `spec.md` §4.7's "monotonic
    /// within a set" invariant.
    pub fn reset_session(&mut self) {
        self.prev_legacy_complete = None;
        self.prev_modern_complete = None;
        self.range_a = Envelope::default();
        self.range_b = Envelope::default();
    }

    /// Ingests a machine-originated rep notification into a `RepEvent`.
    /// `complete_delta` is clamped to `>= 0`: a `complete` count lower than
    /// the previous sighting is rolled over to a fresh baseline rather than
    /// reported negative.
    pub fn ingest_notification(&mut self, notification: RepNotification) -> RepEvent {
        match notification {
            RepNotification::Legacy6 { complete, .. } => {
                let delta = non_negative_delta(self.prev_legacy_complete, complete);
                self.prev_legacy_complete = Some(complete);
                RepEvent {
                    source: RepEventSource::Legacy6,
                    warmup_done: 0,
                    warmup_target: 0,
                    working_done: complete,
                    working_target: 0,
                    complete_counter_raw: complete,
                    complete_delta: delta,
                }
            }
            RepNotification::Modern24 {
                complete,
                warmup_done,
                warmup_target,
                working_done,
                working_target,
                ..
            } => {
                let delta = non_negative_delta(self.prev_modern_complete, complete);
                self.prev_modern_complete = Some(complete);
                RepEvent {
                    source: RepEventSource::Modern24,
                    warmup_done,
                    warmup_target,
                    working_done,
                    working_target,
                    complete_counter_raw: complete,
                    complete_delta: delta,
                }
            }
        }
    }

    /// Builds min/max position envelopes while no workout is active, per
    /// cable. Safe to call every monitor sample; it is a no-op for danger-zone
    /// purposes once a workout starts consuming [`RepCounter::is_in_danger_zone`].
    pub fn update_position_ranges_continuously(&mut self, pos_a_mm: f64, pos_b_mm: f64) {
        self.range_a.observe(pos_a_mm);
        self.range_b.observe(pos_b_mm);
    }

    /// True if either cable is within the bottom `DANGER_ZONE_FRACTION` of
    /// its observed range of motion. Returns `false` until both envelopes
    /// have at least one observation.
    pub fn is_in_danger_zone(&self, pos_a_mm: f64, pos_b_mm: f64) -> bool {
        let in_zone_a = self
            .range_a
            .danger_threshold(DANGER_ZONE_FRACTION)
            .is_some_and(|threshold| pos_a_mm <= threshold);
        let in_zone_b = self
            .range_b
            .danger_threshold(DANGER_ZONE_FRACTION)
            .is_some_and(|threshold| pos_b_mm <= threshold);
        in_zone_a || in_zone_b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_rep_produces_raw_and_delta() {
        let mut counter = RepCounter::new();
        let first = counter.ingest_notification(RepNotification::Legacy6 { top: 1, complete: 3 });
        assert_eq!(first.complete_counter_raw, 3);
        assert_eq!(first.complete_delta, 3);

        let second = counter.ingest_notification(RepNotification::Legacy6 { top: 1, complete: 5 });
        assert_eq!(second.complete_counter_raw, 5);
        assert_eq!(second.complete_delta, 2);
    }

    #[test]
    fn legacy_rollback_clamps_delta_to_zero() {
        let mut counter = RepCounter::new();
        counter.ingest_notification(RepNotification::Legacy6 { top: 1, complete: 10 });
        let rolled_over = counter.ingest_notification(RepNotification::Legacy6 { top: 0, complete: 1 });
        assert_eq!(rolled_over.complete_delta, 0);
        assert_eq!(rolled_over.complete_counter_raw, 1);
    }

    #[test]
    fn modern_rep_keeps_warmup_and_working_separate() {
        let mut counter = RepCounter::new();
        let event = counter.ingest_notification(RepNotification::Modern24 {
            top: 1,
            complete: 4,
            warmup_done: 3,
            warmup_target: 3,
            working_done: 1,
            working_target: 8,
            range_top: 700,
            range_bottom: 50,
        });
        assert_eq!(event.warmup_done, 3);
        assert_eq!(event.working_done, 1);
        assert_eq!(event.working_target, 8);
    }

    #[test]
    fn legacy_and_modern_counters_are_independent() {
        let mut counter = RepCounter::new();
        counter.ingest_notification(RepNotification::Legacy6 { top: 1, complete: 10 });
        let modern = counter.ingest_notification(RepNotification::Modern24 {
            top: 1,
            complete: 2,
            warmup_done: 0,
            warmup_target: 0,
            working_done: 2,
            working_target: 8,
            range_top: 0,
            range_bottom: 0,
        });
        // Independent baselines: modern's first sighting is a full delta, not
        // reduced by the unrelated legacy count.
        assert_eq!(modern.complete_delta, 2);
    }

    #[test]
    fn danger_zone_requires_observed_range() {
        let mut counter = RepCounter::new();
        assert!(!counter.is_in_danger_zone(1.0, 1.0));
        counter.update_position_ranges_continuously(0.0, 0.0);
        counter.update_position_ranges_continuously(100.0, 100.0);
        // Bottom 5% of [0, 100] is [0, 5].
        assert!(counter.is_in_danger_zone(3.0, 50.0));
        assert!(!counter.is_in_danger_zone(50.0, 50.0));
    }
}
