//! Handle State Detector (`spec.md` §4.6).
//!
//! A small hand-rolled state machine rather than a `rust-fsm`-style DSL (see
//! `DESIGN.md`): four states, three triggered transitions, one piece of
//! hysteresis state (`grab_candidate_since_ms`). Consumes the validated
//! `WorkoutMetric` fields the orchestrator already has in hand; it does not
//! read `WorkoutMetric` itself so it stays usable from both the monitor
//! pipeline and tests that only care about position/velocity pairs.

use crate::core::constants::{
    HANDLE_GRAB_POSITION_THRESHOLD_MM, HANDLE_GRAB_SUSTAIN_MS, HANDLE_GRAB_VELOCITY_THRESHOLD_MM_S,
    HANDLE_REST_THRESHOLD_MM,
};
use crate::model::types::{HandleDetection, HandleState};

#[derive(Debug)]
pub struct HandleStateDetector {
    state: HandleState,
    grab_candidate_since_ms: Option<u64>,
}

impl HandleStateDetector {
    pub fn new() -> Self {
        Self {
            state: HandleState::WaitingForRest,
            grab_candidate_since_ms: None,
        }
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Any state → `Disabled`.
    pub fn disable(&mut self) {
        self.state = HandleState::Disabled;
        self.grab_candidate_since_ms = None;
    }

    /// Explicit reset → `WaitingForRest`, regardless of current state.
    pub fn reset(&mut self) {
        self.state = HandleState::WaitingForRest;
        self.grab_candidate_since_ms = None;
    }

    /// Feeds one sample's position/velocity pair through the FSM.
    ///
    /// Runs identically whether the caller is in auto-start or active-workout
    /// mode; it is the orchestrator's job to decide whether a `Grabbed`
    /// transition should kick off the start choreography or merely inform
    /// the safety supervisor (`spec.md` §4.6's `for_auto_start` distinction).
    pub fn update(&mut self, pos_a_mm: f64, pos_b_mm: f64, vel_a_mm_s: f64, vel_b_mm_s: f64, now_ms: u64) -> HandleDetection {
        let max_position_mm = pos_a_mm.max(pos_b_mm);
        let max_abs_velocity_mm_s = vel_a_mm_s.abs().max(vel_b_mm_s.abs());

        match self.state {
            HandleState::Disabled => {}
            HandleState::WaitingForRest => {
                if max_position_mm < HANDLE_REST_THRESHOLD_MM {
                    self.state = HandleState::Released;
                }
            }
            HandleState::Released => {
                let grabbing = max_position_mm > HANDLE_GRAB_POSITION_THRESHOLD_MM
                    && max_abs_velocity_mm_s > HANDLE_GRAB_VELOCITY_THRESHOLD_MM_S;
                if grabbing {
                    let since = *self.grab_candidate_since_ms.get_or_insert(now_ms);
                    if now_ms.saturating_sub(since) >= HANDLE_GRAB_SUSTAIN_MS {
                        self.state = HandleState::Grabbed;
                        self.grab_candidate_since_ms = None;
                    }
                } else {
                    self.grab_candidate_since_ms = None;
                }
            }
            HandleState::Grabbed => {
                if max_position_mm < HANDLE_REST_THRESHOLD_MM {
                    self.state = HandleState::Released;
                }
            }
        }

        HandleDetection {
            state: self.state,
            max_position_mm,
            max_abs_velocity_mm_s,
        }
    }
}

impl Default for HandleStateDetector {
    fn default() -> Self {
        Self::new()
    }
}
