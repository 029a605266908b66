//! Barge-in detection: caller speech while the assistant is talking.
//!
//! Two gates must both pass before the assistant is cut off:
//! 1. **Amplitude**: frame loudness at or above `gate`.
//! 2. **Duration**: an unbroken run of such frames lasting `required_ms`.
//!
//! Any frame below the gate restarts the run from zero. Line clicks and echo
//! spikes are short; real speech is not.

use super::state::SpeakingState;

/// Outcome of evaluating one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BargeIn {
    /// Assistant silent, or the frame was below the gate.
    Idle,
    /// Above the gate, run not yet long enough.
    Accumulating { sustained_ms: u32 },
    /// Threshold reached. State is already suppressed; the caller must now
    /// cancel upstream, targeting `response_id` when present.
    Triggered { response_id: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BargeInArbiter {
    gate: f64,
    required_ms: u32,
}

impl BargeInArbiter {
    pub fn new(gate: f64, required_ms: u32) -> Self {
        Self { gate, required_ms }
    }

    /// Evaluate one frame against the shared state.
    ///
    /// Must run inside the state's critical section. On `Triggered` the
    /// suppression flag is already set when this returns, so an outbound
    /// delta examined after the lock is released is dropped.
    pub fn evaluate(&self, state: &mut SpeakingState, loudness: f64, frame_ms: u32) -> BargeIn {
        if !state.is_speaking {
            return BargeIn::Idle;
        }

        if loudness < self.gate {
            state.reset_loud();
            return BargeIn::Idle;
        }

        let sustained_ms = state.accumulate_loud(frame_ms);
        if sustained_ms >= self.required_ms {
            BargeIn::Triggered {
                response_id: state.hard_cancel(),
            }
        } else {
            BargeIn::Accumulating { sustained_ms }
        }
    }
}
