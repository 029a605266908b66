//! Shared speaking state for one call.
//!
//! Both pumps hold the same [`SharedSpeakingState`]. Each method below is one
//! critical section; callers take the lock, call exactly one operation, and
//! drop the guard before any network I/O.

use parking_lot::Mutex;
use std::sync::Arc;

/// State shared by the barge-in arbiter and the outbound pump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeakingState {
    /// The assistant has audio on the line.
    pub is_speaking: bool,
    /// Drop every outbound delta until the next response starts.
    pub suppress_outbound: bool,
    /// Upstream id of the response currently being played, when known.
    pub current_response_id: Option<String>,
    /// Unbroken above-gate caller audio observed while speaking.
    pub sustained_loud_ms: u32,
}

/// How a response ended, as seen by the outbound pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEnd {
    /// Played to completion (or never produced audio).
    Completed,
    /// Had been hard-cancelled; its cancel already cleared the input buffer.
    Interrupted,
    /// Belongs to an earlier response than the one now tracked. Ignored.
    Stale,
}

pub type SharedSpeakingState = Arc<Mutex<SpeakingState>>;

impl SpeakingState {
    pub fn shared() -> SharedSpeakingState {
        Arc::new(Mutex::new(Self::default()))
    }

    /// A new response began upstream: lift suppression and track its id.
    pub fn begin_response(&mut self, response_id: Option<String>) {
        self.suppress_outbound = false;
        self.current_response_id = response_id;
        self.sustained_loud_ms = 0;
    }

    /// Decide whether an audio delta may go out. Forwarding marks the
    /// assistant as speaking; suppressed deltas change nothing.
    pub fn admit_audio_delta(&mut self) -> bool {
        if self.suppress_outbound {
            return false;
        }
        self.is_speaking = true;
        true
    }

    /// The upstream finished a response. Suppression is left in place so it
    /// persists until the next `begin_response`.
    ///
    /// When both ids are known and differ, the event is for a response that
    /// was already superseded and nothing changes.
    pub fn finish_response(&mut self, response_id: Option<&str>) -> ResponseEnd {
        if let (Some(done), Some(current)) = (response_id, self.current_response_id.as_deref()) {
            if done != current {
                return ResponseEnd::Stale;
            }
        }
        self.is_speaking = false;
        self.current_response_id = None;
        self.sustained_loud_ms = 0;
        if self.suppress_outbound {
            ResponseEnd::Interrupted
        } else {
            ResponseEnd::Completed
        }
    }

    /// Add one above-gate frame to the accumulator and return the new total.
    pub fn accumulate_loud(&mut self, frame_ms: u32) -> u32 {
        self.sustained_loud_ms = self.sustained_loud_ms.saturating_add(frame_ms);
        self.sustained_loud_ms
    }

    pub fn reset_loud(&mut self) {
        self.sustained_loud_ms = 0;
    }

    /// Stop the assistant immediately. Returns the id to target with the
    /// upstream cancel, if one was known.
    pub fn hard_cancel(&mut self) -> Option<String> {
        self.suppress_outbound = true;
        self.is_speaking = false;
        self.sustained_loud_ms = 0;
        self.current_response_id.take()
    }
}
