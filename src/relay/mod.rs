//! Real-time audio relay between a telephony media stream and a
//! conversational realtime session.
//!
//! ## Design
//! - Frame codec: μ-law expansion and RMS loudness (`codec`)
//! - Session adapter: OpenAI Realtime WebSocket client behind the
//!   `Conversation` trait (`realtime`)
//! - Turn coordinator: single-slot debounce timer for end-of-turn (`turn`)
//! - Barge-in arbiter: amplitude + sustained-duration gate (`barge_in`)
//! - Speaking state: the one record both pumps share (`state`)
//! - Orchestrator: the two pumps and session lifecycle (`orchestrator`)
//!
//! ```text
//! Twilio ──media──▸ inbound pump ──append──▸ Realtime
//!                      │  ├─ BargeInArbiter ──cancel──▸
//!                      │  └─ TurnCoordinator ──commit + response──▸
//! Twilio ◂──media── outbound pump ◂──audio delta── Realtime
//! ```

pub mod barge_in;
pub mod codec;
pub mod error;
pub mod orchestrator;
pub mod realtime;
pub mod registry;
pub mod state;
pub mod telephony;
pub mod turn;

#[cfg(test)]
pub(crate) mod testing;

// ── Upstream event type ──────────────────────────────────────────

/// Event decoded from the conversation side, independent of protocol version.
///
/// The outbound pump acts on the response lifecycle and audio variants and
/// logs the rest.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// The session configuration was accepted.
    SessionReady,
    /// A response began; its id targets later cancellation.
    ResponseStarted { response_id: Option<String> },
    /// One chunk of assistant audio, base64 μ-law as sent upstream.
    AudioDelta {
        payload: String,
        response_id: Option<String>,
    },
    /// A response finished (completed, cancelled, or failed).
    ResponseDone {
        response_id: Option<String>,
        status: Option<String>,
    },
    /// Upstream voice activity detection heard the caller start.
    SpeechStarted,
    /// Upstream voice activity detection heard the caller stop.
    SpeechStopped,
    /// Upstream reported an error. Not fatal by itself.
    Error {
        code: Option<String>,
        message: String,
    },
    /// An event from a protocol schema other than the negotiated one.
    ProtocolMismatch {
        event_type: String,
        expected: &'static str,
    },
    /// Anything else the relay has no use for.
    Other { event_type: String },
}

pub use barge_in::{BargeIn, BargeInArbiter};
pub use codec::{decode_loudness, AudioFrame};
pub use error::{RelayError, RelayResult};
pub use orchestrator::{run_call, CallSettings, GreetingPolicy, SessionEnd, SessionReport};
pub use realtime::{Conversation, ConversationConnector, Intent, RealtimeConnector, RealtimeSession};
pub use registry::{CallGuard, CallRegistry};
pub use state::{SharedSpeakingState, SpeakingState};
pub use telephony::{TelephonyCommand, TelephonyEvent, TelephonySink, TelephonyStream};
pub use turn::{TurnCoordinator, TurnPhase};
