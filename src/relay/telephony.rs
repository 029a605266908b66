//! Twilio Media Streams wire types and the telephony-side seams.
//!
//! Inbound events are decoded permissively: unknown event names become
//! [`TelephonyEvent::Unknown`] and missing optional fields default. Only
//! text that is not a JSON object with an `event` field is rejected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{RelayError, RelayResult};

// ── Inbound events ─────────────────────────────────────────────────

/// Event received from the telephony provider.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyEvent {
    /// Socket-level hello, sent before `start`.
    Connected,
    /// Stream metadata; carries the identifiers the relay needs.
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        #[serde(default)]
        start: StartMeta,
    },
    /// One frame of caller audio.
    Media { media: MediaPayload },
    /// Playback of a previously sent mark completed.
    Mark {
        #[serde(default)]
        mark: Option<MarkMeta>,
    },
    /// Caller pressed a key.
    Dtmf {
        #[serde(default)]
        dtmf: Option<DtmfMeta>,
    },
    /// The provider is closing the stream.
    Stop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
    #[serde(default)]
    pub custom_parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl MediaPayload {
    /// Audio from the caller. Frames without a track label count as inbound.
    pub fn is_inbound(&self) -> bool {
        self.track.as_deref().is_none_or(|t| t == "inbound")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarkMeta {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DtmfMeta {
    #[serde(default)]
    pub digit: String,
    #[serde(default)]
    pub track: Option<String>,
}

impl TelephonyEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Start { .. } => "start",
            Self::Media { .. } => "media",
            Self::Mark { .. } => "mark",
            Self::Dtmf { .. } => "dtmf",
            Self::Stop => "stop",
            Self::Unknown => "unknown",
        }
    }
}

/// Decode one text frame from the telephony socket.
pub fn parse_telephony_event(text: &str) -> RelayResult<TelephonyEvent> {
    serde_json::from_str(text)
        .map_err(|e| RelayError::InvalidPayload(format!("telephony event: {e}")))
}

// ── Outbound commands ──────────────────────────────────────────────

/// Message sent to the telephony provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyCommand {
    /// Play a chunk of assistant audio.
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    /// Flush audio the provider has buffered but not yet played.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl TelephonyCommand {
    pub fn media(stream_sid: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::Media {
            stream_sid: stream_sid.into(),
            media: OutboundMedia {
                payload: payload.into(),
            },
        }
    }

    pub fn clear(stream_sid: impl Into<String>) -> Self {
        Self::Clear {
            stream_sid: stream_sid.into(),
        }
    }

    pub fn to_json(&self) -> RelayResult<String> {
        serde_json::to_string(self)
            .map_err(|e| RelayError::TelephonySend(format!("encode failed: {e}")))
    }
}

// ── Seams ──────────────────────────────────────────────────────────

/// Source of telephony events for one call.
#[async_trait]
pub trait TelephonyStream: Send {
    /// Next event, or `None` once the provider has closed the stream.
    /// `Err(InvalidPayload)` is recoverable; any other error ends the call.
    async fn next_event(&mut self) -> Option<RelayResult<TelephonyEvent>>;
}

/// Destination for messages to the telephony provider.
#[async_trait]
pub trait TelephonySink: Send {
    async fn send(&mut self, command: TelephonyCommand) -> RelayResult<()>;

    async fn close(&mut self);
}
