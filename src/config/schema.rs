use serde::{Deserialize, Serialize};

pub use crate::relay::realtime::{ProtocolVersion, TurnDetection};

// ── Top level ───────────────────────────────────────────────────

/// Root configuration, one section per concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub relay: RelayConfig,
    pub realtime: RealtimeConfig,
}

// ── Gateway ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Public `https://` origin the telephony provider reaches us on.
    /// The media stream URL is derived from it.
    pub public_base_url: Option<String>,
    /// Spoken by the provider while the stream connects. Empty disables it.
    pub connect_message: String,
    /// 0 = unlimited
    pub max_concurrent_calls: usize,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            public_base_url: None,
            connect_message: "Hi, connecting you now.".into(),
            max_concurrent_calls: 0,
            request_timeout_secs: 30,
            max_body_bytes: 64 * 1024,
        }
    }
}

// ── Relay ───────────────────────────────────────────────────────

/// Whether the caller may interrupt the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplexMode {
    /// Half duplex: sustained caller speech cancels the assistant.
    #[default]
    Strict,
    /// Both may talk at once; barge-in is off.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GreetingMode {
    #[default]
    None,
    Model,
    /// Requires `greeting_text`.
    Scripted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Silence after the last caller frame before the turn is committed.
    pub silence_debounce_ms: u64,
    /// RMS loudness (linear μ-law scale) that counts as caller voice.
    pub loudness_gate: f64,
    /// Unbroken above-gate audio needed to cut the assistant off.
    pub sustained_voice_ms: u32,
    /// Logical duration of one telephony frame.
    pub frame_ms: u32,
    pub duplex: DuplexMode,
    pub greeting: GreetingMode,
    pub greeting_text: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            silence_debounce_ms: 450,
            loudness_gate: 7000.0,
            sustained_voice_ms: 120,
            frame_ms: 20,
            duplex: DuplexMode::Strict,
            greeting: GreetingMode::None,
            greeting_text: None,
        }
    }
}

// ── Realtime ────────────────────────────────────────────────────

pub const DEFAULT_INSTRUCTIONS: &str = "You are a friendly, warm receptionist answering a phone call. \
Keep answers short and conversational, and stop talking as soon as the caller interrupts.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub url: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub protocol: ProtocolVersion,
    pub turn_detection: TurnDetection,
    /// Only sent when `turn_detection = "server_vad"`.
    pub server_vad_silence_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            url: "wss://api.openai.com/v1/realtime".into(),
            model: "gpt-4o-realtime-preview".into(),
            voice: "alloy".into(),
            instructions: DEFAULT_INSTRUCTIONS.into(),
            protocol: ProtocolVersion::Beta,
            turn_detection: TurnDetection::Local,
            server_vad_silence_ms: 500,
            handshake_timeout_ms: 5_000,
        }
    }
}
