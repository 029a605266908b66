//! OpenAI Realtime WebSocket client: the conversation side of a call.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: WebSocket to `{url}?model=...` with bearer auth
//! 2. **Configure**: send one `session.update` (μ-law both ways, voice,
//!    turn detection, instructions) and wait for `session.updated`
//! 3. **Stream**: relay intents (`input_audio_buffer.*`, `response.*`) up,
//!    decode server events into [`ConversationEvent`]s down
//! 4. **Close**: send a close frame and stop both loops
//!
//! Exactly one schema is spoken per session, chosen by [`ProtocolVersion`].
//! A server event that only exists in the other schema is reported as
//! [`ConversationEvent::ProtocolMismatch`] instead of being guessed at.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Uri};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::codec::AudioFrame;
use super::error::{RelayError, RelayResult};
use super::ConversationEvent;
use crate::config::RealtimeConfig;

// ── Constants ──────────────────────────────────────────────────────

/// Wire name of G.711 μ-law in the beta session schema.
const BETA_ULAW_FORMAT: &str = "g711_ulaw";

/// Wire name of G.711 μ-law in the GA session schema.
const GA_ULAW_FORMAT: &str = "audio/pcmu";

/// Capacity of the intent and event channels.
const CHANNEL_CAPACITY: usize = 256;

// ── Protocol selection ─────────────────────────────────────────────

/// Realtime API schema negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// `OpenAI-Beta: realtime=v1`, flat session fields.
    #[default]
    Beta,
    /// General availability schema, nested `audio.input` / `audio.output`.
    Ga,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Beta => "beta",
            Self::Ga => "ga",
        }
    }

    /// Value of the `OpenAI-Beta` header, if this schema needs one.
    pub fn beta_header(self) -> Option<&'static str> {
        match self {
            Self::Beta => Some("realtime=v1"),
            Self::Ga => None,
        }
    }

    /// Server event carrying assistant audio.
    pub fn audio_delta_event(self) -> &'static str {
        match self {
            Self::Beta => "response.audio.delta",
            Self::Ga => "response.output_audio.delta",
        }
    }

    /// Event types that exist only in the other schema.
    fn foreign_events(self) -> &'static [&'static str] {
        match self {
            Self::Beta => &[
                "response.output_audio.delta",
                "response.output_audio.done",
                "response.output_audio_transcript.delta",
                "response.output_text.delta",
            ],
            Self::Ga => &[
                "response.audio.delta",
                "response.audio.done",
                "response.audio_transcript.delta",
                "response.text.delta",
            ],
        }
    }

    pub fn is_foreign_event(self, event_type: &str) -> bool {
        self.foreign_events().contains(&event_type)
    }
}

/// Who decides that the caller has finished a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDetection {
    /// The relay's own debounce timer commits turns; upstream VAD is off.
    #[default]
    Local,
    /// Upstream server VAD commits turns; the relay only commits on hang-up.
    ServerVad,
}

// ── Intents ────────────────────────────────────────────────────────

/// One relay-to-conversation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Base64 μ-law audio for the input buffer.
    AppendAudio(String),
    /// Finalize the buffered caller input as one turn.
    Commit,
    /// Ask for a reply, optionally with per-response instructions.
    CreateResponse { instructions: Option<String> },
    /// Stop a response; `None` cancels whatever is in flight.
    CancelResponse { response_id: Option<String> },
    /// Drop any uncommitted caller audio.
    ClearInput,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AppendAudio(_) => "input_audio_buffer.append",
            Self::Commit => "input_audio_buffer.commit",
            Self::CreateResponse { .. } => "response.create",
            Self::CancelResponse { .. } => "response.cancel",
            Self::ClearInput => "input_audio_buffer.clear",
        }
    }

    /// Client event for this intent. Identical in both schemas.
    pub fn to_message(&self) -> serde_json::Value {
        match self {
            Self::AppendAudio(payload) => serde_json::json!({
                "type": self.name(),
                "audio": payload,
            }),
            Self::CreateResponse {
                instructions: Some(text),
            } => serde_json::json!({
                "type": self.name(),
                "response": { "instructions": text },
            }),
            Self::CancelResponse {
                response_id: Some(id),
            } => serde_json::json!({
                "type": self.name(),
                "response_id": id,
            }),
            Self::Commit
            | Self::ClearInput
            | Self::CreateResponse { instructions: None }
            | Self::CancelResponse { response_id: None } => {
                serde_json::json!({ "type": self.name() })
            }
        }
    }
}

// ── Conversation seam ──────────────────────────────────────────────

/// The conversation side as the relay sees it.
///
/// Implementors provide `send` and `close`; the named operations are thin
/// wrappers so that every path produces the same intent sequence.
#[async_trait]
pub trait Conversation: Send + Sync {
    /// Queue one intent. Fire-and-forget: no upstream acknowledgement.
    async fn send(&self, intent: Intent) -> RelayResult<()>;

    /// Close the upstream connection.
    async fn close(&self);

    async fn append_audio(&self, frame: &AudioFrame) -> RelayResult<()> {
        self.send(Intent::AppendAudio(frame.payload().to_owned()))
            .await
    }

    async fn commit_turn(&self) -> RelayResult<()> {
        self.send(Intent::Commit).await
    }

    async fn request_response(&self, instructions: Option<String>) -> RelayResult<()> {
        self.send(Intent::CreateResponse { instructions }).await
    }

    /// Cancel a response and drop residual caller audio with it.
    async fn cancel_response(&self, response_id: Option<String>) -> RelayResult<()> {
        self.send(Intent::CancelResponse { response_id }).await?;
        self.send(Intent::ClearInput).await
    }

    async fn clear_input(&self) -> RelayResult<()> {
        self.send(Intent::ClearInput).await
    }
}

/// Opens configured conversation sessions, one per call.
#[async_trait]
pub trait ConversationConnector: Send + Sync {
    async fn connect(
        &self,
        call_id: &str,
    ) -> RelayResult<(Arc<dyn Conversation>, mpsc::Receiver<ConversationEvent>)>;
}

/// Connector for the OpenAI Realtime API.
pub struct RealtimeConnector {
    config: RealtimeConfig,
}

impl RealtimeConnector {
    pub fn new(config: RealtimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConversationConnector for RealtimeConnector {
    async fn connect(
        &self,
        call_id: &str,
    ) -> RelayResult<(Arc<dyn Conversation>, mpsc::Receiver<ConversationEvent>)> {
        let (session, events) = RealtimeSession::connect(call_id.to_owned(), &self.config).await?;
        let conversation: Arc<dyn Conversation> = Arc::new(session);
        Ok((conversation, events))
    }
}

// ── Session ────────────────────────────────────────────────────────

#[derive(Debug)]
enum OutboundMessage {
    Intent(Intent),
    Close,
}

/// Handle to a configured realtime session.
///
/// Created by [`RealtimeSession::connect`], which also returns the event
/// stream. Intents go through a channel to a writer task so that callers
/// never hold the socket.
pub struct RealtimeSession {
    outbound_tx: mpsc::Sender<OutboundMessage>,
    call_id: String,
}

impl RealtimeSession {
    /// Connect, send the session configuration, and wait for the server to
    /// accept it. Any failure here is fatal for the call.
    pub async fn connect(
        call_id: String,
        config: &RealtimeConfig,
    ) -> RelayResult<(Self, mpsc::Receiver<ConversationEvent>)> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RelayError::Connect("realtime API key is not configured".into()))?;

        let url = session_url(&config.url, &config.model)?;
        tracing::info!(
            call_id = %call_id,
            model = %config.model,
            protocol = config.protocol.as_str(),
            "Connecting to realtime service"
        );

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Connect(format!("invalid realtime URL: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| RelayError::Connect(format!("invalid auth header: {e}")))?;
        request.headers_mut().insert("Authorization", auth);
        if let Some(beta) = config.protocol.beta_header() {
            request
                .headers_mut()
                .insert("OpenAI-Beta", HeaderValue::from_static(beta));
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let update = build_session_update(config);
        tracing::debug!(call_id = %call_id, "Sending session.update");
        ws_sender
            .send(WsMessage::Text(update.to_string().into()))
            .await
            .map_err(|e| RelayError::Handshake(format!("failed to send session.update: {e}")))?;

        let timeout = Duration::from_millis(config.handshake_timeout_ms);
        tokio::time::timeout(timeout, await_session_ack(&mut ws_receiver, config.protocol))
            .await
            .map_err(|_| {
                RelayError::Handshake(format!(
                    "no session.updated within {}ms",
                    config.handshake_timeout_ms
                ))
            })??;
        tracing::info!(call_id = %call_id, "Realtime session configured");

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundMessage>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ConversationEvent>(CHANNEL_CAPACITY);

        let cid_out = call_id.clone();
        tokio::spawn(async move {
            outbound_loop(outbound_rx, ws_sender, cid_out).await;
        });

        let cid_in = call_id.clone();
        let protocol = config.protocol;
        tokio::spawn(async move {
            inbound_loop(ws_receiver, event_tx, protocol, cid_in).await;
        });

        Ok((
            Self {
                outbound_tx,
                call_id,
            },
            event_rx,
        ))
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }
}

#[async_trait]
impl Conversation for RealtimeSession {
    async fn send(&self, intent: Intent) -> RelayResult<()> {
        self.outbound_tx
            .send(OutboundMessage::Intent(intent))
            .await
            .map_err(|_| RelayError::ConversationSend("realtime writer has stopped".into()))
    }

    async fn close(&self) {
        let _ = self.outbound_tx.send(OutboundMessage::Close).await;
    }
}

// ── Internal loops ─────────────────────────────────────────────────

/// Read server events until the configuration is acknowledged.
async fn await_session_ack<S, E>(ws_receiver: &mut S, protocol: ProtocolVersion) -> RelayResult<()>
where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match parse_server_event(text.as_str(), protocol) {
                Some(ConversationEvent::SessionReady) => return Ok(()),
                Some(ConversationEvent::Error { message, .. }) => {
                    return Err(RelayError::Handshake(message));
                }
                Some(ConversationEvent::ProtocolMismatch {
                    event_type,
                    expected,
                }) => {
                    return Err(RelayError::ProtocolMismatch {
                        event_type,
                        expected,
                    });
                }
                _ => {}
            },
            Ok(WsMessage::Close(frame)) => {
                return Err(RelayError::Handshake(format!(
                    "connection closed during handshake: {frame:?}"
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(RelayError::Handshake(e.to_string())),
        }
    }
    Err(RelayError::Handshake(
        "connection ended before session.updated".into(),
    ))
}

/// Serialize intents onto the socket until the channel closes or a write fails.
async fn outbound_loop<S>(mut rx: mpsc::Receiver<OutboundMessage>, mut ws_sender: S, call_id: String)
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let mut audio_chunk_count: u64 = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            OutboundMessage::Intent(intent) => {
                if matches!(intent, Intent::AppendAudio(_)) {
                    audio_chunk_count += 1;
                    if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
                        tracing::debug!(
                            call_id = %call_id,
                            chunk = audio_chunk_count,
                            "Appending caller audio"
                        );
                    }
                } else {
                    tracing::debug!(call_id = %call_id, intent = intent.name(), "Sending intent");
                }
                let json = intent.to_message().to_string();
                if let Err(e) = ws_sender.send(WsMessage::Text(json.into())).await {
                    tracing::warn!(
                        call_id = %call_id,
                        error = %e,
                        "Realtime send failed, closing outbound loop"
                    );
                    break;
                }
            }
            OutboundMessage::Close => {
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    tracing::debug!(call_id = %call_id, "Realtime outbound loop terminated");
}

/// Decode server events and hand them to the relay until the socket ends.
async fn inbound_loop<S, E>(
    mut ws_receiver: S,
    event_tx: mpsc::Sender<ConversationEvent>,
    protocol: ProtocolVersion,
    call_id: String,
) where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => {
                let Some(event) = parse_server_event(text.as_str(), protocol) else {
                    continue;
                };
                if event_tx.send(event).await.is_err() {
                    tracing::debug!(call_id = %call_id, "Event receiver dropped");
                    return;
                }
            }
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(
                    call_id = %call_id,
                    close_frame = ?frame,
                    "Realtime connection closed"
                );
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) | WsMessage::Binary(_)) => {
                // Ping/pong is answered by tungstenite; binary is not part of the protocol.
            }
            Err(e) => {
                tracing::error!(call_id = %call_id, error = %e, "Realtime WebSocket error");
                break;
            }
        }
    }

    tracing::debug!(call_id = %call_id, "Realtime inbound loop terminated");
}

// ── Session URL ────────────────────────────────────────────────────

/// Append `model` to the configured endpoint.
///
/// An endpoint without a path gets `/`, since `?model=` alone is not a valid
/// request target. An existing query is kept.
pub fn session_url(base: &str, model: &str) -> RelayResult<String> {
    let uri: Uri = base
        .trim()
        .parse()
        .map_err(|e| RelayError::Connect(format!("invalid realtime URL {base:?}: {e}")))?;
    let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) else {
        return Err(RelayError::Connect(format!(
            "realtime URL {base:?} needs a scheme and host"
        )));
    };
    let path = match uri.path() {
        "" => "/",
        path => path,
    };
    let url = match uri.query() {
        Some(query) if !query.is_empty() => {
            format!("{scheme}://{authority}{path}?{query}&model={model}")
        }
        _ => format!("{scheme}://{authority}{path}?model={model}"),
    };
    Ok(url)
}

// ── Session update message ─────────────────────────────────────────

/// Build the one `session.update` sent at connect time.
pub fn build_session_update(config: &RealtimeConfig) -> serde_json::Value {
    let turn_detection = match config.turn_detection {
        TurnDetection::Local => serde_json::Value::Null,
        TurnDetection::ServerVad => serde_json::json!({
            "type": "server_vad",
            "silence_duration_ms": config.server_vad_silence_ms,
        }),
    };

    match config.protocol {
        ProtocolVersion::Beta => serde_json::json!({
            "type": "session.update",
            "session": {
                "modalities": ["audio", "text"],
                "voice": config.voice,
                "instructions": config.instructions,
                "input_audio_format": BETA_ULAW_FORMAT,
                "output_audio_format": BETA_ULAW_FORMAT,
                "turn_detection": turn_detection,
            }
        }),
        ProtocolVersion::Ga => serde_json::json!({
            "type": "session.update",
            "session": {
                "type": "realtime",
                "model": config.model,
                "output_modalities": ["audio"],
                "instructions": config.instructions,
                "audio": {
                    "input": {
                        "format": { "type": GA_ULAW_FORMAT },
                        "turn_detection": turn_detection,
                    },
                    "output": {
                        "format": { "type": GA_ULAW_FORMAT },
                        "voice": config.voice,
                    }
                }
            }
        }),
    }
}

// ── Server event parsing ───────────────────────────────────────────

fn str_at(value: &serde_json::Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

/// Decode one server event. Malformed JSON is logged and dropped.
pub fn parse_server_event(json_text: &str, protocol: ProtocolVersion) -> Option<ConversationEvent> {
    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed realtime event");
            return None;
        }
    };

    let event_type = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");

    if protocol.is_foreign_event(event_type) {
        return Some(ConversationEvent::ProtocolMismatch {
            event_type: event_type.to_owned(),
            expected: protocol.as_str(),
        });
    }

    let event = match event_type {
        "session.updated" => ConversationEvent::SessionReady,
        "response.created" => ConversationEvent::ResponseStarted {
            response_id: str_at(&value, "/response/id"),
        },
        t if t == protocol.audio_delta_event() => {
            let Some(payload) = str_at(&value, "/delta") else {
                tracing::warn!(event_type = t, "Audio delta without payload");
                return None;
            };
            ConversationEvent::AudioDelta {
                payload,
                response_id: str_at(&value, "/response_id"),
            }
        }
        "response.done" => ConversationEvent::ResponseDone {
            response_id: str_at(&value, "/response/id"),
            status: str_at(&value, "/response/status"),
        },
        "input_audio_buffer.speech_started" => ConversationEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => ConversationEvent::SpeechStopped,
        "error" => ConversationEvent::Error {
            code: str_at(&value, "/error/code"),
            message: str_at(&value, "/error/message")
                .unwrap_or_else(|| "unknown realtime error".into()),
        },
        other => ConversationEvent::Other {
            event_type: other.to_owned(),
        },
    };
    Some(event)
}

// ── Tests ──────────────────────────────────────────────────────────
