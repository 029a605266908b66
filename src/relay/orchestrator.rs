//! Per-call session: wires telephony and conversation together.
//!
//! [`run_call`] owns one call from the telephony `start` event to teardown:
//!
//! 1. wait for `start` and record the stream identifiers
//! 2. connect and configure the conversation (fatal on failure)
//! 3. apply the greeting policy
//! 4. run the inbound and outbound pumps until one of them ends
//! 5. stop the turn timer and close whichever side is still open
//!
//! Both pumps run inside one task under `tokio::select!`, so the first to
//! finish decides the [`SessionEnd`] and the other is dropped where it
//! stands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::barge_in::{BargeIn, BargeInArbiter};
use super::codec::AudioFrame;
use super::error::{RelayError, RelayResult};
use super::realtime::{Conversation, ConversationConnector, TurnDetection};
use super::registry::CallGuard;
use super::state::{ResponseEnd, SharedSpeakingState, SpeakingState};
use super::telephony::{TelephonyCommand, TelephonyEvent, TelephonySink, TelephonyStream};
use super::turn::TurnCoordinator;
use super::ConversationEvent;
use crate::config::{Config, DuplexMode, GreetingMode};

// ── Settings ───────────────────────────────────────────────────────

/// What, if anything, the assistant says before the caller does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GreetingPolicy {
    /// Wait for the caller to speak first.
    None,
    /// Let the model open the conversation on its own.
    Model,
    /// Have the model say this text verbatim.
    Scripted(String),
}

impl GreetingPolicy {
    fn instructions(&self) -> Option<String> {
        match self {
            Self::Scripted(text) => Some(format!("Greet the caller by saying exactly: {text}")),
            Self::None | Self::Model => None,
        }
    }
}

/// Per-call tunables, resolved once from [`Config`].
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub silence_debounce: Duration,
    pub loudness_gate: f64,
    pub sustained_voice_ms: u32,
    pub frame_ms: u32,
    pub duplex: DuplexMode,
    pub greeting: GreetingPolicy,
    pub turn_detection: TurnDetection,
}

impl CallSettings {
    pub fn from_config(config: &Config) -> Self {
        let relay = &config.relay;
        let greeting = match relay.greeting {
            GreetingMode::None => GreetingPolicy::None,
            GreetingMode::Model => GreetingPolicy::Model,
            GreetingMode::Scripted => {
                GreetingPolicy::Scripted(relay.greeting_text.clone().unwrap_or_default())
            }
        };
        Self {
            silence_debounce: Duration::from_millis(relay.silence_debounce_ms),
            loudness_gate: relay.loudness_gate,
            sustained_voice_ms: relay.sustained_voice_ms,
            frame_ms: relay.frame_ms,
            duplex: relay.duplex,
            greeting,
            turn_detection: config.realtime.turn_detection,
        }
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ── Outcome ────────────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The provider sent `stop`.
    Stopped,
    /// The telephony socket closed or errored without `stop`.
    TelephonyDisconnected,
    /// The conversation event stream ended.
    ConversationClosed,
    /// A send failed or the upstream spoke the wrong protocol.
    Fatal(RelayError),
}

impl SessionEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::TelephonyDisconnected => "telephony_disconnected",
            Self::ConversationClosed => "conversation_closed",
            Self::Fatal(_) => "fatal",
        }
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub call_id: String,
    pub stream_sid: String,
    pub call_sid: Option<String>,
    pub end: SessionEnd,
    pub frames_in: u64,
    pub deltas_forwarded: u64,
    pub deltas_suppressed: u64,
    pub commits: u64,
    pub barge_ins: u64,
    pub duration: Duration,
}

// ── Entry point ────────────────────────────────────────────────────

/// Relay one call from `start` to teardown.
///
/// Returns `Err` only if the session was never established: the link closed
/// before `start`, or the conversation could not be connected. Once both
/// sides are up, the outcome is reported in [`SessionReport::end`].
pub async fn run_call<L, S>(
    mut link: L,
    mut sink: S,
    connector: &dyn ConversationConnector,
    settings: &CallSettings,
    guard: CallGuard,
) -> RelayResult<SessionReport>
where
    L: TelephonyStream,
    S: TelephonySink,
{
    let call_id = guard.call_id().to_owned();

    let (stream_sid, call_sid) = await_start(&mut link, &call_id).await?;
    guard.attach(&stream_sid, call_sid.as_deref());
    tracing::info!(
        call_id = %call_id,
        stream_sid = %stream_sid,
        call_sid = call_sid.as_deref().unwrap_or("-"),
        "Media stream started"
    );

    let (conversation, mut events) = match connector.connect(&call_id).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(call_id = %call_id, error = %e, "Conversation setup failed");
            sink.close().await;
            return Err(e);
        }
    };

    if settings.greeting != GreetingPolicy::None {
        if let Err(e) = conversation
            .request_response(settings.greeting.instructions())
            .await
        {
            tracing::error!(call_id = %call_id, error = %e, "Greeting request failed");
            conversation.close().await;
            sink.close().await;
            return Err(e);
        }
    }

    let started = Instant::now();
    let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
    let turn = TurnCoordinator::new(
        Arc::clone(&conversation),
        settings.silence_debounce,
        settings.turn_detection,
        &call_id,
        fault_tx,
    );
    let arbiter = match settings.duplex {
        DuplexMode::Strict => Some(BargeInArbiter::new(
            settings.loudness_gate,
            settings.sustained_voice_ms,
        )),
        DuplexMode::Full => None,
    };

    let session = CallSession {
        call_id,
        stream_sid,
        sink: tokio::sync::Mutex::new(sink),
        conversation,
        state: SpeakingState::shared(),
        turn,
        arbiter,
        frame_ms: settings.frame_ms,
        frames_in: AtomicU64::new(0),
        deltas_forwarded: AtomicU64::new(0),
        deltas_suppressed: AtomicU64::new(0),
        barge_ins: AtomicU64::new(0),
    };

    let end = session.run(&mut link, &mut events, &mut fault_rx).await;
    session.turn.shutdown();
    session.close(&end).await;

    let report = session.into_report(end, call_sid, started.elapsed());
    tracing::info!(
        call_id = %report.call_id,
        stream_sid = %report.stream_sid,
        end = report.end.as_str(),
        frames_in = report.frames_in,
        deltas_forwarded = report.deltas_forwarded,
        deltas_suppressed = report.deltas_suppressed,
        commits = report.commits,
        barge_ins = report.barge_ins,
        duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
        "Call session ended"
    );
    Ok(report)
}

/// Read telephony events until `start` names the stream.
async fn await_start<L: TelephonyStream>(
    link: &mut L,
    call_id: &str,
) -> RelayResult<(String, Option<String>)> {
    loop {
        match link.next_event().await {
            Some(Ok(TelephonyEvent::Start { stream_sid, start })) => {
                match start.stream_sid.or(stream_sid) {
                    Some(sid) => return Ok((sid, start.call_sid)),
                    None => tracing::warn!(call_id = %call_id, "Start event without streamSid"),
                }
            }
            Some(Ok(TelephonyEvent::Stop)) => {
                return Err(RelayError::TelephonyClosed("stop received before start".into()));
            }
            Some(Ok(event)) => {
                tracing::debug!(call_id = %call_id, event_type = event.kind(), "Event before start");
            }
            Some(Err(e)) if !e.is_fatal() => {
                tracing::warn!(call_id = %call_id, error = %e, "Skipping malformed telephony event");
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(RelayError::TelephonyClosed("stream closed before start".into()));
            }
        }
    }
}

// ── Session ────────────────────────────────────────────────────────

struct CallSession<S> {
    call_id: String,
    stream_sid: String,
    sink: tokio::sync::Mutex<S>,
    conversation: Arc<dyn Conversation>,
    state: SharedSpeakingState,
    turn: TurnCoordinator,
    arbiter: Option<BargeInArbiter>,
    frame_ms: u32,
    frames_in: AtomicU64,
    deltas_forwarded: AtomicU64,
    deltas_suppressed: AtomicU64,
    barge_ins: AtomicU64,
}

impl<S: TelephonySink> CallSession<S> {
    async fn run<L: TelephonyStream>(
        &self,
        link: &mut L,
        events: &mut mpsc::Receiver<ConversationEvent>,
        faults: &mut mpsc::UnboundedReceiver<RelayError>,
    ) -> SessionEnd {
        tokio::select! {
            end = self.inbound_pump(link) => end,
            end = self.outbound_pump(events) => end,
            Some(err) = faults.recv() => {
                tracing::error!(call_id = %self.call_id, error = %err, "Turn commit failed");
                SessionEnd::Fatal(err)
            }
        }
    }

    // ── Inbound: telephony → conversation ──

    async fn inbound_pump<L: TelephonyStream>(&self, link: &mut L) -> SessionEnd {
        let end = loop {
            match link.next_event().await {
                Some(Ok(TelephonyEvent::Media { media })) => {
                    if !media.is_inbound() {
                        continue;
                    }
                    if let Err(e) = self.on_media(media.payload).await {
                        tracing::error!(call_id = %self.call_id, error = %e, "Inbound relay failed");
                        return SessionEnd::Fatal(e);
                    }
                }
                Some(Ok(TelephonyEvent::Stop)) => {
                    tracing::info!(call_id = %self.call_id, "Telephony stop received");
                    break SessionEnd::Stopped;
                }
                Some(Ok(event)) => {
                    tracing::debug!(
                        call_id = %self.call_id,
                        event_type = event.kind(),
                        "Ignoring telephony event"
                    );
                }
                Some(Err(e)) if !e.is_fatal() => {
                    tracing::warn!(call_id = %self.call_id, error = %e, "Skipping malformed telephony event");
                }
                Some(Err(e)) => {
                    tracing::warn!(call_id = %self.call_id, error = %e, "Telephony stream failed");
                    break SessionEnd::TelephonyDisconnected;
                }
                None => {
                    tracing::info!(call_id = %self.call_id, "Telephony stream closed");
                    break SessionEnd::TelephonyDisconnected;
                }
            }
        };

        if let Err(e) = self.turn.finish().await {
            tracing::warn!(call_id = %self.call_id, error = %e, "Final turn commit failed");
        }
        end
    }

    async fn on_media(&self, payload: String) -> RelayResult<()> {
        let n = self.frames_in.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n.is_multiple_of(50) {
            tracing::debug!(call_id = %self.call_id, frame = n, "Relaying caller audio");
        }

        let frame = AudioFrame::new(payload, self.frame_ms);
        let loudness = match frame.loudness() {
            Ok(loudness) => loudness,
            Err(e) => {
                tracing::warn!(call_id = %self.call_id, error = %e, "Skipping malformed media frame");
                return Ok(());
            }
        };

        if let Some(arbiter) = &self.arbiter {
            let decision = {
                let mut state = self.state.lock();
                arbiter.evaluate(&mut state, loudness, frame.duration_ms())
            };
            if let BargeIn::Triggered { response_id } = decision {
                self.barge_in(response_id).await?;
            }
        }

        self.conversation.append_audio(&frame).await?;
        self.turn.on_audio_frame();
        Ok(())
    }

    async fn barge_in(&self, response_id: Option<String>) -> RelayResult<()> {
        self.barge_ins.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            call_id = %self.call_id,
            stream_sid = %self.stream_sid,
            response_id = response_id.as_deref().unwrap_or("-"),
            "Caller barged in, cancelling response"
        );
        self.conversation.cancel_response(response_id).await?;
        self.sink
            .lock()
            .await
            .send(TelephonyCommand::clear(&self.stream_sid))
            .await
    }

    // ── Outbound: conversation → telephony ──

    async fn outbound_pump(&self, events: &mut mpsc::Receiver<ConversationEvent>) -> SessionEnd {
        while let Some(event) = events.recv().await {
            match event {
                ConversationEvent::ResponseStarted { response_id } => {
                    tracing::debug!(
                        call_id = %self.call_id,
                        response_id = response_id.as_deref().unwrap_or("-"),
                        "Response started"
                    );
                    self.state.lock().begin_response(response_id);
                }
                ConversationEvent::AudioDelta { payload, .. } => {
                    let admitted = self.state.lock().admit_audio_delta();
                    if !admitted {
                        self.deltas_suppressed.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let command = TelephonyCommand::media(&self.stream_sid, payload);
                    if let Err(e) = self.sink.lock().await.send(command).await {
                        tracing::error!(call_id = %self.call_id, error = %e, "Outbound relay failed");
                        return SessionEnd::Fatal(e);
                    }
                    self.deltas_forwarded.fetch_add(1, Ordering::Relaxed);
                }
                ConversationEvent::ResponseDone {
                    response_id,
                    status,
                } => {
                    let ended = self.state.lock().finish_response(response_id.as_deref());
                    if ended == ResponseEnd::Stale {
                        tracing::debug!(
                            call_id = %self.call_id,
                            response_id = response_id.as_deref().unwrap_or("-"),
                            "Ignoring done for a superseded response"
                        );
                        continue;
                    }
                    let interrupted = ended == ResponseEnd::Interrupted;
                    tracing::debug!(
                        call_id = %self.call_id,
                        response_id = response_id.as_deref().unwrap_or("-"),
                        status = status.as_deref().unwrap_or("-"),
                        interrupted,
                        "Response done"
                    );
                    if !interrupted {
                        if let Err(e) = self.conversation.clear_input().await {
                            return SessionEnd::Fatal(e);
                        }
                    }
                }
                ConversationEvent::Error { code, message } => {
                    tracing::warn!(
                        call_id = %self.call_id,
                        code = code.as_deref().unwrap_or("-"),
                        message = %message,
                        "Realtime service reported an error"
                    );
                }
                ConversationEvent::ProtocolMismatch {
                    event_type,
                    expected,
                } => {
                    tracing::error!(
                        call_id = %self.call_id,
                        event_type = %event_type,
                        expected,
                        "Realtime protocol mismatch"
                    );
                    return SessionEnd::Fatal(RelayError::ProtocolMismatch {
                        event_type,
                        expected,
                    });
                }
                ConversationEvent::SpeechStarted | ConversationEvent::SpeechStopped => {
                    tracing::debug!(call_id = %self.call_id, "Upstream VAD event");
                }
                ConversationEvent::SessionReady | ConversationEvent::Other { .. } => {}
            }
        }

        tracing::info!(call_id = %self.call_id, "Conversation stream ended");
        SessionEnd::ConversationClosed
    }

    // ── Teardown ──

    /// Close what is still open. A side that ended the session is left alone.
    async fn close(&self, end: &SessionEnd) {
        if !matches!(end, SessionEnd::ConversationClosed) {
            self.conversation.close().await;
        }
        if !matches!(end, SessionEnd::TelephonyDisconnected) {
            self.sink.lock().await.close().await;
        }
    }

    fn into_report(self, end: SessionEnd, call_sid: Option<String>, duration: Duration) -> SessionReport {
        SessionReport {
            commits: self.turn.commits(),
            call_id: self.call_id,
            stream_sid: self.stream_sid,
            call_sid,
            end,
            frames_in: self.frames_in.into_inner(),
            deltas_forwarded: self.deltas_forwarded.into_inner(),
            deltas_suppressed: self.deltas_suppressed.into_inner(),
            barge_ins: self.barge_ins.into_inner(),
            duration,
        }
    }
}
