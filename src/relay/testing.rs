//! In-memory doubles for both sides of a call.

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::error::{RelayError, RelayResult};
use super::realtime::{Conversation, ConversationConnector, Intent};
use super::telephony::{
    MediaPayload, StartMeta, TelephonyCommand, TelephonyEvent, TelephonySink, TelephonyStream,
};
use super::ConversationEvent;

// ── Conversation side ──────────────────────────────────────────────

/// Records every intent with the (paused-clock) instant it was sent.
#[derive(Default)]
pub(crate) struct RecordingConversation {
    log: Mutex<Vec<(Instant, Intent)>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingConversation {
    pub fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn intents(&self) -> Vec<Intent> {
        self.log.lock().iter().map(|(_, i)| i.clone()).collect()
    }

    pub fn timed_intents(&self) -> Vec<(Instant, Intent)> {
        self.log.lock().clone()
    }

    /// Intents other than audio appends, in order.
    pub fn control_intents(&self) -> Vec<Intent> {
        self.intents()
            .into_iter()
            .filter(|i| !matches!(i, Intent::AppendAudio(_)))
            .collect()
    }

    pub fn appended(&self) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(_, i)| matches!(i, Intent::AppendAudio(_)))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Conversation for RecordingConversation {
    async fn send(&self, intent: Intent) -> RelayResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::ConversationSend("recording conversation is failing".into()));
        }
        self.log.lock().push((Instant::now(), intent));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out one pre-built conversation, or fails the handshake.
pub(crate) struct ScriptedConnector {
    pub conversation: Arc<RecordingConversation>,
    events: Mutex<Option<mpsc::Receiver<ConversationEvent>>>,
    handshake_error: Mutex<Option<RelayError>>,
}

impl ScriptedConnector {
    pub fn new() -> (Self, mpsc::Sender<ConversationEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let connector = Self {
            conversation: Arc::new(RecordingConversation::default()),
            events: Mutex::new(Some(rx)),
            handshake_error: Mutex::new(None),
        };
        (connector, tx)
    }

    pub fn failing(err: RelayError) -> Self {
        Self {
            conversation: Arc::new(RecordingConversation::default()),
            events: Mutex::new(None),
            handshake_error: Mutex::new(Some(err)),
        }
    }
}

#[async_trait]
impl ConversationConnector for ScriptedConnector {
    async fn connect(
        &self,
        _call_id: &str,
    ) -> RelayResult<(Arc<dyn Conversation>, mpsc::Receiver<ConversationEvent>)> {
        if let Some(err) = self.handshake_error.lock().take() {
            return Err(err);
        }
        let events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| RelayError::Connect("scripted connector already used".into()))?;
        let conversation: Arc<dyn Conversation> = self.conversation.clone();
        Ok((conversation, events))
    }
}

// ── Telephony side ─────────────────────────────────────────────────

pub(crate) struct ChannelStream {
    rx: mpsc::UnboundedReceiver<RelayResult<TelephonyEvent>>,
}

#[async_trait]
impl TelephonyStream for ChannelStream {
    async fn next_event(&mut self) -> Option<RelayResult<TelephonyEvent>> {
        self.rx.recv().await
    }
}

/// Telephony stream fed from a channel. Dropping the sender closes it.
pub(crate) fn telephony_link() -> (mpsc::UnboundedSender<RelayResult<TelephonyEvent>>, ChannelStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelStream { rx })
}

#[derive(Default)]
struct SinkLog {
    sent: Mutex<Vec<TelephonyCommand>>,
    closed: AtomicBool,
    failing: AtomicBool,
}

/// Clonable sink; clones share one log so tests can inspect after the run.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    inner: Arc<SinkLog>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<TelephonyCommand> {
        self.inner.sent.lock().clone()
    }

    pub fn media_count(&self) -> usize {
        self.sent()
            .iter()
            .filter(|c| matches!(c, TelephonyCommand::Media { .. }))
            .count()
    }

    pub fn clear_count(&self) -> usize {
        self.sent()
            .iter()
            .filter(|c| matches!(c, TelephonyCommand::Clear { .. }))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self) {
        self.inner.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TelephonySink for RecordingSink {
    async fn send(&mut self, command: TelephonyCommand) -> RelayResult<()> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(RelayError::TelephonySend("recording sink is failing".into()));
        }
        self.inner.sent.lock().push(command);
        Ok(())
    }

    async fn close(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

// ── Event builders ─────────────────────────────────────────────────

pub(crate) fn start_event(stream_sid: &str) -> TelephonyEvent {
    TelephonyEvent::Start {
        stream_sid: Some(stream_sid.to_owned()),
        start: StartMeta {
            stream_sid: Some(stream_sid.to_owned()),
            call_sid: Some("CA-test".to_owned()),
            ..StartMeta::default()
        },
    }
}

pub(crate) fn media_event(frame: &[u8]) -> TelephonyEvent {
    TelephonyEvent::Media {
        media: MediaPayload {
            payload: base64::engine::general_purpose::STANDARD.encode(frame),
            track: Some("inbound".to_owned()),
            chunk: None,
            timestamp: None,
        },
    }
}

/// 20 ms of μ-law silence.
pub(crate) fn silent_frame() -> Vec<u8> {
    vec![0xFF; 160]
}

/// 20 ms at loudness 8188.
pub(crate) fn loud_frame() -> Vec<u8> {
    vec![0xA7; 160]
}
