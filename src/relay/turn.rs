//! End-of-turn detection by debounce.
//!
//! Every inbound frame re-arms a single timer. When `window` passes with no
//! further frame the caller is considered done: the coordinator commits the
//! buffered input and asks for a reply. The slot holds at most one timer;
//! a generation counter makes a superseded timer that is already past its
//! sleep a no-op even if `abort` lost the race.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::{RelayError, RelayResult};
use super::realtime::{Conversation, TurnDetection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    CommitScheduled,
}

#[derive(Debug)]
struct TimerSlot {
    generation: u64,
    phase: TurnPhase,
    pending: Option<JoinHandle<()>>,
}

impl TimerSlot {
    /// Make every outstanding timer stale and stop the sleeping one.
    fn invalidate(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        self.phase = TurnPhase::Idle;
    }

    /// Called by a timer after its sleep. Only the current timer may commit.
    fn claim(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.phase != TurnPhase::CommitScheduled {
            return false;
        }
        self.phase = TurnPhase::Idle;
        // The claiming task must not be aborted mid-commit by a later frame.
        self.pending.take();
        true
    }
}

pub struct TurnCoordinator {
    conversation: Arc<dyn Conversation>,
    window: Duration,
    detection: TurnDetection,
    call_id: Arc<str>,
    slot: Arc<Mutex<TimerSlot>>,
    commits: Arc<AtomicU64>,
    faults: mpsc::UnboundedSender<RelayError>,
}

impl TurnCoordinator {
    /// `faults` receives send errors raised from timer tasks, which have no
    /// caller to return them to.
    pub fn new(
        conversation: Arc<dyn Conversation>,
        window: Duration,
        detection: TurnDetection,
        call_id: &str,
        faults: mpsc::UnboundedSender<RelayError>,
    ) -> Self {
        Self {
            conversation,
            window,
            detection,
            call_id: Arc::from(call_id),
            slot: Arc::new(Mutex::new(TimerSlot {
                generation: 0,
                phase: TurnPhase::Idle,
                pending: None,
            })),
            commits: Arc::new(AtomicU64::new(0)),
            faults,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.slot.lock().phase
    }

    /// Turns committed so far, by timer or by `finish`.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Caller audio arrived: push the end-of-turn deadline out by `window`.
    pub fn on_audio_frame(&self) {
        if self.detection == TurnDetection::ServerVad {
            return;
        }

        let mut slot = self.slot.lock();
        slot.invalidate();
        let generation = slot.generation;
        slot.phase = TurnPhase::CommitScheduled;
        slot.pending = Some(self.spawn_timer(generation));
    }

    fn spawn_timer(&self, generation: u64) -> JoinHandle<()> {
        let slot = Arc::clone(&self.slot);
        let conversation = Arc::clone(&self.conversation);
        let commits = Arc::clone(&self.commits);
        let faults = self.faults.clone();
        let call_id = Arc::clone(&self.call_id);
        let window = self.window;

        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if !slot.lock().claim(generation) {
                return;
            }
            tracing::debug!(call_id = %call_id, "Caller silent, committing turn");
            if let Err(e) = commit_and_respond(conversation.as_ref(), &commits).await {
                let _ = faults.send(e);
            }
        })
    }

    /// End of stream: drop any pending timer and commit right now.
    pub async fn finish(&self) -> RelayResult<()> {
        self.slot.lock().invalidate();
        tracing::debug!(call_id = %self.call_id, "Stream ended, committing final turn");
        commit_and_respond(self.conversation.as_ref(), &self.commits).await
    }

    /// Drop any pending timer without committing.
    pub fn shutdown(&self) {
        self.slot.lock().invalidate();
    }
}

impl Drop for TurnCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn commit_and_respond(conversation: &dyn Conversation, commits: &AtomicU64) -> RelayResult<()> {
    conversation.commit_turn().await?;
    commits.fetch_add(1, Ordering::Relaxed);
    conversation.request_response(None).await
}
