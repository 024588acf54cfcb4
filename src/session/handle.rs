use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use super::{SessionCommand, SessionMessage};
use crate::engine::{EngineEventReceiver, EngineEventSender, EngineState};
use crate::media::{MediaDescriptor, StreamSource};
use crate::queue::PlayMode;
use crate::state_machine::{PlaybackContext, TransitionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    Forward,
    Backward,
}

/// Point-in-time view of a session, for diagnostics
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub context: PlaybackContext,
    /// Recent transitions, oldest first
    pub history: Vec<TransitionRecord>,
    pub engine: EngineState,
    pub current: Option<MediaDescriptor>,
    pub seek_target: Option<Duration>,
    /// Id of the queue's current item
    pub queue_current: Option<String>,
}

/// Cheap, cloneable control surface of a running session
///
/// Every command is queued and returns immediately; the outcome shows up
/// on the state and event subscriptions.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMessage>,
    state: watch::Receiver<PlaybackContext>,
    events: EngineEventSender,
}

impl SessionHandle {
    pub(super) fn new(
        tx: mpsc::UnboundedSender<SessionMessage>,
        state: watch::Receiver<PlaybackContext>,
        events: EngineEventSender,
    ) -> Self {
        Self { tx, state, events }
    }

    fn send(&self, command: SessionCommand) {
        if self.tx.send(SessionMessage::Command(command)).is_err() {
            tracing::debug!("Playback session is gone, command dropped");
        }
    }

    pub fn load(&self, media: MediaDescriptor, autoplay: bool) {
        self.send(SessionCommand::Load {
            media: Box::new(media),
            autoplay,
        });
    }

    /// Jump to queue position `index` and play it
    pub fn play_queue_from(&self, index: usize) {
        self.send(SessionCommand::PlayQueueFrom(index));
    }

    pub fn play(&self) {
        self.send(SessionCommand::Play);
    }

    pub fn pause(&self) {
        self.send(SessionCommand::Pause);
    }

    pub fn toggle(&self) {
        self.send(SessionCommand::Toggle);
    }

    pub fn stop(&self) {
        self.send(SessionCommand::Stop);
    }

    pub fn seek(&self, target: Duration) {
        self.send(SessionCommand::Seek(target));
    }

    /// Seek relative to the pending target, or the position when none
    pub fn seek_by(&self, direction: SeekDirection, offset: Duration) {
        self.send(SessionCommand::SeekBy { direction, offset });
    }

    pub fn next(&self) {
        self.send(SessionCommand::Next);
    }

    pub fn previous(&self) {
        self.send(SessionCommand::Previous);
    }

    pub fn preload(&self, source: StreamSource) {
        self.send(SessionCommand::Preload(source));
    }

    pub fn cancel_preload(&self) {
        self.send(SessionCommand::CancelPreload);
    }

    pub fn set_volume(&self, volume: f32) {
        self.send(SessionCommand::SetVolume(volume));
    }

    pub fn set_muted(&self, muted: bool) {
        self.send(SessionCommand::SetMuted(muted));
    }

    pub fn set_play_mode(&self, mode: PlayMode) {
        self.send(SessionCommand::SetPlayMode(mode));
    }

    /// The app is visible again; reconcile with the hardware
    pub fn enter_foreground(&self) {
        self.send(SessionCommand::EnterForeground);
    }

    pub fn shutdown(&self) {
        self.send(SessionCommand::Shutdown);
    }

    /// Latest playback context
    pub fn state(&self) -> PlaybackContext {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackContext> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> EngineEventReceiver {
        self.events.subscribe()
    }

    /// `None` once the session has shut down
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(reply));
        rx.await.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
