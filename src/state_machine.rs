//! Playback lifecycle state machine
//!
//! The machine is the single source of truth for what the session is doing.
//! It performs no I/O: every other component reads `PlaybackContext`
//! snapshots and asks for transitions, which are checked against a fixed
//! table. Anything not in the table is rejected and leaves the context as is.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::PlaybackError;

/// Number of transitions retained for diagnostics
pub const HISTORY_SIZE: usize = 20;

/// Playback lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    Idle,
    Loading,
    Ready,
    Playing,
    Seeking,
    Buffering,
    Error,
}

impl PlaybackState {
    pub const ALL: [PlaybackState; 7] = [
        PlaybackState::Idle,
        PlaybackState::Loading,
        PlaybackState::Ready,
        PlaybackState::Playing,
        PlaybackState::Seeking,
        PlaybackState::Buffering,
        PlaybackState::Error,
    ];

    /// Whether `self -> to` is an edge of the transition table
    pub fn can_transition_to(self, to: PlaybackState) -> bool {
        use PlaybackState::*;
        match self {
            Idle => matches!(to, Loading),
            Loading => matches!(to, Ready | Playing | Loading | Error | Idle),
            Ready => matches!(to, Playing | Loading | Idle | Seeking | Error),
            Playing => matches!(
                to,
                Playing | Ready | Seeking | Buffering | Loading | Error | Idle
            ),
            Seeking => matches!(to, Playing | Ready | Loading | Error | Idle),
            Buffering => matches!(to, Playing | Ready | Loading | Error | Idle),
            Error => matches!(to, Loading | Idle),
        }
    }

    /// Playback is underway or about to resume on its own
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PlaybackState::Playing | PlaybackState::Seeking | PlaybackState::Buffering
        )
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Idle => "IDLE",
            PlaybackState::Loading => "LOADING",
            PlaybackState::Ready => "READY",
            PlaybackState::Playing => "PLAYING",
            PlaybackState::Seeking => "SEEKING",
            PlaybackState::Buffering => "BUFFERING",
            PlaybackState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Snapshot of the playback lifecycle
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackContext {
    pub state: PlaybackState,
    pub previous_state: Option<PlaybackState>,
    /// Human readable reason, only set in `Error`
    pub error: Option<String>,
    /// `PlaybackError::code`, only set in `Error`
    pub error_code: Option<u16>,
    pub was_playing_before_seek: bool,
    pub last_transition_time: Instant,
    /// Requested position while seeking or buffering toward a seek target
    pub seek_target: Option<Duration>,
}

impl PlaybackContext {
    fn new() -> Self {
        Self {
            state: PlaybackState::Idle,
            previous_state: None,
            error: None,
            error_code: None,
            was_playing_before_seek: false,
            last_transition_time: Instant::now(),
            seek_target: None,
        }
    }
}

/// Extra data applied together with a transition
#[derive(Debug, Clone, Default)]
pub struct TransitionOptions {
    /// Reason when entering `Error`
    pub error: Option<PlaybackError>,
    /// Target to record on the context
    pub seek_target: Option<Duration>,
    /// Override for `was_playing_before_seek` when entering `Seeking`
    pub was_playing: Option<bool>,
}

impl TransitionOptions {
    pub fn error(error: PlaybackError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn seek_target(target: Duration) -> Self {
        Self {
            seek_target: Some(target),
            ..Default::default()
        }
    }
}

/// One attempted transition
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: PlaybackState,
    pub to: PlaybackState,
    pub at: Instant,
    pub forced: bool,
    pub outcome: Result<(), PlaybackError>,
}

pub type ListenerId = u64;

type Listener = Box<dyn FnMut(&PlaybackContext) + Send>;

/// Table-driven playback state machine
pub struct PlaybackStateMachine {
    context: PlaybackContext,
    history: VecDeque<TransitionRecord>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: ListenerId,
}

impl Default for PlaybackStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackStateMachine {
    pub fn new() -> Self {
        Self {
            context: PlaybackContext::new(),
            history: VecDeque::with_capacity(HISTORY_SIZE),
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.context.state
    }

    pub fn context(&self) -> &PlaybackContext {
        &self.context
    }

    pub fn snapshot(&self) -> PlaybackContext {
        self.context.clone()
    }

    /// Attempt a transition
    ///
    /// Returns `false` and leaves the context untouched when the edge is not
    /// in the table.
    pub fn transition(&mut self, to: PlaybackState, opts: TransitionOptions) -> bool {
        let from = self.context.state;
        if !from.can_transition_to(to) {
            tracing::warn!("Rejected playback transition {} -> {}", from, to);
            self.record(
                from,
                to,
                false,
                Err(PlaybackError::InvalidTransition { from, to }),
            );
            return false;
        }

        self.apply(to, opts);
        self.record(from, to, false, Ok(()));
        tracing::debug!("Playback state {} -> {}", from, to);
        self.notify();
        true
    }

    /// Move to `to` regardless of the table
    ///
    /// Only for resynchronising with the backend's ground truth.
    pub fn force_transition(&mut self, to: PlaybackState, opts: TransitionOptions) {
        let from = self.context.state;
        self.apply(to, opts);
        self.record(from, to, true, Ok(()));
        tracing::info!("Forced playback state {} -> {}", from, to);
        self.notify();
    }

    fn apply(&mut self, to: PlaybackState, opts: TransitionOptions) {
        let ctx = &mut self.context;
        let from = ctx.state;

        if to == PlaybackState::Seeking {
            ctx.was_playing_before_seek = opts.was_playing.unwrap_or(from.is_active());
        }

        if to == PlaybackState::Error {
            let error = opts
                .error
                .unwrap_or_else(|| PlaybackError::Play("unknown error".to_string()));
            ctx.error = Some(error.to_string());
            ctx.error_code = Some(error.code());
        } else if from == PlaybackState::Error {
            ctx.error = None;
            ctx.error_code = None;
        }

        ctx.seek_target = opts.seek_target;
        ctx.previous_state = Some(from);
        ctx.state = to;
        ctx.last_transition_time = Instant::now();
    }

    fn record(
        &mut self,
        from: PlaybackState,
        to: PlaybackState,
        forced: bool,
        outcome: Result<(), PlaybackError>,
    ) {
        if self.history.len() == HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            to,
            at: Instant::now(),
            forced,
            outcome,
        });
    }

    fn notify(&mut self) {
        let ctx = &self.context;
        for (_, listener) in self.listeners.iter_mut() {
            listener(ctx);
        }
    }

    /// Register a listener; it is called right away with the current context
    pub fn subscribe<F>(&mut self, mut listener: F) -> ListenerId
    where
        F: FnMut(&PlaybackContext) + Send + 'static,
    {
        listener(&self.context);
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    /// Last `HISTORY_SIZE` attempted transitions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }
}
