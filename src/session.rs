//! Playback session
//!
//! One tokio task owns the state machine, the heartbeat, the engine, the
//! seek coordinator and the OS bridge. Callers talk to it through a
//! `SessionHandle`; timers, async lookups, backend events and OS transport
//! actions all arrive as messages on the same loop, so no two handlers ever
//! run at once.

mod handle;
pub mod timers;

pub use handle::{SeekDirection, SessionHandle, SessionSnapshot};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bridge::{MediaAction, NowPlayingSurface, OsSessionBridge};
use crate::engine::{
    BackendEventReceiver, EngineEvent, EngineMessage, LoadRequest, MediaBackend, MediaEngine,
    Prefetcher, backend_event_channel,
};
use crate::error::PlaybackError;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
use crate::media::{MediaCategory, MediaDescriptor, StreamSource};
use crate::queue::{PlayMode, QueueProvider};
use crate::remote::CacheStatusSource;
use crate::resume::ResumeStore;
use crate::seek::{SeekCoordinator, SeekEnv, SeekMessage};
use crate::settings::Settings;
use crate::state_machine::{PlaybackState, PlaybackStateMachine, TransitionOptions};
use timers::{Mailbox, Scheduler};

/// Everything a session is assembled from
pub struct SessionParts {
    pub backend: Box<dyn MediaBackend>,
    pub surface: Box<dyn NowPlayingSurface>,
    pub queue: Box<dyn QueueProvider>,
    pub cache: Arc<dyn CacheStatusSource>,
    pub prefetcher: Arc<dyn Prefetcher>,
    pub resume: Arc<dyn ResumeStore>,
    pub settings: Settings,
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Load {
        media: Box<MediaDescriptor>,
        autoplay: bool,
    },
    PlayQueueFrom(usize),
    Play,
    Pause,
    Toggle,
    Stop,
    Seek(Duration),
    SeekBy {
        direction: SeekDirection,
        offset: Duration,
    },
    Next,
    Previous,
    Preload(StreamSource),
    CancelPreload,
    SetVolume(f32),
    SetMuted(bool),
    SetPlayMode(PlayMode),
    EnterForeground,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SessionSlot {
    Heartbeat,
    Persist,
    ResumeLookup,
}

#[derive(Debug)]
pub(crate) enum SessionTimer {
    HeartbeatTick,
    Persist,
    /// Stored offset for a long-form load, tagged with the load request
    ResumeLoaded {
        request: u64,
        media: Box<MediaDescriptor>,
        autoplay: bool,
        offset: Option<Duration>,
    },
}

#[derive(Debug)]
pub(crate) enum SessionMessage {
    Command(SessionCommand),
    Engine(EngineMessage),
    Seek(SeekMessage),
    Action(MediaAction),
    Timer(SessionTimer),
}

pub struct PlaybackSession {
    settings: Settings,
    machine: PlaybackStateMachine,
    heartbeat: HeartbeatMonitor,
    engine: MediaEngine,
    seek: SeekCoordinator,
    bridge: OsSessionBridge,
    queue: Box<dyn QueueProvider>,
    resume: Arc<dyn ResumeStore>,
    scheduler: Scheduler<SessionSlot, SessionTimer>,
    inbox: mpsc::UnboundedReceiver<SessionMessage>,
    backend_events: BackendEventReceiver,
    /// Media the session is working on, including across a stop
    current: Option<MediaDescriptor>,
    /// Bumped per load so late resume lookups can be told apart
    load_request: u64,
    /// Failed loads in a row, bounded by the queue length
    failures: usize,
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("state", &self.machine.state())
            .field("engine", &self.engine)
            .field("seek", &self.seek)
            .field("current", &self.current.as_ref().map(|m| &m.id))
            .finish_non_exhaustive()
    }
}

impl PlaybackSession {
    pub fn new(parts: SessionParts) -> (Self, SessionHandle) {
        let SessionParts {
            backend,
            surface,
            queue,
            cache,
            prefetcher,
            resume,
            settings,
        } = parts;

        let (tx, inbox) = mpsc::unbounded_channel();
        let (backend_tx, backend_events) = backend_event_channel();

        let engine = MediaEngine::new(
            backend,
            backend_tx,
            prefetcher,
            settings.engine.clone(),
            Mailbox::from_sender(tx.clone(), SessionMessage::Engine),
        );
        let seek = SeekCoordinator::new(
            settings.seek.clone(),
            cache,
            Mailbox::from_sender(tx.clone(), SessionMessage::Seek),
        );
        let bridge = OsSessionBridge::new(
            surface,
            settings.bridge.clone(),
            Mailbox::from_sender(tx.clone(), SessionMessage::Action),
        );

        let mut machine = PlaybackStateMachine::new();
        let (state_tx, state_rx) = watch::channel(machine.snapshot());
        machine.subscribe(move |ctx| {
            state_tx.send_replace(ctx.clone());
        });

        let handle = SessionHandle::new(tx.clone(), state_rx, engine.event_sender());
        let session = Self {
            heartbeat: HeartbeatMonitor::new(&settings.heartbeat),
            scheduler: Scheduler::new(Mailbox::from_sender(tx, SessionMessage::Timer)),
            settings,
            machine,
            engine,
            seek,
            bridge,
            queue,
            resume,
            inbox,
            backend_events,
            current: None,
            load_request: 0,
            failures: 0,
        };
        (session, handle)
    }

    /// Build the session and run it on its own task
    pub fn spawn(parts: SessionParts) -> (SessionHandle, JoinHandle<()>) {
        let (session, handle) = Self::new(parts);
        (handle, tokio::spawn(session.run()))
    }

    pub async fn run(mut self) {
        tracing::info!("Playback session started");
        self.schedule_heartbeat();

        loop {
            tokio::select! {
                Some(event) = self.backend_events.recv() => self.engine.on_backend_event(event),
                Some(msg) = self.inbox.recv() => match msg {
                    SessionMessage::Command(SessionCommand::Shutdown) => {
                        self.shutdown().await;
                        break;
                    }
                    msg => self.on_message(msg),
                },
                else => break,
            }
            self.pump();
        }

        tracing::info!("Playback session ended");
    }

    /// Handle every engine event produced by the last message
    fn pump(&mut self) {
        while let Some(event) = self.engine.next_event() {
            self.on_engine_event(event);
        }
    }

    fn on_message(&mut self, msg: SessionMessage) {
        match msg {
            SessionMessage::Command(command) => self.on_command(command),
            SessionMessage::Engine(msg) => self.engine.on_message(msg),
            SessionMessage::Seek(msg) => {
                let mut env = SeekEnv {
                    engine: &mut self.engine,
                    machine: &mut self.machine,
                };
                self.seek.on_message(&mut env, msg);
            }
            SessionMessage::Action(action) => self.on_action(action),
            SessionMessage::Timer(timer) => self.on_timer(timer),
        }
    }

    fn on_command(&mut self, command: SessionCommand) {
        tracing::debug!("Session command {:?}", command);
        match command {
            SessionCommand::Load { media, autoplay } => self.load(*media, autoplay),
            SessionCommand::PlayQueueFrom(index) => match self.queue.jump_to(index) {
                Some(media) => self.play_item(media),
                None => tracing::warn!("Queue has no item {}", index),
            },
            SessionCommand::Play => self.play(),
            SessionCommand::Pause => self.pause(),
            SessionCommand::Toggle => self.toggle(),
            SessionCommand::Stop => self.stop(),
            SessionCommand::Seek(target) => self.seek_to(target),
            SessionCommand::SeekBy { direction, offset } => self.seek_by(direction, offset),
            SessionCommand::Next => self.next(),
            SessionCommand::Previous => self.previous(),
            SessionCommand::Preload(source) => self.engine.preload(source),
            SessionCommand::CancelPreload => self.engine.cancel_preload(),
            SessionCommand::SetVolume(volume) => self.engine.set_volume(volume),
            SessionCommand::SetMuted(muted) => self.engine.set_muted(muted),
            SessionCommand::SetPlayMode(mode) => {
                self.queue.set_play_mode(mode);
                if self.engine.state().is_playing {
                    self.preload_next();
                }
            }
            SessionCommand::EnterForeground => self.enter_foreground(),
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // handled by the run loop
            SessionCommand::Shutdown => {}
        }
    }

    fn on_action(&mut self, action: MediaAction) {
        tracing::debug!("OS transport action {:?}", action);
        match action {
            MediaAction::Play => self.play(),
            MediaAction::Pause => self.pause(),
            MediaAction::Toggle => self.toggle(),
            MediaAction::Stop => self.stop(),
            MediaAction::Next => self.next(),
            MediaAction::Previous => self.previous(),
            MediaAction::SeekTo(target) => self.seek_to(target),
            MediaAction::SeekBy { direction, offset } => self.seek_by(direction, offset),
            MediaAction::SetVolume(volume) => self.engine.set_volume(volume),
        }
    }

    fn on_timer(&mut self, timer: SessionTimer) {
        match timer {
            SessionTimer::HeartbeatTick => {
                let verdict = self.heartbeat.on_tick(self.machine.state(), Instant::now());
                self.apply_verdict(verdict);
                self.schedule_heartbeat();
            }
            SessionTimer::Persist => {
                if self.machine.state() == PlaybackState::Playing {
                    self.persist_offset();
                    self.schedule_persist();
                }
            }
            SessionTimer::ResumeLoaded {
                request,
                media,
                autoplay,
                offset,
            } => {
                if request != self.load_request {
                    tracing::debug!("Dropping resume offset of superseded load {}", media.id);
                    return;
                }
                self.start_load(*media, autoplay, offset);
            }
        }
    }

    // ============ Loading ============

    fn load(&mut self, media: MediaDescriptor, autoplay: bool) {
        if self.seek.is_guarded() && self.current.as_ref().is_some_and(|c| c.id == media.id) {
            tracing::debug!("Reload of {} right after a seek, ignored", media.id);
            return;
        }

        self.load_request += 1;
        self.scheduler.cancel(&SessionSlot::ResumeLookup);

        if media.category() == MediaCategory::LongForm && media.resume_offset.is_none() {
            let store = self.resume.clone();
            let request = self.load_request;
            self.scheduler.spawn(SessionSlot::ResumeLookup, async move {
                let offset = match store.load_offset(&media.id).await {
                    Ok(offset) => offset,
                    Err(e) => {
                        tracing::warn!("Resume offset lookup for {} failed: {:#}", media.id, e);
                        None
                    }
                };
                SessionTimer::ResumeLoaded {
                    request,
                    media: Box::new(media),
                    autoplay,
                    offset,
                }
            });
            return;
        }

        self.start_load(media, autoplay, None);
    }

    fn start_load(&mut self, media: MediaDescriptor, autoplay: bool, stored: Option<Duration>) {
        self.seek.cancel();
        self.heartbeat.disarm();
        self.scheduler.cancel(&SessionSlot::Persist);

        let start_at = media
            .resume_offset
            .or(stored)
            .filter(|offset| *offset >= self.settings.resume.min_offset)
            .unwrap_or_default();
        let same_source = self.engine.has_handle()
            && self.engine.state().current_src.as_ref() == Some(&media.source);

        if !same_source {
            // the outgoing item keeps its place
            self.persist_offset();
            tracing::info!("Loading {} \"{}\" from {:?}", media.id, media.title, start_at);
            self.bridge.set_media(&media);
            self.machine
                .transition(PlaybackState::Loading, TransitionOptions::default());
        }

        self.engine.load_with(LoadRequest {
            source: media.source.clone(),
            autoplay,
            start_at,
            duration_hint: media.duration,
        });
        self.current = Some(media);
    }

    /// Start `media`, replaying the live handle when it is already loaded
    fn play_item(&mut self, media: MediaDescriptor) {
        let live = self.engine.is_acquired()
            && self.engine.state().current_src.as_ref() == Some(&media.source);
        if live {
            let mut env = SeekEnv {
                engine: &mut self.engine,
                machine: &mut self.machine,
            };
            if self.seek.restart(&mut env) {
                return;
            }
        }
        self.load(media, true);
    }

    // ============ Transport ============

    fn play(&mut self) {
        let mut env = SeekEnv {
            engine: &mut self.engine,
            machine: &mut self.machine,
        };
        if self.seek.user_intent(&mut env, true) {
            return;
        }

        match self.machine.state() {
            PlaybackState::Idle | PlaybackState::Error => {
                if self.engine.has_handle() {
                    let position = self.engine.state().current_time;
                    tracing::info!("Reloading at {:?} to recover", position);
                    self.machine
                        .transition(PlaybackState::Loading, TransitionOptions::default());
                    self.engine.reload(position, true);
                    return;
                }
                match self.current.clone().or_else(|| self.queue.current()) {
                    Some(media) => self.load(media, true),
                    None => tracing::debug!("Nothing to play"),
                }
            }
            PlaybackState::Playing => {}
            _ => self.engine.play(),
        }
    }

    fn pause(&mut self) {
        let mut env = SeekEnv {
            engine: &mut self.engine,
            machine: &mut self.machine,
        };
        if self.seek.user_intent(&mut env, false) {
            return;
        }
        self.engine.pause();
    }

    fn toggle(&mut self) {
        let playing = match self.seek.current() {
            Some(op) => op.was_playing,
            None => self.engine.state().is_playing || self.engine.will_autoplay(),
        };
        if playing {
            self.pause();
        } else {
            self.play();
        }
    }

    fn stop(&mut self) {
        self.seek.cancel();
        self.heartbeat.disarm();
        self.load_request += 1;
        self.scheduler.cancel(&SessionSlot::ResumeLookup);
        self.scheduler.cancel(&SessionSlot::Persist);
        self.persist_offset();
        self.engine.cancel_preload();

        if self.engine.has_handle() {
            self.engine.stop();
            return;
        }
        if self.machine.state() != PlaybackState::Idle {
            self.machine
                .transition(PlaybackState::Idle, TransitionOptions::default());
        }
        self.bridge.clear();
    }

    fn seek_to(&mut self, target: Duration) {
        let mut env = SeekEnv {
            engine: &mut self.engine,
            machine: &mut self.machine,
        };
        self.seek.request(&mut env, self.current.as_ref(), target);
    }

    fn seek_by(&mut self, direction: SeekDirection, offset: Duration) {
        let from = self
            .seek
            .target()
            .unwrap_or(self.engine.state().current_time);
        let target = match direction {
            SeekDirection::Forward => from + offset,
            SeekDirection::Backward => from.saturating_sub(offset),
        };
        self.seek_to(target);
    }

    fn next(&mut self) {
        match self.queue.advance() {
            Some(media) => self.play_item(media),
            None => tracing::debug!("No next item in the queue"),
        }
    }

    fn previous(&mut self) {
        match self.queue.retreat() {
            Some(media) => self.play_item(media),
            None => tracing::debug!("No previous item in the queue"),
        }
    }

    fn preload_next(&mut self) {
        if self.queue.play_mode() == PlayMode::LoopOne {
            self.engine.cancel_preload();
            return;
        }
        match self.queue.peek_next() {
            Some(next) if self.engine.state().current_src.as_ref() != Some(&next.source) => {
                self.engine.preload(next.source)
            }
            _ => self.engine.cancel_preload(),
        }
    }

    /// App returned to the foreground; trust the hardware over our state
    fn enter_foreground(&mut self) {
        let Some(playing) = self.engine.actual_is_playing() else {
            return;
        };
        let position = self
            .engine
            .actual_position()
            .unwrap_or(self.engine.state().current_time);
        let state = self.machine.state();

        if !self.seek.is_active() {
            if playing && state != PlaybackState::Playing {
                tracing::info!("Hardware is playing while state was {}", state);
                self.machine
                    .force_transition(PlaybackState::Playing, TransitionOptions::default());
            } else if !playing && matches!(state, PlaybackState::Playing | PlaybackState::Buffering)
            {
                tracing::info!("Hardware is paused while state was {}", state);
                self.machine
                    .force_transition(PlaybackState::Ready, TransitionOptions::default());
            }
        }

        if playing {
            self.heartbeat.reset(position, Instant::now());
        }
        self.bridge.resync(position, playing);
    }

    // ============ Engine events ============

    fn on_engine_event(&mut self, event: EngineEvent) {
        self.bridge.on_engine_event(&event);

        let consumed = {
            let mut env = SeekEnv {
                engine: &mut self.engine,
                machine: &mut self.machine,
            };
            self.seek.on_engine_event(&mut env, &event)
        };
        if let EngineEvent::Seek { position } = &event {
            self.heartbeat.reset(*position, Instant::now());
        }
        if consumed {
            return;
        }

        match event {
            EngineEvent::Load { duration } => {
                tracing::debug!("Stream acquired, duration {:?}", duration);
                let hold = !self.engine.will_autoplay() || self.seek.target().is_some();
                if self.machine.state() == PlaybackState::Loading && hold {
                    self.machine
                        .transition(PlaybackState::Ready, TransitionOptions::default());
                }
                self.resume_deferred_seek();
            }
            EngineEvent::Play => {
                self.failures = 0;
                if self.machine.state() != PlaybackState::Playing {
                    self.machine
                        .transition(PlaybackState::Playing, TransitionOptions::default());
                }
                self.heartbeat
                    .reset(self.engine.state().current_time, Instant::now());
                self.resume_deferred_seek();
                self.preload_next();
                self.schedule_persist();
            }
            EngineEvent::Pause { commanded } => {
                let verdict = self
                    .heartbeat
                    .on_native_pause(self.machine.state(), commanded);
                self.apply_verdict(verdict);
                if matches!(
                    self.machine.state(),
                    PlaybackState::Playing | PlaybackState::Buffering
                ) {
                    self.machine
                        .transition(PlaybackState::Ready, TransitionOptions::default());
                }
                self.scheduler.cancel(&SessionSlot::Persist);
                self.persist_offset();
            }
            EngineEvent::Stop => {
                self.heartbeat.disarm();
                self.scheduler.cancel(&SessionSlot::Persist);
                if !matches!(self.machine.state(), PlaybackState::Idle | PlaybackState::Error) {
                    self.machine
                        .transition(PlaybackState::Idle, TransitionOptions::default());
                }
            }
            EngineEvent::End => self.on_end(),
            EngineEvent::LoadError(error) | EngineEvent::PlayError(error) => self.on_failure(error),
            EngineEvent::TimeUpdate { position } => {
                let verdict =
                    self.heartbeat
                        .on_sample(self.machine.state(), position, Instant::now());
                self.apply_verdict(verdict);
            }
            EngineEvent::Seek { .. } | EngineEvent::Volume { .. } => {}
        }
    }

    fn resume_deferred_seek(&mut self) {
        let mut env = SeekEnv {
            engine: &mut self.engine,
            machine: &mut self.machine,
        };
        self.seek.resume_deferred(&mut env, self.current.as_ref());
    }

    fn on_end(&mut self) {
        self.heartbeat.disarm();
        self.scheduler.cancel(&SessionSlot::Persist);

        if let Some(media) = self.current.as_mut() {
            if media.category() == MediaCategory::LongForm {
                media.resume_offset = None;
                let store = self.resume.clone();
                let id = media.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.clear_offset(&id).await {
                        tracing::warn!("Failed to clear resume offset of {}: {:#}", id, e);
                    }
                });
            }
        }

        if self.queue.play_mode() == PlayMode::LoopOne {
            let mut env = SeekEnv {
                engine: &mut self.engine,
                machine: &mut self.machine,
            };
            if self.seek.restart(&mut env) {
                tracing::info!("Repeating the current item");
                return;
            }
        }

        match self.queue.advance() {
            Some(next) => {
                tracing::info!("Advancing to {}", next.id);
                self.play_item(next);
            }
            None => {
                tracing::info!("Reached the end of the queue");
                self.engine.stop();
            }
        }
    }

    fn on_failure(&mut self, error: PlaybackError) {
        self.seek.cancel();
        self.heartbeat.disarm();
        self.scheduler.cancel(&SessionSlot::Persist);
        self.failures += 1;

        tracing::error!("Playback failed: {}", error);
        let advance = error.allows_auto_advance()
            && self.current.as_ref().is_some_and(|m| m.is_track());
        self.machine
            .transition(PlaybackState::Error, TransitionOptions::error(error));
        self.log_history();

        // long-form items stay in Error with their place kept; play retries
        if !advance {
            return;
        }
        if self.failures >= self.queue.len().max(1) {
            tracing::warn!("{} items failed in a row, giving up", self.failures);
            self.clear_playback();
            return;
        }
        match self.queue.advance() {
            Some(next) => {
                tracing::info!("Skipping to {} after the failure", next.id);
                self.load(next, true);
            }
            None => self.clear_playback(),
        }
    }

    fn clear_playback(&mut self) {
        self.failures = 0;
        self.current = None;
        self.engine.cancel_preload();
        self.machine
            .transition(PlaybackState::Idle, TransitionOptions::default());
        self.bridge.clear();
    }

    fn apply_verdict(&mut self, verdict: HeartbeatVerdict) {
        match verdict {
            HeartbeatVerdict::Healthy => {}
            HeartbeatVerdict::UnexpectedStop => {
                tracing::info!("Reconciling with a backend that paused on its own");
                self.machine
                    .transition(PlaybackState::Ready, TransitionOptions::default());
            }
            HeartbeatVerdict::Stalled => {
                if self.seek.is_guarded() {
                    self.heartbeat
                        .reset(self.engine.state().current_time, Instant::now());
                    return;
                }
                self.machine
                    .transition(PlaybackState::Buffering, TransitionOptions::default());
            }
            HeartbeatVerdict::Recovered => {
                if self.machine.state() == PlaybackState::Buffering {
                    self.machine
                        .transition(PlaybackState::Playing, TransitionOptions::default());
                }
            }
            HeartbeatVerdict::ConnectionLost { stalled_for } => {
                self.seek.cancel();
                self.scheduler.cancel(&SessionSlot::Persist);
                self.persist_offset();
                self.machine.transition(
                    PlaybackState::Error,
                    TransitionOptions::error(PlaybackError::ConnectionLost(stalled_for)),
                );
                self.log_history();
                self.engine.stop();
            }
        }
    }

    fn log_history(&self) {
        tracing::debug!("Recent playback transitions:");
        for record in self.machine.history() {
            tracing::debug!(
                "  {} -> {}{} {:?}",
                record.from,
                record.to,
                if record.forced { " (forced)" } else { "" },
                record.outcome
            );
        }
    }

    // ============ Resume offsets ============

    fn offset_to_persist(&self) -> Option<(String, Duration)> {
        let media = self
            .current
            .as_ref()
            .filter(|m| m.category() == MediaCategory::LongForm)?;
        if !self.engine.is_acquired() {
            return None;
        }
        let position = self
            .engine
            .actual_position()
            .unwrap_or(self.engine.state().current_time);
        (position >= self.settings.resume.min_offset).then(|| (media.id.clone(), position))
    }

    fn persist_offset(&mut self) {
        let Some((id, position)) = self.offset_to_persist() else {
            return;
        };
        if let Some(media) = self.current.as_mut() {
            media.resume_offset = Some(position);
        }
        tracing::debug!("Saving resume offset {:?} for {}", position, id);
        let store = self.resume.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_offset(&id, position).await {
                tracing::warn!("Failed to save resume offset of {}: {:#}", id, e);
            }
        });
    }

    fn schedule_persist(&mut self) {
        let long_form = self
            .current
            .as_ref()
            .is_some_and(|m| m.category() == MediaCategory::LongForm);
        if long_form && !self.scheduler.is_pending(&SessionSlot::Persist) {
            self.scheduler.schedule(
                SessionSlot::Persist,
                self.settings.resume.persist_interval,
                SessionTimer::Persist,
            );
        }
    }

    fn schedule_heartbeat(&mut self) {
        self.scheduler.schedule(
            SessionSlot::Heartbeat,
            self.settings.heartbeat.tick_interval,
            SessionTimer::HeartbeatTick,
        );
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            context: self.machine.snapshot(),
            history: self.machine.history().cloned().collect(),
            engine: self.engine.state().clone(),
            current: self.current.clone(),
            seek_target: self.seek.target(),
            queue_current: self.queue.current().map(|m| m.id),
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down playback session");
        self.scheduler.cancel_all();
        self.seek.cancel();
        self.heartbeat.disarm();

        if let Some((id, position)) = self.offset_to_persist() {
            if let Err(e) = self.resume.save_offset(&id, position).await {
                tracing::warn!("Failed to save resume offset of {}: {:#}", id, e);
            }
        }

        self.engine.shutdown();
        self.pump();
        self.bridge.clear();
        if self.machine.state() != PlaybackState::Idle {
            self.machine
                .transition(PlaybackState::Idle, TransitionOptions::default());
        }
    }
}
