//! Seek policy
//!
//! Directly seekable media (tracks, audiobooks) are seeked right away. Podcast
//! episodes are cache-gated: the server may not hold the bytes at the target
//! yet, so the coordinator checks the cache status, verifies where playback
//! actually landed, and falls back to reloading or to polling the cache until
//! the target becomes reachable.
//!
//! Each request gets a fresh operation id. Every timer and async result
//! carries the id it was started under and is dropped if a newer request has
//! replaced it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::engine::{EngineEvent, MediaEngine};
use crate::error::{PlaybackError, Result};
use crate::media::MediaDescriptor;
use crate::remote::{CacheStatus, CacheStatusSource};
use crate::session::timers::{Mailbox, Scheduler};
use crate::settings::SeekSettings;
use crate::state_machine::{PlaybackState, PlaybackStateMachine, TransitionOptions};

/// How a seek is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekSize {
    /// Below the large-skip threshold; coalesced by the debounce
    FineScrub,
    /// Executed immediately
    LargeJump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Debouncing,
    QueryingCache,
    /// Waiting for the backend to confirm the seek
    AwaitSeeked,
    /// Seek issued on cache-gated media, verification timer pending
    Verifying { cached: bool },
    /// Waiting for the episode to become cached
    Polling { attempts: u32 },
    /// Fresh handle requested, waiting for it to load
    Reloading,
    /// Reloaded handle acquired, waiting for the seek to the target
    ReloadSeek,
}

/// The current seek request
#[derive(Debug, Clone)]
pub struct SeekOperation {
    pub id: u64,
    pub target: Duration,
    pub size: SeekSize,
    pub was_playing: bool,
    /// Set for cache-gated media
    episode_id: Option<String>,
    phase: Phase,
}

impl SeekOperation {
    pub fn is_cache_gated(&self) -> bool {
        self.episode_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeekSlot {
    Debounce,
    CacheQuery,
    Verify,
    Poll,
}

/// Timer and cache results routed back into the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum SeekMessage {
    Execute(u64),
    CacheStatus {
        op: u64,
        status: Result<CacheStatus>,
    },
    Verify(u64),
    Poll(u64),
    PollResult {
        op: u64,
        status: Result<CacheStatus>,
    },
}

impl SeekMessage {
    fn op(&self) -> u64 {
        match self {
            SeekMessage::Execute(op)
            | SeekMessage::Verify(op)
            | SeekMessage::Poll(op)
            | SeekMessage::CacheStatus { op, .. }
            | SeekMessage::PollResult { op, .. } => *op,
        }
    }
}

/// What the coordinator drives
pub struct SeekEnv<'a> {
    pub engine: &'a mut MediaEngine,
    pub machine: &'a mut PlaybackStateMachine,
}

pub struct SeekCoordinator {
    settings: SeekSettings,
    cache: Arc<dyn CacheStatusSource>,
    scheduler: Scheduler<SeekSlot, SeekMessage>,
    next_id: u64,
    current: Option<SeekOperation>,
    /// Seek requested before the stream was acquired: (target, was_playing)
    deferred: Option<(Duration, bool)>,
    /// Backend seeks not yet answered by a `Seek` event
    outstanding: u32,
    guard_until: Option<Instant>,
}

impl std::fmt::Debug for SeekCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeekCoordinator")
            .field("current", &self.current)
            .field("deferred", &self.deferred)
            .field("outstanding", &self.outstanding)
            .finish_non_exhaustive()
    }
}

impl SeekCoordinator {
    pub fn new(
        settings: SeekSettings,
        cache: Arc<dyn CacheStatusSource>,
        mailbox: Mailbox<SeekMessage>,
    ) -> Self {
        Self {
            settings,
            cache,
            scheduler: Scheduler::new(mailbox),
            next_id: 0,
            current: None,
            deferred: None,
            outstanding: 0,
            guard_until: None,
        }
    }

    pub fn current(&self) -> Option<&SeekOperation> {
        self.current.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Target of the active or deferred request
    pub fn target(&self) -> Option<Duration> {
        self.current
            .as_ref()
            .map(|op| op.target)
            .or(self.deferred.map(|(target, _)| target))
    }

    /// A seek was issued moments ago
    ///
    /// Reconciliation passes that compare the current media against what
    /// the caller thinks is playing should not restart it while this holds.
    pub fn is_guarded(&self) -> bool {
        self.guard_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Drop the active request and everything it scheduled
    pub fn cancel(&mut self) {
        if let Some(op) = self.current.take() {
            tracing::debug!("Seek operation {} cancelled", op.id);
        }
        self.next_id += 1;
        self.deferred = None;
        self.outstanding = 0;
        self.scheduler.cancel_all();
    }

    fn is_current(&self, id: u64) -> bool {
        self.current.as_ref().is_some_and(|op| op.id == id)
    }

    fn set_phase(&mut self, phase: Phase) {
        if let Some(op) = self.current.as_mut() {
            op.phase = phase;
        }
    }

    fn issue_seek(&mut self, env: &mut SeekEnv<'_>, target: Duration) {
        self.outstanding += 1;
        env.engine.seek(target);
    }

    // ============ Requests ============

    /// Seek the current media to `target`
    pub fn request(
        &mut self,
        env: &mut SeekEnv<'_>,
        media: Option<&MediaDescriptor>,
        target: Duration,
    ) {
        self.start(env, media, target, None);
    }

    fn start(
        &mut self,
        env: &mut SeekEnv<'_>,
        media: Option<&MediaDescriptor>,
        target: Duration,
        resume_playing: Option<bool>,
    ) {
        let target = match env.engine.actual_duration() {
            Some(duration) => target.min(duration),
            None => target,
        };
        let state = env.machine.state();

        if matches!(state, PlaybackState::Idle | PlaybackState::Error) {
            tracing::debug!("Seek to {:?} ignored in {}", target, state);
            return;
        }

        let was_playing = match (&self.current, resume_playing) {
            (_, Some(playing)) => playing,
            (Some(op), None) => op.was_playing,
            (None, None) => state.is_active() || env.engine.state().is_playing,
        };

        if state == PlaybackState::Loading || !env.engine.is_acquired() {
            let was_playing = was_playing || env.engine.will_autoplay();
            tracing::debug!("Seek to {:?} deferred until the stream is acquired", target);
            self.cancel();
            self.deferred = Some((target, was_playing));
            return;
        }

        let from = self
            .current
            .as_ref()
            .map(|op| op.target)
            .unwrap_or(env.engine.state().current_time);
        let delta = if target > from {
            target - from
        } else {
            from - target
        };
        let size = if delta >= self.settings.large_skip_threshold {
            SeekSize::LargeJump
        } else {
            SeekSize::FineScrub
        };

        // invalidate whatever the previous request left scheduled
        let outstanding = self.outstanding;
        self.cancel();
        self.outstanding = outstanding;

        let id = self.next_id;
        let episode_id = media
            .filter(|m| m.is_cache_gated())
            .map(|m| m.id.clone());
        tracing::info!(
            "Seek operation {}: {:?} -> {:?} ({:?}{})",
            id,
            from,
            target,
            size,
            if episode_id.is_some() { ", cache-gated" } else { "" }
        );

        self.current = Some(SeekOperation {
            id,
            target,
            size,
            was_playing,
            episode_id,
            phase: Phase::Debouncing,
        });
        self.enter_seeking(env, target, was_playing);

        match size {
            SeekSize::LargeJump => self.execute(env, id),
            SeekSize::FineScrub => self.scheduler.schedule(
                SeekSlot::Debounce,
                self.settings.scrub_debounce,
                SeekMessage::Execute(id),
            ),
        }
    }

    /// Replay the live handle from the start without reloading
    pub fn restart(&mut self, env: &mut SeekEnv<'_>) -> bool {
        if !env.engine.is_acquired() {
            return false;
        }
        self.cancel();
        let id = self.next_id;
        tracing::info!("Seek operation {}: restart from zero", id);
        self.current = Some(SeekOperation {
            id,
            target: Duration::ZERO,
            size: SeekSize::LargeJump,
            was_playing: true,
            episode_id: None,
            phase: Phase::AwaitSeeked,
        });
        self.enter_seeking(env, Duration::ZERO, true);
        self.issue_seek(env, Duration::ZERO);
        true
    }

    /// Run a seek that arrived while the stream was loading
    pub fn resume_deferred(&mut self, env: &mut SeekEnv<'_>, media: Option<&MediaDescriptor>) {
        let Some((target, was_playing)) = self.deferred.take() else {
            return;
        };
        if !env.engine.is_acquired() {
            self.deferred = Some((target, was_playing));
            return;
        }
        tracing::debug!("Running deferred seek to {:?}", target);
        self.start(env, media, target, Some(was_playing));
    }

    /// A user play or pause while a request owns the machine
    ///
    /// Returns `false` when no request is active and the caller should act
    /// normally.
    pub fn user_intent(&mut self, env: &mut SeekEnv<'_>, playing: bool) -> bool {
        let Some(op) = self.current.as_mut() else {
            if let Some((_, was_playing)) = self.deferred.as_mut() {
                *was_playing = playing;
            }
            return false;
        };
        op.was_playing = playing;
        let (phase, target) = (op.phase, op.target);
        tracing::debug!("Seek operation {} will resume as playing={}", op.id, playing);

        match phase {
            // engine is paused until the cache catches up
            Phase::Polling { .. } => match (playing, env.machine.state()) {
                (false, PlaybackState::Buffering) => {
                    env.machine
                        .transition(PlaybackState::Ready, TransitionOptions::seek_target(target));
                }
                (true, PlaybackState::Ready) => {
                    env.machine
                        .transition(PlaybackState::Playing, TransitionOptions::seek_target(target));
                    env.machine.transition(
                        PlaybackState::Buffering,
                        TransitionOptions::seek_target(target),
                    );
                }
                _ => {}
            },
            Phase::Reloading | Phase::ReloadSeek => {}
            _ => {
                if playing {
                    env.engine.play();
                } else {
                    env.engine.pause();
                }
            }
        }
        true
    }

    fn enter_seeking(&mut self, env: &mut SeekEnv<'_>, target: Duration, was_playing: bool) {
        let opts = TransitionOptions {
            seek_target: Some(target),
            was_playing: Some(was_playing),
            ..Default::default()
        };
        match env.machine.state() {
            // no self edge; the context keeps the earlier target
            PlaybackState::Seeking => {}
            PlaybackState::Buffering => {
                env.machine.transition(PlaybackState::Ready, TransitionOptions::default());
                env.machine.transition(PlaybackState::Seeking, opts);
            }
            _ => {
                env.machine.transition(PlaybackState::Seeking, opts);
            }
        }
    }

    fn execute(&mut self, env: &mut SeekEnv<'_>, id: u64) {
        let Some(op) = self.current.as_ref().filter(|op| op.id == id) else {
            return;
        };
        self.guard_until = Some(Instant::now() + self.settings.guard_window);

        match op.episode_id.clone() {
            None => {
                let target = op.target;
                self.set_phase(Phase::AwaitSeeked);
                self.issue_seek(env, target);
            }
            Some(episode_id) => {
                self.set_phase(Phase::QueryingCache);
                let cache = self.cache.clone();
                self.scheduler.spawn(SeekSlot::CacheQuery, async move {
                    let status = cache.status(&episode_id).await;
                    SeekMessage::CacheStatus { op: id, status }
                });
            }
        }
    }

    // ============ Inbound ============

    pub fn on_message(&mut self, env: &mut SeekEnv<'_>, msg: SeekMessage) {
        if !self.is_current(msg.op()) {
            tracing::debug!("Dropping {:?} from a superseded seek", msg);
            return;
        }

        match msg {
            SeekMessage::Execute(id) => self.execute(env, id),
            SeekMessage::CacheStatus { status, .. } => self.on_cache_status(env, status),
            SeekMessage::Verify(_) => self.verify(env),
            SeekMessage::Poll(id) => {
                let Some(episode_id) = self.current.as_ref().and_then(|op| op.episode_id.clone())
                else {
                    return;
                };
                let cache = self.cache.clone();
                self.scheduler.spawn(SeekSlot::CacheQuery, async move {
                    let status = cache.status(&episode_id).await;
                    SeekMessage::PollResult { op: id, status }
                });
            }
            SeekMessage::PollResult { status, .. } => self.on_poll_result(env, status),
        }
    }

    fn on_cache_status(&mut self, env: &mut SeekEnv<'_>, status: Result<CacheStatus>) {
        let Some(op) = self.current.as_ref() else {
            return;
        };
        let (id, target) = (op.id, op.target);
        let cached = match status {
            Ok(status) => status.cached,
            Err(e) => {
                tracing::warn!("Cache status unavailable, seeking unverified: {}", e);
                false
            }
        };
        let delay = if cached {
            self.settings.cached_verify_delay
        } else {
            self.settings.uncached_verify_delay
        };

        self.set_phase(Phase::Verifying { cached });
        self.issue_seek(env, target);
        self.scheduler
            .schedule(SeekSlot::Verify, delay, SeekMessage::Verify(id));
    }

    fn verify(&mut self, env: &mut SeekEnv<'_>) {
        let Some(op) = self.current.clone() else {
            return;
        };
        let Phase::Verifying { cached } = op.phase else {
            return;
        };

        let position = env
            .engine
            .actual_position()
            .unwrap_or(env.engine.state().current_time);
        let diff = if position > op.target {
            position - op.target
        } else {
            op.target - position
        };

        if diff <= self.settings.verify_tolerance {
            tracing::debug!("Seek operation {} verified at {:?}", op.id, position);
            self.settle(env);
            return;
        }

        tracing::warn!(
            "Seek operation {} landed at {:?}, {:?} from target",
            op.id,
            position,
            diff
        );
        if cached {
            self.reload(env);
        } else {
            self.wait_for_cache(env);
        }
    }

    /// Pause, park at the target and poll until the episode is cached
    fn wait_for_cache(&mut self, env: &mut SeekEnv<'_>) {
        let Some(op) = self.current.as_ref() else {
            return;
        };
        let (id, target) = (op.id, op.target);

        env.engine.pause();
        if env.machine.state() == PlaybackState::Seeking {
            // a paused listener waits in Ready; the target stays visible
            let to = if op.was_playing {
                PlaybackState::Playing
            } else {
                PlaybackState::Ready
            };
            env.machine.transition(to, TransitionOptions::seek_target(target));
        }
        if env.machine.state() == PlaybackState::Playing {
            env.machine
                .transition(PlaybackState::Buffering, TransitionOptions::seek_target(target));
        }

        tracing::info!("Waiting for {:?} to be cached", target);
        self.set_phase(Phase::Polling { attempts: 0 });
        self.scheduler.schedule(
            SeekSlot::Poll,
            self.settings.cache_poll_interval,
            SeekMessage::Poll(id),
        );
    }

    fn on_poll_result(&mut self, env: &mut SeekEnv<'_>, status: Result<CacheStatus>) {
        let Some(op) = self.current.as_ref() else {
            return;
        };
        let Phase::Polling { attempts } = op.phase else {
            return;
        };
        let id = op.id;
        let attempts = attempts + 1;

        match status {
            Ok(status) if status.cached => {
                tracing::info!("Episode cached after {} polls", attempts);
                self.reload(env);
                return;
            }
            Ok(status) => tracing::debug!(
                "Poll {}: not cached yet (downloading={}, progress={:?})",
                attempts,
                status.downloading,
                status.download_progress
            ),
            Err(e) => tracing::warn!("Poll {} failed: {}", attempts, e),
        }

        if attempts >= self.settings.cache_poll_max_attempts {
            tracing::error!("Giving up on seek operation {} after {} polls", id, attempts);
            self.current = None;
            self.scheduler.cancel_all();
            env.machine.transition(
                PlaybackState::Error,
                TransitionOptions::error(PlaybackError::CacheTimeout(attempts)),
            );
            return;
        }

        self.set_phase(Phase::Polling { attempts });
        self.scheduler.schedule(
            SeekSlot::Poll,
            self.settings.cache_poll_interval,
            SeekMessage::Poll(id),
        );
    }

    /// Fresh handle, then seek once it is acquired
    fn reload(&mut self, env: &mut SeekEnv<'_>) {
        let Some(op) = self.current.as_ref() else {
            return;
        };
        let target = op.target;
        self.scheduler.cancel_all();

        if env.engine.reload(Duration::ZERO, false).is_none() {
            tracing::warn!("Nothing to reload for seek operation {}", op.id);
            self.current = None;
            return;
        }
        self.outstanding = 0;
        self.set_phase(Phase::Reloading);
        env.machine
            .transition(PlaybackState::Loading, TransitionOptions::seek_target(target));
    }

    /// Leave `Seeking` for whatever the request started from
    fn settle(&mut self, env: &mut SeekEnv<'_>) {
        let Some(op) = self.current.take() else {
            return;
        };
        self.scheduler.cancel_all();

        if op.was_playing && !env.engine.state().is_playing {
            env.engine.play();
        }
        match env.machine.state() {
            PlaybackState::Seeking | PlaybackState::Loading => {
                let to = if op.was_playing {
                    PlaybackState::Playing
                } else {
                    PlaybackState::Ready
                };
                env.machine.transition(to, TransitionOptions::default());
            }
            _ => {}
        }
        tracing::debug!("Seek operation {} complete", op.id);
    }

    /// Give the coordinator first look at an engine event
    ///
    /// Returns `true` when the event belonged to the active request and the
    /// session should not apply its default handling.
    pub fn on_engine_event(&mut self, env: &mut SeekEnv<'_>, event: &EngineEvent) -> bool {
        if let EngineEvent::Seek { .. } = event {
            self.outstanding = self.outstanding.saturating_sub(1);
        }
        let Some(op) = self.current.as_ref() else {
            return false;
        };
        let phase = op.phase;

        match (event, phase) {
            (EngineEvent::Seek { position }, Phase::AwaitSeeked) => {
                if self.outstanding > 0 {
                    // an earlier seek landing
                    return true;
                }
                tracing::debug!("Seek landed at {:?}", position);
                self.settle(env);
                true
            }
            (EngineEvent::Seek { .. }, Phase::Verifying { cached }) => {
                // an uncached seek stays in Seeking until the verify timer decides
                if cached && self.outstanding == 0 && env.machine.state() == PlaybackState::Seeking
                {
                    // answer the UI now; the verify timer still runs
                    let to = if op.was_playing {
                        PlaybackState::Playing
                    } else {
                        PlaybackState::Ready
                    };
                    env.machine.transition(to, TransitionOptions::default());
                }
                true
            }
            (EngineEvent::Load { .. }, Phase::Reloading) => {
                let target = op.target;
                self.set_phase(Phase::ReloadSeek);
                self.issue_seek(env, target);
                true
            }
            (EngineEvent::Seek { position }, Phase::ReloadSeek) => {
                if self.outstanding > 0 {
                    return true;
                }
                tracing::info!("Resumed at {:?} after reload", position);
                self.settle(env);
                true
            }
            (EngineEvent::Seek { .. }, _) => true,
            (EngineEvent::Play | EngineEvent::Pause { .. }, _) => true,
            (EngineEvent::LoadError(_) | EngineEvent::PlayError(_) | EngineEvent::Stop, _) => {
                self.cancel();
                false
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        BackendEvent, BackendEventKind, BackendEventSender, BackendLoad, HandleId, LoadOutcome,
        MediaBackend, NoPrefetch, backend_event_channel,
    };
    use crate::media::StreamSource;
    use crate::settings::EngineSettings;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Clone, Default)]
    struct Positions {
        seeks: Arc<Mutex<Vec<Duration>>>,
        position: Arc<Mutex<Duration>>,
    }

    impl MediaBackend for Positions {
        fn attach(&mut self, _events: BackendEventSender) {}
        fn load(&mut self, _handle: HandleId, _load: BackendLoad) {}
        fn play(&mut self, _handle: HandleId) {}
        fn pause(&mut self, _handle: HandleId) {}
        fn stop(&mut self, _handle: HandleId) {}
        fn seek(&mut self, _handle: HandleId, position: Duration) {
            self.seeks.lock().push(position);
        }
        fn set_volume(&mut self, _handle: HandleId, _volume: f32) {}
        fn release(&mut self, _handle: HandleId) {}
        fn current_time(&self, _handle: HandleId) -> Option<Duration> {
            Some(*self.position.lock())
        }
        fn duration(&self, _handle: HandleId) -> Option<Duration> {
            Some(Duration::from_secs(3600))
        }
        fn is_paused(&self, _handle: HandleId) -> bool {
            false
        }
    }

    struct NeverCached;

    #[async_trait]
    impl CacheStatusSource for NeverCached {
        async fn status(&self, _episode_id: &str) -> Result<CacheStatus> {
            Ok(CacheStatus::default())
        }
    }

    struct Fixture {
        engine: MediaEngine,
        machine: PlaybackStateMachine,
        seek: SeekCoordinator,
        backend: Positions,
        handle: HandleId,
        rx: mpsc::UnboundedReceiver<SeekMessage>,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = Positions::default();
            let (backend_tx, _backend_rx) = backend_event_channel();
            let mut engine = MediaEngine::new(
                Box::new(backend.clone()),
                backend_tx,
                Arc::new(NoPrefetch),
                EngineSettings::default(),
                Mailbox::new(|_| {}),
            );
            let LoadOutcome::Started(handle) =
                engine.load(StreamSource::Url("http://h/a".into()), true)
            else {
                panic!("expected load")
            };
            engine.on_backend_event(BackendEvent::new(handle, BackendEventKind::Loaded {
                duration: Some(Duration::from_secs(3600)),
            }));
            engine.on_backend_event(BackendEvent::new(handle, BackendEventKind::Playing));

            let mut machine = PlaybackStateMachine::new();
            machine.transition(PlaybackState::Loading, TransitionOptions::default());
            machine.transition(PlaybackState::Playing, TransitionOptions::default());

            let (tx, rx) = mpsc::unbounded_channel();
            let seek = SeekCoordinator::new(
                SeekSettings::default(),
                Arc::new(NeverCached),
                Mailbox::from_sender(tx, |m| m),
            );
            Self {
                engine,
                machine,
                seek,
                backend,
                handle,
                rx,
            }
        }

        fn request(&mut self, media: Option<&MediaDescriptor>, target: Duration) {
            let mut env = SeekEnv {
                engine: &mut self.engine,
                machine: &mut self.machine,
            };
            self.seek.request(&mut env, media, target);
        }

        fn deliver(&mut self, msg: SeekMessage) {
            let mut env = SeekEnv {
                engine: &mut self.engine,
                machine: &mut self.machine,
            };
            self.seek.on_message(&mut env, msg);
        }

        fn landed(&mut self, position: Duration) {
            self.engine.on_backend_event(BackendEvent::new(
                self.handle,
                BackendEventKind::Seeked { position },
            ));
            while let Some(event) = self.engine.next_event() {
                let mut env = SeekEnv {
                    engine: &mut self.engine,
                    machine: &mut self.machine,
                };
                self.seek.on_engine_event(&mut env, &event);
            }
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn large_jump_is_immediate() {
        let mut fx = Fixture::new();
        fx.request(None, secs(600));

        assert_eq!(*fx.backend.seeks.lock(), vec![secs(600)]);
        assert_eq!(fx.machine.state(), PlaybackState::Seeking);
        assert!(fx.machine.context().was_playing_before_seek);
        assert!(fx.seek.is_guarded());

        fx.landed(secs(600));
        assert_eq!(fx.machine.state(), PlaybackState::Playing);
        assert!(!fx.seek.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn fine_scrubs_coalesce() {
        let mut fx = Fixture::new();
        fx.request(None, secs(2));
        fx.request(None, secs(4));
        fx.request(None, secs(6));
        assert!(fx.backend.seeks.lock().is_empty());

        let msg = fx.rx.recv().await.unwrap();
        fx.deliver(msg);
        assert_eq!(*fx.backend.seeks.lock(), vec![secs(6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_continuation_is_inert() {
        let mut fx = Fixture::new();
        fx.request(None, secs(100));
        let stale = fx.seek.current().unwrap().id;
        fx.request(None, secs(900));

        fx.deliver(SeekMessage::Execute(stale));
        fx.deliver(SeekMessage::Verify(stale));
        assert_eq!(*fx.backend.seeks.lock(), vec![secs(100), secs(900)]);

        // the first answer is not mistaken for the second
        fx.landed(secs(100));
        assert_eq!(fx.machine.state(), PlaybackState::Seeking);
        fx.landed(secs(900));
        assert_eq!(fx.machine.state(), PlaybackState::Playing);
        assert_eq!(fx.engine.state().current_time, secs(900));
    }

    #[tokio::test(start_paused = true)]
    async fn uncached_divergence_parks_in_buffering() {
        let mut fx = Fixture::new();
        let episode =
            MediaDescriptor::podcast_episode("e1", "p1", "Ep", StreamSource::Url("u".into()));
        fx.request(Some(&episode), secs(1200));

        let status = fx.rx.recv().await.unwrap();
        assert!(matches!(status, SeekMessage::CacheStatus { .. }));
        fx.deliver(status);
        assert_eq!(*fx.backend.seeks.lock(), vec![secs(1200)]);

        // backend could not reach the target
        *fx.backend.position.lock() = secs(30);
        fx.landed(secs(30));
        assert_eq!(fx.machine.state(), PlaybackState::Seeking);
        assert_eq!(fx.machine.context().seek_target, Some(secs(1200)));

        let verify = fx.rx.recv().await.unwrap();
        assert!(matches!(verify, SeekMessage::Verify(_)));
        fx.deliver(verify);
        assert_eq!(fx.machine.state(), PlaybackState::Buffering);
        assert_eq!(fx.machine.context().seek_target, Some(secs(1200)));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_uncached_seek_keeps_target_while_polling() {
        let mut fx = Fixture::new();
        fx.engine.pause();
        fx.engine
            .on_backend_event(BackendEvent::new(fx.handle, BackendEventKind::Paused));
        fx.machine
            .transition(PlaybackState::Ready, TransitionOptions::default());

        let episode =
            MediaDescriptor::podcast_episode("e1", "p1", "Ep", StreamSource::Url("u".into()));
        fx.request(Some(&episode), secs(1200));
        assert!(!fx.seek.current().unwrap().was_playing);
        let status = fx.rx.recv().await.unwrap();
        fx.deliver(status);

        *fx.backend.position.lock() = secs(30);
        fx.landed(secs(30));
        let verify = fx.rx.recv().await.unwrap();
        fx.deliver(verify);

        assert_eq!(fx.machine.state(), PlaybackState::Ready);
        assert_eq!(fx.machine.context().seek_target, Some(secs(1200)));
        assert!(matches!(fx.rx.recv().await.unwrap(), SeekMessage::Poll(_)));

        // pressing play while polling shows buffering at the target
        let mut env = SeekEnv {
            engine: &mut fx.engine,
            machine: &mut fx.machine,
        };
        assert!(fx.seek.user_intent(&mut env, true));
        assert_eq!(fx.machine.state(), PlaybackState::Buffering);
        assert_eq!(fx.machine.context().seek_target, Some(secs(1200)));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_gives_up_with_cache_timeout() {
        let mut fx = Fixture::new();
        let episode =
            MediaDescriptor::podcast_episode("e1", "p1", "Ep", StreamSource::Url("u".into()));
        fx.request(Some(&episode), secs(1200));
        let status = fx.rx.recv().await.unwrap();
        fx.deliver(status);
        let verify = fx.rx.recv().await.unwrap();
        fx.deliver(verify);

        for _ in 0..SeekSettings::default().cache_poll_max_attempts {
            let poll = fx.rx.recv().await.unwrap();
            fx.deliver(poll);
            let result = fx.rx.recv().await.unwrap();
            fx.deliver(result);
        }
        assert_eq!(fx.machine.state(), PlaybackState::Error);
        assert_eq!(
            fx.machine.context().error_code,
            Some(PlaybackError::CacheTimeout(0).code())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn seek_while_loading_is_deferred() {
        let mut fx = Fixture::new();
        let LoadOutcome::Started(handle) =
            fx.engine.load(StreamSource::Url("http://h/b".into()), true)
        else {
            panic!("expected load")
        };
        fx.machine
            .transition(PlaybackState::Loading, TransitionOptions::default());

        fx.request(None, secs(42));
        assert!(fx.backend.seeks.lock().is_empty());
        assert_eq!(fx.seek.target(), Some(secs(42)));

        fx.engine.on_backend_event(BackendEvent::new(handle, BackendEventKind::Loaded {
            duration: Some(secs(100)),
        }));
        fx.machine
            .transition(PlaybackState::Ready, TransitionOptions::default());
        let mut env = SeekEnv {
            engine: &mut fx.engine,
            machine: &mut fx.machine,
        };
        fx.seek.resume_deferred(&mut env, None);
        assert_eq!(*fx.backend.seeks.lock(), vec![secs(42)]);
        assert!(fx.seek.current().unwrap().was_playing);
        assert!(fx.machine.context().was_playing_before_seek);
    }
}
