//! Media backend adapter
//!
//! `MediaEngine` owns the one live playback handle and turns the backend's
//! raw, handle-tagged events into the normalized `EngineEvent` stream:
//! - every `load` starts a new epoch; events from older handles are dropped
//! - a failure before any duration was known is a load error, after it a
//!   play error
//! - an audible handle that gets replaced is silenced and released after a
//!   short delay instead of being cut off
//! - the next queue item can be warmed with a plain fetch

pub mod backend;
pub mod events;
pub mod fade;
pub mod preload;
pub mod rodio_backend;
pub mod streaming;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

pub use backend::{
    BackendEvent, BackendEventKind, BackendEventReceiver, BackendEventSender, BackendLoad,
    HandleId, MediaBackend, backend_event_channel,
};
pub use events::{EngineEvent, EngineEventReceiver, EngineEventSender, EngineState};
pub use preload::{NoPrefetch, Prefetch, Prefetcher};
pub use rodio_backend::RodioBackend;
pub use streaming::{SharedBuffer, StreamReader};

use crate::error::PlaybackError;
use crate::media::StreamSource;
use crate::session::timers::{Mailbox, Scheduler};
use crate::settings::EngineSettings;
use preload::Preloader;

/// Capacity of the engine event broadcast
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineSlot {
    LoadTimeout,
    Preload,
    Release(HandleId),
}

/// Timer results routed back into the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    LoadTimeout(u64),
    ArmPreload(u64),
    Release(HandleId),
}

/// Parameters of a load
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub source: StreamSource,
    pub autoplay: bool,
    pub start_at: Duration,
    /// Duration known from the descriptor, used until the backend reports one
    pub duration_hint: Option<Duration>,
}

impl LoadRequest {
    pub fn new(source: StreamSource, autoplay: bool) -> Self {
        Self {
            source,
            autoplay,
            start_at: Duration::ZERO,
            duration_hint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A new handle was created under this epoch
    Started(u64),
    /// Same source already live
    Unchanged,
}

#[derive(Debug)]
struct LiveHandle {
    id: HandleId,
    /// Backend reported `Loaded`
    acquired: bool,
    /// Backend reported a duration for this handle
    duration_known: bool,
    /// Play as soon as the stream is acquired
    autoplay: bool,
    /// Next pause event was asked for
    pause_commanded: bool,
}

pub struct MediaEngine {
    backend: Box<dyn MediaBackend>,
    settings: EngineSettings,
    epoch: u64,
    live: Option<LiveHandle>,
    /// Silenced handles waiting for release
    retiring: Vec<HandleId>,
    state: EngineState,
    preloader: Preloader,
    scheduler: Scheduler<EngineSlot, EngineMessage>,
    outbox: VecDeque<EngineEvent>,
    events: EngineEventSender,
}

impl std::fmt::Debug for MediaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaEngine")
            .field("epoch", &self.epoch)
            .field("live", &self.live)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl MediaEngine {
    pub fn new(
        mut backend: Box<dyn MediaBackend>,
        backend_events: BackendEventSender,
        prefetcher: Arc<dyn Prefetcher>,
        settings: EngineSettings,
        mailbox: Mailbox<EngineMessage>,
    ) -> Self {
        backend.attach(backend_events);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = EngineState {
            volume: settings.volume.clamp(0.0, 1.0),
            ..Default::default()
        };

        Self {
            backend,
            settings,
            epoch: 0,
            live: None,
            retiring: Vec::new(),
            state,
            preloader: Preloader::new(prefetcher),
            scheduler: Scheduler::new(mailbox),
            outbox: VecDeque::new(),
            events,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Current load epoch
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn has_handle(&self) -> bool {
        self.live.is_some()
    }

    /// Live handle has acquired its stream
    pub fn is_acquired(&self) -> bool {
        self.live.as_ref().is_some_and(|live| live.acquired)
    }

    /// Live handle will start playing once acquired
    pub fn will_autoplay(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.autoplay && !self.state.is_playing)
    }

    pub fn subscribe(&self) -> EngineEventReceiver {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> EngineEventSender {
        self.events.clone()
    }

    /// Next normalized event produced since the last call
    pub fn next_event(&mut self) -> Option<EngineEvent> {
        self.outbox.pop_front()
    }

    /// Hardware position of the live handle
    pub fn actual_position(&self) -> Option<Duration> {
        self.live
            .as_ref()
            .and_then(|live| self.backend.current_time(live.id))
    }

    /// Hardware playing flag of the live handle
    pub fn actual_is_playing(&self) -> Option<bool> {
        self.live
            .as_ref()
            .map(|live| !self.backend.is_paused(live.id))
    }

    pub fn actual_duration(&self) -> Option<Duration> {
        self.live
            .as_ref()
            .and_then(|live| self.backend.duration(live.id))
            .or(self.state.duration)
    }

    fn emit(&mut self, event: EngineEvent) {
        tracing::trace!("Engine event {}", event.name());
        // no subscribers is fine
        let _ = self.events.send(event.clone());
        self.outbox.push_back(event);
    }

    // ============ Commands ============

    pub fn load(&mut self, source: StreamSource, autoplay: bool) -> LoadOutcome {
        self.load_with(LoadRequest::new(source, autoplay))
    }

    pub fn load_with(&mut self, request: LoadRequest) -> LoadOutcome {
        if self.live.is_some() && self.state.current_src.as_ref() == Some(&request.source) {
            if request.autoplay && !self.state.is_playing {
                self.play();
            }
            return LoadOutcome::Unchanged;
        }
        LoadOutcome::Started(self.begin_load(request))
    }

    /// Load the current source again under a new epoch
    pub fn reload(&mut self, start_at: Duration, autoplay: bool) -> Option<u64> {
        let source = self.state.current_src.clone()?;
        Some(self.begin_load(LoadRequest {
            source,
            autoplay,
            start_at,
            duration_hint: self.state.duration,
        }))
    }

    fn begin_load(&mut self, request: LoadRequest) -> u64 {
        self.epoch += 1;
        let id = self.epoch;
        let was_audible = self.state.is_playing;

        let previous = self.live.replace(LiveHandle {
            id,
            acquired: false,
            duration_known: false,
            autoplay: request.autoplay,
            pause_commanded: false,
        });

        tracing::info!("Loading {} (epoch {})", request.source, id);
        let warmed = self.preloader.take(&request.source);
        self.state.current_src = Some(request.source.clone());
        self.state.is_playing = false;
        self.state.current_time = request.start_at;
        self.state.duration = request.duration_hint;

        self.backend.load(
            id,
            BackendLoad {
                source: request.source,
                warmed,
                start_at: request.start_at,
            },
        );
        self.backend.set_volume(id, self.state.effective_volume());
        self.scheduler.schedule(
            EngineSlot::LoadTimeout,
            self.settings.load_timeout,
            EngineMessage::LoadTimeout(id),
        );

        if let Some(old) = previous {
            self.retire(old.id, was_audible);
        }
        id
    }

    fn retire(&mut self, handle: HandleId, audible: bool) {
        if audible {
            tracing::debug!("Silencing handle {} before release", handle);
            self.backend.set_volume(handle, 0.0);
            self.retiring.push(handle);
            self.scheduler.schedule(
                EngineSlot::Release(handle),
                self.settings.anti_click_delay,
                EngineMessage::Release(handle),
            );
        } else {
            self.backend.release(handle);
        }
    }

    /// Release the live handle and forget its source
    fn drop_live(&mut self) {
        self.scheduler.cancel(&EngineSlot::LoadTimeout);
        if let Some(live) = self.live.take() {
            self.backend.release(live.id);
        }
        self.state.current_src = None;
        self.state.is_playing = false;
    }

    pub fn play(&mut self) {
        let Some(live) = self.live.as_mut() else {
            tracing::debug!("play() without a handle");
            return;
        };
        if live.acquired {
            self.backend.play(live.id);
        } else {
            live.autoplay = true;
        }
    }

    pub fn pause(&mut self) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if live.acquired {
            live.pause_commanded = true;
            self.backend.pause(live.id);
        } else {
            live.autoplay = false;
        }
    }

    pub fn stop(&mut self) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        live.pause_commanded = true;
        let id = live.id;
        self.scheduler.cancel(&EngineSlot::LoadTimeout);
        self.backend.stop(id);
    }

    pub fn seek(&mut self, position: Duration) {
        match self.live.as_ref() {
            Some(live) if live.acquired => {
                tracing::debug!("Seeking handle {} to {:?}", live.id, position);
                self.backend.seek(live.id, position);
            }
            Some(_) => tracing::debug!("Seek to {:?} before stream acquired, ignored", position),
            None => tracing::debug!("Seek without a handle"),
        }
    }

    /// Warm `source` after the preload delay
    pub fn preload(&mut self, source: StreamSource) {
        if self.state.current_src.as_ref() == Some(&source) {
            return;
        }
        if let Some(token) = self.preloader.schedule(source) {
            self.scheduler.schedule(
                EngineSlot::Preload,
                self.settings.preload_delay,
                EngineMessage::ArmPreload(token),
            );
        }
    }

    pub fn cancel_preload(&mut self) {
        self.scheduler.cancel(&EngineSlot::Preload);
        self.preloader.cancel();
    }

    pub fn preload_target(&self) -> Option<&StreamSource> {
        self.preloader.target()
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.state.volume = volume.clamp(0.0, 1.0);
        self.apply_volume();
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.state.is_muted = muted;
        self.apply_volume();
    }

    fn apply_volume(&mut self) {
        if let Some(live) = &self.live {
            self.backend.set_volume(live.id, self.state.effective_volume());
        }
        self.emit(EngineEvent::Volume {
            volume: self.state.volume,
            muted: self.state.is_muted,
        });
    }

    /// Cancel every timer and release every handle
    pub fn shutdown(&mut self) {
        self.scheduler.cancel_all();
        self.preloader.cancel();
        for handle in std::mem::take(&mut self.retiring) {
            self.backend.release(handle);
        }
        self.drop_live();
    }

    // ============ Inbound ============

    pub fn on_message(&mut self, msg: EngineMessage) {
        match msg {
            EngineMessage::LoadTimeout(id) => {
                if self.live.as_ref().is_some_and(|l| l.id == id && !l.acquired) {
                    tracing::warn!("Load of epoch {} timed out", id);
                    self.drop_live();
                    self.emit(EngineEvent::LoadError(PlaybackError::Load(format!(
                        "no response within {:?}",
                        self.settings.load_timeout
                    ))));
                }
            }
            EngineMessage::ArmPreload(token) => {
                self.preloader.arm(token);
            }
            EngineMessage::Release(handle) => {
                tracing::debug!("Releasing retired handle {}", handle);
                self.retiring.retain(|h| *h != handle);
                self.backend.release(handle);
            }
        }
    }

    pub fn on_backend_event(&mut self, event: BackendEvent) {
        let Some(live) = self.live.as_mut().filter(|live| live.id == event.handle) else {
            tracing::debug!(
                "Discarding {:?} from stale handle {} (epoch {})",
                event.kind,
                event.handle,
                self.epoch
            );
            return;
        };

        match event.kind {
            BackendEventKind::Loaded { duration } => {
                live.acquired = true;
                live.duration_known = duration.is_some();
                let autoplay = live.autoplay;
                let id = live.id;
                self.scheduler.cancel(&EngineSlot::LoadTimeout);
                if duration.is_some() {
                    self.state.duration = duration;
                }
                self.emit(EngineEvent::Load {
                    duration: self.state.duration,
                });
                if autoplay {
                    self.backend.play(id);
                }
            }
            BackendEventKind::Failed(reason) => {
                // a stream that never reported a duration was not really acquired
                let duration_known =
                    live.duration_known || self.backend.duration(event.handle).is_some();
                let error = if duration_known {
                    PlaybackError::Play(reason)
                } else {
                    PlaybackError::Load(reason)
                };
                tracing::warn!("Handle {} failed: {}", event.handle, error);
                self.drop_live();
                self.emit(match error {
                    PlaybackError::Load(_) => EngineEvent::LoadError(error),
                    _ => EngineEvent::PlayError(error),
                });
            }
            BackendEventKind::Playing => {
                live.pause_commanded = false;
                self.state.is_playing = true;
                self.emit(EngineEvent::Play);
            }
            BackendEventKind::Paused => {
                let commanded = std::mem::take(&mut live.pause_commanded);
                self.state.is_playing = false;
                self.emit(EngineEvent::Pause { commanded });
            }
            BackendEventKind::Stopped => {
                self.drop_live();
                self.state.current_time = Duration::ZERO;
                self.emit(EngineEvent::Stop);
            }
            BackendEventKind::Ended => {
                self.state.is_playing = false;
                if let Some(duration) = self.state.duration {
                    self.state.current_time = duration;
                }
                self.emit(EngineEvent::End);
            }
            BackendEventKind::Seeked { position } => {
                self.state.current_time = position;
                self.emit(EngineEvent::Seek { position });
            }
            BackendEventKind::TimeUpdate { position } => {
                self.state.current_time = position;
                self.emit(EngineEvent::TimeUpdate { position });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Load(HandleId, StreamSource),
        Play(HandleId),
        Pause(HandleId),
        Stop(HandleId),
        Seek(HandleId, Duration),
        Volume(HandleId, f32),
        Release(HandleId),
    }

    #[derive(Clone, Default)]
    struct Spy {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl MediaBackend for Spy {
        fn attach(&mut self, _events: BackendEventSender) {}
        fn load(&mut self, handle: HandleId, load: BackendLoad) {
            self.calls.lock().push(Call::Load(handle, load.source));
        }
        fn play(&mut self, handle: HandleId) {
            self.calls.lock().push(Call::Play(handle));
        }
        fn pause(&mut self, handle: HandleId) {
            self.calls.lock().push(Call::Pause(handle));
        }
        fn stop(&mut self, handle: HandleId) {
            self.calls.lock().push(Call::Stop(handle));
        }
        fn seek(&mut self, handle: HandleId, position: Duration) {
            self.calls.lock().push(Call::Seek(handle, position));
        }
        fn set_volume(&mut self, handle: HandleId, volume: f32) {
            self.calls.lock().push(Call::Volume(handle, volume));
        }
        fn release(&mut self, handle: HandleId) {
            self.calls.lock().push(Call::Release(handle));
        }
        fn current_time(&self, _handle: HandleId) -> Option<Duration> {
            None
        }
        fn duration(&self, _handle: HandleId) -> Option<Duration> {
            None
        }
        fn is_paused(&self, _handle: HandleId) -> bool {
            true
        }
    }

    fn engine() -> (MediaEngine, Spy, mpsc::UnboundedReceiver<EngineMessage>) {
        let spy = Spy::default();
        let (backend_tx, _backend_rx) = backend_event_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = MediaEngine::new(
            Box::new(spy.clone()),
            backend_tx,
            Arc::new(NoPrefetch),
            EngineSettings::default(),
            Mailbox::from_sender(tx, |m| m),
        );
        (engine, spy, rx)
    }

    fn src(name: &str) -> StreamSource {
        StreamSource::Url(format!("http://h/{name}"))
    }

    fn drain(engine: &mut MediaEngine) -> Vec<EngineEvent> {
        std::iter::from_fn(|| engine.next_event()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn stale_events_are_discarded() {
        let (mut engine, _spy, _rx) = engine();
        let LoadOutcome::Started(a) = engine.load(src("a"), true) else {
            panic!("expected load")
        };
        let LoadOutcome::Started(b) = engine.load(src("b"), true) else {
            panic!("expected load")
        };

        engine.on_backend_event(BackendEvent::new(a, BackendEventKind::Loaded {
            duration: Some(Duration::from_secs(100)),
        }));
        assert!(drain(&mut engine).is_empty());
        assert!(!engine.is_acquired());

        engine.on_backend_event(BackendEvent::new(b, BackendEventKind::Loaded {
            duration: Some(Duration::from_secs(200)),
        }));
        assert_eq!(
            drain(&mut engine),
            vec![EngineEvent::Load {
                duration: Some(Duration::from_secs(200))
            }]
        );
        assert_eq!(engine.state().current_src, Some(src("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn same_source_load_is_noop_unless_autoplay() {
        let (mut engine, spy, _rx) = engine();
        let LoadOutcome::Started(id) = engine.load(src("a"), false) else {
            panic!("expected load")
        };
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Loaded { duration: None }));

        assert_eq!(engine.load(src("a"), false), LoadOutcome::Unchanged);
        assert!(!spy.calls.lock().contains(&Call::Play(id)));

        assert_eq!(engine.load(src("a"), true), LoadOutcome::Unchanged);
        assert!(spy.calls.lock().contains(&Call::Play(id)));
        assert_eq!(engine.epoch(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_classification() {
        let (mut engine, _spy, _rx) = engine();
        let LoadOutcome::Started(id) = engine.load(src("a"), false) else {
            panic!("expected load")
        };
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Failed("404".into())));
        assert!(matches!(
            drain(&mut engine).as_slice(),
            [EngineEvent::LoadError(PlaybackError::Load(_))]
        ));
        assert_eq!(engine.state().current_src, None);

        let LoadOutcome::Started(id) = engine.load(src("b"), false) else {
            panic!("expected load")
        };
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Loaded {
            duration: Some(Duration::from_secs(180)),
        }));
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Failed("decode".into())));
        assert!(matches!(
            drain(&mut engine).as_slice(),
            [EngineEvent::Load { .. }, EngineEvent::PlayError(PlaybackError::Play(_))]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_without_duration_is_a_load_error() {
        let (mut engine, _spy, _rx) = engine();
        let LoadOutcome::Started(id) = engine.load(src("live"), true) else {
            panic!("expected load")
        };
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Loaded { duration: None }));
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Playing));
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Failed("reset".into())));
        assert!(matches!(
            drain(&mut engine).as_slice(),
            [
                EngineEvent::Load { duration: None },
                EngineEvent::Play,
                EngineEvent::LoadError(PlaybackError::Load(_))
            ]
        ));
        assert!(!engine.has_handle());
    }

    #[tokio::test(start_paused = true)]
    async fn audible_handle_is_silenced_then_released() {
        let (mut engine, spy, mut rx) = engine();
        let LoadOutcome::Started(a) = engine.load(src("a"), true) else {
            panic!("expected load")
        };
        engine.on_backend_event(BackendEvent::new(a, BackendEventKind::Loaded { duration: None }));
        engine.on_backend_event(BackendEvent::new(a, BackendEventKind::Playing));

        engine.load(src("b"), true);
        {
            let calls = spy.calls.lock();
            assert!(calls.contains(&Call::Volume(a, 0.0)));
            assert!(!calls.contains(&Call::Release(a)));
        }

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, EngineMessage::Release(a));
        engine.on_message(msg);
        assert!(spy.calls.lock().contains(&Call::Release(a)));
    }

    #[tokio::test(start_paused = true)]
    async fn load_timeout_becomes_load_error() {
        let (mut engine, _spy, mut rx) = engine();
        engine.load(src("a"), true);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, EngineMessage::LoadTimeout(1));
        engine.on_message(msg);
        assert!(matches!(
            drain(&mut engine).as_slice(),
            [EngineEvent::LoadError(_)]
        ));
        assert!(!engine.has_handle());
    }

    #[tokio::test(start_paused = true)]
    async fn unrequested_pause_is_flagged() {
        let (mut engine, _spy, _rx) = engine();
        let LoadOutcome::Started(id) = engine.load(src("a"), true) else {
            panic!("expected load")
        };
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Loaded { duration: None }));
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Playing));
        drain(&mut engine);

        engine.pause();
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Paused));
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Playing));
        engine.on_backend_event(BackendEvent::new(id, BackendEventKind::Paused));
        assert_eq!(
            drain(&mut engine),
            vec![
                EngineEvent::Pause { commanded: true },
                EngineEvent::Play,
                EngineEvent::Pause { commanded: false },
            ]
        );
    }
}
