//! Doubles shared by the session tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use nocturne::bridge::{
    NowPlayingMetadata, NowPlayingSurface, SurfaceEvent, SurfaceStatus, TransportHandlers,
};
use nocturne::engine::{
    BackendEvent, BackendEventKind, BackendEventSender, BackendLoad, HandleId, MediaBackend,
    Prefetch, Prefetcher, SharedBuffer,
};
use nocturne::remote::{CacheStatus, CacheStatusSource};
use nocturne::{
    MediaDescriptor, MemoryResumeStore, PlayQueue, PlaybackSession, PlaybackState, SessionHandle,
    SessionParts, SessionSnapshot, Settings, StreamSource,
};

/// Clock step of the scripted backend
pub const TICK: Duration = Duration::from_millis(250);

pub fn url(name: &str) -> StreamSource {
    StreamSource::Url(format!("http://media.test/{name}"))
}

pub fn track(id: &str, secs: u64) -> MediaDescriptor {
    MediaDescriptor::track(id, id, url(id)).with_duration(Duration::from_secs(secs))
}

pub fn audiobook(id: &str, secs: u64) -> MediaDescriptor {
    MediaDescriptor::audiobook(id, id, url(id)).with_duration(Duration::from_secs(secs))
}

pub fn episode(id: &str, secs: u64) -> MediaDescriptor {
    MediaDescriptor::podcast_episode(id, "show", id, url(id)).with_duration(Duration::from_secs(secs))
}

#[derive(Debug, Clone)]
struct Voice {
    source: StreamSource,
    position: Duration,
    duration: Duration,
    playing: bool,
}

#[derive(Default)]
struct Script {
    events: Option<BackendEventSender>,
    voices: HashMap<HandleId, Voice>,
    durations: HashMap<StreamSource, Duration>,
    failing: HashSet<StreamSource>,
    held: HashSet<StreamSource>,
    /// Seekable limit per source; absent means fully seekable
    buffered: HashMap<StreamSource, Duration>,
    frozen: bool,
    loads: Vec<(HandleId, StreamSource, Duration)>,
    /// Loads that arrived with prefetched bytes
    warmed: Vec<HandleId>,
    volumes: Vec<(HandleId, f32)>,
    seeks: Vec<(HandleId, Duration)>,
    released: Vec<HandleId>,
}

impl Script {
    fn send(&self, handle: HandleId, kind: BackendEventKind) {
        if let Some(events) = &self.events {
            let _ = events.send(BackendEvent::new(handle, kind));
        }
    }

    /// Move every playing voice forward; false once nobody listens
    fn advance(&mut self, by: Duration) -> bool {
        let open = self.events.as_ref().is_some_and(|tx| !tx.is_closed());
        if self.frozen {
            return open;
        }
        let mut updates = Vec::new();
        for (handle, voice) in self.voices.iter_mut().filter(|(_, v)| v.playing) {
            voice.position = (voice.position + by).min(voice.duration);
            if voice.position >= voice.duration {
                voice.playing = false;
                updates.push((*handle, BackendEventKind::Ended));
            } else {
                updates.push((
                    *handle,
                    BackendEventKind::TimeUpdate {
                        position: voice.position,
                    },
                ));
            }
        }
        for (handle, kind) in updates {
            self.send(handle, kind);
        }
        open
    }
}

/// In-memory backend driven by the paused tokio clock
///
/// Clones share state, so a test keeps one as a probe.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_duration(&self, source: StreamSource, duration: Duration) {
        self.script.lock().durations.insert(source, duration);
    }

    /// Loads of `source` fail
    pub fn fail(&self, source: StreamSource) {
        self.script.lock().failing.insert(source);
    }

    /// Loads of `source` work again
    pub fn recover(&self, source: &StreamSource) {
        self.script.lock().failing.remove(source);
    }

    /// Loads of `source` get no answer until `complete_load`
    pub fn hold(&self, source: StreamSource) {
        self.script.lock().held.insert(source);
    }

    pub fn complete_load(&self, handle: HandleId) {
        let script = self.script.lock();
        let duration = script.voices.get(&handle).map(|v| v.duration);
        script.send(handle, BackendEventKind::Loaded { duration });
    }

    /// Seeks of `source` past `limit` land where playback is
    pub fn set_buffered(&self, source: StreamSource, limit: Option<Duration>) {
        let mut script = self.script.lock();
        match limit {
            Some(limit) => script.buffered.insert(source, limit),
            None => script.buffered.remove(&source),
        };
    }

    /// Stop the clock without telling anyone
    pub fn freeze(&self, frozen: bool) {
        self.script.lock().frozen = frozen;
    }

    /// Pause the voice behind the session's back
    pub fn pause_silently(&self, handle: HandleId) {
        if let Some(voice) = self.script.lock().voices.get_mut(&handle) {
            voice.playing = false;
        }
    }

    /// Pause the voice and report it, as when the OS takes the output away
    pub fn pause_natively(&self, handle: HandleId) {
        let mut script = self.script.lock();
        if let Some(voice) = script.voices.get_mut(&handle) {
            voice.playing = false;
            script.send(handle, BackendEventKind::Paused);
        }
    }

    pub fn warmed(&self) -> Vec<HandleId> {
        self.script.lock().warmed.clone()
    }

    pub fn volumes(&self, handle: HandleId) -> Vec<f32> {
        self.script
            .lock()
            .volumes
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn loads(&self) -> Vec<(HandleId, StreamSource, Duration)> {
        self.script.lock().loads.clone()
    }

    pub fn last_handle(&self) -> Option<HandleId> {
        self.script.lock().loads.last().map(|(handle, _, _)| *handle)
    }

    pub fn seeks(&self) -> Vec<Duration> {
        self.script.lock().seeks.iter().map(|(_, p)| *p).collect()
    }

    pub fn released(&self) -> Vec<HandleId> {
        self.script.lock().released.clone()
    }

    pub fn position(&self, handle: HandleId) -> Option<Duration> {
        self.script.lock().voices.get(&handle).map(|v| v.position)
    }

    pub fn is_playing(&self, handle: HandleId) -> bool {
        self.script
            .lock()
            .voices
            .get(&handle)
            .is_some_and(|v| v.playing)
    }
}

impl MediaBackend for ScriptedBackend {
    fn attach(&mut self, events: BackendEventSender) {
        self.script.lock().events = Some(events);
        let script = self.script.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !script.lock().advance(TICK) {
                    break;
                }
            }
        });
    }

    fn load(&mut self, handle: HandleId, load: BackendLoad) {
        let mut script = self.script.lock();
        let duration = script
            .durations
            .get(&load.source)
            .copied()
            .unwrap_or(Duration::from_secs(3600));
        script
            .loads
            .push((handle, load.source.clone(), load.start_at));
        if load.warmed.is_some() {
            script.warmed.push(handle);
        }
        script.voices.insert(
            handle,
            Voice {
                source: load.source.clone(),
                position: load.start_at,
                duration,
                playing: false,
            },
        );

        if script.failing.contains(&load.source) {
            script.voices.remove(&handle);
            script.send(handle, BackendEventKind::Failed("404 Not Found".into()));
        } else if !script.held.contains(&load.source) {
            script.send(handle, BackendEventKind::Loaded {
                duration: Some(duration),
            });
        }
    }

    fn play(&mut self, handle: HandleId) {
        let mut script = self.script.lock();
        if let Some(voice) = script.voices.get_mut(&handle) {
            voice.playing = true;
            script.send(handle, BackendEventKind::Playing);
        }
    }

    fn pause(&mut self, handle: HandleId) {
        let mut script = self.script.lock();
        if let Some(voice) = script.voices.get_mut(&handle) {
            voice.playing = false;
            script.send(handle, BackendEventKind::Paused);
        }
    }

    fn stop(&mut self, handle: HandleId) {
        let mut script = self.script.lock();
        if script.voices.remove(&handle).is_some() {
            script.send(handle, BackendEventKind::Stopped);
        }
    }

    fn seek(&mut self, handle: HandleId, position: Duration) {
        let mut script = self.script.lock();
        script.seeks.push((handle, position));
        let Some(voice) = script.voices.get(&handle).cloned() else {
            return;
        };
        let landed = match script.buffered.get(&voice.source) {
            Some(limit) if position > *limit => voice.position,
            _ => position.min(voice.duration),
        };
        if let Some(voice) = script.voices.get_mut(&handle) {
            voice.position = landed;
        }
        script.send(handle, BackendEventKind::Seeked { position: landed });
    }

    fn set_volume(&mut self, handle: HandleId, volume: f32) {
        self.script.lock().volumes.push((handle, volume));
    }

    fn release(&mut self, handle: HandleId) {
        let mut script = self.script.lock();
        script.voices.remove(&handle);
        script.released.push(handle);
    }

    fn current_time(&self, handle: HandleId) -> Option<Duration> {
        self.position(handle)
    }

    fn duration(&self, handle: HandleId) -> Option<Duration> {
        self.script.lock().voices.get(&handle).map(|v| v.duration)
    }

    fn is_paused(&self, handle: HandleId) -> bool {
        !self.is_playing(handle)
    }
}

/// Cache status answered from a flag
#[derive(Clone, Default)]
pub struct ScriptedCache {
    cached: Arc<AtomicBool>,
    queries: Arc<AtomicUsize>,
}

impl ScriptedCache {
    pub fn set_cached(&self, cached: bool) {
        self.cached.store(cached, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStatusSource for ScriptedCache {
    async fn status(&self, _episode_id: &str) -> nocturne::Result<CacheStatus> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(CacheStatus {
            cached: self.cached.load(Ordering::SeqCst),
            ..Default::default()
        })
    }
}

/// Prefetcher that hands out a small in-memory payload and remembers it
#[derive(Clone, Default)]
pub struct RecordingPrefetcher {
    fetches: Arc<Mutex<Vec<(StreamSource, SharedBuffer)>>>,
}

impl RecordingPrefetcher {
    pub fn fetched(&self) -> Vec<StreamSource> {
        self.fetches.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn cancelled(&self) -> Vec<StreamSource> {
        self.fetches
            .lock()
            .iter()
            .filter(|(_, buffer)| buffer.is_cancelled())
            .map(|(s, _)| s.clone())
            .collect()
    }
}

impl Prefetcher for RecordingPrefetcher {
    fn prefetch(&self, source: &StreamSource) -> Option<Prefetch> {
        let buffer = SharedBuffer::from_bytes(vec![0; 64]);
        self.fetches.lock().push((source.clone(), buffer.clone()));
        Some(Prefetch { buffer, task: None })
    }
}

#[derive(Debug, Default)]
pub struct SurfaceLog {
    pub handlers: Option<TransportHandlers>,
    pub registrations: usize,
    pub status: SurfaceStatus,
    pub metadata: Option<NowPlayingMetadata>,
    pub reports: Vec<(Duration, bool)>,
    pub cleared: usize,
}

/// Now-playing surface that records what it was told
#[derive(Clone, Default)]
pub struct RecordingSurface {
    log: Arc<Mutex<SurfaceLog>>,
}

impl RecordingSurface {
    /// Press a transport button
    pub fn fire(&self, event: SurfaceEvent) {
        let handlers = self.log.lock().handlers.clone();
        if let Some(handlers) = handlers {
            handlers.handle(event);
        }
    }

    pub fn status(&self) -> SurfaceStatus {
        self.log.lock().status
    }

    pub fn registrations(&self) -> usize {
        self.log.lock().registrations
    }

    pub fn seeked_reports(&self) -> Vec<Duration> {
        self.log
            .lock()
            .reports
            .iter()
            .filter(|(_, seeked)| *seeked)
            .map(|(position, _)| *position)
            .collect()
    }
}

impl NowPlayingSurface for RecordingSurface {
    fn register(&mut self, handlers: TransportHandlers) {
        let mut log = self.log.lock();
        log.handlers = Some(handlers);
        log.registrations += 1;
    }

    fn set_metadata(&mut self, metadata: &NowPlayingMetadata) {
        self.log.lock().metadata = Some(metadata.clone());
    }

    fn set_playback(&mut self, status: SurfaceStatus, _position: Duration) {
        self.log.lock().status = status;
    }

    fn set_position(&mut self, position: Duration, seeked: bool) {
        self.log.lock().reports.push((position, seeked));
    }

    fn clear(&mut self) {
        let mut log = self.log.lock();
        log.status = SurfaceStatus::Stopped;
        log.metadata = None;
        log.cleared += 1;
    }
}

/// A running session wired to the doubles
pub struct Harness {
    pub handle: SessionHandle,
    pub backend: ScriptedBackend,
    pub cache: ScriptedCache,
    pub surface: RecordingSurface,
    pub prefetcher: RecordingPrefetcher,
    pub resume: Arc<MemoryResumeStore>,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub fn start(items: Vec<MediaDescriptor>) -> Self {
        Self::build(items, Settings::default(), ScriptedBackend::new(), MemoryResumeStore::new())
    }

    pub fn build(
        items: Vec<MediaDescriptor>,
        settings: Settings,
        backend: ScriptedBackend,
        resume: MemoryResumeStore,
    ) -> Self {
        for item in &items {
            if let Some(duration) = item.duration {
                backend.set_duration(item.source.clone(), duration);
            }
        }
        let cache = ScriptedCache::default();
        let surface = RecordingSurface::default();
        let prefetcher = RecordingPrefetcher::default();
        let resume = Arc::new(resume);

        let (handle, task) = PlaybackSession::spawn(SessionParts {
            backend: Box::new(backend.clone()),
            surface: Box::new(surface.clone()),
            queue: Box::new(PlayQueue::new(items)),
            cache: Arc::new(cache.clone()),
            prefetcher: Arc::new(prefetcher.clone()),
            resume: resume.clone(),
            settings,
        });

        Self {
            handle,
            backend,
            cache,
            surface,
            prefetcher,
            resume,
            task,
        }
    }

    /// Let every queued message run
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    /// Wait (in virtual time) until the session reaches `state`
    pub async fn wait_for(&self, state: PlaybackState) {
        let mut rx = self.handle.subscribe_state();
        let reached = tokio::time::timeout(Duration::from_secs(600), async {
            rx.wait_for(|ctx| ctx.state == state).await.is_ok()
        })
        .await;
        assert!(
            matches!(reached, Ok(true)),
            "never reached {state}, stuck in {}",
            self.handle.state().state
        );
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.handle.snapshot().await.expect("session is running")
    }
}
