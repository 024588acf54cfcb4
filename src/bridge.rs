//! OS now-playing integration
//!
//! The bridge keeps the lock screen and hardware media keys in step with the
//! session without re-registering anything on ordinary state churn:
//! - the transport handler set is installed once per media category
//! - handlers carry no playback values; relative skips are resolved by the
//!   session against the pending seek target or the live position
//! - the playing/paused flag only follows confirmed engine events
//! - position reports are throttled and re-assert the flag afterwards
//! - identical actions fired in quick succession are dropped

mod cell;
#[cfg(target_os = "linux")]
mod mpris;
#[cfg(any(target_os = "windows", target_os = "macos"))]
mod souvlaki_impl;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub use cell::{LiveCell, LiveReader};

use crate::engine::EngineEvent;
use crate::media::{Artwork, MediaCategory, MediaDescriptor};
use crate::session::SeekDirection;
use crate::session::timers::Mailbox;
use crate::settings::BridgeSettings;

/// Raw transport event from the OS surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceEvent {
    Play,
    Pause,
    Toggle,
    Stop,
    Next,
    Previous,
    SeekBy { forward: bool, offset: Duration },
    SetPosition(Duration),
    SetVolume(f64),
}

/// Request delivered to the session
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MediaAction {
    Play,
    Pause,
    Toggle,
    Stop,
    Next,
    Previous,
    SeekTo(Duration),
    SeekBy {
        direction: SeekDirection,
        offset: Duration,
    },
    SetVolume(f32),
}

/// Playing/paused indicator shown by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceStatus {
    Playing,
    Paused,
    #[default]
    Stopped,
}

/// Buttons the surface should enable
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capabilities {
    pub can_go_next: bool,
    pub can_go_previous: bool,
    pub can_seek: bool,
    /// Set when next/previous skip within the item
    pub skip_interval: Option<Duration>,
}

/// Metadata pushed to the surface
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NowPlayingMetadata {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration: Option<Duration>,
    pub artwork: Vec<Artwork>,
}

impl NowPlayingMetadata {
    pub fn from_media(media: &MediaDescriptor) -> Self {
        Self {
            id: media.id.clone(),
            title: media.title.clone(),
            artist: media.subtitle().to_string(),
            album: media.collection().map(str::to_string),
            duration: media.duration,
            artwork: media.artwork.clone(),
        }
    }

    /// Largest rendition, for surfaces taking a single URL
    pub fn art_url(&self) -> Option<&str> {
        self.artwork
            .iter()
            .max_by_key(|art| art.size)
            .map(|art| art.url.as_str())
    }
}

/// Drops an action identical to the previous one inside the window
#[derive(Debug)]
struct ActionFilter {
    window: Duration,
    last: Mutex<Option<(MediaAction, Instant)>>,
}

impl ActionFilter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    fn admit(&self, action: MediaAction) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        if let Some((previous, at)) = *last {
            if previous == action && now.saturating_duration_since(at) < self.window {
                return false;
            }
        }
        *last = Some((action, now));
        true
    }
}

/// Handler set installed on the surface for one media category
#[derive(Clone)]
pub struct TransportHandlers {
    category: MediaCategory,
    capabilities: Capabilities,
    dispatch: Arc<dyn Fn(SurfaceEvent) + Send + Sync>,
}

impl std::fmt::Debug for TransportHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandlers")
            .field("category", &self.category)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl TransportHandlers {
    fn new(
        category: MediaCategory,
        skip: Duration,
        filter: Arc<ActionFilter>,
        mailbox: Mailbox<MediaAction>,
    ) -> Self {
        let capabilities = Capabilities {
            can_go_next: true,
            can_go_previous: true,
            can_seek: true,
            skip_interval: match category {
                MediaCategory::ShortForm => None,
                MediaCategory::LongForm => Some(skip),
            },
        };

        let seek_relative = |forward: bool, offset: Duration| MediaAction::SeekBy {
            direction: if forward {
                SeekDirection::Forward
            } else {
                SeekDirection::Backward
            },
            offset,
        };

        let dispatch = move |event: SurfaceEvent| {
            let action = match event {
                SurfaceEvent::Play => MediaAction::Play,
                SurfaceEvent::Pause => MediaAction::Pause,
                SurfaceEvent::Toggle => MediaAction::Toggle,
                SurfaceEvent::Stop => MediaAction::Stop,
                SurfaceEvent::Next => match category {
                    MediaCategory::ShortForm => MediaAction::Next,
                    MediaCategory::LongForm => seek_relative(true, skip),
                },
                SurfaceEvent::Previous => match category {
                    MediaCategory::ShortForm => MediaAction::Previous,
                    MediaCategory::LongForm => seek_relative(false, skip),
                },
                SurfaceEvent::SeekBy { forward, offset } => seek_relative(forward, offset),
                SurfaceEvent::SetPosition(position) => MediaAction::SeekTo(position),
                SurfaceEvent::SetVolume(volume) => {
                    MediaAction::SetVolume(volume.clamp(0.0, 1.0) as f32)
                }
            };

            if filter.admit(action) {
                tracing::debug!("Surface {:?} -> {:?}", event, action);
                mailbox.send(action);
            } else {
                tracing::debug!("Dropping repeated {:?}", action);
            }
        };

        Self {
            category,
            capabilities,
            dispatch: Arc::new(dispatch),
        }
    }

    pub fn category(&self) -> MediaCategory {
        self.category
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Entry point for platform callbacks
    pub fn handle(&self, event: SurfaceEvent) {
        (self.dispatch)(event);
    }
}

/// An OS now-playing surface
pub trait NowPlayingSurface: Send {
    /// Replace the installed handler set
    fn register(&mut self, handlers: TransportHandlers);
    fn set_metadata(&mut self, metadata: &NowPlayingMetadata);
    fn set_playback(&mut self, status: SurfaceStatus, position: Duration);
    /// `seeked` marks a discontinuity rather than ordinary progress
    fn set_position(&mut self, position: Duration, seeked: bool);
    fn clear(&mut self);
}

/// Surface for platforms without media controls
#[derive(Debug, Default)]
pub struct NoopSurface;

impl NowPlayingSurface for NoopSurface {
    fn register(&mut self, _handlers: TransportHandlers) {}
    fn set_metadata(&mut self, _metadata: &NowPlayingMetadata) {}
    fn set_playback(&mut self, _status: SurfaceStatus, _position: Duration) {}
    fn set_position(&mut self, _position: Duration, _seeked: bool) {}
    fn clear(&mut self) {}
}

/// Native surface for the current platform
#[cfg(target_os = "linux")]
pub fn platform_surface(display_name: &str) -> Box<dyn NowPlayingSurface> {
    Box::new(mpris::MprisSurface::start(display_name))
}

/// Native surface for the current platform
#[cfg(any(target_os = "windows", target_os = "macos"))]
pub fn platform_surface(display_name: &str) -> Box<dyn NowPlayingSurface> {
    Box::new(souvlaki_impl::SouvlakiSurface::start(display_name))
}

/// Native surface for the current platform
#[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
pub fn platform_surface(_display_name: &str) -> Box<dyn NowPlayingSurface> {
    Box::new(NoopSurface)
}

pub struct OsSessionBridge {
    surface: Box<dyn NowPlayingSurface>,
    settings: BridgeSettings,
    mailbox: Mailbox<MediaAction>,
    filter: Arc<ActionFilter>,
    category: Option<MediaCategory>,
    metadata: Option<NowPlayingMetadata>,
    position: LiveCell<Duration>,
    status: SurfaceStatus,
    last_report: Option<Instant>,
}

impl std::fmt::Debug for OsSessionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsSessionBridge")
            .field("category", &self.category)
            .field("status", &self.status)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl OsSessionBridge {
    pub fn new(
        surface: Box<dyn NowPlayingSurface>,
        settings: BridgeSettings,
        mailbox: Mailbox<MediaAction>,
    ) -> Self {
        let filter = Arc::new(ActionFilter::new(settings.action_dedup_window));
        Self {
            surface,
            settings,
            mailbox,
            filter,
            category: None,
            metadata: None,
            position: LiveCell::default(),
            status: SurfaceStatus::Stopped,
            last_report: None,
        }
    }

    pub fn status(&self) -> SurfaceStatus {
        self.status
    }

    pub fn category(&self) -> Option<MediaCategory> {
        self.category
    }

    pub fn position(&self) -> LiveReader<Duration> {
        self.position.reader()
    }

    /// Media changed; handlers are swapped only when the category differs
    pub fn set_media(&mut self, media: &MediaDescriptor) {
        let category = media.category();
        if self.category != Some(category) {
            tracing::info!("Installing {:?} transport handlers", category);
            self.surface.register(TransportHandlers::new(
                category,
                self.settings.long_form_skip,
                self.filter.clone(),
                self.mailbox.clone(),
            ));
            self.category = Some(category);
        }

        let metadata = NowPlayingMetadata::from_media(media);
        self.position.set(media.resume_offset.unwrap_or_default());
        self.surface.set_metadata(&metadata);
        self.metadata = Some(metadata);
        self.last_report = None;
    }

    pub fn on_engine_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Load { duration } => {
                if let Some(metadata) = self.metadata.as_mut() {
                    if duration.is_some() && metadata.duration != *duration {
                        metadata.duration = *duration;
                        self.surface.set_metadata(metadata);
                    }
                }
            }
            EngineEvent::Play => self.set_status(SurfaceStatus::Playing),
            EngineEvent::Pause { .. } | EngineEvent::End => self.set_status(SurfaceStatus::Paused),
            EngineEvent::Stop => self.set_status(SurfaceStatus::Stopped),
            EngineEvent::TimeUpdate { position } => {
                self.position.set(*position);
                self.report_position(false);
            }
            EngineEvent::Seek { position } => {
                self.position.set(*position);
                self.report_position(true);
            }
            EngineEvent::LoadError(_) | EngineEvent::PlayError(_) | EngineEvent::Volume { .. } => {}
        }
    }

    fn set_status(&mut self, status: SurfaceStatus) {
        self.status = status;
        self.surface.set_playback(status, self.position.get());
    }

    fn report_position(&mut self, force: bool) {
        let now = Instant::now();
        let due = self.last_report.is_none_or(|at| {
            now.saturating_duration_since(at) >= self.settings.position_report_interval
        });
        if !force && !due {
            return;
        }
        let position = self.position.get();
        self.surface.set_position(position, force);
        // some surfaces drop the flag when the position changes
        self.surface.set_playback(self.status, position);
        self.last_report = Some(now);
    }

    /// Foreground return: take the hardware's word for position and flag
    pub fn resync(&mut self, position: Duration, playing: bool) {
        self.position.set(position);
        if playing {
            self.status = SurfaceStatus::Playing;
        } else if self.status == SurfaceStatus::Playing {
            self.status = SurfaceStatus::Paused;
        }
        self.report_position(true);
    }

    /// Nothing is loaded any more
    pub fn clear(&mut self) {
        self.surface.clear();
        self.category = None;
        self.metadata = None;
        self.status = SurfaceStatus::Stopped;
        self.position.set(Duration::ZERO);
        self.last_report = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StreamSource;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Register(MediaCategory),
        Metadata(String),
        Playback(SurfaceStatus),
        Position(Duration, bool),
        Clear,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
        handlers: Arc<Mutex<Option<TransportHandlers>>>,
    }

    impl NowPlayingSurface for Recorder {
        fn register(&mut self, handlers: TransportHandlers) {
            self.calls.lock().push(Call::Register(handlers.category()));
            *self.handlers.lock() = Some(handlers);
        }
        fn set_metadata(&mut self, metadata: &NowPlayingMetadata) {
            self.calls.lock().push(Call::Metadata(metadata.title.clone()));
        }
        fn set_playback(&mut self, status: SurfaceStatus, _position: Duration) {
            self.calls.lock().push(Call::Playback(status));
        }
        fn set_position(&mut self, position: Duration, seeked: bool) {
            self.calls.lock().push(Call::Position(position, seeked));
        }
        fn clear(&mut self) {
            self.calls.lock().push(Call::Clear);
        }
    }

    impl Recorder {
        fn fire(&self, event: SurfaceEvent) {
            let handlers = self.handlers.lock().clone();
            if let Some(handlers) = handlers {
                handlers.handle(event);
            }
        }
    }

    fn bridge() -> (OsSessionBridge, Recorder, mpsc::UnboundedReceiver<MediaAction>) {
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = OsSessionBridge::new(
            Box::new(recorder.clone()),
            BridgeSettings::default(),
            Mailbox::from_sender(tx, |a| a),
        );
        (bridge, recorder, rx)
    }

    fn track(id: &str) -> MediaDescriptor {
        MediaDescriptor::track(id, id.to_uppercase(), StreamSource::Url(format!("http://h/{id}")))
    }

    fn book(id: &str) -> MediaDescriptor {
        MediaDescriptor::audiobook(id, id.to_uppercase(), StreamSource::Url(format!("http://h/{id}")))
            .with_duration(Duration::from_secs(3600))
    }

    fn registrations(recorder: &Recorder) -> usize {
        recorder
            .calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Register(_)))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn handlers_installed_once_per_category() {
        let (mut bridge, recorder, _rx) = bridge();
        bridge.set_media(&track("a"));
        bridge.set_media(&track("b"));
        bridge.on_engine_event(&EngineEvent::Play);
        bridge.on_engine_event(&EngineEvent::Pause { commanded: true });
        assert_eq!(registrations(&recorder), 1);

        bridge.set_media(&book("c"));
        assert_eq!(registrations(&recorder), 2);
        assert_eq!(bridge.category(), Some(MediaCategory::LongForm));
    }

    #[tokio::test(start_paused = true)]
    async fn long_form_next_skips_within_item() {
        let (mut bridge, recorder, mut rx) = bridge();
        bridge.set_media(&book("c"));
        bridge.on_engine_event(&EngineEvent::TimeUpdate {
            position: Duration::from_secs(100),
        });

        recorder.fire(SurfaceEvent::Next);
        assert_eq!(
            rx.try_recv().unwrap(),
            MediaAction::SeekBy {
                direction: SeekDirection::Forward,
                offset: Duration::from_secs(30),
            }
        );
        recorder.fire(SurfaceEvent::Previous);
        assert_eq!(
            rx.try_recv().unwrap(),
            MediaAction::SeekBy {
                direction: SeekDirection::Backward,
                offset: Duration::from_secs(30),
            }
        );
        recorder.fire(SurfaceEvent::SetPosition(Duration::from_secs(5)));
        assert_eq!(
            rx.try_recv().unwrap(),
            MediaAction::SeekTo(Duration::from_secs(5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_action_inside_window_is_dropped() {
        let (mut bridge, recorder, mut rx) = bridge();
        bridge.set_media(&track("a"));

        recorder.fire(SurfaceEvent::Next);
        recorder.fire(SurfaceEvent::Next);
        assert_eq!(rx.try_recv().unwrap(), MediaAction::Next);
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(300)).await;
        recorder.fire(SurfaceEvent::Next);
        assert_eq!(rx.try_recv().unwrap(), MediaAction::Next);
    }

    #[tokio::test(start_paused = true)]
    async fn position_reports_are_throttled_and_reassert_flag() {
        let (mut bridge, recorder, _rx) = bridge();
        bridge.set_media(&track("a"));
        bridge.on_engine_event(&EngineEvent::Play);
        recorder.calls.lock().clear();

        for s in 1..=4 {
            bridge.on_engine_event(&EngineEvent::TimeUpdate {
                position: Duration::from_secs(s),
            });
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert_eq!(
            *recorder.calls.lock(),
            vec![
                Call::Position(Duration::from_secs(1), false),
                Call::Playback(SurfaceStatus::Playing),
            ]
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        bridge.on_engine_event(&EngineEvent::TimeUpdate {
            position: Duration::from_secs(6),
        });
        assert_eq!(recorder.calls.lock().len(), 4);

        // seeks always go out
        bridge.on_engine_event(&EngineEvent::Seek {
            position: Duration::from_secs(50),
        });
        assert_eq!(
            recorder.calls.lock()[4],
            Call::Position(Duration::from_secs(50), true)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resync_takes_hardware_state() {
        let (mut bridge, recorder, _rx) = bridge();
        bridge.set_media(&track("a"));
        bridge.on_engine_event(&EngineEvent::Play);
        bridge.resync(Duration::from_secs(42), false);

        assert_eq!(bridge.status(), SurfaceStatus::Paused);
        assert_eq!(bridge.position().get(), Duration::from_secs(42));
        assert!(
            recorder
                .calls
                .lock()
                .contains(&Call::Position(Duration::from_secs(42), true))
        );
    }
}
