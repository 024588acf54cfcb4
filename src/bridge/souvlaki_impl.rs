//! System media controls via souvlaki (Windows SMTC, macOS MPNowPlayingInfoCenter)

use std::sync::mpsc;
use std::time::Duration;

use souvlaki::{
    MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, MediaPosition, PlatformConfig,
    SeekDirection,
};

use super::{
    LiveCell, LiveReader, NowPlayingMetadata, NowPlayingSurface, SurfaceEvent, SurfaceStatus,
    TransportHandlers,
};

/// Fallback step for direction-only seek events
const DEFAULT_SEEK_STEP: Duration = Duration::from_secs(10);

enum Update {
    Metadata(NowPlayingMetadata),
    Playback(SurfaceStatus, Duration),
    Clear,
}

fn to_playback(status: SurfaceStatus, position: Duration) -> MediaPlayback {
    match status {
        SurfaceStatus::Playing => MediaPlayback::Playing {
            progress: Some(MediaPosition(position)),
        },
        SurfaceStatus::Paused => MediaPlayback::Paused {
            progress: Some(MediaPosition(position)),
        },
        SurfaceStatus::Stopped => MediaPlayback::Stopped,
    }
}

fn to_surface_event(event: MediaControlEvent, skip: Option<Duration>) -> Option<SurfaceEvent> {
    let step = skip.unwrap_or(DEFAULT_SEEK_STEP);
    Some(match event {
        MediaControlEvent::Play => SurfaceEvent::Play,
        MediaControlEvent::Pause => SurfaceEvent::Pause,
        MediaControlEvent::Toggle => SurfaceEvent::Toggle,
        MediaControlEvent::Next => SurfaceEvent::Next,
        MediaControlEvent::Previous => SurfaceEvent::Previous,
        MediaControlEvent::Stop => SurfaceEvent::Stop,
        MediaControlEvent::Seek(direction) => SurfaceEvent::SeekBy {
            forward: matches!(direction, SeekDirection::Forward),
            offset: step,
        },
        MediaControlEvent::SeekBy(direction, offset) => SurfaceEvent::SeekBy {
            forward: matches!(direction, SeekDirection::Forward),
            offset,
        },
        MediaControlEvent::SetPosition(MediaPosition(position)) => {
            SurfaceEvent::SetPosition(position)
        }
        MediaControlEvent::SetVolume(volume) => SurfaceEvent::SetVolume(volume),
        MediaControlEvent::OpenUri(_) | MediaControlEvent::Raise | MediaControlEvent::Quit => {
            return None;
        }
    })
}

/// Media controls owned by a dedicated thread
pub struct SouvlakiSurface {
    handlers: LiveCell<Option<TransportHandlers>>,
    updates: mpsc::Sender<Update>,
}

impl SouvlakiSurface {
    pub fn start(display_name: &str) -> Self {
        let (updates, update_rx) = mpsc::channel();
        let handlers = LiveCell::new(None);
        let reader = handlers.reader();
        let display_name = display_name.to_string();

        let spawned = std::thread::Builder::new()
            .name("media-controls".to_string())
            .spawn(move || run_controls(display_name, reader, update_rx));
        if let Err(e) = spawned {
            tracing::warn!("Failed to start media controls thread: {}", e);
        }

        Self { handlers, updates }
    }

    fn send(&self, update: Update) {
        let _ = self.updates.send(update);
    }
}

fn run_controls(
    display_name: String,
    handlers: LiveReader<Option<TransportHandlers>>,
    updates: mpsc::Receiver<Update>,
) {
    let config = PlatformConfig {
        dbus_name: "nocturne",
        display_name: &display_name,
        hwnd: None,
    };

    let mut controls = match MediaControls::new(config) {
        Ok(controls) => controls,
        Err(e) => {
            tracing::warn!("Failed to create media controls: {:?}", e);
            return;
        }
    };

    let attached = controls.attach(move |event: MediaControlEvent| {
        handlers.with(|handlers| {
            let Some(handlers) = handlers else {
                return;
            };
            let skip = handlers.capabilities().skip_interval;
            if let Some(event) = to_surface_event(event, skip) {
                handlers.handle(event);
            }
        });
    });
    if let Err(e) = attached {
        tracing::warn!("Failed to attach media controls event handler: {:?}", e);
    }
    tracing::info!("Media controls (souvlaki) initialized");

    while let Ok(update) = updates.recv() {
        let result = match update {
            Update::Metadata(meta) => controls.set_metadata(MediaMetadata {
                title: Some(&meta.title),
                artist: Some(&meta.artist).filter(|a| !a.is_empty()).map(|a| a.as_str()),
                album: meta.album.as_deref(),
                cover_url: meta.art_url(),
                duration: meta.duration,
            }),
            Update::Playback(status, position) => {
                controls.set_playback(to_playback(status, position))
            }
            Update::Clear => controls.set_playback(MediaPlayback::Stopped),
        };
        if let Err(e) = result {
            tracing::debug!("Media controls update failed: {:?}", e);
        }
    }
}

impl NowPlayingSurface for SouvlakiSurface {
    fn register(&mut self, handlers: TransportHandlers) {
        self.handlers.set(Some(handlers));
    }

    fn set_metadata(&mut self, metadata: &NowPlayingMetadata) {
        self.send(Update::Metadata(metadata.clone()));
    }

    fn set_playback(&mut self, status: SurfaceStatus, position: Duration) {
        self.send(Update::Playback(status, position));
    }

    fn set_position(&mut self, _position: Duration, _seeked: bool) {
        // progress travels with the playback update that follows
    }

    fn clear(&mut self) {
        self.send(Update::Clear);
    }
}
