//! MPRIS D-Bus surface (Linux)

use std::sync::Arc;
use std::time::Duration;

use mpris_server::{
    LocalPlayerInterface, LocalRootInterface, LocalServer, LoopStatus, Metadata, PlaybackRate,
    PlaybackStatus, Property, Signal, Time, TrackId, Volume,
    zbus::{Result, fdo},
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    Capabilities, LiveCell, LiveReader, NowPlayingMetadata, NowPlayingSurface, SurfaceEvent,
    SurfaceStatus, TransportHandlers,
};

fn to_mpris_metadata(meta: &NowPlayingMetadata) -> Metadata {
    let object_id: String = meta
        .id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut builder = Metadata::builder().trackid(
        TrackId::try_from(format!("/org/nocturne/track/t{}", object_id))
            .unwrap_or(TrackId::NO_TRACK),
    );

    builder = builder.title(&meta.title);
    if !meta.artist.is_empty() {
        builder = builder.artist([meta.artist.as_str()]);
    }
    if let Some(album) = &meta.album {
        builder = builder.album(album);
    }
    if let Some(length) = meta.duration {
        builder = builder.length(to_time(length));
    }
    if let Some(art_url) = meta.art_url() {
        builder = builder.art_url(art_url);
    }
    builder.build()
}

fn to_time(duration: Duration) -> Time {
    Time::from_micros(duration.as_micros() as i64)
}

fn to_status(status: SurfaceStatus) -> PlaybackStatus {
    match status {
        SurfaceStatus::Playing => PlaybackStatus::Playing,
        SurfaceStatus::Paused => PlaybackStatus::Paused,
        SurfaceStatus::Stopped => PlaybackStatus::Stopped,
    }
}

/// Values answered to D-Bus property reads
#[derive(Debug, Clone, Default)]
struct Shared {
    status: SurfaceStatus,
    metadata: Option<NowPlayingMetadata>,
    position: Duration,
    capabilities: Option<Capabilities>,
}

impl Shared {
    fn properties(&self) -> Vec<Property> {
        let caps = self.capabilities;
        vec![
            Property::PlaybackStatus(to_status(self.status)),
            Property::Metadata(
                self.metadata
                    .as_ref()
                    .map(to_mpris_metadata)
                    .unwrap_or_default(),
            ),
            Property::CanGoNext(caps.is_some_and(|c| c.can_go_next)),
            Property::CanGoPrevious(caps.is_some_and(|c| c.can_go_previous)),
            Property::CanPlay(self.metadata.is_some()),
            Property::CanPause(self.metadata.is_some()),
            Property::CanSeek(caps.is_some_and(|c| c.can_seek)),
        ]
    }
}

enum Update {
    Properties,
    Seeked(Duration),
}

struct MprisPlayer {
    shared: Arc<Mutex<Shared>>,
    handlers: LiveReader<Option<TransportHandlers>>,
    identity: String,
}

impl MprisPlayer {
    fn fire(&self, event: SurfaceEvent) {
        self.handlers.with(|handlers| match handlers {
            Some(handlers) => handlers.handle(event),
            None => tracing::debug!("MPRIS {:?} before handlers were installed", event),
        });
    }
}

impl LocalRootInterface for MprisPlayer {
    async fn raise(&self) -> fdo::Result<()> {
        Ok(())
    }

    async fn quit(&self) -> fdo::Result<()> {
        Ok(())
    }

    async fn can_quit(&self) -> fdo::Result<bool> {
        Ok(false)
    }

    async fn fullscreen(&self) -> fdo::Result<bool> {
        Ok(false)
    }

    async fn set_fullscreen(&self, _fullscreen: bool) -> Result<()> {
        Ok(())
    }

    async fn can_set_fullscreen(&self) -> fdo::Result<bool> {
        Ok(false)
    }

    async fn can_raise(&self) -> fdo::Result<bool> {
        Ok(false)
    }

    async fn has_track_list(&self) -> fdo::Result<bool> {
        Ok(false)
    }

    async fn identity(&self) -> fdo::Result<String> {
        Ok(self.identity.clone())
    }

    async fn desktop_entry(&self) -> fdo::Result<String> {
        Ok("nocturne".to_string())
    }

    async fn supported_uri_schemes(&self) -> fdo::Result<Vec<String>> {
        Ok(vec!["http".to_string(), "https".to_string(), "file".to_string()])
    }

    async fn supported_mime_types(&self) -> fdo::Result<Vec<String>> {
        Ok(vec![
            "audio/mpeg".to_string(),
            "audio/ogg".to_string(),
            "audio/flac".to_string(),
            "audio/mp4".to_string(),
        ])
    }
}

impl LocalPlayerInterface for MprisPlayer {
    async fn next(&self) -> fdo::Result<()> {
        self.fire(SurfaceEvent::Next);
        Ok(())
    }

    async fn previous(&self) -> fdo::Result<()> {
        self.fire(SurfaceEvent::Previous);
        Ok(())
    }

    async fn pause(&self) -> fdo::Result<()> {
        self.fire(SurfaceEvent::Pause);
        Ok(())
    }

    async fn play(&self) -> fdo::Result<()> {
        self.fire(SurfaceEvent::Play);
        Ok(())
    }

    async fn play_pause(&self) -> fdo::Result<()> {
        self.fire(SurfaceEvent::Toggle);
        Ok(())
    }

    async fn stop(&self) -> fdo::Result<()> {
        self.fire(SurfaceEvent::Stop);
        Ok(())
    }

    async fn seek(&self, offset: Time) -> fdo::Result<()> {
        let micros = offset.as_micros();
        self.fire(SurfaceEvent::SeekBy {
            forward: micros >= 0,
            offset: Duration::from_micros(micros.unsigned_abs()),
        });
        Ok(())
    }

    async fn set_position(&self, _track_id: TrackId, position: Time) -> fdo::Result<()> {
        self.fire(SurfaceEvent::SetPosition(Duration::from_micros(
            position.as_micros().max(0) as u64,
        )));
        Ok(())
    }

    async fn open_uri(&self, _uri: String) -> fdo::Result<()> {
        Ok(())
    }

    async fn playback_status(&self) -> fdo::Result<PlaybackStatus> {
        Ok(to_status(self.shared.lock().status))
    }

    async fn loop_status(&self) -> fdo::Result<LoopStatus> {
        Ok(LoopStatus::None)
    }

    async fn set_loop_status(&self, _loop_status: LoopStatus) -> Result<()> {
        Ok(())
    }

    async fn rate(&self) -> fdo::Result<PlaybackRate> {
        Ok(PlaybackRate::default())
    }

    async fn set_rate(&self, _rate: PlaybackRate) -> Result<()> {
        Ok(())
    }

    async fn shuffle(&self) -> fdo::Result<bool> {
        Ok(false)
    }

    async fn set_shuffle(&self, _shuffle: bool) -> Result<()> {
        Ok(())
    }

    async fn metadata(&self) -> fdo::Result<Metadata> {
        let shared = self.shared.lock();
        Ok(shared
            .metadata
            .as_ref()
            .map(to_mpris_metadata)
            .unwrap_or_default())
    }

    async fn volume(&self) -> fdo::Result<Volume> {
        Ok(1.0)
    }

    async fn set_volume(&self, volume: Volume) -> Result<()> {
        self.fire(SurfaceEvent::SetVolume(volume));
        Ok(())
    }

    async fn position(&self) -> fdo::Result<Time> {
        Ok(to_time(self.shared.lock().position))
    }

    async fn minimum_rate(&self) -> fdo::Result<PlaybackRate> {
        Ok(PlaybackRate::default())
    }

    async fn maximum_rate(&self) -> fdo::Result<PlaybackRate> {
        Ok(PlaybackRate::default())
    }

    async fn can_go_next(&self) -> fdo::Result<bool> {
        Ok(self.shared.lock().capabilities.is_some_and(|c| c.can_go_next))
    }

    async fn can_go_previous(&self) -> fdo::Result<bool> {
        Ok(self
            .shared
            .lock()
            .capabilities
            .is_some_and(|c| c.can_go_previous))
    }

    async fn can_play(&self) -> fdo::Result<bool> {
        Ok(self.shared.lock().metadata.is_some())
    }

    async fn can_pause(&self) -> fdo::Result<bool> {
        Ok(self.shared.lock().metadata.is_some())
    }

    async fn can_seek(&self) -> fdo::Result<bool> {
        Ok(self.shared.lock().capabilities.is_some_and(|c| c.can_seek))
    }

    async fn can_control(&self) -> fdo::Result<bool> {
        Ok(true)
    }
}

/// MPRIS server on its own thread
pub struct MprisSurface {
    shared: Arc<Mutex<Shared>>,
    handlers: LiveCell<Option<TransportHandlers>>,
    updates: mpsc::UnboundedSender<Update>,
}

impl MprisSurface {
    pub fn start(display_name: &str) -> Self {
        let (updates, update_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let handlers = LiveCell::new(None);
        let player = MprisPlayer {
            shared: shared.clone(),
            handlers: handlers.reader(),
            identity: display_name.to_string(),
        };
        let bus_name: String = display_name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        // LocalServer is !Send; it gets a current-thread runtime of its own
        let spawned = std::thread::Builder::new()
            .name("mpris".to_string())
            .spawn(move || run_server(bus_name, player, update_rx));
        if let Err(e) = spawned {
            tracing::warn!("Failed to start MPRIS thread: {}", e);
        }

        Self {
            shared,
            handlers,
            updates,
        }
    }

    fn publish(&self) {
        let _ = self.updates.send(Update::Properties);
    }
}

fn run_server(bus_name: String, player: MprisPlayer, mut updates: mpsc::UnboundedReceiver<Update>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::warn!("Failed to create runtime for MPRIS: {}", e);
            return;
        }
    };

    let shared = player.shared.clone();
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async move {
        let server = match LocalServer::new(&bus_name, player).await {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!("MPRIS unavailable: {}", e);
                return;
            }
        };
        tracing::info!("MPRIS server registered as {}", bus_name);

        tokio::select! {
            _ = server.run() => {}
            _ = async {
                while let Some(update) = updates.recv().await {
                    let result = match update {
                        Update::Properties => {
                            let properties = shared.lock().properties();
                            server.properties_changed(properties).await
                        }
                        Update::Seeked(position) => {
                            server
                                .emit(Signal::Seeked {
                                    position: to_time(position),
                                })
                                .await
                        }
                    };
                    if let Err(e) = result {
                        tracing::debug!("MPRIS update failed: {}", e);
                    }
                }
            } => {}
        }
    });
}

impl NowPlayingSurface for MprisSurface {
    fn register(&mut self, handlers: TransportHandlers) {
        self.shared.lock().capabilities = Some(handlers.capabilities());
        self.handlers.set(Some(handlers));
        self.publish();
    }

    fn set_metadata(&mut self, metadata: &NowPlayingMetadata) {
        self.shared.lock().metadata = Some(metadata.clone());
        self.publish();
    }

    fn set_playback(&mut self, status: SurfaceStatus, position: Duration) {
        {
            let mut shared = self.shared.lock();
            shared.status = status;
            shared.position = position;
        }
        self.publish();
    }

    fn set_position(&mut self, position: Duration, seeked: bool) {
        self.shared.lock().position = position;
        if seeked {
            let _ = self.updates.send(Update::Seeked(position));
        }
    }

    fn clear(&mut self) {
        {
            let mut shared = self.shared.lock();
            shared.status = SurfaceStatus::Stopped;
            shared.metadata = None;
            shared.position = Duration::ZERO;
        }
        self.publish();
    }
}
