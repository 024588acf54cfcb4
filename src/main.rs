//! Nocturne - headless player for a personal media server
//!
//! Usage: `nocturne <item>...` where each item is a local path, a URL, or
//! `track:<id>`, `audiobook:<id>`, `episode:<podcast id>/<episode id>` on
//! the configured server.

use std::path::PathBuf;
use std::sync::Arc;

use nocturne::{
    HttpCacheStatus, HttpPrefetcher, MediaDescriptor, MemoryResumeStore, PlayQueue,
    PlaybackSession, PlaybackState, QueueProvider, ResumeStore, RodioBackend, SessionParts,
    Settings, SqliteResumeStore, StreamLocator, StreamSource, platform_surface,
    remote::build_client,
};

/// Turn one command line argument into a queue item
fn parse_item(arg: &str, locator: &StreamLocator) -> Option<MediaDescriptor> {
    if let Some(id) = arg.strip_prefix("track:") {
        return Some(MediaDescriptor::track(id, id, locator.track(id)));
    }
    if let Some(id) = arg.strip_prefix("audiobook:") {
        return Some(MediaDescriptor::audiobook(id, id, locator.audiobook(id)));
    }
    if let Some(rest) = arg.strip_prefix("episode:") {
        let (podcast_id, episode_id) = rest.split_once('/')?;
        return Some(MediaDescriptor::podcast_episode(
            episode_id,
            podcast_id,
            episode_id,
            locator.podcast_episode(podcast_id, episode_id),
        ));
    }
    if arg.starts_with("http://") || arg.starts_with("https://") {
        return Some(MediaDescriptor::track(arg, arg, StreamSource::Url(arg.to_string())));
    }

    let path = PathBuf::from(arg);
    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| arg.to_string());
    Some(MediaDescriptor::track(arg, title, StreamSource::File(path)))
}

async fn open_resume_store(settings: &Settings) -> Arc<dyn ResumeStore> {
    let path = settings
        .resume
        .database_path
        .clone()
        .or_else(Settings::default_database_path);
    if let Some(path) = path {
        match SqliteResumeStore::open(&path).await {
            Ok(store) => return Arc::new(store),
            Err(e) => tracing::warn!("Resume database unavailable, offsets kept in memory: {:#}", e),
        }
    }
    Arc::new(MemoryResumeStore::new())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let settings = Settings::load();
    let locator = StreamLocator::new(settings.server.base_url.clone());

    let items: Vec<MediaDescriptor> = std::env::args()
        .skip(1)
        .filter_map(|arg| {
            let item = parse_item(&arg, &locator);
            if item.is_none() {
                tracing::warn!("Ignoring unrecognised item {}", arg);
            }
            item
        })
        .collect();
    let queue = PlayQueue::new(items);
    if queue.is_empty() {
        eprintln!("usage: nocturne <path|url|track:ID|audiobook:ID|episode:PODCAST/EPISODE>...");
        return Ok(());
    }

    let client = build_client(&settings.server)?;
    let backend = RodioBackend::spawn(settings.engine.output_device.clone(), client.clone())?;
    let resume = open_resume_store(&settings).await;

    let parts = SessionParts {
        backend: Box::new(backend),
        surface: platform_surface(&settings.bridge.display_name),
        queue: Box::new(queue),
        cache: Arc::new(HttpCacheStatus::new(client.clone(), locator)),
        prefetcher: Arc::new(HttpPrefetcher::new(client)),
        resume,
        settings,
    };
    let (handle, session) = PlaybackSession::spawn(parts);
    handle.play_queue_from(0);

    let mut state = handle.subscribe_state();
    let finished = async move {
        let mut started = false;
        while state.changed().await.is_ok() {
            let context = state.borrow_and_update().clone();
            match context.state {
                PlaybackState::Playing => started = true,
                PlaybackState::Idle if started => break,
                PlaybackState::Error => {
                    tracing::error!(
                        "Playback error {}: {}",
                        context.error_code.unwrap_or_default(),
                        context.error.unwrap_or_default()
                    );
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = finished => tracing::info!("Queue finished"),
    }

    handle.shutdown();
    session.await?;
    Ok(())
}
