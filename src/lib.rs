//! Nocturne - playback core for a personal media-streaming client
//!
//! Plays tracks, audiobooks and cache-gated podcast episodes from a remote
//! server and keeps the OS now-playing surface in step with what is
//! actually audible.

pub mod bridge;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod media;
pub mod queue;
pub mod remote;
pub mod resume;
pub mod seek;
pub mod session;
pub mod settings;
pub mod state_machine;

pub use bridge::{NowPlayingSurface, OsSessionBridge, platform_surface};
pub use engine::{EngineEvent, MediaBackend, MediaEngine, RodioBackend};
pub use error::{PlaybackError, Result};
pub use media::{MediaCategory, MediaDescriptor, MediaKind, StreamSource};
pub use queue::{PlayMode, PlayQueue, QueueProvider};
pub use remote::{CacheStatus, CacheStatusSource, HttpCacheStatus, HttpPrefetcher, StreamLocator};
pub use resume::{MemoryResumeStore, ResumeStore, SqliteResumeStore};
pub use session::{PlaybackSession, SeekDirection, SessionHandle, SessionParts, SessionSnapshot};
pub use settings::Settings;
pub use state_machine::{PlaybackContext, PlaybackState, PlaybackStateMachine};
