//! Hardware playback seam
//!
//! A backend drives audio handles identified by the engine's load epoch.
//! Commands are fire-and-forget; outcomes come back as `BackendEvent`s on the
//! channel passed to `attach`, tagged with the handle they concern.

use std::time::Duration;

use tokio::sync::mpsc;

use super::streaming::SharedBuffer;
use crate::media::StreamSource;

/// Handle id, equal to the load epoch that created it
pub type HandleId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEventKind {
    /// Stream acquired and decodable
    Loaded { duration: Option<Duration> },
    /// Acquisition or playback failed
    Failed(String),
    Playing,
    Paused,
    Stopped,
    /// Reached the end of the stream
    Ended,
    /// A seek completed; `position` is where playback actually is
    Seeked { position: Duration },
    TimeUpdate { position: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendEvent {
    pub handle: HandleId,
    pub kind: BackendEventKind,
}

impl BackendEvent {
    pub fn new(handle: HandleId, kind: BackendEventKind) -> Self {
        Self { handle, kind }
    }
}

pub type BackendEventSender = mpsc::UnboundedSender<BackendEvent>;
pub type BackendEventReceiver = mpsc::UnboundedReceiver<BackendEvent>;

pub fn backend_event_channel() -> (BackendEventSender, BackendEventReceiver) {
    mpsc::unbounded_channel()
}

/// A load as the backend sees it
#[derive(Debug, Clone)]
pub struct BackendLoad {
    pub source: StreamSource,
    /// Bytes fetched ahead of time for this source
    pub warmed: Option<SharedBuffer>,
    /// Initial position
    pub start_at: Duration,
}

/// Audio output capable of hosting playback handles
pub trait MediaBackend: Send {
    /// Connect the event stream; called once before any command
    fn attach(&mut self, events: BackendEventSender);

    /// Create `handle` for `load`; it stays paused until `play`
    fn load(&mut self, handle: HandleId, load: BackendLoad);

    fn play(&mut self, handle: HandleId);

    fn pause(&mut self, handle: HandleId);

    fn stop(&mut self, handle: HandleId);

    fn seek(&mut self, handle: HandleId, position: Duration);

    fn set_volume(&mut self, handle: HandleId, volume: f32);

    /// Tear the handle down; no further events are sent for it
    fn release(&mut self, handle: HandleId);

    /// Actual hardware position, bypassing any cached state
    fn current_time(&self, handle: HandleId) -> Option<Duration>;

    fn duration(&self, handle: HandleId) -> Option<Duration>;

    fn is_paused(&self, handle: HandleId) -> bool;
}
