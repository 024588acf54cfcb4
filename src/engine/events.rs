//! Normalized engine events and engine-owned state

use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::PlaybackError;
use crate::media::StreamSource;

/// Event stream exposed by the engine
///
/// Only events from the live load epoch are ever emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Load { duration: Option<Duration> },
    LoadError(PlaybackError),
    PlayError(PlaybackError),
    Play,
    /// `commanded` is false when the backend paused on its own
    Pause { commanded: bool },
    Stop,
    End,
    Seek { position: Duration },
    TimeUpdate { position: Duration },
    Volume { volume: f32, muted: bool },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Load { .. } => "load",
            EngineEvent::LoadError(_) => "loaderror",
            EngineEvent::PlayError(_) => "playerror",
            EngineEvent::Play => "play",
            EngineEvent::Pause { .. } => "pause",
            EngineEvent::Stop => "stop",
            EngineEvent::End => "end",
            EngineEvent::Seek { .. } => "seek",
            EngineEvent::TimeUpdate { .. } => "timeupdate",
            EngineEvent::Volume { .. } => "volume",
        }
    }
}

pub type EngineEventSender = broadcast::Sender<EngineEvent>;
pub type EngineEventReceiver = broadcast::Receiver<EngineEvent>;

/// State owned by the engine; everyone else reads copies
#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    /// `None` exactly when no handle is live
    pub current_src: Option<StreamSource>,
    pub is_playing: bool,
    pub current_time: Duration,
    pub duration: Option<Duration>,
    pub volume: f32,
    pub is_muted: bool,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            current_src: None,
            is_playing: false,
            current_time: Duration::ZERO,
            duration: None,
            volume: 1.0,
            is_muted: false,
        }
    }
}

impl EngineState {
    pub fn effective_volume(&self) -> f32 {
        if self.is_muted { 0.0 } else { self.volume }
    }
}
