//! rodio-based `MediaBackend`
//!
//! The rodio output stream is not `Send`, so it lives on a dedicated audio
//! thread. `RodioBackend` is the non-blocking front: commands go over a
//! channel, and per-handle position/duration/paused values are mirrored in
//! a shared map so the synchronous getters never wait on the thread.

mod output;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::backend::{BackendEventSender, BackendLoad, HandleId, MediaBackend};

/// How often positions are sampled and end of stream is checked
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Gain ramp used when an audible voice changes volume
const VOLUME_RAMP: Duration = Duration::from_millis(20);

/// Values the audio thread publishes for each handle
#[derive(Debug, Clone, Copy, Default)]
struct VoiceSnapshot {
    position: Duration,
    duration: Option<Duration>,
    paused: bool,
}

type Snapshots = Arc<RwLock<HashMap<HandleId, VoiceSnapshot>>>;

/// Commands processed by the audio thread
enum OutputCommand {
    Attach(BackendEventSender),
    Load {
        handle: HandleId,
        load: BackendLoad,
    },
    /// Decoder construction finished off-thread
    Prepared {
        handle: HandleId,
        decoded: Result<output::Decoded, String>,
        start_at: Duration,
    },
    Play(HandleId),
    Pause(HandleId),
    Stop(HandleId),
    Seek(HandleId, Duration),
    Volume(HandleId, f32),
    Release(HandleId),
    Tick,
}

impl std::fmt::Debug for OutputCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Attach(_) => write!(f, "Attach"),
            Self::Load { handle, load } => f
                .debug_struct("Load")
                .field("handle", handle)
                .field("source", &load.source)
                .field("start_at", &load.start_at)
                .finish_non_exhaustive(),
            Self::Prepared {
                handle, start_at, ..
            } => f
                .debug_struct("Prepared")
                .field("handle", handle)
                .field("start_at", start_at)
                .finish_non_exhaustive(),
            Self::Play(h) => f.debug_tuple("Play").field(h).finish(),
            Self::Pause(h) => f.debug_tuple("Pause").field(h).finish(),
            Self::Stop(h) => f.debug_tuple("Stop").field(h).finish(),
            Self::Seek(h, pos) => f.debug_tuple("Seek").field(h).field(pos).finish(),
            Self::Volume(h, v) => f.debug_tuple("Volume").field(h).field(v).finish(),
            Self::Release(h) => f.debug_tuple("Release").field(h).finish(),
            Self::Tick => write!(f, "Tick"),
        }
    }
}

type CommandSender = mpsc::UnboundedSender<OutputCommand>;

/// Audio output on the default (or a named) device
pub struct RodioBackend {
    commands: CommandSender,
    snapshots: Snapshots,
    _thread: JoinHandle<()>,
}

impl std::fmt::Debug for RodioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RodioBackend")
            .field("handles", &self.snapshots.read().len())
            .finish()
    }
}

impl RodioBackend {
    /// Spawn the audio thread; must be called inside a tokio runtime
    pub fn spawn(device_name: Option<String>, client: reqwest::Client) -> anyhow::Result<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let snapshots: Snapshots = Arc::default();
        let runtime = tokio::runtime::Handle::try_current()?;

        let thread = output::spawn(output::OutputThread {
            device_name,
            client,
            runtime,
            commands: commands.clone(),
            command_rx,
            snapshots: snapshots.clone(),
        })?;

        // Ticker stops once the thread's receiver is gone
        let ticker = commands.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if ticker.send(OutputCommand::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            commands,
            snapshots,
            _thread: thread,
        })
    }

    fn send(&self, command: OutputCommand) {
        if self.commands.send(command).is_err() {
            tracing::error!("Audio thread is gone");
        }
    }

    fn snapshot(&self, handle: HandleId) -> Option<VoiceSnapshot> {
        self.snapshots.read().get(&handle).copied()
    }
}

impl MediaBackend for RodioBackend {
    fn attach(&mut self, events: BackendEventSender) {
        self.send(OutputCommand::Attach(events));
    }

    fn load(&mut self, handle: HandleId, load: BackendLoad) {
        self.snapshots.write().insert(
            handle,
            VoiceSnapshot {
                position: load.start_at,
                duration: None,
                paused: true,
            },
        );
        self.send(OutputCommand::Load { handle, load });
    }

    fn play(&mut self, handle: HandleId) {
        self.send(OutputCommand::Play(handle));
    }

    fn pause(&mut self, handle: HandleId) {
        self.send(OutputCommand::Pause(handle));
    }

    fn stop(&mut self, handle: HandleId) {
        self.send(OutputCommand::Stop(handle));
    }

    fn seek(&mut self, handle: HandleId, position: Duration) {
        self.send(OutputCommand::Seek(handle, position));
    }

    fn set_volume(&mut self, handle: HandleId, volume: f32) {
        self.send(OutputCommand::Volume(handle, volume));
    }

    fn release(&mut self, handle: HandleId) {
        self.snapshots.write().remove(&handle);
        self.send(OutputCommand::Release(handle));
    }

    fn current_time(&self, handle: HandleId) -> Option<Duration> {
        self.snapshot(handle).map(|s| s.position)
    }

    fn duration(&self, handle: HandleId) -> Option<Duration> {
        self.snapshot(handle).and_then(|s| s.duration)
    }

    fn is_paused(&self, handle: HandleId) -> bool {
        self.snapshot(handle).is_none_or(|s| s.paused)
    }
}
