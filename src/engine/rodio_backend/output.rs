//! Audio thread owning the rodio output stream

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink, Source};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{CommandSender, OutputCommand, Snapshots, VOLUME_RAMP, VoiceSnapshot};
use crate::engine::backend::{
    BackendEvent, BackendEventKind, BackendEventSender, BackendLoad, HandleId,
};
use crate::engine::fade::{GainControl, Ramp};
use crate::engine::streaming::{SharedBuffer, StreamReader, spawn_download};
use crate::media::StreamSource;

pub(super) trait MediaRead: Read + Seek + Send + Sync {}

impl<T: Read + Seek + Send + Sync> MediaRead for T {}

pub(super) type Decoded = Decoder<Box<dyn MediaRead>>;

/// Everything the audio thread needs
pub(super) struct OutputThread {
    pub device_name: Option<String>,
    pub client: reqwest::Client,
    pub runtime: tokio::runtime::Handle,
    pub commands: CommandSender,
    pub command_rx: mpsc::UnboundedReceiver<OutputCommand>,
    pub snapshots: Snapshots,
}

pub(super) fn spawn(ctx: OutputThread) -> anyhow::Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("audio-output".to_string())
        .spawn(move || run(ctx))?;
    Ok(handle)
}

fn run(mut ctx: OutputThread) {
    let stream = match open_stream(ctx.device_name.as_deref()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::error!("No audio output: {}", e);
            None
        }
    };
    tracing::info!("Audio thread started");

    let mut output = Output {
        stream,
        voices: HashMap::new(),
        events: None,
        client: ctx.client,
        runtime: ctx.runtime,
        commands: ctx.commands,
        snapshots: ctx.snapshots,
    };

    while let Some(command) = ctx.command_rx.blocking_recv() {
        if !matches!(command, OutputCommand::Tick) {
            tracing::trace!("Audio thread: {:?}", command);
        }
        output.handle(command);
    }

    output.release_all();
    tracing::info!("Audio thread exiting");
}

/// Open the named device, or the default one
fn open_stream(device_name: Option<&str>) -> Result<OutputStream, String> {
    let Some(name) = device_name else {
        return OutputStreamBuilder::open_default_stream()
            .map_err(|e| format!("Failed to create audio output: {}", e));
    };

    let host = rodio::cpal::default_host();
    let device = host
        .output_devices()
        .map_err(|e| format!("Failed to enumerate devices: {}", e))?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| format!("Device not found: {}", name))?;
    let config = device
        .default_output_config()
        .map_err(|e| format!("Failed to get device config: {}", e))?;

    OutputStreamBuilder::from_device(device)
        .map_err(|e| format!("Failed to create stream builder: {}", e))?
        .with_sample_rate(config.sample_rate().0)
        .open_stream()
        .map_err(|e| format!("Failed to open stream: {}", e))
}

/// Where a voice reads its bytes from
enum Origin {
    Stream {
        buffer: SharedBuffer,
        download: Option<AbortHandle>,
    },
    File(PathBuf),
}

impl Origin {
    fn reader(&self) -> Result<Box<dyn MediaRead>, String> {
        match self {
            Origin::Stream { buffer, .. } => Ok(Box::new(StreamReader::new(buffer.clone()))),
            Origin::File(path) => {
                let file = File::open(path)
                    .map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
                Ok(Box::new(BufReader::new(file)))
            }
        }
    }

    /// Whether `position` lies inside the bytes already local
    ///
    /// Byte offsets are estimated assuming a constant bitrate.
    fn covers(&self, position: Duration, duration: Option<Duration>) -> bool {
        match self {
            Origin::File(_) => true,
            Origin::Stream { buffer, .. } => {
                if buffer.is_complete() {
                    return true;
                }
                match duration {
                    Some(total) if !total.is_zero() => {
                        position.as_secs_f64() / total.as_secs_f64() <= buffer.buffered_fraction()
                    }
                    _ => false,
                }
            }
        }
    }

    fn failure(&self) -> Option<String> {
        match self {
            Origin::Stream { buffer, .. } => buffer.failure(),
            Origin::File(_) => None,
        }
    }

    fn close(self) {
        if let Origin::Stream { buffer, download } = self {
            buffer.cancel();
            if let Some(download) = download {
                download.abort();
            }
        }
    }
}

struct Voice {
    origin: Origin,
    sink: Option<Sink>,
    gain: GainControl,
    duration: Option<Duration>,
    paused: bool,
    ended: bool,
    /// `Loaded` already sent
    announced: bool,
}

impl Voice {
    fn snapshot(&self) -> VoiceSnapshot {
        VoiceSnapshot {
            position: self
                .sink
                .as_ref()
                .map(|sink| sink.get_pos())
                .unwrap_or_default(),
            duration: self.duration,
            paused: self.paused,
        }
    }
}

struct Output {
    stream: Option<OutputStream>,
    voices: HashMap<HandleId, Voice>,
    events: Option<BackendEventSender>,
    client: reqwest::Client,
    runtime: tokio::runtime::Handle,
    commands: CommandSender,
    snapshots: Snapshots,
}

impl Output {
    fn handle(&mut self, command: OutputCommand) {
        match command {
            OutputCommand::Attach(events) => self.events = Some(events),
            OutputCommand::Load { handle, load } => self.load(handle, load),
            OutputCommand::Prepared {
                handle,
                decoded,
                start_at,
            } => self.prepared(handle, decoded, start_at),
            OutputCommand::Play(handle) => self.set_paused(handle, false),
            OutputCommand::Pause(handle) => self.set_paused(handle, true),
            OutputCommand::Stop(handle) => self.stop(handle),
            OutputCommand::Seek(handle, position) => self.seek(handle, position),
            OutputCommand::Volume(handle, volume) => self.set_volume(handle, volume),
            OutputCommand::Release(handle) => self.release(handle),
            OutputCommand::Tick => self.tick(),
        }
    }

    fn emit(&self, handle: HandleId, kind: BackendEventKind) {
        if let Some(events) = &self.events {
            let _ = events.send(BackendEvent::new(handle, kind));
        }
    }

    fn publish(&self, handle: HandleId) {
        if let Some(voice) = self.voices.get(&handle) {
            self.snapshots.write().insert(handle, voice.snapshot());
        }
    }

    fn load(&mut self, handle: HandleId, load: BackendLoad) {
        let origin = match load.source {
            StreamSource::Url(url) => match load.warmed {
                Some(buffer) if buffer.failure().is_none() => Origin::Stream {
                    buffer,
                    download: None,
                },
                _ => {
                    let _guard = self.runtime.enter();
                    let (buffer, download) = spawn_download(self.client.clone(), url);
                    Origin::Stream {
                        buffer,
                        download: Some(download),
                    }
                }
            },
            StreamSource::File(path) => Origin::File(path),
        };

        self.voices.insert(
            handle,
            Voice {
                origin,
                sink: None,
                gain: GainControl::new(1.0),
                duration: None,
                paused: true,
                ended: false,
                announced: false,
            },
        );
        self.prepare(handle, load.start_at);
    }

    /// Build a decoder off-thread; the result comes back as `Prepared`
    fn prepare(&self, handle: HandleId, start_at: Duration) {
        let Some(voice) = self.voices.get(&handle) else {
            return;
        };
        let reader = voice.origin.reader();
        let commands = self.commands.clone();
        self.runtime.spawn_blocking(move || {
            let decoded = reader.and_then(|reader| {
                Decoder::new(reader).map_err(|e| format!("Failed to decode audio: {}", e))
            });
            let _ = commands.send(OutputCommand::Prepared {
                handle,
                decoded,
                start_at,
            });
        });
    }

    fn prepared(&mut self, handle: HandleId, decoded: Result<Decoded, String>, start_at: Duration) {
        let Some(voice) = self.voices.get_mut(&handle) else {
            tracing::debug!("Handle {} released while decoding", handle);
            return;
        };
        let decoder = match decoded {
            Ok(decoder) => decoder,
            Err(e) => {
                self.emit(handle, BackendEventKind::Failed(e));
                return;
            }
        };
        let Some(stream) = &self.stream else {
            self.emit(handle, BackendEventKind::Failed("no audio output".to_string()));
            return;
        };

        let duration = decoder.total_duration().or(voice.duration);
        let sink = Sink::connect_new(stream.mixer());
        sink.pause();
        sink.append(Ramp::new(decoder, voice.gain.clone()));
        if !start_at.is_zero() {
            if let Err(e) = sink.try_seek(start_at) {
                tracing::warn!("Initial seek to {:?} failed: {:?}", start_at, e);
            }
        }

        let position = sink.get_pos();
        if !voice.paused {
            sink.play();
        }
        if let Some(old) = voice.sink.replace(sink) {
            old.stop();
        }
        voice.duration = duration;
        voice.ended = false;

        let first = !std::mem::replace(&mut voice.announced, true);
        self.publish(handle);
        if first {
            self.emit(handle, BackendEventKind::Loaded { duration });
        } else {
            // rebuilt for a seek after the end of stream
            self.emit(handle, BackendEventKind::Seeked { position });
        }
    }

    fn set_paused(&mut self, handle: HandleId, paused: bool) {
        let Some(voice) = self.voices.get_mut(&handle) else {
            return;
        };
        let Some(sink) = &voice.sink else {
            return;
        };
        if paused {
            sink.pause();
        } else {
            sink.play();
        }
        voice.paused = paused;
        self.publish(handle);
        self.emit(
            handle,
            if paused {
                BackendEventKind::Paused
            } else {
                BackendEventKind::Playing
            },
        );
    }

    fn stop(&mut self, handle: HandleId) {
        let Some(voice) = self.voices.get_mut(&handle) else {
            return;
        };
        if let Some(sink) = voice.sink.take() {
            sink.stop();
        }
        voice.paused = true;
        self.publish(handle);
        self.emit(handle, BackendEventKind::Stopped);
    }

    fn seek(&mut self, handle: HandleId, position: Duration) {
        let Some(voice) = self.voices.get_mut(&handle) else {
            return;
        };
        let Some(sink) = &voice.sink else {
            return;
        };

        if voice.ended || sink.empty() {
            // the decoder is spent, start a fresh one at the target
            self.prepare(handle, position);
            return;
        }

        let landed = if !voice.origin.covers(position, voice.duration) {
            let current = sink.get_pos();
            tracing::info!(
                "Seek to {:?} is beyond the buffered range, staying at {:?}",
                position,
                current
            );
            current
        } else {
            match sink.try_seek(position) {
                Ok(()) => position,
                Err(e) => {
                    tracing::warn!("Seek to {:?} failed: {:?}", position, e);
                    sink.get_pos()
                }
            }
        };

        self.publish(handle);
        if let Some(snapshot) = self.snapshots.write().get_mut(&handle) {
            snapshot.position = landed;
        }
        self.emit(handle, BackendEventKind::Seeked { position: landed });
    }

    fn set_volume(&mut self, handle: HandleId, volume: f32) {
        let Some(voice) = self.voices.get(&handle) else {
            return;
        };
        let audible = voice.sink.is_some() && !voice.paused;
        let ramp = if audible { VOLUME_RAMP } else { Duration::ZERO };
        voice.gain.ramp_to(volume, ramp);
    }

    fn release(&mut self, handle: HandleId) {
        if let Some(voice) = self.voices.remove(&handle) {
            if let Some(sink) = voice.sink {
                sink.stop();
            }
            voice.origin.close();
            tracing::debug!("Handle {} released", handle);
        }
        self.snapshots.write().remove(&handle);
    }

    fn release_all(&mut self) {
        let handles: Vec<HandleId> = self.voices.keys().copied().collect();
        for handle in handles {
            self.release(handle);
        }
    }

    fn tick(&mut self) {
        let mut updates = Vec::new();
        for (handle, voice) in self.voices.iter_mut() {
            let Some(sink) = &voice.sink else {
                continue;
            };
            if voice.paused || voice.ended {
                continue;
            }

            if sink.empty() {
                voice.paused = true;
                voice.ended = true;
                let kind = match voice.origin.failure() {
                    Some(reason) => BackendEventKind::Failed(reason),
                    None => BackendEventKind::Ended,
                };
                updates.push((*handle, kind));
                continue;
            }

            updates.push((
                *handle,
                BackendEventKind::TimeUpdate {
                    position: sink.get_pos(),
                },
            ));
        }

        for (handle, kind) in updates {
            self.publish(handle);
            self.emit(handle, kind);
        }
    }
}
