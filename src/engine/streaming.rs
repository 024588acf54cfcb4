//! In-memory stream buffer for remote media
//!
//! A download task appends into a `SharedBuffer` while the decoder reads
//! from it through `StreamReader`. Reads past the downloaded range block
//! until the bytes arrive, the download fails, or the buffer is cancelled.
//! The same buffer serves the preload fetch and the playback handle, so a
//! warmed item starts from whatever was already fetched.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::{Condvar, Mutex};
use tokio::task::AbortHandle;

use crate::error::PlaybackError;

/// How long a blocked reader sleeps before rechecking cancellation
const READ_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct BufferState {
    data: Vec<u8>,
    total: Option<u64>,
    finished: bool,
    cancelled: bool,
    failure: Option<String>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BufferState>,
    grown: Condvar,
}

/// Growable byte buffer shared between a download and its readers
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SharedBuffer")
            .field("downloaded", &state.data.len())
            .field("total", &state.total)
            .field("finished", &state.finished)
            .finish()
    }
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer holding a complete payload
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let buffer = Self::new();
        {
            let mut state = buffer.inner.state.lock();
            state.total = Some(bytes.len() as u64);
            state.data = bytes;
            state.finished = true;
        }
        buffer
    }

    pub fn set_total_size(&self, total: u64) {
        self.inner.state.lock().total = Some(total);
    }

    pub fn append(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.inner.state.lock().data.extend_from_slice(chunk);
        self.inner.grown.notify_all();
    }

    pub fn finish(&self) {
        self.inner.state.lock().finished = true;
        self.inner.grown.notify_all();
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.inner.state.lock().failure = Some(reason.into());
        self.inner.grown.notify_all();
    }

    /// Stop the download and wake every blocked reader
    pub fn cancel(&self) {
        self.inner.state.lock().cancelled = true;
        self.inner.grown.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().finished
    }

    pub fn failure(&self) -> Option<String> {
        self.inner.state.lock().failure.clone()
    }

    pub fn downloaded(&self) -> u64 {
        self.inner.state.lock().data.len() as u64
    }

    /// Content length if the server sent one, or the final size once finished
    pub fn total_size(&self) -> Option<u64> {
        let state = self.inner.state.lock();
        if state.finished {
            Some(state.data.len() as u64)
        } else {
            state.total
        }
    }

    /// Fraction of the payload that is local (0.0 - 1.0)
    pub fn buffered_fraction(&self) -> f64 {
        let state = self.inner.state.lock();
        if state.finished {
            return 1.0;
        }
        match state.total {
            Some(total) if total > 0 => (state.data.len() as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }

    /// Read at `position`, blocking until bytes are available
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.inner.state.lock();
        loop {
            if state.cancelled {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "stream cancelled"));
            }
            if let Some(reason) = &state.failure {
                return Err(io::Error::other(reason.clone()));
            }

            let available = state.data.len() as u64;
            if position < available {
                let start = position as usize;
                let len = buf.len().min(state.data.len() - start);
                buf[..len].copy_from_slice(&state.data[start..start + len]);
                return Ok(len);
            }
            if state.finished {
                return Ok(0);
            }

            tracing::trace!("Reader waiting at byte {} ({} buffered)", position, available);
            self.inner.grown.wait_for(&mut state, READ_POLL);
        }
    }
}

/// `Read + Seek` cursor over a `SharedBuffer`
#[derive(Debug, Clone)]
pub struct StreamReader {
    buffer: SharedBuffer,
    position: u64,
}

impl StreamReader {
    pub fn new(buffer: SharedBuffer) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.buffer.read_at(self.position, buf)?;
        self.position += read as u64;
        Ok(read)
    }
}

impl Seek for StreamReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => {
                let Some(total) = self.buffer.total_size() else {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "stream length unknown",
                    ));
                };
                total as i64 + offset
            }
        };

        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

/// Stream `url` into `buffer` until done, failed or cancelled
pub async fn download_into(
    client: &reqwest::Client,
    url: &str,
    buffer: &SharedBuffer,
) -> Result<u64, PlaybackError> {
    let result = fetch(client, url, buffer).await;
    match &result {
        Ok(bytes) => {
            buffer.finish();
            tracing::debug!("Downloaded {} bytes from {}", bytes, url);
        }
        Err(e) => buffer.fail(e.to_string()),
    }
    result
}

async fn fetch(
    client: &reqwest::Client,
    url: &str,
    buffer: &SharedBuffer,
) -> Result<u64, PlaybackError> {
    let response = client.get(url).send().await?.error_for_status()?;
    if let Some(len) = response.content_length() {
        buffer.set_total_size(len);
    }

    let mut stream = response.bytes_stream();
    let mut received = 0u64;
    while let Some(chunk) = stream.next().await {
        if buffer.is_cancelled() {
            return Err(PlaybackError::Network("download cancelled".to_string()));
        }
        let chunk = chunk?;
        received += chunk.len() as u64;
        buffer.append(&chunk);
    }
    Ok(received)
}

/// Start a background download, returning its buffer and abort handle
pub fn spawn_download(client: reqwest::Client, url: String) -> (SharedBuffer, AbortHandle) {
    let buffer = SharedBuffer::new();
    let target = buffer.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = download_into(&client, &url, &target).await {
            tracing::warn!("Download of {} failed: {}", url, e);
        }
    });
    (buffer, task.abort_handle())
}
