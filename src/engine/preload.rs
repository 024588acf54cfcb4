//! Next-item warming
//!
//! Preloading never creates a second playback handle. It runs a plain,
//! cancellable fetch of the upcoming item into a `SharedBuffer`, which the
//! backend adopts if that item is loaded next.

use std::sync::Arc;

use tokio::task::AbortHandle;

use super::streaming::SharedBuffer;
use crate::media::StreamSource;

/// A fetch in flight or finished
#[derive(Debug)]
pub struct Prefetch {
    pub buffer: SharedBuffer,
    pub task: Option<AbortHandle>,
}

impl Prefetch {
    fn cancel(self) {
        self.buffer.cancel();
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

/// Something that can fetch a source ahead of playback
pub trait Prefetcher: Send + Sync {
    /// Start fetching; `None` when the source needs no warming
    fn prefetch(&self, source: &StreamSource) -> Option<Prefetch>;
}

/// Prefetcher that never fetches
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrefetch;

impl Prefetcher for NoPrefetch {
    fn prefetch(&self, _source: &StreamSource) -> Option<Prefetch> {
        None
    }
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Idle,
    /// Waiting for the arm timer
    Scheduled { source: StreamSource, token: u64 },
    Fetching {
        source: StreamSource,
        fetch: Prefetch,
    },
}

/// Single preload slot
pub struct Preloader {
    prefetcher: Arc<dyn Prefetcher>,
    slot: SlotState,
    next_token: u64,
}

impl std::fmt::Debug for Preloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preloader")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Preloader {
    pub fn new(prefetcher: Arc<dyn Prefetcher>) -> Self {
        Self {
            prefetcher,
            slot: SlotState::Idle,
            next_token: 0,
        }
    }

    /// Queue `source` for warming; returns the token to arm it with
    ///
    /// `None` when the slot already targets the same source.
    pub fn schedule(&mut self, source: StreamSource) -> Option<u64> {
        if self.target() == Some(&source) {
            return None;
        }
        self.cancel();
        self.next_token += 1;
        let token = self.next_token;
        tracing::debug!("Preload of {} scheduled (token {})", source, token);
        self.slot = SlotState::Scheduled { source, token };
        Some(token)
    }

    /// Start the fetch if `token` is still the scheduled one
    pub fn arm(&mut self, token: u64) -> bool {
        let slot = std::mem::take(&mut self.slot);
        match slot {
            SlotState::Scheduled {
                source,
                token: scheduled,
            } if scheduled == token => {
                match self.prefetcher.prefetch(&source) {
                    Some(fetch) => {
                        tracing::info!("Preloading {}", source);
                        self.slot = SlotState::Fetching { source, fetch };
                    }
                    None => tracing::debug!("{} needs no preload", source),
                }
                true
            }
            other => {
                self.slot = other;
                false
            }
        }
    }

    /// Hand over warmed bytes for `source`, if any
    pub fn take(&mut self, source: &StreamSource) -> Option<SharedBuffer> {
        match std::mem::take(&mut self.slot) {
            SlotState::Fetching { source: fetched, fetch } if &fetched == source => {
                if fetch.buffer.is_cancelled() {
                    return None;
                }
                tracing::debug!("Adopting preloaded bytes for {}", source);
                Some(fetch.buffer)
            }
            SlotState::Scheduled { source: scheduled, .. } if &scheduled == source => None,
            other => {
                // a different item is being warmed; it is now stale
                self.slot = other;
                self.cancel();
                None
            }
        }
    }

    pub fn cancel(&mut self) {
        match std::mem::take(&mut self.slot) {
            SlotState::Idle => {}
            SlotState::Scheduled { source, .. } => {
                tracing::debug!("Preload of {} cancelled before start", source);
            }
            SlotState::Fetching { source, fetch } => {
                tracing::debug!("Preload of {} aborted", source);
                fetch.cancel();
            }
        }
    }

    /// Source the slot currently targets
    pub fn target(&self) -> Option<&StreamSource> {
        match &self.slot {
            SlotState::Idle => None,
            SlotState::Scheduled { source, .. } | SlotState::Fetching { source, .. } => {
                Some(source)
            }
        }
    }

    pub fn is_fetching(&self) -> bool {
        matches!(self.slot, SlotState::Fetching { .. })
    }
}
