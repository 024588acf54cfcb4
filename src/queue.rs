//! Play queue and next/previous policy
//!
//! The session consumes queues only through `QueueProvider`. `PlayQueue` is
//! the built-in provider; index math for every play mode lives in
//! `QueueNavigator` so that preloading and actual advancing agree.

use rand::Rng;

use crate::media::MediaDescriptor;

/// Play mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayMode {
    #[default]
    Sequential,
    LoopAll,
    LoopOne,
    Shuffle,
}

impl PlayMode {
    /// Cycle to the next mode
    pub fn next(self) -> Self {
        match self {
            PlayMode::Sequential => PlayMode::LoopAll,
            PlayMode::LoopAll => PlayMode::LoopOne,
            PlayMode::LoopOne => PlayMode::Shuffle,
            PlayMode::Shuffle => PlayMode::Sequential,
        }
    }
}

/// Source of next/previous media for a session
pub trait QueueProvider: Send {
    fn current(&self) -> Option<MediaDescriptor>;

    /// What `advance` would return, without moving
    fn peek_next(&self) -> Option<MediaDescriptor>;

    /// Move to the next item on an explicit skip or after a failure
    fn advance(&mut self) -> Option<MediaDescriptor>;

    fn retreat(&mut self) -> Option<MediaDescriptor>;

    fn has_next(&self) -> bool {
        self.peek_next().is_some()
    }

    fn play_mode(&self) -> PlayMode;

    fn set_play_mode(&mut self, mode: PlayMode);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn jump_to(&mut self, index: usize) -> Option<MediaDescriptor>;
}

/// Pre-drawn shuffle indices so `peek_next` and `advance` agree
#[derive(Debug, Clone, Default)]
pub struct ShuffleCache {
    pub next: Option<usize>,
    pub prev: Option<usize>,
}

impl ShuffleCache {
    /// Draw new indices, avoiding `current` when there is a choice
    pub fn regenerate(&mut self, queue_len: usize, current: usize) {
        if queue_len == 0 {
            self.clear();
            return;
        }

        let mut rng = rand::rng();
        let mut draw = || {
            if queue_len == 1 {
                return 0;
            }
            // skip over the current index
            let idx = rng.random_range(0..queue_len - 1);
            if idx >= current { idx + 1 } else { idx }
        };
        self.next = Some(draw());
        self.prev = Some(draw());

        tracing::debug!(
            "Shuffle indices drawn: next={:?}, prev={:?}",
            self.next,
            self.prev
        );
    }

    pub fn clear(&mut self) {
        self.next = None;
        self.prev = None;
    }
}

/// Index calculations for one queue position
pub struct QueueNavigator<'a> {
    queue_len: usize,
    current_idx: usize,
    play_mode: PlayMode,
    shuffle_cache: &'a ShuffleCache,
}

impl<'a> QueueNavigator<'a> {
    pub fn new(
        queue_len: usize,
        current_idx: usize,
        play_mode: PlayMode,
        shuffle_cache: &'a ShuffleCache,
    ) -> Self {
        Self {
            queue_len,
            current_idx,
            play_mode,
            shuffle_cache,
        }
    }

    /// Next index for an explicit skip
    ///
    /// `LoopOne` skips like `LoopAll`; repeating the same item only happens
    /// on natural end and is handled by the session.
    pub fn next_index(&self) -> Option<usize> {
        if self.queue_len == 0 {
            return None;
        }

        match self.play_mode {
            PlayMode::Shuffle => self.shuffle_cache.next,
            PlayMode::LoopAll | PlayMode::LoopOne => Some((self.current_idx + 1) % self.queue_len),
            PlayMode::Sequential => {
                let next = self.current_idx + 1;
                (next < self.queue_len).then_some(next)
            }
        }
    }

    pub fn prev_index(&self) -> Option<usize> {
        if self.queue_len == 0 {
            return None;
        }

        match self.play_mode {
            PlayMode::Shuffle => self.shuffle_cache.prev,
            PlayMode::LoopAll | PlayMode::LoopOne => {
                if self.current_idx == 0 {
                    Some(self.queue_len - 1)
                } else {
                    Some(self.current_idx - 1)
                }
            }
            PlayMode::Sequential => self.current_idx.checked_sub(1),
        }
    }
}

/// In-memory queue
#[derive(Debug, Clone, Default)]
pub struct PlayQueue {
    items: Vec<MediaDescriptor>,
    current: Option<usize>,
    mode: PlayMode,
    shuffle: ShuffleCache,
}

impl PlayQueue {
    pub fn new(items: Vec<MediaDescriptor>) -> Self {
        let current = (!items.is_empty()).then_some(0);
        let mut queue = Self {
            items,
            current,
            ..Default::default()
        };
        queue.refresh_shuffle();
        queue
    }

    pub fn items(&self) -> &[MediaDescriptor] {
        &self.items
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn push(&mut self, item: MediaDescriptor) {
        self.items.push(item);
        if self.current.is_none() {
            self.current = Some(0);
        }
        self.refresh_shuffle();
    }

    /// Replace the contents and point at `start`
    pub fn replace(&mut self, items: Vec<MediaDescriptor>, start: usize) {
        self.items = items;
        self.current = (start < self.items.len()).then_some(start);
        self.refresh_shuffle();
    }

    fn navigator(&self) -> Option<QueueNavigator<'_>> {
        self.current
            .map(|idx| QueueNavigator::new(self.items.len(), idx, self.mode, &self.shuffle))
    }

    fn move_to(&mut self, idx: Option<usize>) -> Option<MediaDescriptor> {
        let idx = idx?;
        self.current = Some(idx);
        self.refresh_shuffle();
        self.items.get(idx).cloned()
    }

    fn refresh_shuffle(&mut self) {
        match (self.mode, self.current) {
            (PlayMode::Shuffle, Some(current)) => {
                self.shuffle.regenerate(self.items.len(), current)
            }
            _ => self.shuffle.clear(),
        }
    }
}

impl QueueProvider for PlayQueue {
    fn current(&self) -> Option<MediaDescriptor> {
        self.current.and_then(|idx| self.items.get(idx).cloned())
    }

    fn peek_next(&self) -> Option<MediaDescriptor> {
        self.navigator()
            .and_then(|nav| nav.next_index())
            .and_then(|idx| self.items.get(idx).cloned())
    }

    fn advance(&mut self) -> Option<MediaDescriptor> {
        let next = self.navigator().and_then(|nav| nav.next_index());
        self.move_to(next)
    }

    fn retreat(&mut self) -> Option<MediaDescriptor> {
        let prev = self.navigator().and_then(|nav| nav.prev_index());
        self.move_to(prev)
    }

    fn play_mode(&self) -> PlayMode {
        self.mode
    }

    fn set_play_mode(&mut self, mode: PlayMode) {
        self.mode = mode;
        self.refresh_shuffle();
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn jump_to(&mut self, index: usize) -> Option<MediaDescriptor> {
        if index >= self.items.len() {
            return None;
        }
        self.move_to(Some(index))
    }
}
