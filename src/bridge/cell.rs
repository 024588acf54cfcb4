//! Single-writer, many-reader value cells

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Writing half; only the session holds it
pub struct LiveCell<T> {
    value: Arc<RwLock<T>>,
}

/// Reading half, cheap to clone into handlers
pub struct LiveReader<T> {
    value: Arc<RwLock<T>>,
}

impl<T> LiveCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(RwLock::new(value)),
        }
    }

    pub fn set(&self, value: T) {
        *self.value.write() = value;
    }

    pub fn reader(&self) -> LiveReader<T> {
        LiveReader {
            value: self.value.clone(),
        }
    }
}

impl<T: Clone> LiveCell<T> {
    pub fn get(&self) -> T {
        self.value.read().clone()
    }
}

impl<T: Default> Default for LiveCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone> LiveReader<T> {
    pub fn get(&self) -> T {
        self.value.read().clone()
    }
}

impl<T> LiveReader<T> {
    /// Borrow the value for the duration of `f`
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }
}

impl<T> Clone for LiveReader<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LiveCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LiveCell").field(&*self.value.read()).finish()
    }
}

impl<T: fmt::Debug> fmt::Debug for LiveReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LiveReader").field(&*self.value.read()).finish()
    }
}
