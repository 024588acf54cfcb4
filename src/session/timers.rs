//! Timers and async completions delivered back to the session loop
//!
//! Nothing that waits runs inside the session task. A component asks its
//! `Scheduler` for a delayed message or for the result of a future, and the
//! message comes back through the component's `Mailbox` as an ordinary
//! session message. Every pending task sits in a named slot so it can be
//! replaced or cancelled.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Delivery side of a component's message stream
pub struct Mailbox<M> {
    deliver: Arc<dyn Fn(M) + Send + Sync>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            deliver: self.deliver.clone(),
        }
    }
}

impl<M> fmt::Debug for Mailbox<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Mailbox")
    }
}

impl<M: Send + 'static> Mailbox<M> {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(M) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Deliver into a channel, wrapping each message with `wrap`
    pub fn from_sender<T, W>(tx: mpsc::UnboundedSender<T>, wrap: W) -> Self
    where
        T: Send + 'static,
        W: Fn(M) -> T + Send + Sync + 'static,
    {
        Self::new(move |msg| {
            // receiver gone means the session is shutting down
            let _ = tx.send(wrap(msg));
        })
    }

    pub fn send(&self, msg: M) {
        (self.deliver)(msg);
    }
}

/// Slot-keyed timer and task set
pub struct Scheduler<S, M> {
    mailbox: Mailbox<M>,
    slots: HashMap<S, AbortHandle>,
}

impl<S, M> fmt::Debug for Scheduler<S, M>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<S, M> Scheduler<S, M>
where
    S: Hash + Eq + Clone + fmt::Debug,
    M: Send + 'static,
{
    pub fn new(mailbox: Mailbox<M>) -> Self {
        Self {
            mailbox,
            slots: HashMap::new(),
        }
    }

    pub fn mailbox(&self) -> &Mailbox<M> {
        &self.mailbox
    }

    /// Deliver `msg` after `delay`, replacing whatever occupies `slot`
    pub fn schedule(&mut self, slot: S, delay: Duration, msg: M) {
        let mailbox = self.mailbox.clone();
        self.spawn_task(slot, async move {
            tokio::time::sleep(delay).await;
            mailbox.send(msg);
        });
    }

    /// Deliver the output of `fut`, replacing whatever occupies `slot`
    pub fn spawn<F>(&mut self, slot: S, fut: F)
    where
        F: Future<Output = M> + Send + 'static,
    {
        let mailbox = self.mailbox.clone();
        self.spawn_task(slot, async move {
            let msg = fut.await;
            mailbox.send(msg);
        });
    }

    fn spawn_task<F>(&mut self, slot: S, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.slots.retain(|_, handle| !handle.is_finished());
        let handle = tokio::spawn(task).abort_handle();
        if let Some(previous) = self.slots.insert(slot, handle) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, slot: &S) {
        if let Some(handle) = self.slots.remove(slot) {
            handle.abort();
        }
    }

    pub fn is_pending(&self, slot: &S) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn cancel_all(&mut self) {
        for (slot, handle) in self.slots.drain() {
            if !handle.is_finished() {
                tracing::trace!("Cancelling pending {:?}", slot);
            }
            handle.abort();
        }
    }
}

impl<S, M> Drop for Scheduler<S, M> {
    fn drop(&mut self) {
        for (_, handle) in self.slots.drain() {
            handle.abort();
        }
    }
}
