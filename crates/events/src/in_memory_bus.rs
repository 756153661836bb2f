//! Process-local bus used by the in-memory engine and tests.

use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    #[error("subscriber list lock poisoned")]
    Poisoned,
}

/// Fan-out over std channels: every live subscription gets its own clone.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions, as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?;
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        Subscription::new(rx)
    }
}
