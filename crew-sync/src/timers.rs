//! Cancellable one-shot timers keyed by an arbitrary id.
//!
//! Scheduling a key that already has a timer cancels the old one first, so a
//! key never has more than one live timer. Expirations are delivered through
//! [`KeyedTimers::next_expired`]; a generation counter filters out a timer
//! that fired just before it was replaced.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

struct Armed {
    generation: u64,
    abort: AbortHandle,
}

pub struct KeyedTimers<K> {
    armed: HashMap<K, Armed>,
    generation: u64,
    fired_tx: mpsc::UnboundedSender<(K, u64)>,
    fired_rx: mpsc::UnboundedReceiver<(K, u64)>,
}

impl<K> KeyedTimers<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        Self {
            armed: HashMap::new(),
            generation: 0,
            fired_tx,
            fired_rx,
        }
    }

    /// Arm (or re-arm) the timer for `key`. Must be called inside a tokio runtime.
    pub fn schedule(&mut self, key: K, after: Duration) {
        self.cancel(&key);

        self.generation += 1;
        let generation = self.generation;
        let tx = self.fired_tx.clone();
        let fired_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send((fired_key, generation));
        });

        self.armed.insert(
            key,
            Armed {
                generation,
                abort: task.abort_handle(),
            },
        );
    }

    /// Disarm the timer for `key`. Returns whether one was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.armed.remove(key) {
            Some(armed) => {
                armed.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Wait for the next live timer to fire and return its key.
    ///
    /// Pending forever while nothing is armed; intended for `select!` loops.
    pub async fn next_expired(&mut self) -> K {
        loop {
            // The sender half lives in `self`, so the channel never closes.
            let Some((key, generation)) = self.fired_rx.recv().await else {
                return std::future::pending().await;
            };
            if self.take_if_current(&key, generation) {
                return key;
            }
        }
    }

    fn take_if_current(&mut self, key: &K, generation: u64) -> bool {
        match self.armed.get(key) {
            Some(armed) if armed.generation == generation => {
                self.armed.remove(key);
                true
            }
            _ => false,
        }
    }
}

impl<K> Default for KeyedTimers<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for KeyedTimers<K> {
    fn drop(&mut self) {
        for armed in self.armed.values() {
            armed.abort.abort();
        }
    }
}
