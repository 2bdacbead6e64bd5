//! In-process broker backed by `VecDeque` lists and `tokio::sync::broadcast` channels.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info};

use super::Broker;
use crate::{Error, Result};

/// Default capacity of every pub/sub channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broker that lives inside the current process.
///
/// All lists share one mutex, so a multi-key pop inspects and removes under a
/// single critical section. Waiters park on a [`Notify`] that every push wakes.
pub struct MemoryBroker {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
    channels: DashMap<String, broadcast::Sender<String>>,
    channel_capacity: usize,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a broker whose channels buffer up to `channel_capacity` messages
    /// per subscriber before the slowest one starts lagging.
    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            pushed: Notify::new(),
            channels: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of pub/sub channels currently allocated.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::broker("memory broker is closed"));
        }
        Ok(())
    }

    fn try_pop(&self, keys: &[String]) -> Option<(String, String)> {
        let mut lists = self.lists.lock();
        for key in keys {
            if let Some(list) = lists.get_mut(key)
                && let Some(value) = list.pop_front()
            {
                if list.is_empty() {
                    lists.remove(key);
                }
                return Some((key.clone(), value));
            }
        }
        None
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn rpush(&self, key: &str, value: String) -> Result<usize> {
        self.ensure_open()?;
        let len = {
            let mut lists = self.lists.lock();
            let list = lists.entry(key.to_string()).or_default();
            list.push_back(value);
            list.len()
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before inspecting the lists so a push that lands
            // between the check and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some(popped) = self.try_pop(keys) {
                return Ok(Some(popped));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    // One last look: a push may have raced the deadline.
                    self.ensure_open()?;
                    return Ok(self.try_pop(keys));
                }
            }
        }
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let lists = self.lists.lock();
        Ok(lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lrem(&self, key: &str, count: usize, value: &str) -> Result<usize> {
        self.ensure_open()?;
        let mut lists = self.lists.lock();
        let Some(list) = lists.get_mut(key) else {
            return Ok(0);
        };

        let limit = if count == 0 { usize::MAX } else { count };
        let mut removed = 0usize;
        list.retain(|item| {
            if removed < limit && item == value {
                removed += 1;
                false
            } else {
                true
            }
        });
        if list.is_empty() {
            lists.remove(key);
        }
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.lists.lock().get(key).map_or(0, VecDeque::len))
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        self.ensure_open()?;
        let Some(tx) = self.channels.get(channel).map(|tx| tx.clone()) else {
            return Ok(0);
        };

        match tx.send(payload) {
            Ok(receivers) => Ok(receivers),
            Err(_) => {
                // Every subscriber is gone; forget the channel until someone resubscribes.
                self.channels
                    .remove_if(channel, |_, tx| tx.receiver_count() == 0);
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        self.ensure_open()?;
        let capacity = self.channel_capacity;
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();
        debug!(channel, "Subscribed to broker channel");
        Ok(rx)
    }

    fn unsubscribe(&self, channel: &str) {
        if self
            .channels
            .remove_if(channel, |_, tx| tx.receiver_count() == 0)
            .is_some()
        {
            debug!(channel, "Released broker channel");
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the senders ends every subscriber's stream.
        self.channels.clear();
        self.pushed.notify_waiters();
        info!("Memory broker closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
