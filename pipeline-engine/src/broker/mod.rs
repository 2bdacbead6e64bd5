//! Broker abstraction: a shared list + pub/sub store reachable by every worker.
//!
//! The operations mirror the small Redis subset the engine depends on:
//! - `RPUSH` / multi-key `BLPOP` / `LRANGE` / `LREM` / `LLEN` for the lanes
//! - `PUBLISH` / `SUBSCRIBE` for progress channels
//!
//! `blpop` must be atomic across all the given keys: checking the keys and
//! popping the winning element happens as one operation, so two callers can
//! never receive the same element.

mod memory;

pub use memory::{DEFAULT_CHANNEL_CAPACITY, MemoryBroker};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::Result;

/// List and pub/sub operations provided by the backing store.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append `value` to the tail of the list at `key`. Returns the new length.
    async fn rpush(&self, key: &str, value: String) -> Result<usize>;

    /// Pop the head of the first non-empty list among `keys`, checked in order.
    ///
    /// Blocks up to `timeout`; returns `(key, value)` or `None` once the timeout
    /// elapses with every list still empty.
    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>>;

    /// Snapshot of every element of the list at `key`, head first.
    async fn lrange(&self, key: &str) -> Result<Vec<String>>;

    /// Remove up to `count` elements equal to `value` (head first). `0` removes all.
    async fn lrem(&self, key: &str, count: usize, value: &str) -> Result<usize>;

    /// Length of the list at `key`; missing keys have length 0.
    async fn llen(&self, key: &str) -> Result<usize>;

    /// Publish `payload` on `channel`. Returns the number of receivers reached.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    /// Subscribe to future messages on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;

    /// Forget `channel` once its last receiver is gone.
    ///
    /// Called after dropping a receiver; a channel that still has receivers
    /// is left untouched.
    fn unsubscribe(&self, channel: &str);

    /// Stop accepting operations and disconnect every subscriber.
    ///
    /// Callers blocked in [`Broker::blpop`] observe `Error::BrokerUnavailable`.
    fn close(&self);

    /// Whether [`Broker::close`] has been called.
    fn is_closed(&self) -> bool;
}
