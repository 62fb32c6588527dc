//! Distributed key/value abstraction.
//!
//! Locks, progress hashes, the `.nodb` document cache, and the status
//! pub/sub channels all live in a shared key/value store. In production
//! deployments that store is a Redis instance; this module defines the
//! seam as a trait so the rest of the library never talks to a concrete
//! backend directly.
//!
//! [`MemoryKv`] is the bundled in-process backend. It implements the full
//! contract including TTL expiry and pub/sub fan-out, which makes it the
//! backend of choice for tests and single-process deployments.

mod memory;

pub use memory::MemoryKv;

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of each pub/sub channel buffer.
///
/// Subscribers that fall more than this many messages behind observe a
/// `Lagged` error rather than blocking publishers.
pub const CHANNEL_CAPACITY: usize = 256;

/// Key/value store contract shared by all distributed-state consumers.
///
/// Semantics follow the Redis primitives each method maps onto:
/// `SET NX PX`, `GET`, `DEL`, `SCAN`, `HSET`, `HGET`, `HGETALL`, `HDEL`,
/// and `PUBLISH`/`SUBSCRIBE`. All methods are infallible from the caller's
/// perspective; backend connectivity failures are a deployment concern
/// handled behind the trait.
pub trait KvStore: Send + Sync + 'static {
    /// Conditionally inserts `value` under `key` iff the key is absent.
    ///
    /// Returns `true` when the insert happened. An expired entry counts
    /// as absent. When `ttl` is given the entry expires that far in the
    /// future.
    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool;

    /// Returns the live value under `key`, if any.
    fn get(&self, key: &str) -> Option<String>;

    /// Removes `key`. Returns `true` when a live entry was removed.
    fn delete(&self, key: &str) -> bool;

    /// Returns all live keys starting with `prefix`, sorted.
    fn scan(&self, prefix: &str) -> Vec<String>;

    /// Sets `field` to `value` in the hash stored under `key`.
    fn hset(&self, key: &str, field: &str, value: &str);

    /// Returns `field` from the hash under `key`, if present.
    fn hget(&self, key: &str, field: &str) -> Option<String>;

    /// Returns the full hash under `key`, sorted by field.
    fn hgetall(&self, key: &str) -> BTreeMap<String, String>;

    /// Removes `field` from the hash under `key`.
    ///
    /// Returns `true` when the field existed.
    fn hdel(&self, key: &str, field: &str) -> bool;

    /// Publishes `payload` to every current subscriber of `channel`.
    fn publish(&self, channel: &str, payload: &str);

    /// Subscribes to `channel`.
    ///
    /// Only messages published after the subscription are delivered.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}
