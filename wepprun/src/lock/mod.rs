//! Distributed lock manager for controller files.
//!
//! Every mutating operation on a controller is gated by a distributed
//! token stored under `lock:<runid>:<relpath>` with a TTL, plus a legacy
//! boolean flag `locked:<relpath>` kept in the per-run hash `<runid>`.
//! The distributed key is the single source of truth; the legacy flag is
//! advisory and auto-normalized when the two disagree.
//!
//! # Recovery
//!
//! The manager recovers nothing automatically. A holder that loses its
//! lock (TTL expiry, crash, administrative [`LockManager::clear_locks`])
//! discovers the loss at the next `unlock` ([`LockError::TokenMismatch`])
//! or dump (`NotLocked`), and recovers with a forced unlock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::kv::KvStore;

/// Default time bound on a held lock.
///
/// Pipeline stages that run longer than this lose their lock; the dump
/// at the end of the stage then fails and is surfaced to the caller.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(120);

/// Lock acquisition and release failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The resource is held by another token.
    #[error("already locked: {relpath} of run {runid}")]
    AlreadyLocked { runid: String, relpath: String },

    /// The stored token no longer matches the holder's local token.
    ///
    /// Indicates a crash, TTL expiry, or an administrative clear; recover
    /// with a forced unlock.
    #[error("lock token mismatch: {relpath} of run {runid}")]
    TokenMismatch { runid: String, relpath: String },

    /// A dump or release was attempted without holding the lock.
    #[error("not locked: {relpath} of run {runid}")]
    NotLocked { runid: String, relpath: String },

    /// The lock record could not be encoded for storage; nothing was
    /// written.
    #[error("unencodable lock record for {relpath} of run {runid}: {reason}")]
    Codec {
        runid: String,
        relpath: String,
        reason: String,
    },
}

/// The distributed record stored under `lock:<runid>:<relpath>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    /// Token identifying the holder.
    pub token: Uuid,
    /// TTL the record was created with, in seconds.
    pub ttl_seconds: u64,
    /// Creation time, UTC.
    pub created_at: DateTime<Utc>,
}

/// Mutual exclusion over controller files shared by processes and threads.
#[derive(Clone)]
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl LockManager {
    /// Creates a manager with the default TTL.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_ttl(kv, DEFAULT_LOCK_TTL)
    }

    /// Creates a manager with an explicit TTL.
    pub fn with_ttl(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Returns the TTL applied to new locks.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock_key(runid: &str, relpath: &str) -> String {
        format!("lock:{}:{}", runid, relpath)
    }

    fn flag_field(relpath: &str) -> String {
        format!("locked:{}", relpath)
    }

    /// Attempts to acquire the lock for `relpath` of `runid`.
    ///
    /// Returns the fresh token on success; the caller must retain it to
    /// unlock later. Acquisition never waits: contention surfaces as
    /// [`LockError::AlreadyLocked`] and retrying is the caller's decision.
    pub fn lock(&self, runid: &str, relpath: &str) -> Result<Uuid, LockError> {
        let token = Uuid::new_v4();
        let record = LockRecord {
            token,
            ttl_seconds: self.ttl.as_secs(),
            created_at: Utc::now(),
        };
        let payload = serde_json::to_string(&record).map_err(|e| LockError::Codec {
            runid: runid.to_string(),
            relpath: relpath.to_string(),
            reason: e.to_string(),
        })?;
        let key = Self::lock_key(runid, relpath);
        if !self.kv.set_nx(&key, &payload, Some(self.ttl)) {
            return Err(LockError::AlreadyLocked {
                runid: runid.to_string(),
                relpath: relpath.to_string(),
            });
        }
        self.kv.hset(runid, &Self::flag_field(relpath), "true");
        Ok(token)
    }

    /// Releases the lock for `relpath` of `runid`.
    ///
    /// Without `force` the stored token must equal `local`; a missing
    /// record or a differing token raises [`LockError::TokenMismatch`].
    /// A forced unlock removes whatever is there.
    pub fn unlock(
        &self,
        runid: &str,
        relpath: &str,
        local: Option<Uuid>,
        force: bool,
    ) -> Result<(), LockError> {
        let key = Self::lock_key(runid, relpath);
        if !force {
            let stored = self.stored_token(runid, relpath);
            match (stored, local) {
                (Some(stored), Some(local)) if stored == local => {}
                _ => {
                    return Err(LockError::TokenMismatch {
                        runid: runid.to_string(),
                        relpath: relpath.to_string(),
                    });
                }
            }
        }
        self.kv.delete(&key);
        self.kv.hset(runid, &Self::flag_field(relpath), "false");
        Ok(())
    }

    /// Verifies that `local` still holds the lock for `relpath`.
    ///
    /// Used by dump: a holder whose record expired or was cleared gets
    /// [`LockError::NotLocked`].
    pub fn validate_held(
        &self,
        runid: &str,
        relpath: &str,
        local: Option<Uuid>,
    ) -> Result<(), LockError> {
        match (self.stored_token(runid, relpath), local) {
            (Some(stored), Some(local)) if stored == local => Ok(()),
            _ => Err(LockError::NotLocked {
                runid: runid.to_string(),
                relpath: relpath.to_string(),
            }),
        }
    }

    /// Returns whether `relpath` of `runid` is locked.
    ///
    /// The distributed key is authoritative; a stale legacy flag is
    /// rewritten to match.
    pub fn is_locked(&self, runid: &str, relpath: &str) -> bool {
        let held = self.kv.get(&Self::lock_key(runid, relpath)).is_some();
        let field = Self::flag_field(relpath);
        let flag = self.kv.hget(runid, &field);
        let flag_says = flag.as_deref() == Some("true");
        if flag_says != held {
            self.kv
                .hset(runid, &field, if held { "true" } else { "false" });
        }
        held
    }

    /// Administrative: removes every lock of `runid` and resets all legacy
    /// flags to `"false"`.
    ///
    /// Returns the set of flag fields that were live (held key or truthy
    /// flag) before the clear. Concurrently active holders lose their
    /// guarantee and will observe `TokenMismatch` on their next unlock.
    pub fn clear_locks(&self, runid: &str) -> BTreeSet<String> {
        let mut cleared = BTreeSet::new();
        let prefix = format!("lock:{}:", runid);
        for key in self.kv.scan(&prefix) {
            let relpath = key[prefix.len()..].to_string();
            self.kv.delete(&key);
            let field = Self::flag_field(&relpath);
            self.kv.hset(runid, &field, "false");
            cleared.insert(field);
        }
        for (field, value) in self.kv.hgetall(runid) {
            if field.starts_with("locked:") && value == "true" {
                self.kv.hset(runid, &field, "false");
                cleared.insert(field);
            }
        }
        cleared
    }

    /// Snapshot of relpath -> locked for every lock `runid` has ever seen.
    ///
    /// Legacy flag entries without a distributed key are normalized to
    /// `false` in the result and in the hash.
    pub fn lock_statuses(&self, runid: &str) -> BTreeMap<String, bool> {
        let mut statuses = BTreeMap::new();
        for (field, _) in self.kv.hgetall(runid) {
            if let Some(relpath) = field.strip_prefix("locked:") {
                statuses.insert(relpath.to_string(), self.is_locked(runid, relpath));
            }
        }
        let prefix = format!("lock:{}:", runid);
        for key in self.kv.scan(&prefix) {
            let relpath = key[prefix.len()..].to_string();
            statuses.insert(relpath.clone(), self.is_locked(runid, &relpath));
        }
        statuses
    }

    fn stored_token(&self, runid: &str, relpath: &str) -> Option<Uuid> {
        let payload = self.kv.get(&Self::lock_key(runid, relpath))?;
        serde_json::from_str::<LockRecord>(&payload)
            .ok()
            .map(|r| r.token)
    }
}
