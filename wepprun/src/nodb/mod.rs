//! NoDb base: persistence, identity, and locking of run controllers.
//!
//! Every controller is a plain serde struct persisted to `<kind>.nodb`
//! inside the run directory, wrapped at runtime by the [`Nodb`] handle
//! which carries the non-serialized collaborators: the local lock token,
//! the run logger, and the platform services (KV store, lock manager,
//! tool runner, status messenger).
//!
//! Handles are obtained through the [`Registry`], which guarantees one
//! live instance per (run directory, kind) as long as the on-disk
//! document's mtime has not advanced. Read-only runs bypass the cache
//! entirely and refuse locks and dumps.
//!
//! Mutations follow the `lock -> mutate -> dump -> unlock` scope enforced
//! by [`Nodb::with_locked`].

mod registry;
mod store;

pub use registry::Registry;
pub use store::{canonical_kind_tag, decode_document, encode_document};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::kv::KvStore;
use crate::lock::{LockError, LockManager};
use crate::logging::RunLogger;
use crate::process::ToolRunner;
use crate::rundir;
use crate::status::{RedisPrep, StatusMessenger};

/// Closed set of controller kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodbKind {
    Ron,
    Watershed,
    Landuse,
    Soils,
    Climate,
    Wepp,
    WeppPost,
    Disturbed,
    Rap,
    Ash,
    Omni,
}

impl NodbKind {
    /// Canonical type tag written into `.nodb` documents.
    pub fn tag(&self) -> &'static str {
        match self {
            NodbKind::Ron => "ron",
            NodbKind::Watershed => "watershed",
            NodbKind::Landuse => "landuse",
            NodbKind::Soils => "soils",
            NodbKind::Climate => "climate",
            NodbKind::Wepp => "wepp",
            NodbKind::WeppPost => "wepppost",
            NodbKind::Disturbed => "disturbed",
            NodbKind::Rap => "rap",
            NodbKind::Ash => "ash",
            NodbKind::Omni => "omni",
        }
    }

    /// File name of the persisted document.
    pub fn filename(&self) -> String {
        format!("{}.nodb", self.tag())
    }

    /// Resolves a canonical tag back to a kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ron" => Some(NodbKind::Ron),
            "watershed" => Some(NodbKind::Watershed),
            "landuse" => Some(NodbKind::Landuse),
            "soils" => Some(NodbKind::Soils),
            "climate" => Some(NodbKind::Climate),
            "wepp" => Some(NodbKind::Wepp),
            "wepppost" => Some(NodbKind::WeppPost),
            "disturbed" => Some(NodbKind::Disturbed),
            "rap" => Some(NodbKind::Rap),
            "ash" => Some(NodbKind::Ash),
            "omni" => Some(NodbKind::Omni),
            _ => None,
        }
    }

    pub fn all() -> &'static [NodbKind] {
        &[
            NodbKind::Ron,
            NodbKind::Watershed,
            NodbKind::Landuse,
            NodbKind::Soils,
            NodbKind::Climate,
            NodbKind::Wepp,
            NodbKind::WeppPost,
            NodbKind::Disturbed,
            NodbKind::Rap,
            NodbKind::Ash,
            NodbKind::Omni,
        ]
    }
}

impl std::fmt::Display for NodbKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Persistence and locking failures.
#[derive(Debug, Error)]
pub enum NodbError {
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Write attempted on a read-only run.
    #[error("run {runid} is read-only")]
    ReadonlyViolation { runid: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {reason}")]
    Serde { path: PathBuf, reason: String },

    #[error("{path} holds a {found} document, expected {expected}")]
    KindMismatch {
        path: PathBuf,
        expected: &'static str,
        found: String,
    },

    #[error("no {kind} controller at {path}")]
    NotFound { kind: NodbKind, path: PathBuf },
}

/// A persistent controller state type.
///
/// Implementors are plain serde structs; identity, locking, and
/// persistence live in the wrapping [`Nodb`] handle.
pub trait Controller: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: NodbKind;
}

/// Fields shared by every controller state struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodbBase {
    /// Absolute working directory of the run.
    pub wd: PathBuf,
    /// Opaque run identifier.
    pub runid: String,
    /// Profile name the run was constructed with.
    pub profile: String,
}

impl NodbBase {
    pub fn new(wd: impl Into<PathBuf>, runid: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            wd: wd.into(),
            runid: runid.into(),
            profile: profile.into(),
        }
    }
}

/// Shared platform services injected into every controller handle.
pub struct Platform {
    pub kv: Arc<dyn KvStore>,
    pub tools: Arc<dyn ToolRunner>,
    pub locks: LockManager,
    pub status: StatusMessenger,
    pub prep: RedisPrep,
}

impl Platform {
    pub fn new(kv: Arc<dyn KvStore>, tools: Arc<dyn ToolRunner>) -> Arc<Self> {
        let locks = LockManager::new(Arc::clone(&kv));
        Self::with_locks(kv, tools, locks)
    }

    /// Platform with a custom lock manager (e.g. shortened TTL).
    pub fn with_locks(
        kv: Arc<dyn KvStore>,
        tools: Arc<dyn ToolRunner>,
        locks: LockManager,
    ) -> Arc<Self> {
        Arc::new(Self {
            status: StatusMessenger::new(Arc::clone(&kv)),
            prep: RedisPrep::new(Arc::clone(&kv)),
            locks,
            tools,
            kv,
        })
    }
}

/// Handle to a persistent controller.
///
/// Cloning is cheap and preserves identity: all clones share the same
/// state, local token, and logger. The registry hands out clones of one
/// handle per (run, kind) until the on-disk mtime advances.
pub struct Nodb<C: Controller> {
    wd: PathBuf,
    runid: String,
    platform: Arc<Platform>,
    readonly: bool,
    state: Arc<RwLock<C>>,
    token: Arc<Mutex<Option<Uuid>>>,
    mtime: Arc<Mutex<Option<SystemTime>>>,
    logger: Arc<RunLogger>,
}

impl<C: Controller> std::fmt::Debug for Nodb<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nodb")
            .field("wd", &self.wd)
            .field("runid", &self.runid)
            .field("readonly", &self.readonly)
            .finish()
    }
}

impl<C: Controller> Clone for Nodb<C> {
    fn clone(&self) -> Self {
        Self {
            wd: self.wd.clone(),
            runid: self.runid.clone(),
            platform: Arc::clone(&self.platform),
            readonly: self.readonly,
            state: Arc::clone(&self.state),
            token: Arc::clone(&self.token),
            mtime: Arc::clone(&self.mtime),
            logger: Arc::clone(&self.logger),
        }
    }
}

impl<C: Controller> Nodb<C> {
    pub(crate) fn assemble(
        wd: PathBuf,
        runid: String,
        platform: Arc<Platform>,
        readonly: bool,
        state: C,
        mtime: Option<SystemTime>,
        logger: Arc<RunLogger>,
    ) -> Self {
        Self {
            wd,
            runid,
            platform,
            readonly,
            state: Arc::new(RwLock::new(state)),
            token: Arc::new(Mutex::new(None)),
            mtime: Arc::new(Mutex::new(mtime)),
            logger,
        }
    }

    pub fn runid(&self) -> &str {
        &self.runid
    }

    pub fn wd(&self) -> &Path {
        &self.wd
    }

    pub fn kind(&self) -> NodbKind {
        C::KIND
    }

    /// Path of the persisted document relative to the run directory.
    pub fn relpath(&self) -> String {
        C::KIND.filename()
    }

    pub fn path(&self) -> PathBuf {
        self.wd.join(self.relpath())
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn logger(&self) -> &Arc<RunLogger> {
        &self.logger
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn recorded_mtime(&self) -> Option<SystemTime> {
        *self.mtime.lock().unwrap()
    }

    /// The token this handle believes it holds, if any.
    pub fn local_token(&self) -> Option<Uuid> {
        *self.token.lock().unwrap()
    }

    /// Drops the local token without touching the distributed key.
    ///
    /// Used in tests and crash simulations; a subsequent `unlock` raises
    /// `TokenMismatch`.
    pub fn forget_local_token(&self) {
        self.token.lock().unwrap().take();
    }

    /// Acquires the distributed lock for this controller.
    pub fn lock(&self) -> Result<(), NodbError> {
        if self.readonly {
            return Err(NodbError::ReadonlyViolation {
                runid: self.runid.clone(),
            });
        }
        let token = self
            .platform
            .locks
            .lock(&self.runid, &self.relpath())?;
        *self.token.lock().unwrap() = Some(token);
        Ok(())
    }

    /// Releases the distributed lock.
    ///
    /// Without `force` the local token must match the stored token.
    pub fn unlock(&self, force: bool) -> Result<(), NodbError> {
        let local = self.local_token();
        self.platform
            .locks
            .unlock(&self.runid, &self.relpath(), local, force)?;
        self.token.lock().unwrap().take();
        Ok(())
    }

    /// Whether the distributed key for this controller exists.
    pub fn is_locked(&self) -> bool {
        self.platform.locks.is_locked(&self.runid, &self.relpath())
    }

    /// Runs `f` against the current state without locking.
    pub fn read<T>(&self, f: impl FnOnce(&C) -> T) -> T {
        f(&self.state.read().unwrap())
    }

    /// Persists the current state.
    ///
    /// Fails with `NotLocked` unless this handle still holds the
    /// distributed lock; a holder that ran past the TTL surfaces the
    /// loss here. The write is atomic (temp file + rename) and refreshes
    /// the shared document cache.
    pub fn dump(&self) -> Result<(), NodbError> {
        if self.readonly {
            return Err(NodbError::ReadonlyViolation {
                runid: self.runid.clone(),
            });
        }
        self.platform
            .locks
            .validate_held(&self.runid, &self.relpath(), self.local_token())?;
        let state = self.state.read().unwrap();
        let mtime = store::write_document::<C>(&self.path(), &state, self.platform.kv.as_ref())?;
        *self.mtime.lock().unwrap() = Some(mtime);
        Ok(())
    }

    /// The `lock -> mutate -> dump -> unlock` scope.
    ///
    /// Guarantees the unlock on every path. A failed acquisition raises
    /// `AlreadyLocked` without mutating state; a failed dump (e.g. lock
    /// lost to TTL expiry during `f`) is surfaced after the unlock
    /// attempt.
    pub fn with_locked<T, E>(&self, f: impl FnOnce(&mut C) -> Result<T, E>) -> Result<T, E>
    where
        E: From<NodbError>,
    {
        self.lock()?;
        let outcome = {
            let mut state = self.state.write().unwrap();
            f(&mut state)
        };
        match outcome {
            Ok(value) => match self.dump() {
                Ok(()) => {
                    self.unlock(false)?;
                    Ok(value)
                }
                Err(dump_err) => {
                    if let Err(unlock_err) = self.unlock(false) {
                        tracing::debug!(
                            runid = %self.runid,
                            kind = %C::KIND,
                            error = %unlock_err,
                            "unlock after failed dump also failed"
                        );
                    }
                    Err(E::from(dump_err))
                }
            },
            Err(err) => {
                if let Err(unlock_err) = self.unlock(false) {
                    tracing::debug!(
                        runid = %self.runid,
                        kind = %C::KIND,
                        error = %unlock_err,
                        "unlock after aborted mutation failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Reloads state from disk, bypassing the document cache.
    pub fn reload(&self) -> Result<(), NodbError> {
        let path = self.path();
        let raw = std::fs::read_to_string(&path).map_err(|e| NodbError::Io {
            path: path.clone(),
            source: e,
        })?;
        let fresh = store::decode_document::<C>(&raw, &path)?;
        *self.state.write().unwrap() = fresh;
        let meta = std::fs::metadata(&path).map_err(|e| NodbError::Io {
            path: path.clone(),
            source: e,
        })?;
        *self.mtime.lock().unwrap() = meta.modified().ok();
        Ok(())
    }
}

/// Readonly helper shared with the registry.
pub(crate) fn run_is_readonly(wd: &Path) -> bool {
    rundir::is_readonly(wd)
}
