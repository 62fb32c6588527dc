//! Singleton cache of controller handles.
//!
//! The registry guarantees at most one live handle per (run directory,
//! kind) within a process, invalidated when the on-disk document's mtime
//! advances. Read-only runs and `ignore_lock` hydrations bypass the
//! cache, so they always get a fresh instance and never hold the
//! singleton slot.
//!
//! The registry also owns the cleanup entry points that stop run log
//! queue listeners and release their file descriptors.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;

use super::{run_is_readonly, store, Controller, Nodb, NodbError, NodbKind, Platform};
use crate::logging::RunLogger;
use crate::rundir;

struct Slot {
    /// Type-erased `Nodb<C>` handle.
    handle: Box<dyn Any + Send + Sync>,
    logger: Arc<RunLogger>,
    runid: String,
}

/// Process-wide controller cache and factory.
pub struct Registry {
    platform: Arc<Platform>,
    runs_root: PathBuf,
    cache: DashMap<(PathBuf, NodbKind), Slot>,
}

impl Registry {
    pub fn new(platform: Arc<Platform>, runs_root: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            runs_root: runs_root.into(),
            cache: DashMap::new(),
        }
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn runs_root(&self) -> &Path {
        &self.runs_root
    }

    /// Resolves a runid to its working directory.
    pub fn wd_for(&self, runid: &str) -> PathBuf {
        self.runs_root.join(runid)
    }

    /// Creates a controller for `runid`, writing the initial document and
    /// the run directory skeleton.
    pub fn create<C: Controller>(&self, runid: &str, state: C) -> Result<Nodb<C>, NodbError> {
        let wd = self.wd_for(runid);
        self.create_at(&wd, runid, state)
    }

    /// Creates a controller anchored at an explicit directory (scenario
    /// clones, batch children).
    pub fn create_at<C: Controller>(
        &self,
        wd: &Path,
        runid: &str,
        state: C,
    ) -> Result<Nodb<C>, NodbError> {
        std::fs::create_dir_all(wd).map_err(|e| NodbError::Io {
            path: wd.to_path_buf(),
            source: e,
        })?;
        rundir::make_run_skeleton(wd).map_err(|e| match e {
            rundir::RunDirError::Io { path, source } => NodbError::Io { path, source },
            rundir::RunDirError::Rehome { path, reason } => NodbError::Serde { path, reason },
        })?;
        let path = wd.join(C::KIND.filename());
        let mtime = store::write_document::<C>(&path, &state, self.platform.kv.as_ref())?;
        let readonly = run_is_readonly(wd);
        let logger = RunLogger::start(runid, C::KIND.tag(), wd, Arc::clone(&self.platform.kv));
        let handle = Nodb::assemble(
            wd.to_path_buf(),
            runid.to_string(),
            Arc::clone(&self.platform),
            readonly,
            state,
            Some(mtime),
            Arc::clone(&logger),
        );
        if !readonly {
            self.cache.insert(
                (wd.to_path_buf(), C::KIND),
                Slot {
                    handle: Box::new(handle.clone()),
                    logger,
                    runid: runid.to_string(),
                },
            );
        }
        Ok(handle)
    }

    /// Returns the singleton handle for `(runid, C)`.
    ///
    /// The cached instance is returned as long as the document's mtime
    /// has not advanced; otherwise a fresh hydration replaces the slot.
    /// `ignore_lock` (and read-only runs) bypass the cache entirely.
    pub fn get_instance<C: Controller>(
        &self,
        runid: &str,
        ignore_lock: bool,
    ) -> Result<Nodb<C>, NodbError> {
        let wd = self.wd_for(runid);
        self.get_instance_at(&wd, runid, ignore_lock)
    }

    /// Singleton lookup anchored at an explicit directory.
    pub fn get_instance_at<C: Controller>(
        &self,
        wd: &Path,
        runid: &str,
        ignore_lock: bool,
    ) -> Result<Nodb<C>, NodbError> {
        let path = wd.join(C::KIND.filename());
        let meta = std::fs::metadata(&path).map_err(|_| NodbError::NotFound {
            kind: C::KIND,
            path: path.clone(),
        })?;
        let disk_mtime = meta.modified().map_err(|e| NodbError::Io {
            path: path.clone(),
            source: e,
        })?;
        let readonly = run_is_readonly(wd);
        let bypass_cache = readonly || ignore_lock;
        let key = (wd.to_path_buf(), C::KIND);

        if !bypass_cache {
            if let Some(slot) = self.cache.get(&key) {
                if let Some(handle) = slot.handle.downcast_ref::<Nodb<C>>() {
                    if handle.recorded_mtime() == Some(disk_mtime) {
                        return Ok(handle.clone());
                    }
                }
            }
        }

        rundir::touch_access_log(wd, runid);
        let (state, mtime) =
            store::load_document::<C>(&path, self.platform.kv.as_ref())?;
        let logger = RunLogger::start(runid, C::KIND.tag(), wd, Arc::clone(&self.platform.kv));
        let handle = Nodb::assemble(
            wd.to_path_buf(),
            runid.to_string(),
            Arc::clone(&self.platform),
            readonly,
            state,
            Some(mtime),
            Arc::clone(&logger),
        );
        if !bypass_cache {
            // Replacing a stale slot drops the old logger reference; its
            // listener stops when the last handle clone goes away.
            self.cache.insert(
                key,
                Slot {
                    handle: Box::new(handle.clone()),
                    logger,
                    runid: runid.to_string(),
                },
            );
        }
        Ok(handle)
    }

    /// Whether a controller document exists for `(runid, C)`.
    pub fn has_instance<C: Controller>(&self, runid: &str) -> bool {
        self.wd_for(runid).join(C::KIND.filename()).exists()
    }

    /// Stops the queue listener and evicts the cache for every instance
    /// of `kind`.
    pub fn cleanup_all_instances(&self, kind: NodbKind) {
        let keys: Vec<(PathBuf, NodbKind)> = self
            .cache
            .iter()
            .filter(|e| e.key().1 == kind)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, slot)) = self.cache.remove(&key) {
                slot.logger.safe_stop_queue_listener();
            }
        }
    }

    /// Stops listeners and evicts the cache for one run across all kinds.
    pub fn cleanup_run_instances(&self, runid: &str) {
        let keys: Vec<(PathBuf, NodbKind)> = self
            .cache
            .iter()
            .filter(|e| e.value().runid == runid)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, slot)) = self.cache.remove(&key) {
                slot.logger.safe_stop_queue_listener();
            }
        }
    }

    /// Number of cached instances, across all kinds.
    pub fn cached_instances(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::nodb::NodbBase;
    use crate::process::SystemToolRunner;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        base: NodbBase,
        value: String,
    }

    impl Controller for Sample {
        const KIND: NodbKind = NodbKind::Ron;
    }

    fn registry() -> (Registry, TempDir) {
        let root = TempDir::new().unwrap();
        let platform = Platform::new(
            Arc::new(MemoryKv::new()),
            Arc::new(SystemToolRunner::new()),
        );
        (Registry::new(platform, root.path()), root)
    }

    fn seed(registry: &Registry, runid: &str, value: &str) -> Nodb<Sample> {
        let wd = registry.wd_for(runid);
        registry
            .create_at(
                &wd,
                runid,
                Sample {
                    base: NodbBase::new(&wd, runid, "default"),
                    value: value.to_string(),
                },
            )
            .unwrap()
    }

    #[test]
    fn test_singleton_identity_until_mtime_advances() {
        let (registry, _root) = registry();
        seed(&registry, "r1", "initial");
        let a = registry.get_instance::<Sample>("r1", false).unwrap();
        let b = registry.get_instance::<Sample>("r1", false).unwrap();
        assert!(Arc::ptr_eq(&a.state, &b.state));

        // External rewrite advances the mtime.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let path = registry.wd_for("r1").join("ron.nodb");
        let raw = std::fs::read_to_string(&path)
            .unwrap()
            .replace("initial", "updated");
        std::fs::write(&path, raw).unwrap();

        let c = registry.get_instance::<Sample>("r1", false).unwrap();
        assert!(!Arc::ptr_eq(&a.state, &c.state));
        assert_eq!(c.read(|p| p.value.clone()), "updated");
    }

    #[test]
    fn test_missing_document_is_not_found() {
        let (registry, _root) = registry();
        let err = registry.get_instance::<Sample>("ghost", false).unwrap_err();
        assert!(matches!(err, NodbError::NotFound { .. }));
    }

    #[test]
    fn test_readonly_run_bypasses_cache() {
        let (registry, _root) = registry();
        seed(&registry, "r1", "x");
        registry.cleanup_run_instances("r1");
        std::fs::write(registry.wd_for("r1").join("READONLY"), "").unwrap();

        let a = registry.get_instance::<Sample>("r1", false).unwrap();
        let b = registry.get_instance::<Sample>("r1", false).unwrap();
        assert!(!Arc::ptr_eq(&a.state, &b.state));
        assert_eq!(registry.cached_instances(), 0);
        assert!(a.is_readonly());
        assert!(matches!(
            a.lock().unwrap_err(),
            NodbError::ReadonlyViolation { .. }
        ));
    }

    #[test]
    fn test_ignore_lock_bypasses_cache() {
        let (registry, _root) = registry();
        let cached = seed(&registry, "r1", "x");
        let fresh = registry.get_instance::<Sample>("r1", true).unwrap();
        assert!(!Arc::ptr_eq(&cached.state, &fresh.state));
        // The cached slot is untouched.
        let again = registry.get_instance::<Sample>("r1", false).unwrap();
        assert!(Arc::ptr_eq(&cached.state, &again.state));
    }

    #[test]
    fn test_cleanup_all_instances_empties_kind() {
        let (registry, _root) = registry();
        seed(&registry, "r1", "x");
        seed(&registry, "r2", "y");
        assert_eq!(registry.cached_instances(), 2);
        registry.cleanup_all_instances(NodbKind::Ron);
        assert_eq!(registry.cached_instances(), 0);
    }
}
