//! Run directory layout, sentinels, and clone helpers.
//!
//! A run owns a directory tree:
//!
//! ```text
//! <wd>/
//!   <kind>.nodb          one per controller
//!   <kind>.log           run-scoped log files
//!   .<runid>             access log (touched on hydration)
//!   READONLY             sentinel: writes disabled, cache bypassed
//!   ARCHIVED             sentinel: run is frozen
//!   dem/  watershed/  landuse/  soils/  climate/  wepp/output/
//!   omni/scenarios/<name>/       scenario clones
//!   _pups/omni/scenarios/<name>  symlinked results trees of derived runs
//! ```
//!
//! [`clone_run_dir`] materializes scenario and batch-child runs: read-only
//! input directories become symlinks into the source run, `.nodb` files
//! are copied and rehomed to the clone's working directory, and sentinel
//! files are left behind.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

/// Sentinel disabling writes and the singleton cache.
pub const READONLY_SENTINEL: &str = "READONLY";

/// Sentinel marking an archived (frozen) run.
pub const ARCHIVED_SENTINEL: &str = "ARCHIVED";

/// Subdirectories considered read-only inputs when cloning.
const SYMLINKED_DIRS: &[&str] = &["dem", "watershed", "landuse", "soils", "climate"];

/// Results trees of derived runs, symlinked under the parent.
pub const PUPS_DIR: &str = "_pups";

/// Failures manipulating a run directory tree.
#[derive(Debug, Error)]
pub enum RunDirError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rehome {path}: {reason}")]
    Rehome { path: PathBuf, reason: String },
}

impl RunDirError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Whether the `READONLY` sentinel (or the archive sentinel) is present.
pub fn is_readonly(wd: &Path) -> bool {
    wd.join(READONLY_SENTINEL).exists() || is_archived(wd)
}

/// Whether the `ARCHIVED` sentinel is present.
pub fn is_archived(wd: &Path) -> bool {
    wd.join(ARCHIVED_SENTINEL).exists()
}

/// Appends a line to the run access log `.<runid>`.
///
/// Best effort; hydration never fails over the access log.
pub fn touch_access_log(wd: &Path, runid: &str) {
    let path = wd.join(format!(".{}", runid));
    let line = format!("{}\n", Utc::now().to_rfc3339());
    let _ = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()));
}

/// Creates the canonical subdirectory skeleton of a fresh run.
pub fn make_run_skeleton(wd: &Path) -> Result<(), RunDirError> {
    for sub in [
        "dem",
        "watershed",
        "landuse",
        "soils",
        "climate",
        "wepp/runs",
        "wepp/output",
        "wepp/output/interchange",
    ] {
        let path = wd.join(sub);
        fs::create_dir_all(&path).map_err(|e| RunDirError::io(&path, e))?;
    }
    Ok(())
}

/// Clones `src` into `dst` for a derived run.
///
/// - read-only input directories are symlinked back into `src`
/// - `.nodb` files are copied and rehomed (wd, and runid when given)
/// - other directories are created empty (outputs are regenerated)
/// - sentinel files, run logs, and `_pups/` are not carried over
/// - other top-level files are copied as-is
/// - the canonical skeleton is restored last, so pipeline stages can
///   write into `wepp/runs` and `wepp/output` of the clone immediately
pub fn clone_run_dir(
    src: &Path,
    dst: &Path,
    new_runid: Option<&str>,
) -> Result<(), RunDirError> {
    fs::create_dir_all(dst).map_err(|e| RunDirError::io(dst, e))?;
    let entries = fs::read_dir(src).map_err(|e| RunDirError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| RunDirError::io(src, e))?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy().to_string();
        let src_path = entry.path();
        let dst_path = dst.join(&name);

        if name_str == READONLY_SENTINEL || name_str == ARCHIVED_SENTINEL {
            continue;
        }
        if name_str.ends_with(".log") || name_str.starts_with('.') {
            continue;
        }
        // Derived-run bookkeeping belongs to the parent only.
        if name_str == PUPS_DIR {
            continue;
        }

        let file_type = entry.file_type().map_err(|e| RunDirError::io(&src_path, e))?;
        if file_type.is_dir() {
            if SYMLINKED_DIRS.contains(&name_str.as_str()) {
                symlink(&src_path, &dst_path).map_err(|e| RunDirError::io(&dst_path, e))?;
            } else {
                fs::create_dir_all(&dst_path).map_err(|e| RunDirError::io(&dst_path, e))?;
            }
        } else if name_str.ends_with(".nodb") {
            fs::copy(&src_path, &dst_path).map_err(|e| RunDirError::io(&dst_path, e))?;
            rehome_nodb(&dst_path, dst, new_runid)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|e| RunDirError::io(&dst_path, e))?;
        }
    }
    // A template run may carry its outputs at top level only; the nested
    // skeleton (`wepp/runs`, `wepp/output/interchange`) must exist in the
    // clone before any pipeline stage writes into it.
    make_run_skeleton(dst)?;
    Ok(())
}

/// Symlinks a derived run's results tree under the parent's `_pups/`.
pub fn link_pup(parent: &Path, rel: &str, target: &Path) -> Result<(), RunDirError> {
    let link = parent.join(PUPS_DIR).join(rel);
    if let Some(dir) = link.parent() {
        fs::create_dir_all(dir).map_err(|e| RunDirError::io(dir, e))?;
    }
    symlink(target, &link).map_err(|e| RunDirError::io(&link, e))
}

/// Rewrites the `wd` (and optionally `runid`) recorded inside a `.nodb`
/// document so a copied controller points at its new home.
pub fn rehome_nodb(
    path: &Path,
    new_wd: &Path,
    new_runid: Option<&str>,
) -> Result<(), RunDirError> {
    let raw = fs::read_to_string(path).map_err(|e| RunDirError::io(path, e))?;
    let mut doc: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| RunDirError::Rehome {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let base = doc
        .get_mut("state")
        .and_then(|s| s.get_mut("base"))
        .ok_or_else(|| RunDirError::Rehome {
            path: path.to_path_buf(),
            reason: "document has no state.base".to_string(),
        })?;
    base["wd"] = serde_json::Value::String(new_wd.to_string_lossy().into_owned());
    if let Some(runid) = new_runid {
        base["runid"] = serde_json::Value::String(runid.to_string());
    }
    let out = serde_json::to_string_pretty(&doc).map_err(|e| RunDirError::Rehome {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::write(path, out).map_err(|e| RunDirError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_nodb(wd: &Path, kind: &str, runid: &str) {
        let doc = serde_json::json!({
            "kind": kind,
            "state": { "base": { "wd": wd.to_string_lossy(), "runid": runid } }
        });
        fs::write(
            wd.join(format!("{}.nodb", kind)),
            serde_json::to_string_pretty(&doc).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_sentinels() {
        let wd = tempdir().unwrap();
        assert!(!is_readonly(wd.path()));
        fs::write(wd.path().join(READONLY_SENTINEL), "").unwrap();
        assert!(is_readonly(wd.path()));
        assert!(!is_archived(wd.path()));
        fs::write(wd.path().join(ARCHIVED_SENTINEL), "").unwrap();
        assert!(is_archived(wd.path()));
    }

    #[test]
    fn test_skeleton_creates_expected_tree() {
        let wd = tempdir().unwrap();
        make_run_skeleton(wd.path()).unwrap();
        assert!(wd.path().join("dem").is_dir());
        assert!(wd.path().join("wepp/output/interchange").is_dir());
    }

    #[test]
    fn test_clone_symlinks_inputs_and_rehomes_nodb() {
        let root = tempdir().unwrap();
        let src = root.path().join("parent");
        let dst = root.path().join("child");
        fs::create_dir_all(&src).unwrap();
        make_run_skeleton(&src).unwrap();
        fs::write(src.join("dem/dem.tif"), b"raster").unwrap();
        write_nodb(&src, "ron", "parent");
        fs::write(src.join("ron.log"), "old log").unwrap();
        fs::write(src.join(READONLY_SENTINEL), "").unwrap();

        clone_run_dir(&src, &dst, Some("child")).unwrap();

        // Inputs are symlinked, shared with the parent.
        assert!(dst.join("dem").symlink_metadata().unwrap().is_symlink());
        assert_eq!(fs::read(dst.join("dem/dem.tif")).unwrap(), b"raster");
        // Outputs come back empty, with the full nested skeleton.
        assert!(dst.join("wepp").is_dir());
        assert!(!dst.join("wepp").symlink_metadata().unwrap().is_symlink());
        assert!(dst.join("wepp/runs").is_dir());
        assert!(dst.join("wepp/output/interchange").is_dir());
        // Sentinels and logs are not carried over.
        assert!(!dst.join(READONLY_SENTINEL).exists());
        assert!(!dst.join("ron.log").exists());
        // The controller now points at its new home.
        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dst.join("ron.nodb")).unwrap()).unwrap();
        assert_eq!(
            doc["state"]["base"]["wd"].as_str().unwrap(),
            dst.to_string_lossy()
        );
        assert_eq!(doc["state"]["base"]["runid"].as_str().unwrap(), "child");
    }

    #[test]
    fn test_clone_accepts_pipeline_writes_immediately() {
        let root = tempdir().unwrap();
        let src = root.path().join("parent");
        let dst = root.path().join("child");
        fs::create_dir_all(&src).unwrap();
        make_run_skeleton(&src).unwrap();
        write_nodb(&src, "ron", "parent");

        clone_run_dir(&src, &dst, Some("child")).unwrap();

        // A WEPP prep in the clone writes straight into the nested tree.
        fs::write(dst.join("wepp/runs/p1.run"), "hillslope 1").unwrap();
        fs::write(dst.join("wepp/output/H1.pass.json"), "{}").unwrap();
    }

    #[test]
    fn test_link_pup_registers_results_tree() {
        let root = tempdir().unwrap();
        let parent = root.path().join("parent");
        let child = parent.join("omni/scenarios/sev1");
        fs::create_dir_all(&child).unwrap();
        fs::write(child.join("marker"), "x").unwrap();

        link_pup(&parent, "omni/scenarios/sev1", &child).unwrap();
        let link = parent.join("_pups/omni/scenarios/sev1");
        assert!(link.symlink_metadata().unwrap().is_symlink());
        assert_eq!(fs::read(link.join("marker")).unwrap(), b"x");

        // The results tree is bookkeeping of this run; clones do not
        // inherit it.
        write_nodb(&parent, "ron", "parent");
        let clone = root.path().join("clone");
        clone_run_dir(&parent, &clone, Some("clone")).unwrap();
        assert!(!clone.join("_pups").exists());
    }

    #[test]
    fn test_rehome_rejects_malformed_document() {
        let wd = tempdir().unwrap();
        let path = wd.path().join("broken.nodb");
        fs::write(&path, "{\"kind\": \"ron\"}").unwrap();
        let err = rehome_nodb(&path, wd.path(), None).unwrap_err();
        assert!(matches!(err, RunDirError::Rehome { .. }));
    }
}
