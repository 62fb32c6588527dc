//! wepprun - Run-controller subsystem for watershed erosion modeling
//!
//! This library is the state machine of a single watershed modeling run:
//! a set of persistent, file-backed domain controllers (Ron, Watershed,
//! Landuse, Soils, Climate, Wepp, plus optional mods) that orchestrate
//! channel delineation, subcatchment abstraction, landuse and soil
//! assignment, climate generation, and WEPP execution.
//!
//! # High-Level API
//!
//! Runs are anchored to a working directory and identified by an opaque
//! `runid`. Controllers are hydrated through the [`nodb::Registry`], which
//! caches one instance per (run, kind) and invalidates on mtime:
//!
//! ```ignore
//! use wepprun::nodb::{Registry, Platform};
//! use wepprun::controllers::Watershed;
//!
//! let registry = Registry::new(platform, runs_root);
//! let watershed = registry.get_instance::<Watershed>("little-salmon", false)?;
//! watershed.set_outlet(&registry, -116.02, 45.51)?;
//! ```
//!
//! Mutations follow a strict `lock -> mutate -> dump -> unlock` scope
//! mediated by a distributed lock (see [`lock`]); long-running pipeline
//! stages are executed by the background [`executor::JobPool`], and batch
//! fan-out over vector features lives in [`batch`].

pub mod batch;
pub mod config;
pub mod controllers;
pub mod executor;
pub mod kv;
pub mod lock;
pub mod logging;
pub mod nodb;
pub mod preflight;
pub mod process;
pub mod rundir;
pub mod status;
pub mod trigger;

/// Version of the wepprun library.
///
/// Synchronized across the workspace; defined in `Cargo.toml` and injected
/// at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
