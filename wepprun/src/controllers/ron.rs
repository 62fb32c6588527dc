//! Ron: run metadata and DEM acquisition.
//!
//! Ron is the root controller of a run. It owns the descriptive metadata
//! (name, scenario), the map view (center, zoom, extent, cellsize), the
//! full resolved [`RunConfig`], and the DEM fetch that everything
//! downstream rasterizes against.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ControllerError;
use crate::config::RunConfig;
use crate::nodb::{Controller, Nodb, NodbBase, NodbKind, Registry};
use crate::process::run_binary;
use crate::status::{EventKind, TaskEnum};
use crate::trigger::{TriggerBus, TriggerEvent};

/// Wrapper resolving the configured elevation provider; takes an extent
/// and cellsize and writes a GeoTIFF.
const DEM_FETCH_BIN: &str = "wc-dem-fetch";

const DEM_FETCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Root controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ron {
    pub base: NodbBase,
    pub config: RunConfig,
    pub name: String,
    pub scenario: String,
    pub cellsize: f64,
    pub center_lat: f64,
    pub center_lon: f64,
    pub zoom: u8,
    /// `[min_lon, min_lat, max_lon, max_lat]`, set before DEM fetch.
    pub extent: Option<[f64; 4]>,
    /// Fetched raster, relative to the run directory.
    pub dem_path: Option<PathBuf>,
}

impl Controller for Ron {
    const KIND: NodbKind = NodbKind::Ron;
}

impl Ron {
    pub fn new(base: NodbBase, config: RunConfig) -> Self {
        Self {
            cellsize: config.general.cellsize,
            center_lat: config.map.center_lat,
            center_lon: config.map.center_lon,
            zoom: config.map.zoom,
            extent: config.map.extent,
            base,
            config,
            name: String::new(),
            scenario: String::new(),
            dem_path: None,
        }
    }

    /// Creates the run: directory skeleton, initial document, prep
    /// timestamp, and the `ON_INIT_FINISH` trigger.
    pub fn initialize(
        registry: &Registry,
        bus: &TriggerBus,
        runid: &str,
        config: RunConfig,
    ) -> Result<Nodb<Ron>, ControllerError> {
        let wd = registry.wd_for(runid);
        let profile = config.profile.clone();
        let state = Ron::new(NodbBase::new(&wd, runid, profile), config);
        let handle = registry.create_at(&wd, runid, state)?;
        let platform = registry.platform();
        platform.prep.timestamp(runid, TaskEnum::ProjectInit);
        platform
            .status
            .publish(runid, "ron", EventKind::Completed, "project_init");
        bus.emit(registry, runid, TriggerEvent::InitFinish)?;
        Ok(handle)
    }
}

impl Nodb<Ron> {
    /// Sets the display name and scenario label.
    pub fn set_name(&self, name: &str, scenario: &str) -> Result<(), ControllerError> {
        self.with_locked(|ron| {
            ron.name = name.to_string();
            ron.scenario = scenario.to_string();
            Ok(())
        })
    }

    /// Sets the map view the DEM will be fetched against.
    pub fn set_map(
        &self,
        extent: [f64; 4],
        center: (f64, f64),
        zoom: u8,
    ) -> Result<(), ControllerError> {
        let [min_lon, min_lat, max_lon, max_lat] = extent;
        if min_lon >= max_lon || min_lat >= max_lat {
            return Err(ControllerError::Validation(format!(
                "degenerate extent [{min_lon}, {min_lat}, {max_lon}, {max_lat}]"
            )));
        }
        self.with_locked(|ron| {
            ron.extent = Some(extent);
            ron.center_lat = center.0;
            ron.center_lon = center.1;
            ron.zoom = zoom;
            Ok(())
        })
    }

    /// Fetches the DEM for the current extent into `dem/dem.tif`.
    pub fn fetch_dem(&self, registry: &Registry) -> Result<(), ControllerError> {
        let (extent, cellsize) = self.read(|ron| (ron.extent, ron.cellsize));
        let extent = extent.ok_or_else(|| ControllerError::MissingPrerequisite {
            operation: "fetch_dem",
            prerequisite: "a map extent".to_string(),
        })?;

        let platform = registry.platform();
        platform
            .status
            .publish(self.runid(), "ron", EventKind::Started, "fetch_dem");
        self.logger().info(format!(
            "fetching dem for extent {:?} at {} m",
            extent, cellsize
        ));

        let relpath = PathBuf::from("dem/dem.tif");
        let argv = vec![
            DEM_FETCH_BIN.to_string(),
            "--extent".to_string(),
            extent.map(|v| v.to_string()).join(","),
            "--cellsize".to_string(),
            cellsize.to_string(),
            "-o".to_string(),
            relpath.to_string_lossy().into_owned(),
        ];
        let outcome = run_binary(
            platform.tools.as_ref(),
            argv,
            self.wd(),
            DEM_FETCH_TIMEOUT,
        );
        if let Err(source) = outcome {
            self.logger().error(format!("dem fetch failed: {source}"));
            platform
                .status
                .exception(self.runid(), "ron", "fetch_dem", &source.to_string());
            return Err(ControllerError::ExternalToolFailure {
                operation: "fetch_dem",
                source,
            });
        }
        if !self.wd().join(&relpath).exists() {
            return Err(ControllerError::MissingOutput {
                operation: "fetch_dem",
                path: relpath,
            });
        }

        self.with_locked(|ron| {
            ron.dem_path = Some(relpath.clone());
            Ok::<_, ControllerError>(())
        })?;
        platform.prep.timestamp(self.runid(), TaskEnum::FetchDem);
        platform
            .status
            .publish(self.runid(), "ron", EventKind::Completed, "fetch_dem");
        Ok(())
    }

    /// Whether a DEM has been fetched.
    pub fn has_dem(&self) -> bool {
        self.read(|ron| ron.dem_path.clone())
            .map(|p| self.wd().join(p).exists())
            .unwrap_or(false)
    }
}
