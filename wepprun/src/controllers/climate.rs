//! Climate: CLIGEN station selection and climate file generation.
//!
//! Station selection works off a JSON catalog (`climate.cligen_db`)
//! using one of three modes; generation drives the CLIGEN binary per
//! spatial mode, producing `.cli` files under `climate/`. The simulation
//! start year is published to the prep-state hash so downstream
//! processors emit gregorian dates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ControllerError;
use crate::nodb::{Controller, Nodb, NodbBase, NodbError, NodbKind, Registry};
use crate::process::run_binary;
use crate::status::{EventKind, TaskEnum};
use crate::trigger::{TriggerBus, TriggerEvent};

use super::watershed::Watershed;

const CLIGEN_TIMEOUT: Duration = Duration::from_secs(900);

/// Prep-state field carrying the published start year.
pub const START_YEAR_FIELD: &str = "climate_start_year";

/// How the CLIGEN station is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationMode {
    #[default]
    Closest,
    /// Closest station with a record long enough for stable statistics.
    Heuristic,
    Specified,
}

/// How climate files map onto the watershed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClimateSpatialMode {
    /// One file for the whole watershed.
    #[default]
    Single,
    /// One file per hillslope.
    Multiple,
    /// One file per hillslope, spatially interpolated.
    MultipleInterpolated,
}

/// One CLIGEN station from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub desc: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Years of record.
    pub years: u32,
}

/// Minimum record length the heuristic mode accepts.
const HEURISTIC_MIN_YEARS: u32 = 30;

/// Loads the station catalog from a JSON array.
pub fn load_station_catalog(path: &Path) -> Result<Vec<Station>, ControllerError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ControllerError::Nodb(NodbError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        ControllerError::Validation(format!("malformed station catalog {}: {}", path.display(), e))
    })
}

fn squared_distance(station: &Station, lon: f64, lat: f64) -> f64 {
    let dx = station.longitude - lon;
    let dy = station.latitude - lat;
    dx * dx + dy * dy
}

/// Climate controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Climate {
    pub base: NodbBase,
    pub station_mode: StationMode,
    pub spatial_mode: ClimateSpatialMode,
    pub station: Option<Station>,
    /// Simulation length, years.
    pub sim_years: u32,
    /// First gregorian year of the generated record.
    pub start_year: Option<i32>,
    /// Generated files, relative to the run directory.
    pub cli_files: Vec<PathBuf>,
}

impl Controller for Climate {
    const KIND: NodbKind = NodbKind::Climate;
}

impl Climate {
    pub fn new(base: NodbBase, sim_years: u32) -> Self {
        Self {
            base,
            station_mode: StationMode::default(),
            spatial_mode: ClimateSpatialMode::default(),
            station: None,
            sim_years,
            start_year: None,
            cli_files: Vec::new(),
        }
    }
}

impl Nodb<Climate> {
    pub fn set_station_mode(&self, mode: StationMode) -> Result<(), ControllerError> {
        self.with_locked(|c| {
            c.station_mode = mode;
            Ok(())
        })
    }

    pub fn set_spatial_mode(&self, mode: ClimateSpatialMode) -> Result<(), ControllerError> {
        self.with_locked(|c| {
            c.spatial_mode = mode;
            Ok(())
        })
    }

    /// Selects a station from the catalog for the watershed centroid.
    ///
    /// `specified` names the station id when the mode is `Specified`.
    pub fn find_station(
        &self,
        catalog: &[Station],
        centroid: (f64, f64),
        specified: Option<&str>,
    ) -> Result<Station, ControllerError> {
        let mode = self.read(|c| c.station_mode);
        let chosen = match mode {
            StationMode::Closest => catalog
                .iter()
                .min_by(|a, b| {
                    squared_distance(a, centroid.0, centroid.1)
                        .total_cmp(&squared_distance(b, centroid.0, centroid.1))
                })
                .cloned(),
            StationMode::Heuristic => {
                let long_records: Vec<&Station> = catalog
                    .iter()
                    .filter(|s| s.years >= HEURISTIC_MIN_YEARS)
                    .collect();
                let pool: &[&Station] = if long_records.is_empty() {
                    &[]
                } else {
                    &long_records
                };
                pool.iter()
                    .min_by(|a, b| {
                        squared_distance(a, centroid.0, centroid.1)
                            .total_cmp(&squared_distance(b, centroid.0, centroid.1))
                    })
                    .map(|s| (*s).clone())
                    .or_else(|| {
                        catalog
                            .iter()
                            .min_by(|a, b| {
                                squared_distance(a, centroid.0, centroid.1)
                                    .total_cmp(&squared_distance(b, centroid.0, centroid.1))
                            })
                            .cloned()
                    })
            }
            StationMode::Specified => {
                let id = specified.ok_or_else(|| {
                    ControllerError::Validation(
                        "specified station mode requires a station id".to_string(),
                    )
                })?;
                catalog.iter().find(|s| s.id == id).cloned()
            }
        };
        let station = chosen.ok_or_else(|| {
            ControllerError::Validation("no usable station in the catalog".to_string())
        })?;
        self.with_locked(|c| {
            c.station = Some(station.clone());
            Ok::<_, ControllerError>(())
        })?;
        self.logger()
            .info(format!("selected station {} ({})", station.id, station.desc));
        Ok(station)
    }

    /// Generates climate files for the selected station.
    pub fn build(
        &self,
        registry: &Registry,
        bus: &TriggerBus,
        cligen_bin: &str,
        start_year: i32,
    ) -> Result<(), ControllerError> {
        let station = self
            .read(|c| c.station.clone())
            .ok_or_else(|| ControllerError::MissingPrerequisite {
                operation: "build_climate",
                prerequisite: "a selected station".to_string(),
            })?;
        let platform = registry.platform();
        platform
            .status
            .publish(self.runid(), "climate", EventKind::Started, "build_climate");

        let (spatial_mode, sim_years) = self.read(|c| (c.spatial_mode, c.sim_years));
        let targets: Vec<PathBuf> = match spatial_mode {
            ClimateSpatialMode::Single => vec![PathBuf::from("climate/wepp.cli")],
            ClimateSpatialMode::Multiple | ClimateSpatialMode::MultipleInterpolated => {
                let translator = self.watershed_translator(registry)?;
                translator
                    .iter_sub_ids()
                    .map(|id| PathBuf::from(format!("climate/{}.cli", id)))
                    .collect()
            }
        };

        for target in &targets {
            let mut argv = vec![
                cligen_bin.to_string(),
                "-i".to_string(),
                station.id.clone(),
                "-y".to_string(),
                sim_years.to_string(),
                "-b".to_string(),
                start_year.to_string(),
                "-o".to_string(),
                target.to_string_lossy().into_owned(),
            ];
            if spatial_mode == ClimateSpatialMode::MultipleInterpolated {
                argv.push("--interpolate".to_string());
            }
            run_binary(platform.tools.as_ref(), argv, self.wd(), CLIGEN_TIMEOUT).map_err(
                |source| {
                    self.logger()
                        .error(format!("cligen failed for {}: {}", target.display(), source));
                    platform.status.exception(
                        self.runid(),
                        "climate",
                        "build_climate",
                        &source.to_string(),
                    );
                    ControllerError::ExternalToolFailure {
                        operation: "build_climate",
                        source,
                    }
                },
            )?;
            if !self.wd().join(target).exists() {
                return Err(ControllerError::MissingOutput {
                    operation: "build_climate",
                    path: target.clone(),
                });
            }
        }

        self.with_locked(|c| {
            c.cli_files = targets;
            c.start_year = Some(start_year);
            Ok::<_, ControllerError>(())
        })?;
        platform
            .prep
            .set_progress(self.runid(), START_YEAR_FIELD, &start_year.to_string());
        platform.prep.timestamp(self.runid(), TaskEnum::BuildClimate);
        platform
            .status
            .publish(self.runid(), "climate", EventKind::Completed, "build_climate");
        bus.emit(registry, self.runid(), TriggerEvent::ClimateBuildComplete)?;
        Ok(())
    }

    fn watershed_translator(
        &self,
        registry: &Registry,
    ) -> Result<super::watershed::Translator, ControllerError> {
        let watershed = registry
            .get_instance::<Watershed>(self.runid(), false)
            .map_err(|e| match e {
                NodbError::NotFound { .. } => ControllerError::MissingPrerequisite {
                    operation: "build_climate",
                    prerequisite: "a delineated watershed".to_string(),
                },
                other => ControllerError::Nodb(other),
            })?;
        watershed
            .translator_factory()
            .map_err(|_| ControllerError::MissingPrerequisite {
                operation: "build_climate",
                prerequisite: "an abstracted watershed".to_string(),
            })
    }
}
