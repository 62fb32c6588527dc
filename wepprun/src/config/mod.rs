//! Run configuration profiles.
//!
//! A run is constructed against a profile: an INI file naming the
//! delineation backend, climate databases, soil mode, active mods, and
//! map defaults. Values are overlaid on [`RunConfig::default()`] by
//! [`profile::parse_profile`], then per-run overrides of the form
//! `section:key=value` are applied on top.

mod profile;

pub use profile::{apply_override, load_profile, parse_profile};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read profile {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse profile {path}: {reason}")]
    ParseFailed { path: PathBuf, reason: String },

    #[error("invalid value for [{section}] {key} = {value}: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown config key [{section}] {key}")]
    UnknownKey { section: String, key: String },

    #[error("malformed override {0:?}, expected section:key=value")]
    MalformedOverride(String),
}

/// Channel delineation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelineationBackendKind {
    #[default]
    Topaz,
    Taudem,
    Wbt,
}

impl std::str::FromStr for DelineationBackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "topaz" => Ok(Self::Topaz),
            "taudem" => Ok(Self::Taudem),
            "wbt" => Ok(Self::Wbt),
            _ => Err(()),
        }
    }
}

/// `[general]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Raster cell size in meters.
    pub cellsize: f64,
    pub w3w_api_key: Option<String>,
    pub locales: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cellsize: 30.0,
            w3w_api_key: None,
            locales: vec!["us".to_string()],
        }
    }
}

/// `[map]` section: initial extent and view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    pub center_lat: f64,
    pub center_lon: f64,
    pub zoom: u8,
    /// Optional boundary dataset name.
    pub boundary: Option<String>,
    /// `[min_lon, min_lat, max_lon, max_lat]`.
    pub extent: Option<[f64; 4]>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            center_lat: 45.0,
            center_lon: -116.0,
            zoom: 11,
            boundary: None,
            extent: None,
        }
    }
}

/// `[watershed]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatershedConfig {
    pub delineation_backend: DelineationBackendKind,
    pub topaz_bin: String,
    pub taudem_bin: String,
    pub wbt_bin: String,
}

impl Default for WatershedConfig {
    fn default() -> Self {
        Self {
            delineation_backend: DelineationBackendKind::Topaz,
            topaz_bin: "topaz".to_string(),
            taudem_bin: "taudem".to_string(),
            wbt_bin: "whitebox_tools".to_string(),
        }
    }
}

/// `[topaz]` section: delineation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopazConfig {
    /// Critical source area, hectares.
    pub csa: f64,
    /// Minimum channel length, meters.
    pub mcl: f64,
}

impl Default for TopazConfig {
    fn default() -> Self {
        Self {
            csa: 4.0,
            mcl: 60.0,
        }
    }
}

/// `[climate]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClimateConfig {
    /// Station catalog path (JSON).
    pub cligen_db: Option<PathBuf>,
    pub cligen_bin: String,
    /// Wildcard for observed climate files.
    pub observed_clis_wc: Option<String>,
    /// Wildcard for future climate files.
    pub future_clis_wc: Option<String>,
    pub use_gridmet_wind_when_applicable: bool,
}

impl Default for ClimateConfig {
    fn default() -> Self {
        Self {
            cligen_db: None,
            cligen_bin: "cligen".to_string(),
            observed_clis_wc: None,
            future_clis_wc: None,
            use_gridmet_wind_when_applicable: false,
        }
    }
}

/// Soil assignment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SoilsMode {
    #[default]
    Gridded,
    Single,
    UserDefined,
    SpatialAPI,
    RredBurned,
}

impl std::str::FromStr for SoilsMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gridded" => Ok(Self::Gridded),
            "single" => Ok(Self::Single),
            "userdefined" | "user_defined" => Ok(Self::UserDefined),
            "spatialapi" | "spatial_api" => Ok(Self::SpatialAPI),
            "rred_burned" | "rredburned" => Ok(Self::RredBurned),
            _ => Err(()),
        }
    }
}

/// `[soils]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoilsConfig {
    pub mode: SoilsMode,
    pub ssurgo_db: Option<PathBuf>,
    /// Single-mode soil key.
    pub single_selection: Option<String>,
}

/// `[landuse]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanduseConfig {
    pub enable_landuse_change: bool,
    /// Uniform dominant cover applied to every subcatchment, if set.
    pub uniform_dom: Option<String>,
}

/// `[nodb]` section: the active mod set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodbConfig {
    pub mods: Vec<String>,
}

/// `[disturbed]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisturbedConfig {
    /// Soil version used for disturbed class soils.
    pub sol_ver: String,
    /// Whether a soil burn severity map is required before landuse/soils.
    pub sbs_required: bool,
}

impl Default for DisturbedConfig {
    fn default() -> Self {
        Self {
            sol_ver: "7778.0".to_string(),
            sbs_required: true,
        }
    }
}

/// `[omni]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OmniConfig {
    pub scenarios: Vec<String>,
}

/// `[wepp]` section: runtime knobs passed through to WEPP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeppConfig {
    pub bin: String,
    /// Crop coefficient for the pmet ET adjustment.
    pub pmet_kcb: f64,
    /// Surface residue shear adjustment.
    pub rst: f64,
    /// Restrictive-layer conductivity override.
    pub kslast: Option<f64>,
    pub phosphorus_opts: bool,
    pub baseflow_opts: bool,
}

impl Default for WeppConfig {
    fn default() -> Self {
        Self {
            bin: "wepp".to_string(),
            pmet_kcb: 0.95,
            rst: 0.8,
            kslast: None,
            phosphorus_opts: false,
            baseflow_opts: true,
        }
    }
}

/// Full recognized config surface of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Profile name this config was loaded from.
    pub profile: String,
    pub general: GeneralConfig,
    pub map: MapConfig,
    pub watershed: WatershedConfig,
    pub topaz: TopazConfig,
    pub climate: ClimateConfig,
    pub soils: SoilsConfig,
    pub landuse: LanduseConfig,
    pub nodb: NodbConfig,
    pub disturbed: DisturbedConfig,
    pub omni: OmniConfig,
    pub wepp: WeppConfig,
}

impl RunConfig {
    /// Whether `mod_name` is active for this run.
    pub fn has_mod(&self, mod_name: &str) -> bool {
        self.nodb.mods.iter().any(|m| m == mod_name)
    }
}
