//! INI parsing for run profiles.
//!
//! The single place where INI key names map to [`RunConfig`] fields.
//! Parsing starts from `RunConfig::default()` and overlays any values
//! found in the profile; overrides (`section:key=value`) reuse the same
//! key mapping so the recognized surface stays in one table.

use ini::Ini;
use std::path::{Path, PathBuf};

use super::{ConfigError, RunConfig};

/// Loads a profile file and applies `overrides` on top.
pub fn load_profile(path: &Path, overrides: &[String]) -> Result<RunConfig, ConfigError> {
    let ini = Ini::load_from_file(path).map_err(|e| ConfigError::ParseFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut config = parse_profile(&ini)?;
    config.profile = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    for entry in overrides {
        apply_override(&mut config, entry)?;
    }
    Ok(config)
}

/// Parses an `Ini` object into a `RunConfig`.
pub fn parse_profile(ini: &Ini) -> Result<RunConfig, ConfigError> {
    let mut config = RunConfig::default();
    for (section, properties) in ini.iter() {
        let Some(section) = section else { continue };
        for (key, value) in properties.iter() {
            set_value(&mut config, section, key, value)?;
        }
    }
    Ok(config)
}

/// Applies one `section:key=value` override.
pub fn apply_override(config: &mut RunConfig, entry: &str) -> Result<(), ConfigError> {
    let (selector, value) = entry
        .split_once('=')
        .ok_or_else(|| ConfigError::MalformedOverride(entry.to_string()))?;
    let (section, key) = selector
        .split_once(':')
        .ok_or_else(|| ConfigError::MalformedOverride(entry.to_string()))?;
    set_value(config, section.trim(), key.trim(), value.trim())
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_f64(section: &str, key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(section, key, value, "must be a number"))
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(invalid(section, key, value, "must be a boolean")),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn set_value(
    config: &mut RunConfig,
    section: &str,
    key: &str,
    value: &str,
) -> Result<(), ConfigError> {
    match (section, key) {
        ("general", "cellsize") => {
            let v = parse_f64(section, key, value)?;
            if v <= 0.0 {
                return Err(invalid(section, key, value, "must be positive"));
            }
            config.general.cellsize = v;
        }
        ("general", "w3w_api_key") => {
            let v = value.trim();
            if !v.is_empty() {
                config.general.w3w_api_key = Some(v.to_string());
            }
        }
        ("general", "locales") => config.general.locales = parse_list(value),

        ("map", "center_lat") => config.map.center_lat = parse_f64(section, key, value)?,
        ("map", "center_lon") => config.map.center_lon = parse_f64(section, key, value)?,
        ("map", "zoom") => {
            config.map.zoom = value
                .parse()
                .map_err(|_| invalid(section, key, value, "must be an integer 0-22"))?;
        }
        ("map", "boundary") => config.map.boundary = Some(value.to_string()),
        ("map", "extent") => {
            let parts: Vec<f64> = value
                .split(',')
                .map(|s| s.trim().parse())
                .collect::<Result<_, _>>()
                .map_err(|_| {
                    invalid(section, key, value, "expected min_lon,min_lat,max_lon,max_lat")
                })?;
            if parts.len() != 4 {
                return Err(invalid(
                    section,
                    key,
                    value,
                    "expected min_lon,min_lat,max_lon,max_lat",
                ));
            }
            config.map.extent = Some([parts[0], parts[1], parts[2], parts[3]]);
        }

        ("watershed", "delineation_backend") => {
            config.watershed.delineation_backend = value
                .parse()
                .map_err(|_| invalid(section, key, value, "must be one of: topaz, taudem, wbt"))?;
        }
        ("watershed", "topaz_bin") => config.watershed.topaz_bin = value.to_string(),
        ("watershed", "taudem_bin") => config.watershed.taudem_bin = value.to_string(),
        ("watershed", "wbt_bin") => config.watershed.wbt_bin = value.to_string(),

        ("topaz", "csa") => config.topaz.csa = parse_f64(section, key, value)?,
        ("topaz", "mcl") => config.topaz.mcl = parse_f64(section, key, value)?,

        ("climate", "cligen_db") => config.climate.cligen_db = Some(PathBuf::from(value)),
        ("climate", "cligen_bin") => config.climate.cligen_bin = value.to_string(),
        ("climate", "observed_clis_wc") => {
            config.climate.observed_clis_wc = Some(value.to_string())
        }
        ("climate", "future_clis_wc") => config.climate.future_clis_wc = Some(value.to_string()),
        ("climate", "use_gridmet_wind_when_applicable") => {
            config.climate.use_gridmet_wind_when_applicable = parse_bool(section, key, value)?;
        }

        ("soils", "mode") => {
            config.soils.mode = value.parse().map_err(|_| {
                invalid(
                    section,
                    key,
                    value,
                    "must be one of: gridded, single, userdefined, spatialapi, rred_burned",
                )
            })?;
        }
        ("soils", "ssurgo_db") => config.soils.ssurgo_db = Some(PathBuf::from(value)),
        ("soils", "single_selection") => {
            config.soils.single_selection = Some(value.to_string())
        }

        ("landuse", "enable_landuse_change") => {
            config.landuse.enable_landuse_change = parse_bool(section, key, value)?;
        }
        ("landuse", "uniform_dom") => config.landuse.uniform_dom = Some(value.to_string()),

        ("nodb", "mods") => config.nodb.mods = parse_list(value),

        ("disturbed", "sol_ver") => config.disturbed.sol_ver = value.to_string(),
        ("disturbed", "sbs_required") => {
            config.disturbed.sbs_required = parse_bool(section, key, value)?;
        }

        ("omni", "scenarios") => config.omni.scenarios = parse_list(value),

        ("wepp", "bin") => config.wepp.bin = value.to_string(),
        ("wepp", "pmet_kcb") => config.wepp.pmet_kcb = parse_f64(section, key, value)?,
        ("wepp", "rst") => config.wepp.rst = parse_f64(section, key, value)?,
        ("wepp", "kslast") => config.wepp.kslast = Some(parse_f64(section, key, value)?),
        ("wepp", "phosphorus_opts") => {
            config.wepp.phosphorus_opts = parse_bool(section, key, value)?;
        }
        ("wepp", "baseflow_opts") => config.wepp.baseflow_opts = parse_bool(section, key, value)?,

        _ => {
            return Err(ConfigError::UnknownKey {
                section: section.to_string(),
                key: key.to_string(),
            });
        }
    }
    Ok(())
}
