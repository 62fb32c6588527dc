//! Watershed: delineation state machine, outlet snapping, abstraction.
//!
//! Delineation advances through
//! `NoChannels -> HasChannels -> HasOutlet -> HasSubcatchments -> Abstracted`
//! and never skips: abstracting without an outlet is an
//! `InvalidTransition`. Rebuilding channels resets everything downstream,
//! including the prep timestamps preflight gates on.
//!
//! The delineation algorithms live in external tools (TOPAZ, TauDEM,
//! WhiteboxTools) behind the [`DelineationBackend`] seam. The production
//! adapter drives the per-backend wrapper binary and parses the
//! normalized JSON it emits on stdout.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ControllerError;
use crate::config::{DelineationBackendKind, WatershedConfig};
use crate::nodb::{Controller, Nodb, NodbBase, NodbKind, Registry};
use crate::process::{run_binary, ToolRunner};
use crate::status::{EventKind, TaskEnum};

const DELINEATION_TIMEOUT: Duration = Duration::from_secs(1800);

/// Delineation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelineationState {
    NoChannels,
    HasChannels,
    HasOutlet,
    HasSubcatchments,
    Abstracted,
}

impl DelineationState {
    pub fn name(&self) -> &'static str {
        match self {
            DelineationState::NoChannels => "no_channels",
            DelineationState::HasChannels => "has_channels",
            DelineationState::HasOutlet => "has_outlet",
            DelineationState::HasSubcatchments => "has_subcatchments",
            DelineationState::Abstracted => "abstracted",
        }
    }
}

/// One delineated channel. TOPAZ channel ids end in 4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub topaz_id: i64,
    pub length_m: f64,
    pub order: u8,
    /// Representative point, WGS84.
    pub lon: f64,
    pub lat: f64,
}

/// One abstracted subcatchment (hillslope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subcatchment {
    pub topaz_id: i64,
    pub area_ha: f64,
    pub slope: f64,
    pub lon: f64,
    pub lat: f64,
    /// Channel this hillslope drains to.
    pub channel_id: i64,
}

/// The selected outlet, snapped onto the channel network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outlet {
    pub requested: (f64, f64),
    pub snapped: (f64, f64),
    pub channel_id: i64,
}

/// Watershed controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watershed {
    pub base: NodbBase,
    pub delineation: DelineationState,
    /// Critical source area, hectares.
    pub csa: f64,
    /// Minimum channel length, meters.
    pub mcl: f64,
    pub outlet: Option<Outlet>,
    pub channels: Vec<Channel>,
    pub subcatchments: Vec<Subcatchment>,
}

impl Controller for Watershed {
    const KIND: NodbKind = NodbKind::Watershed;
}

impl Watershed {
    pub fn new(base: NodbBase, csa: f64, mcl: f64) -> Self {
        Self {
            base,
            delineation: DelineationState::NoChannels,
            csa,
            mcl,
            outlet: None,
            channels: Vec::new(),
            subcatchments: Vec::new(),
        }
    }
}

/// Seam over the external delineation tools.
pub trait DelineationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn delineate_channels(
        &self,
        tools: &dyn ToolRunner,
        wd: &Path,
        csa: f64,
        mcl: f64,
    ) -> Result<Vec<Channel>, ControllerError>;

    fn delineate_subcatchments(
        &self,
        tools: &dyn ToolRunner,
        wd: &Path,
        outlet: &Outlet,
    ) -> Result<Vec<Subcatchment>, ControllerError>;
}

/// Production adapter: runs the backend's wrapper binary and parses the
/// normalized JSON it prints to stdout.
pub struct StdoutJsonBackend {
    name: &'static str,
    bin: String,
}

impl StdoutJsonBackend {
    pub fn new(name: &'static str, bin: impl Into<String>) -> Self {
        Self {
            name,
            bin: bin.into(),
        }
    }

    /// Adapter for the profile's configured backend.
    pub fn for_config(config: &WatershedConfig) -> Self {
        match config.delineation_backend {
            DelineationBackendKind::Topaz => Self::new("topaz", &config.topaz_bin),
            DelineationBackendKind::Taudem => Self::new("taudem", &config.taudem_bin),
            DelineationBackendKind::Wbt => Self::new("wbt", &config.wbt_bin),
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        stdout: &str,
    ) -> Result<T, ControllerError> {
        serde_json::from_str(stdout).map_err(|e| {
            ControllerError::Validation(format!(
                "{} emitted malformed output for {}: {}",
                self.name, operation, e
            ))
        })
    }
}

impl DelineationBackend for StdoutJsonBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn delineate_channels(
        &self,
        tools: &dyn ToolRunner,
        wd: &Path,
        csa: f64,
        mcl: f64,
    ) -> Result<Vec<Channel>, ControllerError> {
        let argv = vec![
            self.bin.clone(),
            "channels".to_string(),
            "--csa".to_string(),
            csa.to_string(),
            "--mcl".to_string(),
            mcl.to_string(),
        ];
        let outcome = run_binary(tools, argv, wd, DELINEATION_TIMEOUT).map_err(|source| {
            ControllerError::ExternalToolFailure {
                operation: "build_channels",
                source,
            }
        })?;
        self.parse("build_channels", &outcome.stdout)
    }

    fn delineate_subcatchments(
        &self,
        tools: &dyn ToolRunner,
        wd: &Path,
        outlet: &Outlet,
    ) -> Result<Vec<Subcatchment>, ControllerError> {
        let argv = vec![
            self.bin.clone(),
            "subcatchments".to_string(),
            "--outlet".to_string(),
            format!("{},{}", outlet.snapped.0, outlet.snapped.1),
        ];
        let outcome = run_binary(tools, argv, wd, DELINEATION_TIMEOUT).map_err(|source| {
            ControllerError::ExternalToolFailure {
                operation: "build_subcatchments",
                source,
            }
        })?;
        self.parse("build_subcatchments", &outcome.stdout)
    }
}

/// Bidirectional `topaz_id <-> wepp_id` mapping.
///
/// WEPP numbers hillslopes 1..n in topaz order, then channels n+1..n+m.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translator {
    top2wepp: BTreeMap<i64, i64>,
    wepp2top: BTreeMap<i64, i64>,
    n_hillslopes: usize,
}

impl Translator {
    pub fn build(channels: &[Channel], subcatchments: &[Subcatchment]) -> Self {
        let mut top2wepp = BTreeMap::new();
        let mut wepp2top = BTreeMap::new();
        let mut sub_ids: Vec<i64> = subcatchments.iter().map(|s| s.topaz_id).collect();
        sub_ids.sort_unstable();
        let mut chn_ids: Vec<i64> = channels.iter().map(|c| c.topaz_id).collect();
        chn_ids.sort_unstable();
        let mut wepp_id = 0i64;
        for topaz_id in sub_ids.iter().chain(chn_ids.iter()) {
            wepp_id += 1;
            top2wepp.insert(*topaz_id, wepp_id);
            wepp2top.insert(wepp_id, *topaz_id);
        }
        Self {
            top2wepp,
            wepp2top,
            n_hillslopes: sub_ids.len(),
        }
    }

    pub fn wepp(&self, topaz_id: i64) -> Option<i64> {
        self.top2wepp.get(&topaz_id).copied()
    }

    pub fn top(&self, wepp_id: i64) -> Option<i64> {
        self.wepp2top.get(&wepp_id).copied()
    }

    /// Topaz ids of all hillslopes, ascending.
    pub fn iter_sub_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.top2wepp.keys().copied().filter(|id| id % 10 != 4)
    }

    /// Topaz ids of all channels, ascending.
    pub fn iter_chn_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.top2wepp.keys().copied().filter(|id| id % 10 == 4)
    }

    pub fn n_hillslopes(&self) -> usize {
        self.n_hillslopes
    }
}

fn squared_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    dx * dx + dy * dy
}

fn point_feature(topaz_id: i64, lon: f64, lat: f64, extra: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "type": "Feature",
        "geometry": { "type": "Point", "coordinates": [lon, lat] },
        "properties": { "TopazID": topaz_id, "extra": extra },
    })
}

fn write_json_artifact(
    wd: &Path,
    name: &str,
    value: &serde_json::Value,
) -> Result<(), ControllerError> {
    let path = wd.join("watershed").join(name);
    let raw = serde_json::to_string_pretty(value)
        .map_err(|e| ControllerError::Validation(e.to_string()))?;
    std::fs::write(&path, raw).map_err(|e| {
        ControllerError::Nodb(crate::nodb::NodbError::Io {
            path,
            source: e,
        })
    })
}

impl Nodb<Watershed> {
    fn require_at_least(
        &self,
        state: DelineationState,
        attempted: &'static str,
    ) -> Result<(), ControllerError> {
        let current = self.read(|w| w.delineation);
        if current < state {
            return Err(ControllerError::InvalidTransition {
                from: current.name(),
                attempted,
            });
        }
        Ok(())
    }

    /// Runs channel delineation. Always permitted; resets the outlet,
    /// subcatchments, and downstream prep timestamps.
    pub fn build_channels(
        &self,
        registry: &Registry,
        backend: &dyn DelineationBackend,
    ) -> Result<(), ControllerError> {
        let platform = registry.platform();
        platform
            .status
            .publish(self.runid(), "watershed", EventKind::Started, "build_channels");
        self.logger().info(format!(
            "delineating channels with {} (csa/mcl from profile)",
            backend.name()
        ));

        let (csa, mcl) = self.read(|w| (w.csa, w.mcl));
        let channels = backend.delineate_channels(platform.tools.as_ref(), self.wd(), csa, mcl)?;
        if channels.is_empty() {
            return Err(ControllerError::Validation(
                "delineation produced no channels".to_string(),
            ));
        }
        if let Some(bad) = channels.iter().find(|c| c.topaz_id % 10 != 4) {
            return Err(ControllerError::Validation(format!(
                "channel topaz id {} does not end in 4",
                bad.topaz_id
            )));
        }

        self.with_locked(|w| {
            w.channels = channels.clone();
            w.outlet = None;
            w.subcatchments.clear();
            w.delineation = DelineationState::HasChannels;
            Ok::<_, ControllerError>(())
        })?;

        self.write_bound_and_channels()?;
        platform.prep.timestamp(self.runid(), TaskEnum::BuildChannels);
        platform.prep.remove_timestamp(self.runid(), TaskEnum::SetOutlet);
        platform
            .prep
            .remove_timestamp(self.runid(), TaskEnum::AbstractWatershed);
        platform
            .status
            .publish(self.runid(), "watershed", EventKind::Completed, "build_channels");
        Ok(())
    }

    /// Selects the outlet by snapping `(lon, lat)` to the nearest channel.
    pub fn set_outlet(
        &self,
        registry: &Registry,
        lon: f64,
        lat: f64,
    ) -> Result<Outlet, ControllerError> {
        self.require_at_least(DelineationState::HasChannels, "set_outlet")?;
        let outlet = self.read(|w| {
            w.channels
                .iter()
                .min_by(|a, b| {
                    squared_distance((a.lon, a.lat), (lon, lat))
                        .total_cmp(&squared_distance((b.lon, b.lat), (lon, lat)))
                })
                .map(|nearest| Outlet {
                    requested: (lon, lat),
                    snapped: (nearest.lon, nearest.lat),
                    channel_id: nearest.topaz_id,
                })
        });
        let outlet = outlet.ok_or_else(|| {
            ControllerError::Validation("no channels to snap the outlet onto".to_string())
        })?;

        self.with_locked(|w| {
            w.outlet = Some(outlet.clone());
            w.subcatchments.clear();
            w.delineation = DelineationState::HasOutlet;
            Ok::<_, ControllerError>(())
        })?;

        let platform = registry.platform();
        platform.prep.timestamp(self.runid(), TaskEnum::SetOutlet);
        platform
            .prep
            .remove_timestamp(self.runid(), TaskEnum::AbstractWatershed);
        self.logger().info(format!(
            "outlet snapped to channel {} at ({:.5}, {:.5})",
            outlet.channel_id, outlet.snapped.0, outlet.snapped.1
        ));
        Ok(outlet)
    }

    /// Delineates subcatchments draining to the selected outlet.
    pub fn build_subcatchments(
        &self,
        registry: &Registry,
        backend: &dyn DelineationBackend,
    ) -> Result<(), ControllerError> {
        self.require_at_least(DelineationState::HasOutlet, "build_subcatchments")?;
        let platform = registry.platform();
        let outlet = self
            .read(|w| w.outlet.clone())
            .ok_or_else(|| ControllerError::InvalidTransition {
                from: DelineationState::HasChannels.name(),
                attempted: "build_subcatchments",
            })?;

        let subcatchments =
            backend.delineate_subcatchments(platform.tools.as_ref(), self.wd(), &outlet)?;
        if let Some(bad) = subcatchments.iter().find(|s| s.topaz_id % 10 == 4) {
            return Err(ControllerError::Validation(format!(
                "subcatchment topaz id {} collides with channel numbering",
                bad.topaz_id
            )));
        }

        self.with_locked(|w| {
            w.subcatchments = subcatchments;
            w.delineation = DelineationState::HasSubcatchments;
            Ok::<_, ControllerError>(())
        })
    }

    /// Abstracts the watershed: freezes the id mapping and persists the
    /// subcatchment artifact.
    pub fn abstract_watershed(&self, registry: &Registry) -> Result<(), ControllerError> {
        let current = self.read(|w| w.delineation);
        if current != DelineationState::HasSubcatchments && current != DelineationState::Abstracted
        {
            return Err(ControllerError::InvalidTransition {
                from: current.name(),
                attempted: "abstract_watershed",
            });
        }

        let features: Vec<serde_json::Value> = self.read(|w| {
            w.subcatchments
                .iter()
                .map(|s| {
                    point_feature(
                        s.topaz_id,
                        s.lon,
                        s.lat,
                        serde_json::json!({
                            "area_ha": s.area_ha,
                            "slope": s.slope,
                            "channel_id": s.channel_id,
                        }),
                    )
                })
                .collect()
        });
        write_json_artifact(
            self.wd(),
            "SUBCATCHMENTS.JSON",
            &serde_json::json!({ "type": "FeatureCollection", "features": features }),
        )?;

        self.with_locked(|w| {
            w.delineation = DelineationState::Abstracted;
            Ok::<_, ControllerError>(())
        })?;

        let platform = registry.platform();
        platform
            .prep
            .timestamp(self.runid(), TaskEnum::AbstractWatershed);
        platform.status.publish(
            self.runid(),
            "watershed",
            EventKind::Completed,
            "abstract_watershed",
        );
        Ok(())
    }

    /// The frozen id mapping. Only available once abstracted.
    pub fn translator_factory(&self) -> Result<Translator, ControllerError> {
        self.read(|w| {
            if w.delineation != DelineationState::Abstracted {
                return Err(ControllerError::MissingPrerequisite {
                    operation: "translator_factory",
                    prerequisite: "an abstracted watershed".to_string(),
                });
            }
            Ok(Translator::build(&w.channels, &w.subcatchments))
        })
    }

    fn write_bound_and_channels(&self) -> Result<(), ControllerError> {
        let (bound, features) = self.read(|w| {
            let lons: Vec<f64> = w.channels.iter().map(|c| c.lon).collect();
            let lats: Vec<f64> = w.channels.iter().map(|c| c.lat).collect();
            let min = |v: &[f64]| v.iter().copied().fold(f64::INFINITY, f64::min);
            let max = |v: &[f64]| v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let (min_lon, max_lon, min_lat, max_lat) =
                (min(&lons), max(&lons), min(&lats), max(&lats));
            let bound = serde_json::json!({
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [min_lon, min_lat], [max_lon, min_lat],
                        [max_lon, max_lat], [min_lon, max_lat],
                        [min_lon, min_lat],
                    ]],
                },
                "properties": {},
            });
            let features: Vec<serde_json::Value> = w
                .channels
                .iter()
                .map(|c| {
                    point_feature(
                        c.topaz_id,
                        c.lon,
                        c.lat,
                        serde_json::json!({ "length_m": c.length_m, "order": c.order }),
                    )
                })
                .collect();
            (bound, features)
        });
        write_json_artifact(self.wd(), "BOUND.WGS.JSON", &bound)?;
        write_json_artifact(
            self.wd(),
            "CHANNELS.JSON",
            &serde_json::json!({ "type": "FeatureCollection", "features": features }),
        )
    }
}
