//! Landuse: per-subcatchment dominant cover and management descriptors.
//!
//! Cover assignment walks the abstracted watershed's hillslopes and
//! records a dominant cover code (`domlc`) per topaz id, either from the
//! gridded default or a uniform override. Mods revise the result through
//! the trigger bus: the disturbed coupling writes burn classes after
//! `LANDUSE_DOMLC_COMPLETE`, which [`Nodb::identify_burn_class`] then
//! exposes to soils and ash.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ControllerError;
use crate::nodb::{Controller, Nodb, NodbBase, NodbError, NodbKind, Registry};
use crate::status::{EventKind, TaskEnum};
use crate::trigger::{TriggerBus, TriggerEvent};

use super::watershed::Watershed;

/// NLCD evergreen forest; the fallback dominant cover.
const DEFAULT_DOM: &str = "42";

/// Soil burn severity classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurnClass {
    #[default]
    Unburned,
    Low,
    Moderate,
    High,
}

impl BurnClass {
    /// Maps an SBS raster value (0..=3) to a class.
    pub fn from_severity(value: u8) -> Self {
        match value {
            0 => BurnClass::Unburned,
            1 => BurnClass::Low,
            2 => BurnClass::Moderate,
            _ => BurnClass::High,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BurnClass::Unburned => "unburned",
            BurnClass::Low => "low",
            BurnClass::Moderate => "moderate",
            BurnClass::High => "high",
        }
    }
}

/// Management descriptor attached to a dominant cover code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Management {
    pub key: String,
    pub desc: String,
    /// Disturbed-coupling class name, when the cover has one.
    pub disturbed_class: Option<String>,
}

fn default_management(dom: &str) -> Management {
    let (key, desc, disturbed_class) = match dom {
        "41" => ("deciduous", "Deciduous Forest", Some("forest")),
        "42" => ("evergreen", "Evergreen Forest", Some("forest")),
        "52" => ("shrub", "Shrubland", Some("shrub")),
        "71" => ("grass", "Grassland/Herbaceous", Some("grass")),
        "81" => ("pasture", "Pasture/Hay", None),
        "82" => ("crops", "Cultivated Crops", None),
        other => return Management {
            key: format!("dom-{}", other),
            desc: format!("Unmapped cover {}", other),
            disturbed_class: None,
        },
    };
    Management {
        key: key.to_string(),
        desc: desc.to_string(),
        disturbed_class: disturbed_class.map(str::to_string),
    }
}

/// Landuse controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Landuse {
    pub base: NodbBase,
    /// topaz_id -> dominant cover code.
    pub domlc: BTreeMap<i64, String>,
    /// cover code -> management descriptor.
    pub managements: BTreeMap<String, Management>,
    pub uniform_dom: Option<String>,
    /// topaz_id -> burn class, written by the disturbed coupling.
    pub burn_classes: BTreeMap<i64, BurnClass>,
}

impl Controller for Landuse {
    const KIND: NodbKind = NodbKind::Landuse;
}

impl Landuse {
    pub fn new(base: NodbBase, uniform_dom: Option<String>) -> Self {
        Self {
            base,
            domlc: BTreeMap::new(),
            managements: BTreeMap::new(),
            uniform_dom,
            burn_classes: BTreeMap::new(),
        }
    }
}

impl Nodb<Landuse> {
    /// Assigns dominant cover per hillslope of the abstracted watershed.
    ///
    /// Emits `LANDUSE_DOMLC_COMPLETE` after the assignment is persisted
    /// (so mod handlers can lock this controller themselves) and
    /// `LANDUSE_BUILD_COMPLETE` once the build is final.
    pub fn build(&self, registry: &Registry, bus: &TriggerBus) -> Result<(), ControllerError> {
        let translator = watershed_translator(registry, self.runid())?;
        let platform = registry.platform();
        platform
            .status
            .publish(self.runid(), "landuse", EventKind::Started, "build_landuse");

        let uniform = self.read(|lu| lu.uniform_dom.clone());
        self.with_locked(|lu| {
            lu.domlc.clear();
            for topaz_id in translator.iter_sub_ids() {
                let dom = uniform.clone().unwrap_or_else(|| DEFAULT_DOM.to_string());
                lu.managements
                    .entry(dom.clone())
                    .or_insert_with(|| default_management(&dom));
                lu.domlc.insert(topaz_id, dom);
            }
            Ok::<_, ControllerError>(())
        })?;
        self.logger().info(format!(
            "assigned dominant cover for {} hillslopes",
            translator.n_hillslopes()
        ));

        bus.emit(registry, self.runid(), TriggerEvent::LanduseDomlcComplete)?;
        platform.prep.timestamp(self.runid(), TaskEnum::BuildLanduse);
        platform
            .status
            .publish(self.runid(), "landuse", EventKind::Completed, "build_landuse");
        bus.emit(registry, self.runid(), TriggerEvent::LanduseBuildComplete)?;
        Ok(())
    }

    /// Sets a uniform dominant cover applied on the next build.
    pub fn set_uniform_dom(&self, dom: Option<&str>) -> Result<(), ControllerError> {
        self.with_locked(|lu| {
            lu.uniform_dom = dom.map(str::to_string);
            Ok(())
        })
    }

    /// Management descriptor for a cover code.
    pub fn management(&self, dom: &str) -> Option<Management> {
        self.read(|lu| lu.managements.get(dom).cloned())
    }

    /// Burn class of a hillslope.
    ///
    /// `mofe_id` selects a within-hillslope flow element; burn classes
    /// are currently uniform across elements so it only disambiguates
    /// the lookup, never the result.
    pub fn identify_burn_class(&self, topaz_id: i64, _mofe_id: Option<u32>) -> BurnClass {
        self.read(|lu| lu.burn_classes.get(&topaz_id).copied().unwrap_or_default())
    }

    /// Replaces the burn-class map. Called by the disturbed coupling
    /// under its own lock scope.
    pub fn set_burn_classes(
        &self,
        classes: BTreeMap<i64, BurnClass>,
    ) -> Result<(), ControllerError> {
        self.with_locked(|lu| {
            lu.burn_classes = classes;
            Ok(())
        })
    }

    /// Whether any hillslope carries a burned class.
    pub fn is_burned(&self) -> bool {
        self.read(|lu| lu.burn_classes.values().any(|c| *c != BurnClass::Unburned))
    }
}

fn watershed_translator(
    registry: &Registry,
    runid: &str,
) -> Result<super::watershed::Translator, ControllerError> {
    let watershed = registry
        .get_instance::<Watershed>(runid, false)
        .map_err(|e| match e {
            NodbError::NotFound { .. } => ControllerError::MissingPrerequisite {
                operation: "build_landuse",
                prerequisite: "a delineated watershed".to_string(),
            },
            other => ControllerError::Nodb(other),
        })?;
    watershed
        .translator_factory()
        .map_err(|_| ControllerError::MissingPrerequisite {
            operation: "build_landuse",
            prerequisite: "an abstracted watershed".to_string(),
        })
}
