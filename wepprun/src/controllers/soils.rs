//! Soils: per-subcatchment soil assignment.
//!
//! Five assignment modes; all walk the abstracted watershed's hillslopes
//! and record a soil key per topaz id. `RredBurned` folds in the burn
//! classes the disturbed coupling wrote onto landuse, selecting the
//! disturbed soil version per class.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::landuse::{BurnClass, Landuse};
use super::ControllerError;
use crate::config::SoilsMode;
use crate::nodb::{Controller, Nodb, NodbBase, NodbError, NodbKind, Registry};
use crate::status::{EventKind, TaskEnum};
use crate::trigger::{TriggerBus, TriggerEvent};

use super::watershed::Watershed;

/// Soils controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Soils {
    pub base: NodbBase,
    pub mode: SoilsMode,
    /// topaz_id -> soil key.
    pub domsoil: BTreeMap<i64, String>,
    /// Single-mode soil key.
    pub single_selection: Option<String>,
    /// Restrictive-layer conductivity override applied at WEPP prep.
    pub kslast: Option<f64>,
    /// Soil version used for disturbed-class soils.
    pub sol_ver: String,
}

impl Controller for Soils {
    const KIND: NodbKind = NodbKind::Soils;
}

impl Soils {
    pub fn new(base: NodbBase, mode: SoilsMode, sol_ver: impl Into<String>) -> Self {
        Self {
            base,
            mode,
            domsoil: BTreeMap::new(),
            single_selection: None,
            kslast: None,
            sol_ver: sol_ver.into(),
        }
    }
}

impl Nodb<Soils> {
    /// Assigns a soil per hillslope according to the configured mode.
    pub fn build(&self, registry: &Registry, bus: &TriggerBus) -> Result<(), ControllerError> {
        let translator = self.watershed_translator(registry)?;
        let platform = registry.platform();
        platform
            .status
            .publish(self.runid(), "soils", EventKind::Started, "build_soils");

        let (mode, single, sol_ver) =
            self.read(|s| (s.mode, s.single_selection.clone(), s.sol_ver.clone()));
        let sub_ids: Vec<i64> = translator.iter_sub_ids().collect();

        let assignment: BTreeMap<i64, String> = match mode {
            SoilsMode::Gridded => sub_ids
                .iter()
                .map(|id| (*id, format!("ssurgo-{}", id)))
                .collect(),
            SoilsMode::SpatialAPI => sub_ids
                .iter()
                .map(|id| (*id, format!("spatial-{}", id)))
                .collect(),
            SoilsMode::Single => {
                let key = single.ok_or_else(|| {
                    ControllerError::Validation(
                        "single soils mode requires a selection".to_string(),
                    )
                })?;
                sub_ids.iter().map(|id| (*id, key.clone())).collect()
            }
            SoilsMode::UserDefined => {
                let existing = self.read(|s| s.domsoil.clone());
                if let Some(missing) = sub_ids.iter().find(|id| !existing.contains_key(id)) {
                    return Err(ControllerError::Validation(format!(
                        "user-defined soils are missing hillslope {}",
                        missing
                    )));
                }
                existing
            }
            SoilsMode::RredBurned => {
                let landuse = self.landuse(registry)?;
                sub_ids
                    .iter()
                    .map(|id| {
                        let class = landuse.identify_burn_class(*id, None);
                        (*id, burned_soil_key(class, &sol_ver))
                    })
                    .collect()
            }
        };

        self.with_locked(|s| {
            s.domsoil = assignment;
            Ok::<_, ControllerError>(())
        })?;
        self.logger().info(format!(
            "assigned soils for {} hillslopes in {:?} mode",
            sub_ids.len(),
            mode
        ));

        platform.prep.timestamp(self.runid(), TaskEnum::BuildSoils);
        platform
            .status
            .publish(self.runid(), "soils", EventKind::Completed, "build_soils");
        bus.emit(registry, self.runid(), TriggerEvent::SoilsBuildComplete)?;
        Ok(())
    }

    /// Sets the restrictive-layer conductivity override.
    pub fn set_kslast(&self, kslast: Option<f64>) -> Result<(), ControllerError> {
        if let Some(v) = kslast {
            if v <= 0.0 {
                return Err(ControllerError::Validation(format!(
                    "kslast must be positive, got {v}"
                )));
            }
        }
        self.with_locked(|s| {
            s.kslast = kslast;
            Ok(())
        })
    }

    /// Sets the single-mode soil key.
    pub fn set_single_selection(&self, key: &str) -> Result<(), ControllerError> {
        self.with_locked(|s| {
            s.single_selection = Some(key.to_string());
            Ok(())
        })
    }

    /// Seeds a user-defined assignment ahead of a `UserDefined` build.
    pub fn set_user_soils(&self, domsoil: BTreeMap<i64, String>) -> Result<(), ControllerError> {
        self.with_locked(|s| {
            s.domsoil = domsoil;
            Ok(())
        })
    }

    fn watershed_translator(
        &self,
        registry: &Registry,
    ) -> Result<super::watershed::Translator, ControllerError> {
        let watershed = registry
            .get_instance::<Watershed>(self.runid(), false)
            .map_err(|e| match e {
                NodbError::NotFound { .. } => ControllerError::MissingPrerequisite {
                    operation: "build_soils",
                    prerequisite: "a delineated watershed".to_string(),
                },
                other => ControllerError::Nodb(other),
            })?;
        watershed
            .translator_factory()
            .map_err(|_| ControllerError::MissingPrerequisite {
                operation: "build_soils",
                prerequisite: "an abstracted watershed".to_string(),
            })
    }

    fn landuse(&self, registry: &Registry) -> Result<Nodb<Landuse>, ControllerError> {
        registry
            .get_instance::<Landuse>(self.runid(), false)
            .map_err(|e| match e {
                NodbError::NotFound { .. } => ControllerError::MissingPrerequisite {
                    operation: "build_soils",
                    prerequisite: "a built landuse".to_string(),
                },
                other => ControllerError::Nodb(other),
            })
    }
}

fn burned_soil_key(class: BurnClass, sol_ver: &str) -> String {
    match class {
        BurnClass::Unburned => format!("unburned-{}", sol_ver),
        burned => format!("burned-{}-{}", burned.name(), sol_ver),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::testutil::{abstracted_watershed, registry};

    fn soils(registry: &Registry, runid: &str, mode: SoilsMode) -> Nodb<Soils> {
        let wd = registry.wd_for(runid);
        registry
            .create_at(
                &wd,
                runid,
                Soils::new(NodbBase::new(&wd, runid, "default"), mode, "7778.0"),
            )
            .unwrap()
    }

    fn built_landuse(registry: &Registry, runid: &str) -> Nodb<Landuse> {
        let wd = registry.wd_for(runid);
        let lu = registry
            .create_at(
                &wd,
                runid,
                Landuse::new(NodbBase::new(&wd, runid, "default"), None),
            )
            .unwrap();
        lu.build(registry, &TriggerBus::new()).unwrap();
        lu
    }

    #[test]
    fn test_gridded_assignment_covers_every_hillslope() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        let s = soils(&registry, "r1", SoilsMode::Gridded);
        s.build(&registry, &TriggerBus::new()).unwrap();
        let domsoil = s.read(|s| s.domsoil.clone());
        assert_eq!(domsoil.len(), 3);
        assert_eq!(domsoil.get(&21).map(String::as_str), Some("ssurgo-21"));
    }

    #[test]
    fn test_single_mode_requires_selection() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        let s = soils(&registry, "r1", SoilsMode::Single);
        let err = s.build(&registry, &TriggerBus::new()).unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));

        s.set_single_selection("MX4683").unwrap();
        s.build(&registry, &TriggerBus::new()).unwrap();
        assert!(s.read(|s| s.domsoil.values().all(|k| k == "MX4683")));
    }

    #[test]
    fn test_user_defined_must_cover_all_hillslopes() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        let s = soils(&registry, "r1", SoilsMode::UserDefined);
        let mut partial = BTreeMap::new();
        partial.insert(21, "custom-a".to_string());
        s.set_user_soils(partial).unwrap();
        let err = s.build(&registry, &TriggerBus::new()).unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
    }

    #[test]
    fn test_rred_burned_selects_by_burn_class() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        let lu = built_landuse(&registry, "r1");
        let mut classes = BTreeMap::new();
        classes.insert(21, BurnClass::High);
        classes.insert(22, BurnClass::Low);
        lu.set_burn_classes(classes).unwrap();

        let s = soils(&registry, "r1", SoilsMode::RredBurned);
        s.build(&registry, &TriggerBus::new()).unwrap();
        let domsoil = s.read(|s| s.domsoil.clone());
        assert_eq!(
            domsoil.get(&21).map(String::as_str),
            Some("burned-high-7778.0")
        );
        assert_eq!(
            domsoil.get(&22).map(String::as_str),
            Some("burned-low-7778.0")
        );
        assert_eq!(
            domsoil.get(&31).map(String::as_str),
            Some("unburned-7778.0")
        );
    }

    #[test]
    fn test_kslast_validation() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        let s = soils(&registry, "r1", SoilsMode::Gridded);
        assert!(s.set_kslast(Some(-1.0)).is_err());
        s.set_kslast(Some(0.5)).unwrap();
        assert_eq!(s.read(|s| s.kslast), Some(0.5));
        s.set_kslast(None).unwrap();
        assert_eq!(s.read(|s| s.kslast), None);
    }
}
