//! Disturbed: soil burn severity coupling.
//!
//! Holds the SBS map and the per-hillslope burn classes sampled from it.
//! When landuse finishes its dominant-cover assignment
//! (`LANDUSE_DOMLC_COMPLETE`), the handler pushes the burn classes onto
//! the landuse controller, where soils and ash read them back through
//! `identify_burn_class`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::controllers::landuse::{BurnClass, Landuse};
use crate::controllers::ControllerError;
use crate::nodb::{Controller, Nodb, NodbBase, NodbError, NodbKind, Registry};
use crate::status::{EventKind, TaskEnum};
use crate::trigger::{
    TriggerBus, TriggerContext, TriggerError, TriggerEvent, TriggerHandler,
};

/// Disturbed controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disturbed {
    pub base: NodbBase,
    /// SBS raster, relative to the run directory.
    pub sbs_path: Option<PathBuf>,
    /// Whether landuse/soils are blocked until a map is set.
    pub sbs_required: bool,
    /// Soil version used for disturbed-class soils.
    pub sol_ver: String,
    /// topaz_id -> burn class sampled from the map.
    pub classes: BTreeMap<i64, BurnClass>,
}

impl Controller for Disturbed {
    const KIND: NodbKind = NodbKind::Disturbed;
}

impl Disturbed {
    pub fn new(base: NodbBase, sbs_required: bool, sol_ver: impl Into<String>) -> Self {
        Self {
            base,
            sbs_path: None,
            sbs_required,
            sol_ver: sol_ver.into(),
            classes: BTreeMap::new(),
        }
    }
}

impl Nodb<Disturbed> {
    /// Records the SBS map and its per-hillslope classification.
    ///
    /// `relpath` must already exist inside the run directory; `classes`
    /// is the wrapper's sampling of the raster over the hillslopes.
    pub fn set_sbs_map(
        &self,
        registry: &Registry,
        bus: &TriggerBus,
        relpath: &Path,
        classes: BTreeMap<i64, BurnClass>,
    ) -> Result<(), ControllerError> {
        if !self.wd().join(relpath).exists() {
            return Err(ControllerError::Validation(format!(
                "no SBS raster at {}",
                relpath.display()
            )));
        }
        self.with_locked(|d| {
            d.sbs_path = Some(relpath.to_path_buf());
            d.classes = classes;
            Ok::<_, ControllerError>(())
        })?;

        let platform = registry.platform();
        platform.prep.timestamp(self.runid(), TaskEnum::SetSbsMap);
        platform
            .status
            .publish(self.runid(), "disturbed", EventKind::Completed, "set_sbs_map");
        self.logger().info(format!(
            "sbs map set to {} ({} hillslopes classified)",
            relpath.display(),
            self.read(|d| d.classes.len())
        ));
        bus.emit(registry, self.runid(), TriggerEvent::SbsMapChanged)?;
        Ok(())
    }

    /// Removes the SBS map, reverting the run to undisturbed.
    pub fn remove_sbs_map(&self, registry: &Registry) -> Result<(), ControllerError> {
        self.with_locked(|d| {
            d.sbs_path = None;
            d.classes.clear();
            Ok::<_, ControllerError>(())
        })?;
        registry
            .platform()
            .prep
            .remove_timestamp(self.runid(), TaskEnum::SetSbsMap);
        Ok(())
    }

    pub fn has_sbs(&self) -> bool {
        self.read(|d| d.sbs_path.is_some())
    }
}

/// Pushes burn classes onto landuse after the cover assignment.
pub struct DisturbedHandler;

impl TriggerHandler for DisturbedHandler {
    fn module(&self) -> &'static str {
        "disturbed"
    }

    fn on_event(&self, event: TriggerEvent, ctx: &TriggerContext<'_>) -> Result<(), TriggerError> {
        if event != TriggerEvent::LanduseDomlcComplete {
            return Ok(());
        }
        let disturbed = match ctx.registry.get_instance::<Disturbed>(ctx.runid, false) {
            Ok(handle) => handle,
            // The coupling is configured but not initialized yet.
            Err(NodbError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(TriggerError::Nodb(e)),
        };
        let classes = disturbed.read(|d| d.classes.clone());
        if classes.is_empty() {
            return Ok(());
        }
        let landuse = ctx
            .registry
            .get_instance::<Landuse>(ctx.runid, false)
            .map_err(TriggerError::Nodb)?;
        landuse
            .set_burn_classes(classes)
            .map_err(|e| TriggerError::Handler {
                module: "disturbed",
                event,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::testutil::{abstracted_watershed, registry};

    fn disturbed(registry: &Registry, runid: &str) -> Nodb<Disturbed> {
        let wd = registry.wd_for(runid);
        registry
            .create_at(
                &wd,
                runid,
                Disturbed::new(NodbBase::new(&wd, runid, "disturbed"), true, "7778.0"),
            )
            .unwrap()
    }

    fn classes() -> BTreeMap<i64, BurnClass> {
        let mut classes = BTreeMap::new();
        classes.insert(21, BurnClass::High);
        classes.insert(22, BurnClass::Moderate);
        classes.insert(31, BurnClass::Unburned);
        classes
    }

    #[test]
    fn test_set_sbs_map_requires_raster() {
        let (registry, _root) = registry();
        let d = disturbed(&registry, "r1");
        let err = d
            .set_sbs_map(
                &registry,
                &TriggerBus::new(),
                Path::new("sbs.tif"),
                classes(),
            )
            .unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
        assert!(!d.has_sbs());
    }

    #[test]
    fn test_set_and_remove_sbs_map() {
        let (registry, _root) = registry();
        let d = disturbed(&registry, "r1");
        std::fs::write(d.wd().join("sbs.tif"), b"raster").unwrap();
        d.set_sbs_map(
            &registry,
            &TriggerBus::new(),
            Path::new("sbs.tif"),
            classes(),
        )
        .unwrap();
        assert!(d.has_sbs());
        assert!(registry
            .platform()
            .prep
            .last_timestamp("r1", TaskEnum::SetSbsMap)
            .is_some());

        d.remove_sbs_map(&registry).unwrap();
        assert!(!d.has_sbs());
        assert!(registry
            .platform()
            .prep
            .last_timestamp("r1", TaskEnum::SetSbsMap)
            .is_none());
    }

    #[test]
    fn test_handler_pushes_classes_onto_landuse() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        let d = disturbed(&registry, "r1");
        std::fs::write(d.wd().join("sbs.tif"), b"raster").unwrap();
        d.set_sbs_map(
            &registry,
            &TriggerBus::new(),
            Path::new("sbs.tif"),
            classes(),
        )
        .unwrap();

        let wd = registry.wd_for("r1");
        let lu = registry
            .create_at(
                &wd,
                "r1",
                Landuse::new(NodbBase::new(&wd, "r1", "disturbed"), None),
            )
            .unwrap();
        let mut bus = TriggerBus::new();
        bus.register(std::sync::Arc::new(DisturbedHandler));
        lu.build(&registry, &bus).unwrap();

        assert_eq!(lu.identify_burn_class(21, None), BurnClass::High);
        assert_eq!(lu.identify_burn_class(31, None), BurnClass::Unburned);
        assert!(lu.is_burned());
    }

    #[test]
    fn test_handler_ignores_runs_without_the_controller() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        let wd = registry.wd_for("r1");
        let lu = registry
            .create_at(
                &wd,
                "r1",
                Landuse::new(NodbBase::new(&wd, "r1", "disturbed"), None),
            )
            .unwrap();
        let mut bus = TriggerBus::new();
        bus.register(std::sync::Arc::new(DisturbedHandler));
        // No disturbed.nodb exists; dispatch must be a no-op.
        lu.build(&registry, &bus).unwrap();
        assert!(!lu.is_burned());
    }
}
