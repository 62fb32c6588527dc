//! Ash: post-fire ash transport, keyed by burn class.
//!
//! Runs after the WEPP watershed pass. The transport model proper lives
//! in a downstream tool; this controller derives the per-hillslope ash
//! load from the initial ash depth and the burn class, which is what the
//! reports and the transport input decks consume.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::controllers::landuse::{BurnClass, Landuse};
use crate::controllers::watershed::Watershed;
use crate::controllers::ControllerError;
use crate::nodb::{Controller, Nodb, NodbBase, NodbError, NodbKind, Registry};
use crate::status::EventKind;
use crate::trigger::{TriggerContext, TriggerError, TriggerEvent, TriggerHandler};

/// Ash controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ash {
    pub base: NodbBase,
    /// Initial ash depth, millimeters.
    pub ash_depth_mm: f64,
    /// topaz_id -> ash load, tonnes/ha.
    pub loads: BTreeMap<i64, f64>,
}

impl Controller for Ash {
    const KIND: NodbKind = NodbKind::Ash;
}

impl Ash {
    pub fn new(base: NodbBase, ash_depth_mm: f64) -> Self {
        Self {
            base,
            ash_depth_mm,
            loads: BTreeMap::new(),
        }
    }
}

/// Ash load per millimeter of depth, tonnes/ha, by burn class.
fn load_factor(class: BurnClass) -> f64 {
    match class {
        BurnClass::Unburned => 0.0,
        BurnClass::Low => 0.5,
        BurnClass::Moderate => 1.0,
        BurnClass::High => 1.5,
    }
}

impl Nodb<Ash> {
    /// Computes per-hillslope ash loads from the landuse burn classes.
    pub fn run_model(&self, registry: &Registry) -> Result<(), ControllerError> {
        let watershed = registry.get_instance::<Watershed>(self.runid(), false)?;
        let translator = watershed.translator_factory()?;
        let landuse = registry.get_instance::<Landuse>(self.runid(), false)?;
        let depth = self.read(|a| a.ash_depth_mm);

        let loads: BTreeMap<i64, f64> = translator
            .iter_sub_ids()
            .map(|topaz_id| {
                let class = landuse.identify_burn_class(topaz_id, None);
                (topaz_id, depth * load_factor(class))
            })
            .collect();

        self.with_locked(|a| {
            a.loads = loads;
            Ok::<_, ControllerError>(())
        })?;
        registry
            .platform()
            .status
            .publish(self.runid(), "ash", EventKind::Completed, "run_model");
        Ok(())
    }

    /// Total ash load over the watershed, tonnes/ha summed by hillslope.
    pub fn total_load(&self) -> f64 {
        self.read(|a| a.loads.values().sum())
    }
}

/// Runs the ash model once WEPP completes.
pub struct AshHandler;

impl TriggerHandler for AshHandler {
    fn module(&self) -> &'static str {
        "ash"
    }

    fn on_event(&self, event: TriggerEvent, ctx: &TriggerContext<'_>) -> Result<(), TriggerError> {
        if event != TriggerEvent::WeppRunComplete {
            return Ok(());
        }
        let ash = match ctx.registry.get_instance::<Ash>(ctx.runid, false) {
            Ok(handle) => handle,
            Err(NodbError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(TriggerError::Nodb(e)),
        };
        ash.run_model(ctx.registry).map_err(|e| TriggerError::Handler {
            module: "ash",
            event,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::testutil::{abstracted_watershed, registry};
    use crate::trigger::TriggerBus;

    fn ash(registry: &Registry, runid: &str) -> Nodb<Ash> {
        let wd = registry.wd_for(runid);
        registry
            .create_at(&wd, runid, Ash::new(NodbBase::new(&wd, runid, "ash"), 10.0))
            .unwrap()
    }

    fn burned_landuse(registry: &Registry, runid: &str) -> Nodb<Landuse> {
        let wd = registry.wd_for(runid);
        let lu = registry
            .create_at(&wd, runid, Landuse::new(NodbBase::new(&wd, runid, "ash"), None))
            .unwrap();
        lu.build(registry, &TriggerBus::new()).unwrap();
        let mut classes = BTreeMap::new();
        classes.insert(21, BurnClass::High);
        classes.insert(22, BurnClass::Low);
        lu.set_burn_classes(classes).unwrap();
        lu
    }

    #[test]
    fn test_loads_follow_burn_class() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        burned_landuse(&registry, "r1");
        let a = ash(&registry, "r1");
        a.run_model(&registry).unwrap();

        let loads = a.read(|s| s.loads.clone());
        assert_eq!(loads.get(&21).copied(), Some(15.0));
        assert_eq!(loads.get(&22).copied(), Some(5.0));
        assert_eq!(loads.get(&31).copied(), Some(0.0));
        assert!((a.total_load() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_handler_fires_on_wepp_completion() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        burned_landuse(&registry, "r1");
        let a = ash(&registry, "r1");

        let mut bus = TriggerBus::new();
        bus.register(std::sync::Arc::new(AshHandler));
        bus.emit(&registry, "r1", TriggerEvent::WeppRunComplete)
            .unwrap();
        assert!(a.total_load() > 0.0);
    }

    #[test]
    fn test_unburned_run_yields_no_load() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        let wd = registry.wd_for("r1");
        let lu = registry
            .create_at(&wd, "r1", Landuse::new(NodbBase::new(&wd, "r1", "ash"), None))
            .unwrap();
        lu.build(&registry, &TriggerBus::new()).unwrap();
        let a = ash(&registry, "r1");
        a.run_model(&registry).unwrap();
        assert_eq!(a.total_load(), 0.0);
    }
}
