//! RAP: rangeland cover revision of landuse.
//!
//! Carries per-hillslope fractional cover from the RAP timeseries. When
//! landuse finishes building, the handler revises the assignment:
//! hillslopes whose cover falls below the shrub threshold are remapped
//! from forest to shrub, the usual correction in rangeland watersheds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::controllers::landuse::Landuse;
use crate::controllers::ControllerError;
use crate::nodb::{Controller, Nodb, NodbBase, NodbError, NodbKind, Registry};
use crate::trigger::{TriggerContext, TriggerError, TriggerEvent, TriggerHandler};

/// Fractional tree cover below which forest covers remap to shrubland.
const SHRUB_COVER_THRESHOLD: f64 = 0.25;

/// RAP controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rap {
    pub base: NodbBase,
    /// RAP acquisition year.
    pub year: i32,
    /// topaz_id -> fractional tree cover, 0..=1.
    pub cover: BTreeMap<i64, f64>,
    /// Hillslopes remapped during the last revision.
    pub remapped: Vec<i64>,
}

impl Controller for Rap {
    const KIND: NodbKind = NodbKind::Rap;
}

impl Rap {
    pub fn new(base: NodbBase, year: i32) -> Self {
        Self {
            base,
            year,
            cover: BTreeMap::new(),
            remapped: Vec::new(),
        }
    }
}

impl Nodb<Rap> {
    /// Stores the sampled cover timeseries for the acquisition year.
    pub fn ingest_cover(&self, cover: BTreeMap<i64, f64>) -> Result<(), ControllerError> {
        if let Some((id, bad)) = cover.iter().find(|(_, v)| !(0.0..=1.0).contains(*v)) {
            return Err(ControllerError::Validation(format!(
                "cover fraction {} for hillslope {} out of range",
                bad, id
            )));
        }
        self.with_locked(|rap| {
            rap.cover = cover;
            Ok(())
        })
    }

    /// Remaps low-cover forest hillslopes to shrubland on the landuse
    /// controller.
    pub fn revise_landuse(&self, registry: &Registry) -> Result<usize, ControllerError> {
        let landuse = registry.get_instance::<Landuse>(self.runid(), false)?;
        let cover = self.read(|rap| rap.cover.clone());
        let mut remapped = Vec::new();
        landuse.with_locked(|lu| {
            for (topaz_id, fraction) in &cover {
                if *fraction < SHRUB_COVER_THRESHOLD {
                    if let Some(dom) = lu.domlc.get_mut(topaz_id) {
                        if dom == "41" || dom == "42" {
                            *dom = "52".to_string();
                            remapped.push(*topaz_id);
                        }
                    }
                }
            }
            Ok::<_, ControllerError>(())
        })?;

        self.with_locked(|rap| {
            rap.remapped = remapped.clone();
            Ok::<_, ControllerError>(())
        })?;
        self.logger().info(format!(
            "rap revision remapped {} hillslopes to shrubland",
            remapped.len()
        ));
        Ok(remapped.len())
    }
}

/// Applies the cover revision once landuse is built.
pub struct RapHandler;

impl TriggerHandler for RapHandler {
    fn module(&self) -> &'static str {
        "rap"
    }

    fn on_event(&self, event: TriggerEvent, ctx: &TriggerContext<'_>) -> Result<(), TriggerError> {
        if event != TriggerEvent::LanduseBuildComplete {
            return Ok(());
        }
        let rap = match ctx.registry.get_instance::<Rap>(ctx.runid, false) {
            Ok(handle) => handle,
            Err(NodbError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(TriggerError::Nodb(e)),
        };
        if rap.read(|r| r.cover.is_empty()) {
            return Ok(());
        }
        rap.revise_landuse(ctx.registry)
            .map(|_| ())
            .map_err(|e| TriggerError::Handler {
                module: "rap",
                event,
                reason: e.to_string(),
            })
    }
}
