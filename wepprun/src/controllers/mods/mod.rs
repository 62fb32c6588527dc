//! Optional per-run couplings ("mods").
//!
//! A mod is a controller of its own plus, usually, a trigger handler
//! that reacts to lifecycle events of the core pipeline. Which mods are
//! live is decided per run by the profile's `[nodb] mods` list;
//! [`bus_for`] turns that list into the run's trigger bus.

pub mod ash;
pub mod disturbed;
pub mod omni;
pub mod rap;

pub use ash::Ash;
pub use disturbed::Disturbed;
pub use omni::Omni;
pub use rap::Rap;

use std::sync::Arc;

use crate::config::RunConfig;
use crate::trigger::TriggerBus;

/// Builds the trigger bus for a run from its active mod set.
///
/// Unknown mod names are skipped with a warning rather than failing the
/// run; migrated profiles carry retired mod names.
pub fn bus_for(config: &RunConfig) -> TriggerBus {
    let mut bus = TriggerBus::new();
    for name in &config.nodb.mods {
        match name.as_str() {
            // `baer` is the legacy name of the disturbed coupling.
            "disturbed" | "baer" => bus.register(Arc::new(disturbed::DisturbedHandler)),
            "rap" => bus.register(Arc::new(rap::RapHandler)),
            "ash" => bus.register(Arc::new(ash::AshHandler)),
            // Omni has no passive handler; scenario fan-out is explicit.
            "omni" => {}
            other => {
                tracing::warn!(module = other, "unknown mod in profile, skipping");
            }
        }
    }
    bus
}
