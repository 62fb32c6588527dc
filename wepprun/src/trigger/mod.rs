//! Intra-run lifecycle event dispatch.
//!
//! Controllers emit typed events to a [`TriggerBus`]; the bus dispatches
//! synchronously to every handler registered for the run's mod set, in
//! registration order. Handlers run on the emitter's thread, under the
//! emitter's lock, and take their own locks for any mutation of their
//! own controllers. A handler error aborts the emitting operation.
//!
//! There is no cross-run dispatch; each run wires its own bus from its
//! profile's mod list.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::nodb::{NodbError, Registry};
use crate::status::EventKind;

/// Lifecycle events controllers may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerEvent {
    InitFinish,
    LanduseDomlcComplete,
    LanduseBuildComplete,
    SoilsBuildComplete,
    ClimateBuildComplete,
    PreppingPhosphorus,
    WeppPrepComplete,
    WeppRunComplete,
    SbsMapChanged,
    BatchRunCompleted,
}

impl TriggerEvent {
    /// Wire tag published with the `TRIGGER` status event.
    pub fn tag(&self) -> &'static str {
        match self {
            TriggerEvent::InitFinish => "ON_INIT_FINISH",
            TriggerEvent::LanduseDomlcComplete => "LANDUSE_DOMLC_COMPLETE",
            TriggerEvent::LanduseBuildComplete => "LANDUSE_BUILD_COMPLETE",
            TriggerEvent::SoilsBuildComplete => "SOILS_BUILD_COMPLETE",
            TriggerEvent::ClimateBuildComplete => "CLIMATE_BUILD_COMPLETE",
            TriggerEvent::PreppingPhosphorus => "PREPPING_PHOSPHORUS",
            TriggerEvent::WeppPrepComplete => "WEPP_PREP_WATERSHED_COMPLETE",
            TriggerEvent::WeppRunComplete => "WEPP_RUN_COMPLETE",
            TriggerEvent::SbsMapChanged => "SBS_MAP_CHANGED",
            TriggerEvent::BatchRunCompleted => "BATCH_RUN_COMPLETED",
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Dispatch failures surface to the emitting controller and abort its
/// operation.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Nodb(#[from] NodbError),

    #[error("{module} handler failed on {event}: {reason}")]
    Handler {
        module: &'static str,
        event: TriggerEvent,
        reason: String,
    },
}

/// What a handler gets to work with: the registry for resolving its own
/// controllers, and the emitting run.
pub struct TriggerContext<'a> {
    pub registry: &'a Registry,
    pub runid: &'a str,
}

/// A mod's subscription to lifecycle events.
///
/// `on_event` is called for every emitted event; handlers ignore events
/// they do not care about by returning `Ok(())`.
pub trait TriggerHandler: Send + Sync {
    /// Mod name as it appears in `[nodb] mods`.
    fn module(&self) -> &'static str;

    fn on_event(&self, event: TriggerEvent, ctx: &TriggerContext<'_>) -> Result<(), TriggerError>;
}

/// Per-run synchronous event bus.
#[derive(Default)]
pub struct TriggerBus {
    handlers: Vec<Arc<dyn TriggerHandler>>,
}

impl TriggerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TriggerHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Dispatches `event` to every handler in registration order.
    ///
    /// Publishes a `TRIGGER` status event on `<runid>:trigger` before
    /// dispatch. The first handler error aborts dispatch and is returned
    /// to the emitter.
    pub fn emit(
        &self,
        registry: &Registry,
        runid: &str,
        event: TriggerEvent,
    ) -> Result<(), TriggerError> {
        registry
            .platform()
            .status
            .publish(runid, "trigger", EventKind::Trigger, event.tag());
        let ctx = TriggerContext { registry, runid };
        for handler in &self.handlers {
            tracing::debug!(runid, event = %event, module = handler.module(), "dispatching trigger");
            handler.on_event(event, &ctx)?;
        }
        Ok(())
    }
}
