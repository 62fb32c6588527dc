//! Domain controllers.
//!
//! Each controller is a serde state struct (see [`crate::nodb`]) plus an
//! operations impl on its `Nodb` handle. Operations follow one shape:
//! acquire the distributed lock, mutate, persist, release; record the
//! prep timestamp on success; publish status events; and emit trigger
//! events for the run's mod set.
//!
//! Cross-controller access goes through the [`crate::nodb::Registry`]
//! passed in at the call site, never through stored references.

mod climate;
mod landuse;
pub mod mods;
mod ron;
mod soils;
mod watershed;
mod wepp;
mod wepp_post;

pub use climate::{Climate, ClimateSpatialMode, Station, StationMode};
pub use landuse::{BurnClass, Landuse, Management};
pub use ron::Ron;
pub use soils::Soils;
pub use watershed::{
    Channel, DelineationBackend, DelineationState, Outlet, StdoutJsonBackend, Subcatchment,
    Translator, Watershed,
};
pub use wepp::Wepp;
pub use wepp_post::{HillslopeLoss, RunTotals, WeppPost};

use std::path::PathBuf;

use thiserror::Error;

use crate::nodb::NodbError;
use crate::process::ToolError;
use crate::trigger::TriggerError;

/// Failures of controller operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Nodb(#[from] NodbError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    /// Operation attempted out of state-machine order.
    #[error("invalid transition from {from}: {attempted}")]
    InvalidTransition {
        from: &'static str,
        attempted: &'static str,
    },

    /// A collaborating controller has not produced what this operation
    /// needs yet.
    #[error("{operation} requires {prerequisite}")]
    MissingPrerequisite {
        operation: &'static str,
        prerequisite: String,
    },

    /// An external hydrology tool failed.
    #[error("{operation} failed: {source}")]
    ExternalToolFailure {
        operation: &'static str,
        #[source]
        source: ToolError,
    },

    /// The tool exited cleanly but an expected artifact is absent.
    #[error("{operation} produced no {path}")]
    MissingOutput {
        operation: &'static str,
        path: PathBuf,
    },

    #[error("{0}")]
    Validation(String),
}
