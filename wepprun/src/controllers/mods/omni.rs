//! Omni: scenario fan-out.
//!
//! A scenario is a full clone of the current run under
//! `omni/scenarios/<name>/`: read-only inputs symlinked back to the
//! parent, controller documents copied and rehomed to the clone, and the
//! clone's results tree registered under `_pups/omni/scenarios/<name>`.
//! The pipeline then reruns inside the clone (scheduled as background
//! jobs, like batch children), diverging wherever the scenario changes
//! parameters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::controllers::ControllerError;
use crate::nodb::{Controller, Nodb, NodbBase, NodbError, NodbKind, Registry};
use crate::rundir;
use crate::status::EventKind;

/// Omni controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Omni {
    pub base: NodbBase,
    /// Scenario names from the profile.
    pub scenarios: Vec<String>,
    /// Scenarios whose clone has finished its pipeline.
    pub completed: Vec<String>,
}

impl Controller for Omni {
    const KIND: NodbKind = NodbKind::Omni;
}

impl Omni {
    pub fn new(base: NodbBase, scenarios: Vec<String>) -> Self {
        Self {
            base,
            scenarios,
            completed: Vec::new(),
        }
    }
}

fn valid_scenario_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn rundir_err(e: rundir::RunDirError) -> ControllerError {
    match e {
        rundir::RunDirError::Io { path, source } => {
            ControllerError::Nodb(NodbError::Io { path, source })
        }
        rundir::RunDirError::Rehome { path, reason } => {
            ControllerError::Nodb(NodbError::Serde { path, reason })
        }
    }
}

impl Nodb<Omni> {
    /// Working directory of a scenario clone.
    pub fn scenario_wd(&self, name: &str) -> PathBuf {
        self.wd().join("omni/scenarios").join(name)
    }

    /// Runid assigned to a scenario clone.
    pub fn scenario_runid(&self, name: &str) -> String {
        format!("{}_{}", self.runid(), name)
    }

    /// Materializes the scenario clone.
    ///
    /// Inputs are symlinked, `.nodb` documents copied and rehomed to the
    /// clone's directory and runid, and the clone is registered under the
    /// parent's `_pups/` results tree. Fails if the clone already exists.
    pub fn clone_scenario(&self, registry: &Registry, name: &str) -> Result<PathBuf, ControllerError> {
        if !valid_scenario_name(name) {
            return Err(ControllerError::Validation(format!(
                "invalid scenario name {:?}",
                name
            )));
        }
        let dst = self.scenario_wd(name);
        if dst.exists() {
            return Err(ControllerError::Validation(format!(
                "scenario {} already exists",
                name
            )));
        }
        let child_runid = self.scenario_runid(name);
        rundir::clone_run_dir(self.wd(), &dst, Some(&child_runid)).map_err(rundir_err)?;
        rundir::link_pup(self.wd(), &format!("omni/scenarios/{}", name), &dst)
            .map_err(rundir_err)?;

        self.with_locked(|omni| {
            if !omni.scenarios.iter().any(|s| s == name) {
                omni.scenarios.push(name.to_string());
            }
            Ok::<_, ControllerError>(())
        })?;
        self.logger()
            .info(format!("cloned scenario {} into {}", name, dst.display()));
        registry
            .platform()
            .status
            .publish(self.runid(), "omni", EventKind::Info, &format!("cloned {}", name));
        Ok(dst)
    }

    /// Records a scenario's pipeline as finished.
    pub fn mark_complete(&self, registry: &Registry, name: &str) -> Result<(), ControllerError> {
        self.with_locked(|omni| {
            if !omni.completed.iter().any(|s| s == name) {
                omni.completed.push(name.to_string());
            }
            Ok::<_, ControllerError>(())
        })?;
        registry.platform().status.publish(
            self.runid(),
            "omni",
            EventKind::Completed,
            &format!("scenario {}", name),
        );
        Ok(())
    }

    /// Scenarios still waiting on their pipeline.
    pub fn pending(&self) -> Vec<String> {
        self.read(|omni| {
            omni.scenarios
                .iter()
                .filter(|s| !omni.completed.contains(s))
                .cloned()
                .collect()
        })
    }
}
