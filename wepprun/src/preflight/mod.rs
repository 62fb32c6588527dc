//! Cross-controller prerequisite graph.
//!
//! Preflight answers "which pipeline stages may run right now" from the
//! task timestamps in the prep-state hash. A stage is ready when every
//! prerequisite task has succeeded, and succeeded no earlier than its own
//! prerequisites; rerunning an upstream stage therefore marks everything
//! downstream stale until it is rebuilt in order.
//!
//! Soil burn severity handling: when the disturbed mod requires an SBS
//! map and none is set, landuse and everything downstream is blocked;
//! when an SBS map exists without being required, the run is annotated
//! `burned` but nothing is gated on it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{RedisPrep, TaskEnum};

/// Pipeline stages reported by preflight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Channels,
    Outlet,
    Subcatchments,
    Landuse,
    Soils,
    Climate,
    Wepp,
    Observed,
    Watar,
}

impl Stage {
    pub fn all() -> &'static [Stage] {
        &[
            Stage::Channels,
            Stage::Outlet,
            Stage::Subcatchments,
            Stage::Landuse,
            Stage::Soils,
            Stage::Climate,
            Stage::Wepp,
            Stage::Observed,
            Stage::Watar,
        ]
    }

    /// Task whose timestamp marks this stage complete.
    fn task(&self) -> TaskEnum {
        match self {
            Stage::Channels => TaskEnum::BuildChannels,
            Stage::Outlet => TaskEnum::SetOutlet,
            Stage::Subcatchments => TaskEnum::AbstractWatershed,
            Stage::Landuse => TaskEnum::BuildLanduse,
            Stage::Soils => TaskEnum::BuildSoils,
            Stage::Climate => TaskEnum::BuildClimate,
            Stage::Wepp => TaskEnum::RunWepp,
            Stage::Observed => TaskEnum::RunObserved,
            Stage::Watar => TaskEnum::RunWatar,
        }
    }

    /// Direct prerequisite stages.
    fn prerequisites(&self) -> &'static [Stage] {
        match self {
            Stage::Channels => &[],
            Stage::Outlet => &[Stage::Channels],
            Stage::Subcatchments => &[Stage::Channels],
            Stage::Landuse => &[Stage::Subcatchments],
            Stage::Soils => &[Stage::Subcatchments, Stage::Landuse],
            Stage::Climate => &[Stage::Subcatchments],
            Stage::Wepp => &[Stage::Landuse, Stage::Soils, Stage::Climate],
            Stage::Observed => &[Stage::Wepp],
            Stage::Watar => &[Stage::Wepp],
        }
    }
}

/// Readiness of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    NotReady,
    NotApplicable,
}

/// How soil burn severity factors into this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SbsState {
    /// No disturbed coupling, no map.
    NotApplicable,
    /// Map required and present.
    Satisfied,
    /// Map required and absent; dependents are blocked.
    Missing,
    /// Map present without being required.
    Burned,
}

/// Everything preflight needs, decoupled from the live stores.
#[derive(Debug, Clone)]
pub struct PreflightInputs {
    /// Task field name -> last success time.
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
    /// Disturbed coupling demands an SBS map before landuse/soils.
    pub sbs_required: bool,
    /// An SBS map is set on the run.
    pub has_sbs: bool,
    /// Observed and watar stages are configured for this run.
    pub observed_applicable: bool,
    pub watar_applicable: bool,
}

impl PreflightInputs {
    /// Loads inputs from the prep-state hash.
    pub fn from_prep(prep: &RedisPrep, runid: &str, sbs_required: bool, has_sbs: bool) -> Self {
        Self {
            timestamps: prep.timestamps(runid),
            sbs_required,
            has_sbs,
            observed_applicable: false,
            watar_applicable: false,
        }
    }
}

/// Preflight result: per-stage readiness plus the SBS annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    pub stages: BTreeMap<Stage, Readiness>,
    pub sbs: SbsState,
}

impl PreflightReport {
    pub fn is_ready(&self, stage: Stage) -> bool {
        self.stages.get(&stage) == Some(&Readiness::Ready)
    }
}

fn completed_at(inputs: &PreflightInputs, stage: Stage) -> Option<DateTime<Utc>> {
    inputs.timestamps.get(stage.task().field()).copied()
}

/// A stage's completion is current when it happened no earlier than every
/// one of its own (transitive) prerequisites.
fn completion_is_current(inputs: &PreflightInputs, stage: Stage) -> bool {
    let Some(own) = completed_at(inputs, stage) else {
        return false;
    };
    stage.prerequisites().iter().all(|p| {
        completed_at(inputs, *p).is_some_and(|pt| pt <= own) && completion_is_current(inputs, *p)
    })
}

fn stage_ready(inputs: &PreflightInputs, stage: Stage) -> bool {
    // SBS gating: landuse (and by prerequisite everything downstream of
    // it) is blocked while a required SBS map is absent.
    if stage == Stage::Landuse && inputs.sbs_required && !inputs.has_sbs {
        return false;
    }
    stage
        .prerequisites()
        .iter()
        .all(|p| completion_is_current(inputs, *p) && stage_ready(inputs, *p))
}

/// Computes the full preflight report.
pub fn check(inputs: &PreflightInputs) -> PreflightReport {
    let sbs = match (inputs.sbs_required, inputs.has_sbs) {
        (true, true) => SbsState::Satisfied,
        (true, false) => SbsState::Missing,
        (false, true) => SbsState::Burned,
        (false, false) => SbsState::NotApplicable,
    };
    let mut stages = BTreeMap::new();
    for stage in Stage::all() {
        let applicable = match stage {
            Stage::Observed => inputs.observed_applicable,
            Stage::Watar => inputs.watar_applicable,
            _ => true,
        };
        let readiness = if !applicable {
            Readiness::NotApplicable
        } else if stage_ready(inputs, *stage) {
            Readiness::Ready
        } else {
            Readiness::NotReady
        };
        stages.insert(*stage, readiness);
    }
    PreflightReport { stages, sbs }
}
