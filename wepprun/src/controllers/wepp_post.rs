//! WeppPost: aggregation of per-hillslope WEPP outputs.
//!
//! Walks `wepp/output/H<wepp_id>.pass.json`, sums runoff and sediment
//! into run totals, and persists the summary alongside the raw outputs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ControllerError;
use crate::nodb::{Controller, Nodb, NodbBase, NodbError, NodbKind, Registry};
use crate::status::{EventKind, TaskEnum};

/// Per-hillslope pass summary as the WEPP wrapper emits it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HillslopeLoss {
    #[serde(default)]
    pub wepp_id: i64,
    #[serde(default)]
    pub runoff_mm: f64,
    #[serde(default)]
    pub soil_loss_kg: f64,
    #[serde(default)]
    pub sediment_yield_kg: f64,
}

/// Whole-run totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub hillslopes: usize,
    pub runoff_mm: f64,
    pub soil_loss_kg: f64,
    pub sediment_yield_kg: f64,
}

/// WeppPost controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeppPost {
    pub base: NodbBase,
    pub hillslopes: Vec<HillslopeLoss>,
    pub totals: Option<RunTotals>,
}

impl Controller for WeppPost {
    const KIND: NodbKind = NodbKind::WeppPost;
}

impl WeppPost {
    pub fn new(base: NodbBase) -> Self {
        Self {
            base,
            hillslopes: Vec::new(),
            totals: None,
        }
    }
}

fn parse_pass_file(path: &Path) -> Result<HillslopeLoss, ControllerError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ControllerError::Nodb(NodbError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    })?;
    let mut loss: HillslopeLoss = serde_json::from_str(&raw).map_err(|e| {
        ControllerError::Validation(format!("malformed pass file {}: {}", path.display(), e))
    })?;
    if loss.wepp_id == 0 {
        // Wrapper omits the id; recover it from the file name.
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_suffix(".pass"))
            .and_then(|s| s.strip_prefix('H'))
            .and_then(|s| s.parse().ok())
        {
            loss.wepp_id = id;
        }
    }
    Ok(loss)
}

impl Nodb<WeppPost> {
    /// Aggregates hillslope pass files into run totals.
    pub fn run(&self, registry: &Registry) -> Result<RunTotals, ControllerError> {
        let platform = registry.platform();
        if platform
            .prep
            .last_timestamp(self.runid(), TaskEnum::RunWepp)
            .is_none()
        {
            return Err(ControllerError::MissingPrerequisite {
                operation: "wepppost",
                prerequisite: "a completed WEPP run".to_string(),
            });
        }
        platform
            .status
            .publish(self.runid(), "wepppost", EventKind::Started, "aggregate");

        let output_dir = self.wd().join("wepp/output");
        let entries = std::fs::read_dir(&output_dir).map_err(|e| {
            ControllerError::Nodb(NodbError::Io {
                path: output_dir.clone(),
                source: e,
            })
        })?;
        let mut hillslopes = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('H') && name.ends_with(".pass.json") {
                hillslopes.push(parse_pass_file(&entry.path())?);
            }
        }
        hillslopes.sort_by_key(|h| h.wepp_id);
        if hillslopes.is_empty() {
            return Err(ControllerError::MissingOutput {
                operation: "wepppost",
                path: output_dir,
            });
        }

        let totals = RunTotals {
            hillslopes: hillslopes.len(),
            runoff_mm: hillslopes.iter().map(|h| h.runoff_mm).sum(),
            soil_loss_kg: hillslopes.iter().map(|h| h.soil_loss_kg).sum(),
            sediment_yield_kg: hillslopes.iter().map(|h| h.sediment_yield_kg).sum(),
        };

        let totals_path = output_dir.join("totals.json");
        let raw = serde_json::to_string_pretty(&totals)
            .map_err(|e| ControllerError::Validation(e.to_string()))?;
        std::fs::write(&totals_path, raw).map_err(|e| {
            ControllerError::Nodb(NodbError::Io {
                path: totals_path,
                source: e,
            })
        })?;

        self.with_locked(|post| {
            post.hillslopes = hillslopes;
            post.totals = Some(totals.clone());
            Ok::<_, ControllerError>(())
        })?;
        platform
            .status
            .publish(self.runid(), "wepppost", EventKind::Completed, "aggregate");
        Ok(totals)
    }
}
