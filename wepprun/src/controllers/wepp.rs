//! Wepp: input preparation and the WEPP runs themselves.
//!
//! Four phases in strict order: prep hillslopes, run hillslopes, prep
//! watershed, run watershed. Preparation collects the landuse,
//! soils, and climate assignments into per-hillslope run files under
//! `wepp/runs/`; the runs drive the WEPP binary per hillslope and then
//! once more for the channel routing pass. Outputs land under
//! `wepp/output/`.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::climate::Climate;
use super::landuse::Landuse;
use super::soils::Soils;
use super::watershed::{Translator, Watershed};
use super::ControllerError;
use crate::nodb::{Controller, Nodb, NodbBase, NodbError, NodbKind, Registry};
use crate::status::{EventKind, TaskEnum};
use crate::trigger::{TriggerBus, TriggerEvent};

const WEPP_TIMEOUT: Duration = Duration::from_secs(3600);

/// WEPP pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeppPhase {
    Unprepped,
    HillslopesPrepped,
    HillslopesRun,
    WatershedPrepped,
    Complete,
}

impl WeppPhase {
    fn name(&self) -> &'static str {
        match self {
            WeppPhase::Unprepped => "unprepped",
            WeppPhase::HillslopesPrepped => "hillslopes_prepped",
            WeppPhase::HillslopesRun => "hillslopes_run",
            WeppPhase::WatershedPrepped => "watershed_prepped",
            WeppPhase::Complete => "complete",
        }
    }
}

/// Wepp controller state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wepp {
    pub base: NodbBase,
    pub bin: String,
    pub phase: WeppPhase,
    /// Crop coefficient for the pmet ET adjustment.
    pub pmet_kcb: f64,
    /// Surface residue shear adjustment.
    pub rst: f64,
    pub kslast: Option<f64>,
    pub phosphorus_opts: bool,
    pub baseflow_opts: bool,
}

impl Controller for Wepp {
    const KIND: NodbKind = NodbKind::Wepp;
}

impl Wepp {
    pub fn new(base: NodbBase, config: &crate::config::WeppConfig) -> Self {
        Self {
            base,
            bin: config.bin.clone(),
            phase: WeppPhase::Unprepped,
            pmet_kcb: config.pmet_kcb,
            rst: config.rst,
            kslast: config.kslast,
            phosphorus_opts: config.phosphorus_opts,
            baseflow_opts: config.baseflow_opts,
        }
    }
}

impl Nodb<Wepp> {
    fn require_phase(
        &self,
        needed: WeppPhase,
        attempted: &'static str,
    ) -> Result<(), ControllerError> {
        let current = self.read(|w| w.phase);
        if current < needed {
            return Err(ControllerError::InvalidTransition {
                from: current.name(),
                attempted,
            });
        }
        Ok(())
    }

    fn advance_phase(&self, phase: WeppPhase) -> Result<(), ControllerError> {
        self.with_locked(|w| {
            w.phase = phase;
            Ok(())
        })
    }

    /// Writes per-hillslope run files from the built landuse, soils, and
    /// climate assignments.
    pub fn prep_hillslopes(
        &self,
        registry: &Registry,
        bus: &TriggerBus,
    ) -> Result<(), ControllerError> {
        let translator = self.translator(registry)?;
        let landuse = self.collaborator::<Landuse>(registry, "a built landuse")?;
        let soils = self.collaborator::<Soils>(registry, "built soils")?;
        let climate = self.collaborator::<Climate>(registry, "a built climate")?;

        let platform = registry.platform();
        platform
            .status
            .publish(self.runid(), "wepp", EventKind::Started, "prep_hillslopes");

        let (pmet_kcb, rst, kslast, phosphorus) =
            self.read(|w| (w.pmet_kcb, w.rst, w.kslast, w.phosphorus_opts));
        if phosphorus {
            bus.emit(registry, self.runid(), TriggerEvent::PreppingPhosphorus)?;
        }

        let cli_files = climate.read(|c| c.cli_files.clone());
        for topaz_id in translator.iter_sub_ids() {
            let wepp_id = translator.wepp(topaz_id).ok_or_else(|| {
                ControllerError::Validation(format!("hillslope {} has no wepp id", topaz_id))
            })?;
            let dom = landuse
                .read(|lu| lu.domlc.get(&topaz_id).cloned())
                .ok_or_else(|| ControllerError::MissingPrerequisite {
                    operation: "prep_hillslopes",
                    prerequisite: format!("landuse for hillslope {}", topaz_id),
                })?;
            let soil = soils
                .read(|s| s.domsoil.get(&topaz_id).cloned())
                .ok_or_else(|| ControllerError::MissingPrerequisite {
                    operation: "prep_hillslopes",
                    prerequisite: format!("soil for hillslope {}", topaz_id),
                })?;
            let cli = cli_files
                .iter()
                .find(|p| p.ends_with(format!("{}.cli", topaz_id)))
                .or_else(|| cli_files.first())
                .ok_or_else(|| ControllerError::MissingPrerequisite {
                    operation: "prep_hillslopes",
                    prerequisite: "generated climate files".to_string(),
                })?;

            let mut run = String::new();
            let _ = writeln!(run, "hillslope {} topaz {}", wepp_id, topaz_id);
            let _ = writeln!(run, "man {}", dom);
            let _ = writeln!(run, "sol {}", soil);
            let _ = writeln!(run, "cli {}", cli.display());
            let _ = writeln!(run, "pmet_kcb {}", pmet_kcb);
            let _ = writeln!(run, "rst {}", rst);
            if let Some(k) = kslast {
                let _ = writeln!(run, "kslast {}", k);
            }
            if phosphorus {
                let _ = writeln!(run, "phosphorus");
            }
            let path = self.wd().join(format!("wepp/runs/p{}.run", wepp_id));
            std::fs::write(&path, run).map_err(|e| {
                ControllerError::Nodb(NodbError::Io { path, source: e })
            })?;
        }

        self.advance_phase(WeppPhase::HillslopesPrepped)?;
        self.logger().info(format!(
            "prepped {} hillslope run files",
            translator.n_hillslopes()
        ));
        platform
            .status
            .publish(self.runid(), "wepp", EventKind::Completed, "prep_hillslopes");
        Ok(())
    }

    /// Runs WEPP once per hillslope.
    pub fn run_hillslopes(&self, registry: &Registry) -> Result<(), ControllerError> {
        self.require_phase(WeppPhase::HillslopesPrepped, "run_hillslopes")?;
        let translator = self.translator(registry)?;
        let platform = registry.platform();
        platform
            .status
            .publish(self.runid(), "wepp", EventKind::Started, "run_hillslopes");
        let bin = self.read(|w| w.bin.clone());

        let total = translator.n_hillslopes();
        for (i, topaz_id) in translator.iter_sub_ids().enumerate() {
            let wepp_id = translator.wepp(topaz_id).unwrap_or(0);
            self.run_wepp_pass(
                registry,
                &bin,
                &format!("p{}.run", wepp_id),
                &PathBuf::from(format!("wepp/output/H{}.pass.json", wepp_id)),
                "run_hillslopes",
            )?;
            platform.prep.set_progress(
                self.runid(),
                "wepp_hillslopes",
                &format!("{}/{}", i + 1, total),
            );
        }

        self.advance_phase(WeppPhase::HillslopesRun)?;
        platform
            .status
            .publish(self.runid(), "wepp", EventKind::Completed, "run_hillslopes");
        Ok(())
    }

    /// Writes the watershed routing pass inputs.
    pub fn prep_watershed(
        &self,
        registry: &Registry,
        bus: &TriggerBus,
    ) -> Result<(), ControllerError> {
        self.require_phase(WeppPhase::HillslopesRun, "prep_watershed")?;
        let translator = self.translator(registry)?;
        let baseflow = self.read(|w| w.baseflow_opts);

        let mut run = String::new();
        let _ = writeln!(run, "watershed routing");
        for topaz_id in translator.iter_chn_ids() {
            let _ = writeln!(run, "chn {}", translator.wepp(topaz_id).unwrap_or(0));
        }
        if baseflow {
            let _ = writeln!(run, "baseflow");
        }
        let path = self.wd().join("wepp/runs/pw0.run");
        std::fs::write(&path, run)
            .map_err(|e| ControllerError::Nodb(NodbError::Io { path, source: e }))?;

        self.advance_phase(WeppPhase::WatershedPrepped)?;
        bus.emit(registry, self.runid(), TriggerEvent::WeppPrepComplete)?;
        Ok(())
    }

    /// Runs the watershed routing pass and finalizes the run.
    pub fn run_watershed(
        &self,
        registry: &Registry,
        bus: &TriggerBus,
    ) -> Result<(), ControllerError> {
        self.require_phase(WeppPhase::WatershedPrepped, "run_watershed")?;
        let platform = registry.platform();
        platform
            .status
            .publish(self.runid(), "wepp", EventKind::Started, "run_watershed");
        let bin = self.read(|w| w.bin.clone());

        self.run_wepp_pass(
            registry,
            &bin,
            "pw0.run",
            &PathBuf::from("wepp/output/loss_pw0.txt"),
            "run_watershed",
        )?;

        self.advance_phase(WeppPhase::Complete)?;
        platform.prep.timestamp(self.runid(), TaskEnum::RunWepp);
        platform
            .status
            .publish(self.runid(), "wepp", EventKind::Completed, "run_watershed");
        bus.emit(registry, self.runid(), TriggerEvent::WeppRunComplete)?;
        Ok(())
    }

    fn run_wepp_pass(
        &self,
        registry: &Registry,
        bin: &str,
        run_file: &str,
        expected_output: &PathBuf,
        operation: &'static str,
    ) -> Result<(), ControllerError> {
        let platform = registry.platform();
        let argv = vec![bin.to_string(), "-r".to_string(), run_file.to_string()];
        let outcome = crate::process::run_binary(
            platform.tools.as_ref(),
            argv,
            &self.wd().join("wepp/runs"),
            WEPP_TIMEOUT,
        );
        if let Err(source) = outcome {
            self.logger()
                .error(format!("{} failed on {}: {}", operation, run_file, source));
            platform
                .status
                .exception(self.runid(), "wepp", operation, &source.to_string());
            return Err(ControllerError::ExternalToolFailure { operation, source });
        }
        if !self.wd().join(expected_output).exists() {
            return Err(ControllerError::MissingOutput {
                operation,
                path: expected_output.clone(),
            });
        }
        Ok(())
    }

    fn translator(&self, registry: &Registry) -> Result<Translator, ControllerError> {
        let watershed = registry
            .get_instance::<Watershed>(self.runid(), false)
            .map_err(|e| match e {
                NodbError::NotFound { .. } => ControllerError::MissingPrerequisite {
                    operation: "wepp",
                    prerequisite: "a delineated watershed".to_string(),
                },
                other => ControllerError::Nodb(other),
            })?;
        watershed
            .translator_factory()
            .map_err(|_| ControllerError::MissingPrerequisite {
                operation: "wepp",
                prerequisite: "an abstracted watershed".to_string(),
            })
    }

    fn collaborator<C: Controller>(
        &self,
        registry: &Registry,
        prerequisite: &str,
    ) -> Result<Nodb<C>, ControllerError> {
        registry
            .get_instance::<C>(self.runid(), false)
            .map_err(|e| match e {
                NodbError::NotFound { .. } => ControllerError::MissingPrerequisite {
                    operation: "prep_hillslopes",
                    prerequisite: prerequisite.to_string(),
                },
                other => ControllerError::Nodb(other),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunConfig, SoilsMode};
    use crate::controllers::climate::{ClimateSpatialMode, Station};
    use crate::controllers::testutil::abstracted_watershed;
    use crate::kv::MemoryKv;
    use crate::nodb::Platform;
    use crate::process::{CommandOutcome, CommandSpec, ToolError, ToolRunner};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Stub for both CLIGEN (`-o <file>`) and WEPP (`-r <run file>`):
    /// fabricates the output artifact each pass is expected to leave.
    struct FakeTools;

    impl ToolRunner for FakeTools {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome, ToolError> {
            if let Some(i) = spec.argv.iter().position(|a| a == "-o") {
                std::fs::write(spec.cwd.join(&spec.argv[i + 1]), b"cli").unwrap();
            }
            if let Some(i) = spec.argv.iter().position(|a| a == "-r") {
                let run_file = &spec.argv[i + 1];
                let output_dir = spec.cwd.parent().unwrap().join("output");
                let name = if run_file == "pw0.run" {
                    "loss_pw0.txt".to_string()
                } else {
                    let id = run_file.trim_start_matches('p').trim_end_matches(".run");
                    format!("H{}.pass.json", id)
                };
                std::fs::write(output_dir.join(name), b"{}").unwrap();
            }
            Ok(CommandOutcome {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                duration: Duration::from_millis(1),
            })
        }
    }

    fn registry() -> (Registry, TempDir) {
        let root = TempDir::new().unwrap();
        let platform = Platform::new(Arc::new(MemoryKv::new()), Arc::new(FakeTools));
        (Registry::new(platform, root.path()), root)
    }

    fn station() -> Station {
        Station {
            id: "ID106152".to_string(),
            desc: "MOSCOW U OF I".to_string(),
            latitude: 46.73,
            longitude: -117.00,
            years: 82,
        }
    }

    /// Drives landuse, soils, and climate to built state.
    fn prepared_run(registry: &Registry, runid: &str) -> Nodb<Wepp> {
        abstracted_watershed(registry, runid);
        let wd = registry.wd_for(runid);
        let bus = TriggerBus::new();

        let lu = registry
            .create_at(
                &wd,
                runid,
                Landuse::new(NodbBase::new(&wd, runid, "default"), None),
            )
            .unwrap();
        lu.build(registry, &bus).unwrap();

        let soils = registry
            .create_at(
                &wd,
                runid,
                Soils::new(NodbBase::new(&wd, runid, "default"), SoilsMode::Gridded, "7778.0"),
            )
            .unwrap();
        soils.build(registry, &bus).unwrap();

        let climate = registry
            .create_at(
                &wd,
                runid,
                Climate::new(NodbBase::new(&wd, runid, "default"), 100),
            )
            .unwrap();
        climate.set_spatial_mode(ClimateSpatialMode::Multiple).unwrap();
        climate
            .find_station(&[station()], (-116.1, 45.2), None)
            .unwrap();
        climate.build(registry, &bus, "cligen", 2000).unwrap();

        registry
            .create_at(
                &wd,
                runid,
                Wepp::new(
                    NodbBase::new(&wd, runid, "default"),
                    &RunConfig::default().wepp,
                ),
            )
            .unwrap()
    }

    #[test]
    fn test_full_wepp_sequence() {
        let (registry, _root) = registry();
        let wepp = prepared_run(&registry, "r1");
        let bus = TriggerBus::new();

        wepp.prep_hillslopes(&registry, &bus).unwrap();
        assert!(wepp.wd().join("wepp/runs/p1.run").exists());
        let run = std::fs::read_to_string(wepp.wd().join("wepp/runs/p1.run")).unwrap();
        assert!(run.contains("man 42"));
        assert!(run.contains("sol ssurgo-21"));
        assert!(run.contains("cli climate/21.cli"));

        wepp.run_hillslopes(&registry).unwrap();
        assert!(wepp.wd().join("wepp/output/H1.pass.json").exists());

        wepp.prep_watershed(&registry, &bus).unwrap();
        let routing = std::fs::read_to_string(wepp.wd().join("wepp/runs/pw0.run")).unwrap();
        assert!(routing.contains("chn 4"));
        assert!(routing.contains("baseflow"));

        wepp.run_watershed(&registry, &bus).unwrap();
        assert_eq!(wepp.read(|w| w.phase), WeppPhase::Complete);
        assert!(wepp.wd().join("wepp/output/loss_pw0.txt").exists());
        assert!(registry
            .platform()
            .prep
            .last_timestamp("r1", TaskEnum::RunWepp)
            .is_some());
    }

    #[test]
    fn test_out_of_order_phases_are_invalid() {
        let (registry, _root) = registry();
        let wepp = prepared_run(&registry, "r1");
        let bus = TriggerBus::new();

        let err = wepp.run_hillslopes(&registry).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidTransition { .. }));
        let err = wepp.run_watershed(&registry, &bus).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidTransition { .. }));
    }

    #[test]
    fn test_prep_requires_collaborators() {
        let (registry, _root) = registry();
        abstracted_watershed(&registry, "r1");
        let wd = registry.wd_for("r1");
        let wepp = registry
            .create_at(
                &wd,
                "r1",
                Wepp::new(
                    NodbBase::new(&wd, "r1", "default"),
                    &RunConfig::default().wepp,
                ),
            )
            .unwrap();
        let err = wepp
            .prep_hillslopes(&registry, &TriggerBus::new())
            .unwrap_err();
        assert!(matches!(err, ControllerError::MissingPrerequisite { .. }));
    }
}
