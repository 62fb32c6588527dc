//! End-to-end pipeline scenarios over stubbed external tools: the
//! delineation state machine, singleton cache behavior, readonly runs,
//! and preflight advancement across a full run.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use wepprun::batch::{Batch, BatchRunner, BatchTemplate, PipelineFn};
use wepprun::config::{RunConfig, SoilsMode};
use wepprun::executor::{JobContext, JobError, JobPool};
use wepprun::controllers::{
    Channel, Climate, ClimateSpatialMode, ControllerError, DelineationBackend, DelineationState,
    Landuse, Outlet, Ron, Soils, Station, Subcatchment, Watershed, Wepp, WeppPost,
};
use wepprun::kv::MemoryKv;
use wepprun::nodb::{Nodb, NodbBase, NodbError, Platform, Registry};
use wepprun::preflight::{self, PreflightInputs, Stage};
use wepprun::process::{CommandOutcome, CommandSpec, ToolError, ToolRunner};
use wepprun::trigger::TriggerBus;

/// Two channels draining three hillslopes, enough for every id-mapping
/// edge case (hillslopes 21/22/31, channels 24/34).
struct StubBackend;

impl DelineationBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn delineate_channels(
        &self,
        _tools: &dyn ToolRunner,
        _wd: &Path,
        _csa: f64,
        _mcl: f64,
    ) -> Result<Vec<Channel>, ControllerError> {
        Ok(vec![
            Channel {
                topaz_id: 24,
                length_m: 410.0,
                order: 1,
                lon: -116.10,
                lat: 45.20,
            },
            Channel {
                topaz_id: 34,
                length_m: 220.0,
                order: 1,
                lon: -116.30,
                lat: 45.40,
            },
        ])
    }

    fn delineate_subcatchments(
        &self,
        _tools: &dyn ToolRunner,
        _wd: &Path,
        _outlet: &Outlet,
    ) -> Result<Vec<Subcatchment>, ControllerError> {
        Ok(vec![
            Subcatchment {
                topaz_id: 21,
                area_ha: 12.5,
                slope: 0.21,
                lon: -116.11,
                lat: 45.21,
                channel_id: 24,
            },
            Subcatchment {
                topaz_id: 22,
                area_ha: 8.0,
                slope: 0.15,
                lon: -116.12,
                lat: 45.22,
                channel_id: 24,
            },
            Subcatchment {
                topaz_id: 31,
                area_ha: 6.2,
                slope: 0.30,
                lon: -116.31,
                lat: 45.41,
                channel_id: 34,
            },
        ])
    }
}

/// Stub CLIGEN/WEPP: fabricates the artifact each invocation is expected
/// to leave behind.
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

fn registry() -> (Arc<Registry>, TempDir) {
    let root = TempDir::new().unwrap();
    let platform = Platform::new(Arc::new(MemoryKv::new()), Arc::new(FakeTools));
    (Arc::new(Registry::new(platform, root.path())), root)
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

fn preflight_report(registry: &Registry, runid: &str) -> preflight::PreflightReport {
    preflight::check(&PreflightInputs::from_prep(
        &registry.platform().prep,
        runid,
        false,
        false,
    ))
}

fn create_watershed(registry: &Registry, runid: &str) -> Nodb<Watershed> {
    let wd = registry.wd_for(runid);
    registry
        .create_at(
            &wd,
            runid,
            Watershed::new(NodbBase::new(&wd, runid, "default"), 4.0, 60.0),
        )
        .unwrap()
}

#[test]
fn test_full_pipeline_advances_preflight_without_regressions() {
    let (registry, _root) = registry();
    let runid = "little-salmon";
    let wd = registry.wd_for(runid);
    let bus = TriggerBus::new();
    Ron::initialize(&registry, &bus, runid, RunConfig::default()).unwrap();

    // Fresh run: only channel delineation may start.
    let report = preflight_report(&registry, runid);
    assert!(report.is_ready(Stage::Channels));
    for stage in [Stage::Landuse, Stage::Soils, Stage::Climate, Stage::Wepp] {
        assert!(!report.is_ready(stage));
    }

    let mut ready_so_far: Vec<Stage> = Vec::new();
    let mut assert_advances = |registry: &Registry, just_finished: &str| {
        let report = preflight_report(registry, runid);
        for stage in &ready_so_far {
            assert!(
                report.is_ready(*stage),
                "{stage:?} regressed after {just_finished}"
            );
        }
        ready_so_far = Stage::all()
            .iter()
            .copied()
            .filter(|s| report.is_ready(*s))
            .collect();
    };

    let w = create_watershed(&registry, runid);
    w.build_channels(&registry, &StubBackend).unwrap();
    assert_advances(&registry, "build_channels");
    w.set_outlet(&registry, -116.11, 45.19).unwrap();
    w.build_subcatchments(&registry, &StubBackend).unwrap();
    w.abstract_watershed(&registry).unwrap();
    assert_advances(&registry, "abstract_watershed");
    assert!(preflight_report(&registry, runid).is_ready(Stage::Landuse));
    assert!(!preflight_report(&registry, runid).is_ready(Stage::Soils));

    let lu = registry
        .create_at(&wd, runid, Landuse::new(NodbBase::new(&wd, runid, "default"), None))
        .unwrap();
    lu.build(&registry, &bus).unwrap();
    assert_advances(&registry, "build_landuse");
    assert!(preflight_report(&registry, runid).is_ready(Stage::Soils));

    let soils = registry
        .create_at(
            &wd,
            runid,
            Soils::new(NodbBase::new(&wd, runid, "default"), SoilsMode::Gridded, "7778.0"),
        )
        .unwrap();
    soils.build(&registry, &bus).unwrap();
    assert_advances(&registry, "build_soils");

    let climate = registry
        .create_at(&wd, runid, Climate::new(NodbBase::new(&wd, runid, "default"), 100))
        .unwrap();
    climate.set_spatial_mode(ClimateSpatialMode::Multiple).unwrap();
    climate.find_station(&[station()], (-116.1, 45.2), None).unwrap();
    climate.build(&registry, &bus, "cligen", 2000).unwrap();
    assert_advances(&registry, "build_climate");
    assert!(preflight_report(&registry, runid).is_ready(Stage::Wepp));

    let wepp = registry
        .create_at(
            &wd,
            runid,
            Wepp::new(NodbBase::new(&wd, runid, "default"), &RunConfig::default().wepp),
        )
        .unwrap();
    wepp.prep_hillslopes(&registry, &bus).unwrap();
    wepp.run_hillslopes(&registry).unwrap();
    wepp.prep_watershed(&registry, &bus).unwrap();
    wepp.run_watershed(&registry, &bus).unwrap();
    assert_advances(&registry, "run_wepp");

    // Post-processing consumes the per-hillslope pass files.
    let post = registry
        .create_at(&wd, runid, WeppPost::new(NodbBase::new(&wd, runid, "default")))
        .unwrap();
    let totals = post.run(&registry).unwrap();
    assert_eq!(post.read(|p| p.hillslopes.len()), 3);
    assert!(totals.runoff_mm >= 0.0);
}

#[test]
fn test_delineation_state_machine_rejects_skips() {
    let (registry, _root) = registry();
    let w = create_watershed(&registry, "r1");
    assert_eq!(w.read(|s| s.delineation), DelineationState::NoChannels);

    assert!(matches!(
        w.set_outlet(&registry, -116.0, 45.0).unwrap_err(),
        ControllerError::InvalidTransition { .. }
    ));
    assert!(matches!(
        w.build_subcatchments(&registry, &StubBackend).unwrap_err(),
        ControllerError::InvalidTransition { .. }
    ));
    assert!(matches!(
        w.abstract_watershed(&registry).unwrap_err(),
        ControllerError::InvalidTransition { .. }
    ));

    w.build_channels(&registry, &StubBackend).unwrap();
    assert!(matches!(
        w.abstract_watershed(&registry).unwrap_err(),
        ControllerError::InvalidTransition {
            from: "has_channels",
            ..
        }
    ));
}

#[test]
fn test_external_rewrite_refreshes_the_singleton() {
    let (registry, _root) = registry();
    let wd = registry.wd_for("r1");
    let c = registry
        .create_at(&wd, "r1", Climate::new(NodbBase::new(&wd, "r1", "default"), 100))
        .unwrap();
    assert_eq!(c.read(|s| s.sim_years), 100);

    // Another process rewrites the document and advances the mtime.
    std::thread::sleep(Duration::from_millis(20));
    let path = wd.join("climate.nodb");
    let raw = std::fs::read_to_string(&path)
        .unwrap()
        .replace("\"sim_years\": 100", "\"sim_years\": 31415");
    std::fs::write(&path, raw).unwrap();

    let fresh = registry.get_instance::<Climate>("r1", false).unwrap();
    assert_eq!(fresh.read(|s| s.sim_years), 31415);
    // The refreshed instance now owns the singleton slot.
    let again = registry.get_instance::<Climate>("r1", false).unwrap();
    assert_eq!(again.read(|s| s.sim_years), 31415);
}

#[test]
fn test_readonly_run_refuses_writes_and_cache() {
    let (registry, _root) = registry();
    let wd = registry.wd_for("r1");
    registry
        .create_at(&wd, "r1", Climate::new(NodbBase::new(&wd, "r1", "default"), 100))
        .unwrap();
    registry.cleanup_run_instances("r1");
    std::fs::write(wd.join("READONLY"), "").unwrap();

    let c = registry.get_instance::<Climate>("r1", false).unwrap();
    assert!(c.is_readonly());
    assert_eq!(registry.cached_instances(), 0);
    assert!(matches!(
        c.lock().unwrap_err(),
        NodbError::ReadonlyViolation { .. }
    ));
    assert!(matches!(
        c.set_spatial_mode(ClimateSpatialMode::Multiple).unwrap_err(),
        ControllerError::Nodb(NodbError::ReadonlyViolation { .. })
    ));
}

/// Drives a run through delineation, landuse, soils, and climate, and
/// creates the Wepp controller, leaving it ready for `prep_hillslopes`.
fn prepare_template(registry: &Registry, runid: &str) {
    let wd = registry.wd_for(runid);
    let bus = TriggerBus::new();
    Ron::initialize(registry, &bus, runid, RunConfig::default()).unwrap();

    let w = create_watershed(registry, runid);
    w.build_channels(registry, &StubBackend).unwrap();
    w.set_outlet(registry, -116.1, 45.2).unwrap();
    w.build_subcatchments(registry, &StubBackend).unwrap();
    w.abstract_watershed(registry).unwrap();

    registry
        .create_at(&wd, runid, Landuse::new(NodbBase::new(&wd, runid, "default"), None))
        .unwrap()
        .build(registry, &bus)
        .unwrap();
    registry
        .create_at(
            &wd,
            runid,
            Soils::new(NodbBase::new(&wd, runid, "default"), SoilsMode::Gridded, "7778.0"),
        )
        .unwrap()
        .build(registry, &bus)
        .unwrap();
    let climate = registry
        .create_at(&wd, runid, Climate::new(NodbBase::new(&wd, runid, "default"), 100))
        .unwrap();
    climate.set_spatial_mode(ClimateSpatialMode::Multiple).unwrap();
    climate.find_station(&[station()], (-116.1, 45.2), None).unwrap();
    climate.build(registry, &bus, "cligen", 2000).unwrap();

    registry
        .create_at(
            &wd,
            runid,
            Wepp::new(NodbBase::new(&wd, runid, "default"), &RunConfig::default().wepp),
        )
        .unwrap();
    registry.cleanup_run_instances(runid);
}

#[tokio::test]
async fn test_wepp_runs_inside_a_batch_clone() {
    let (registry, root) = registry();
    prepare_template(&registry, "template");

    let geojson_path = root.path().join("huc.geojson");
    std::fs::write(
        &geojson_path,
        serde_json::to_vec(&serde_json::json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"NAME": "clone-a"},
                "geometry": null
            }]
        }))
        .unwrap(),
    )
    .unwrap();

    let mut template = BatchTemplate::new("{NAME}");
    template.validate(&geojson_path).unwrap();
    let batch = Batch {
        name: "clones".to_string(),
        geojson: geojson_path,
        template,
        template_dir: registry.wd_for("template"),
    };
    let pool = Arc::new(JobPool::new(Arc::clone(&registry), 2));
    let runner = BatchRunner::new(Arc::clone(&registry), pool);

    // The child pipeline preps and runs WEPP hillslopes against the
    // clone's rehomed controllers and symlinked inputs.
    let pipeline: PipelineFn = Arc::new(|ctx: &JobContext| {
        let wepp = ctx
            .registry
            .get_instance::<Wepp>(&ctx.runid, false)
            .map_err(JobError::failed)?;
        let bus = TriggerBus::new();
        wepp.prep_hillslopes(&ctx.registry, &bus)
            .map_err(JobError::failed)?;
        wepp.run_hillslopes(&ctx.registry).map_err(JobError::failed)
    });
    let handles = runner.enqueue(&batch, pipeline).unwrap();
    assert!(handles.completion.wait().await.is_success());
    for child in &handles.children {
        assert!(child.status().is_success(), "{:?}", child.take_error());
    }

    // Run files and outputs landed inside the clone, not the template.
    let child_wd = registry.wd_for("clone-a");
    assert!(child_wd.join("wepp/runs/p1.run").exists());
    assert!(child_wd.join("wepp/output/H1.pass.json").exists());
    assert!(!registry
        .wd_for("template")
        .join("wepp/runs/p1.run")
        .exists());
}

#[test]
fn test_persisted_state_round_trips_observationally() {
    let (registry, _root) = registry();
    let w = create_watershed(&registry, "r1");
    w.build_channels(&registry, &StubBackend).unwrap();
    w.set_outlet(&registry, -116.1, 45.2).unwrap();
    w.build_subcatchments(&registry, &StubBackend).unwrap();
    w.abstract_watershed(&registry).unwrap();
    let before = w.read(|s| serde_json::to_value(s).unwrap());

    // Evict the cache so the next lookup rehydrates from disk.
    registry.cleanup_run_instances("r1");
    assert_eq!(registry.cached_instances(), 0);
    let rehydrated = registry.get_instance::<Watershed>("r1", false).unwrap();
    let after = rehydrated.read(|s| serde_json::to_value(s).unwrap());
    assert_eq!(before, after);
    assert_eq!(
        rehydrated.read(|s| s.delineation),
        DelineationState::Abstracted
    );
    // The rehydrated controller still produces the frozen id mapping.
    let translator = rehydrated.translator_factory().unwrap();
    assert_eq!(translator.n_hillslopes(), 3);
}
