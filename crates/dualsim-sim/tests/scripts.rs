//! Every bundled scenario script must pass.

use std::path::{Path, PathBuf};

use dualsim_common::SlotId;
use dualsim_common::recovery::RecoveryAction;
use dualsim_sim::scenario::ScenarioScript;

fn scenario_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios")
}

fn load(name: &str) -> ScenarioScript {
    ScenarioScript::load(&scenario_dir().join(name)).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ─── Bundled scripts ─────────────────────────────────────────────────────

#[test]
fn all_bundled_scenarios_pass() {
    init_tracing();
    let mut paths: Vec<PathBuf> = std::fs::read_dir(scenario_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();
    assert!(paths.len() >= 6, "found {paths:?}");

    for path in paths {
        let script = ScenarioScript::load(&path).unwrap();
        if let Err(e) = script.run() {
            panic!("{}: {e:#}", path.display());
        }
    }
}

#[test]
fn auto_switch_report_ends_on_primary() {
    init_tracing();
    let report = load("auto_switch.toml").run().unwrap();
    assert_eq!(report.preferred.preferred_slot, Some(SlotId(0)));
    assert!(report.preferred_changes >= 2);
    assert_eq!(report.elapsed_ms, 1_000);
}

#[test]
fn exhausted_ladder_report_lists_every_rung() {
    init_tracing();
    let report = load("exhausted_ladder.toml").run().unwrap();
    let mut expected = RecoveryAction::LADDER.to_vec();
    expected.push(RecoveryAction::GetDataCallList);
    assert_eq!(report.executed, expected);
}

// ─── Failure reporting ───────────────────────────────────────────────────

#[test]
fn broken_expectation_points_at_its_step() {
    init_tracing();
    let mut script = load("emergency_override.toml");
    // Same device, but expect the first override to be refused.
    let text = r#"
        name = "flipped"
        [[step]]
        op = "emergency_override"
        slot = 1
        expect = false
    "#;
    script.steps = ScenarioScript::from_toml_str(text).unwrap().steps;
    let err = format!("{:#}", script.run().unwrap_err());
    assert!(err.contains("step 1 (emergency_override)"), "{err}");
    assert!(err.contains("override completed true, expected false"), "{err}");
}

#[test]
fn missing_script_is_an_error() {
    let err = ScenarioScript::load(&scenario_dir().join("nope.toml")).unwrap_err();
    assert!(format!("{err:#}").contains("nope.toml"));
}
