//! Analysis-driven invalidation: every model mutation is diffed and the
//! touched artifacts are dropped from the cache, never served stale.

use serde_json::json;

use revpipe_core::container::Payload;
use revpipe_core::description::{PipelineDescription, DEFAULT_PIPELINE};
use revpipe_core::global::TreeGlobal;
use revpipe_core::pipe::AnalysisOptions;
use revpipe_core::registry::{default_globals, default_registry};
use revpipe_core::runner::Runner;
use revpipe_core::target::ContainerToTargetsMap;

fn default_runner(functions: serde_json::Value) -> Runner {
    let description = PipelineDescription::from_yaml(DEFAULT_PIPELINE).unwrap();
    let mut runner = description.build(default_registry(), default_globals()).unwrap();
    *runner.globals_mut().get_as_mut::<TreeGlobal>("model").unwrap().value_mut() =
        json!({ "Functions": functions });
    runner
}

fn request(runner: &Runner, container: &str, raw: &str) -> ContainerToTargetsMap {
    let mut map = ContainerToTargetsMap::new();
    map.add(container, runner.registry().parse_target(raw).unwrap());
    map
}

fn rename_options(address: &str, name: &str) -> AnalysisOptions {
    let mut options = AnalysisOptions::new();
    options.insert("address".to_string(), address.to_string());
    options.insert("name".to_string(), name.to_string());
    options
}

#[test]
fn renaming_a_function_drops_only_its_artifacts() {
    let mut runner = default_runner(json!({
        "0x1000": { "Name": "main" },
        "0x2000": { "Name": "helper" },
    }));
    runner.run("decompile", &request(&runner, "decompiled", "*:function")).unwrap();

    let diffs = runner
        .run_analysis("import", "rename-function", &rename_options("0x1000", "entry_point"))
        .unwrap();
    assert!(!diffs.get("model").unwrap().is_empty());

    let decompiled = runner.step("decompile").unwrap().containers().get("decompiled").unwrap();
    let renamed = runner.registry().parse_target("0x1000:function").unwrap();
    let untouched = runner.registry().parse_target("0x2000:function").unwrap();
    assert!(!decompiled.contains(&renamed), "artifacts of the renamed function must be dropped");
    assert!(decompiled.contains(&untouched), "artifacts of unrelated functions must survive");
}

#[test]
fn whole_binary_artifacts_are_dropped_on_any_model_change() {
    let mut runner = default_runner(json!({ "0x1000": { "Name": "main" } }));
    runner.run("decompile", &request(&runner, "decompiled", "*:function")).unwrap();

    runner
        .run_analysis("import", "rename-function", &rename_options("0x1000", "entry_point"))
        .unwrap();

    // The lifted module is a whole-binary artifact; it depends on the entire
    // model and must be conservatively invalidated.
    let module = runner.step("lift").unwrap().containers().get("module").unwrap();
    assert!(module.is_empty());
}

#[test]
fn rerunning_after_invalidation_reflects_the_new_model() {
    let mut runner = default_runner(json!({ "0x1000": { "Name": "main" } }));
    let goals = request(&runner, "isolated", "0x1000:function");

    let before = runner.run("isolate", &goals).unwrap();
    let target = runner.registry().parse_target("0x1000:function").unwrap();
    let Some(Payload::Text(text)) = before.get("isolated").unwrap().get(&target) else {
        panic!("expected an isolated text payload");
    };
    assert!(text.contains("main"));

    runner
        .run_analysis("import", "rename-function", &rename_options("0x1000", "entry_point"))
        .unwrap();

    let after = runner.run("isolate", &goals).unwrap();
    let Some(Payload::Text(text)) = after.get("isolated").unwrap().get(&target) else {
        panic!("expected an isolated text payload");
    };
    assert!(text.contains("entry_point"), "recomputed artifact must see the new name: {text}");
}

#[test]
fn analysis_that_changes_nothing_invalidates_nothing() {
    let mut runner = default_runner(json!({ "0x1000": { "Name": "main" } }));
    runner.run("decompile", &request(&runner, "decompiled", "*:function")).unwrap();
    let state_before = runner.current_state();

    // Every name is already lowercase; normalization is a no-op.
    let diffs =
        runner.run_analysis("import", "normalize-function-names", &AnalysisOptions::new()).unwrap();
    assert!(diffs.get("model").unwrap().is_empty());
    assert_eq!(runner.current_state(), state_before);
}

#[test]
fn run_all_analyses_reports_the_overall_model_delta() {
    let mut runner = default_runner(json!({
        "0x1000": { "Name": "Main" },
        "0x2000": { "Name": "Helper" },
    }));
    runner.run("decompile", &request(&runner, "decompiled", "*:function")).unwrap();

    let diffs = runner.run_all_analyses().unwrap();
    let model_diff = diffs.get("model").unwrap();
    assert_eq!(model_diff.tree().entries.len(), 2, "both names should be normalized");

    let model = runner.globals().get_as::<TreeGlobal>("model").unwrap();
    assert_eq!(model.value()["Functions"]["0x1000"]["Name"], "main");

    // Everything was renamed, so everything materialized was dropped.
    let decompiled = runner.step("decompile").unwrap().containers().get("decompiled").unwrap();
    assert!(decompiled.is_empty());
}

#[test]
fn unknown_analysis_is_a_configuration_error() {
    let mut runner = default_runner(json!({}));
    let error =
        runner.run_analysis("import", "find-dragons", &AnalysisOptions::new()).unwrap_err();
    assert!(error.to_string().contains("find-dragons"));
}
