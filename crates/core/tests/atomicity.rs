//! Failure atomicity: a failed run or analysis leaves the runner in a state
//! observably identical to the state before the call.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;

use revpipe_core::container::{Container, ContainerSet, PayloadFormat};
use revpipe_core::error::{EngineError, EngineResult};
use revpipe_core::global::{GlobalsMap, TreeGlobal};
use revpipe_core::pipe::{Analysis, AnalysisOptions};
use revpipe_core::pipes::testing::{CountingPipe, FailingPipe};
use revpipe_core::registry::default_registry;
use revpipe_core::runner::Runner;
use revpipe_core::step::Step;
use revpipe_core::target::ContainerToTargetsMap;

fn model(addresses: &[&str]) -> GlobalsMap {
    let mut functions = serde_json::Map::new();
    for address in addresses {
        functions.insert(address.to_string(), json!({ "Name": format!("fn_{address}") }));
    }
    let mut globals = GlobalsMap::new();
    globals.insert("model", Box::new(TreeGlobal::new(json!({ "Functions": functions }))));
    globals
}

fn containers() -> ContainerSet {
    let mut set = ContainerSet::new();
    set.add(Container::new("seed", PayloadFormat::Text, &["binary"]));
    set.add(Container::new("out", PayloadFormat::Text, &["function"]));
    set
}

#[test]
fn failed_run_commits_nothing_anywhere_in_the_chain() {
    let registry = default_registry();
    let binary = registry.kind("binary").unwrap();
    let function = registry.kind("function").unwrap();

    let (source, source_calls) =
        CountingPipe::source("generate-seed", "seed", binary, "seed payload");
    let mut generate = Step::new("generate", containers());
    generate.add_pipe(Arc::new(source));
    let mut broken = Step::new("broken", containers());
    broken.add_pipe(Arc::new(FailingPipe::new("out", function)));

    let mut runner = Runner::new(registry, model(&["0x1000"]));
    runner.add_step(generate);
    runner.add_step(broken);
    let state_before = runner.current_state();

    // Request both the seed and the output so the upstream step runs (and
    // stages real work) before the failing pipe aborts the transaction.
    let mut request = ContainerToTargetsMap::new();
    request.add("seed", runner.registry().parse_target(":binary").unwrap());
    request.add("out", runner.registry().parse_target("0x1000:function").unwrap());
    let error = runner.run("broken", &request).unwrap_err();
    assert!(matches!(error, EngineError::PipeExecution { .. }));

    // The upstream pipe did execute, but its staged output was discarded
    // along with everything else.
    assert_eq!(source_calls.load(Ordering::SeqCst), 1);
    assert_eq!(runner.current_state(), state_before);
    assert!(runner.step("generate").unwrap().containers().get("seed").unwrap().is_empty());
}

#[test]
fn unknown_step_fails_before_touching_anything() {
    let registry = default_registry();
    let binary = registry.kind("binary").unwrap();
    let (source, source_calls) =
        CountingPipe::source("generate-seed", "seed", binary, "seed payload");
    let mut generate = Step::new("generate", containers());
    generate.add_pipe(Arc::new(source));

    let mut runner = Runner::new(registry, model(&["0x1000"]));
    runner.add_step(generate);

    let mut request = ContainerToTargetsMap::new();
    request.add("seed", runner.registry().parse_target(":binary").unwrap());
    let error = runner.run("linker", &request).unwrap_err();
    assert!(error.to_string().contains("linker"));
    assert_eq!(source_calls.load(Ordering::SeqCst), 0);
}

/// Mutates the model, then fails.
struct SabotagedAnalysis;

impl Analysis for SabotagedAnalysis {
    fn name(&self) -> &str {
        "sabotaged"
    }

    fn run(
        &self,
        _options: &AnalysisOptions,
        _containers: &ContainerSet,
        globals: &mut GlobalsMap,
    ) -> EngineResult<()> {
        let model = globals.get_as_mut::<TreeGlobal>("model")?;
        model.value_mut()["Functions"] = json!({});
        Err(EngineError::InvalidRequest("midway failure".to_string()))
    }
}

#[test]
fn failed_analysis_restores_the_globals_snapshot() {
    let registry = default_registry();
    let mut step = Step::new("import", containers());
    step.add_analysis(Arc::new(SabotagedAnalysis));

    let mut runner = Runner::new(registry, model(&["0x1000", "0x2000"]));
    runner.add_step(step);
    let model_before =
        runner.globals().get_as::<TreeGlobal>("model").unwrap().value().clone();

    let error = runner.run_analysis("import", "sabotaged", &AnalysisOptions::new()).unwrap_err();
    assert!(error.to_string().contains("midway failure"));

    let model_after = runner.globals().get_as::<TreeGlobal>("model").unwrap().value();
    assert_eq!(*model_after, model_before, "partial mutations must be rolled back");
}

#[test]
fn failed_batch_of_analyses_restores_the_globals_snapshot() {
    use revpipe_core::pipes::NormalizeFunctionNamesAnalysis;

    let registry = default_registry();
    let mut first = Step::new("import", containers());
    first.add_analysis(Arc::new(NormalizeFunctionNamesAnalysis::new("model")));
    let mut second = Step::new("curate", containers());
    second.add_analysis(Arc::new(SabotagedAnalysis));

    let mut globals = GlobalsMap::new();
    globals.insert(
        "model",
        Box::new(TreeGlobal::new(json!({ "Functions": { "0x1000": { "Name": "Main" } } }))),
    );
    let mut runner = Runner::new(registry, globals);
    runner.add_step(first);
    runner.add_step(second);
    let model_before = runner.globals().get_as::<TreeGlobal>("model").unwrap().value().clone();

    let error = runner.run_all_analyses().unwrap_err();
    assert!(error.to_string().contains("midway failure"));

    // The normalization did run, but the whole batch rolls back together.
    let model_after = runner.globals().get_as::<TreeGlobal>("model").unwrap().value();
    assert_eq!(*model_after, model_before);
}
