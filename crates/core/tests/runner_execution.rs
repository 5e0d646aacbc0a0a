//! End-to-end execution: backward goal deduction, forward production, and
//! the laziness guarantees of the committed cache.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;

use revpipe_core::container::{Container, ContainerSet, Payload, PayloadFormat};
use revpipe_core::global::{GlobalsMap, TreeGlobal};
use revpipe_core::pipes::testing::CountingPipe;
use revpipe_core::registry::{default_globals, default_registry};
use revpipe_core::runner::Runner;
use revpipe_core::step::Step;
use revpipe_core::target::{ContainerToTargetsMap, Target};

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

/// Two-step chain: a source step seeding one whole-binary payload, and a
/// fan-out step copying it into one entry per requested function.
fn counting_runner(
    addresses: &[&str],
) -> (Runner, Arc<std::sync::atomic::AtomicUsize>, Arc<std::sync::atomic::AtomicUsize>) {
    let registry = default_registry();
    let binary = registry.kind("binary").unwrap();
    let function = registry.kind("function").unwrap();

    let (source, source_calls) =
        CountingPipe::source("generate-seed", "seed", binary.clone(), "seed payload");
    let (fan_out, fan_out_calls) =
        CountingPipe::transform("fan-out", "seed", binary, "out", function);

    let mut generate = Step::new("generate", containers());
    generate.add_pipe(Arc::new(source));
    let mut expand = Step::new("expand", containers());
    expand.add_pipe(Arc::new(fan_out));

    let mut runner = Runner::new(registry, model(addresses));
    runner.add_step(generate);
    runner.add_step(expand);
    (runner, source_calls, fan_out_calls)
}

fn function_request(runner: &Runner, container: &str, raw: &str) -> ContainerToTargetsMap {
    let mut request = ContainerToTargetsMap::new();
    request.add(container, runner.registry().parse_target(raw).unwrap());
    request
}

#[test]
fn wildcard_request_produces_every_function() {
    let (mut runner, source_calls, fan_out_calls) = counting_runner(&["0x1000", "0x2000"]);

    let request = function_request(&runner, "out", "*:function");
    let produced = runner.run("expand", &request).unwrap();

    let out = produced.get("out").unwrap();
    assert_eq!(out.len(), 2);
    let target = runner.registry().parse_target("0x1000:function").unwrap();
    assert_eq!(out.get(&target), Some(&Payload::Text("seed payload".to_string())));

    assert_eq!(source_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fan_out_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn response_contains_exactly_the_requested_subset() {
    let (mut runner, _, _) = counting_runner(&["0x1000", "0x2000"]);

    let request = function_request(&runner, "out", "0x1000:function");
    let produced = runner.run("expand", &request).unwrap();

    let out = produced.get("out").unwrap();
    assert_eq!(out.len(), 1);
    let other = runner.registry().parse_target("0x2000:function").unwrap();
    assert!(!out.contains(&other));
}

#[test]
fn second_identical_run_invokes_no_pipes() {
    let (mut runner, source_calls, fan_out_calls) = counting_runner(&["0x1000", "0x2000"]);

    let request = function_request(&runner, "out", "*:function");
    let first = runner.run("expand", &request).unwrap();
    let second = runner.run("expand", &request).unwrap();

    assert_eq!(first.get("out").unwrap().enumerate(), second.get("out").unwrap().enumerate());
    assert_eq!(source_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fan_out_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn incremental_request_recomputes_only_the_missing_target() {
    let (mut runner, source_calls, fan_out_calls) = counting_runner(&["0x1000", "0x2000"]);

    runner.run("expand", &function_request(&runner, "out", "0x1000:function")).unwrap();
    assert_eq!(fan_out_calls.load(Ordering::SeqCst), 1);

    // The widened request only has 0x2000 left to produce; the upstream seed
    // is already committed, so the source pipe is not invoked again.
    let produced = runner.run("expand", &function_request(&runner, "out", "*:function")).unwrap();
    assert_eq!(produced.get("out").unwrap().len(), 2);
    assert_eq!(source_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fan_out_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn upstream_intermediates_can_be_requested_at_a_downstream_step() {
    let (mut runner, source_calls, _) = counting_runner(&["0x1000"]);

    // The seed is produced upstream; requesting it at the downstream step
    // flows it forward through state inheritance.
    let request = function_request(&runner, "seed", ":binary");
    let produced = runner.run("expand", &request).unwrap();

    let binary = runner.registry().kind("binary").unwrap();
    let seed = Target::all(binary);
    assert!(produced.get("seed").unwrap().contains(&seed));
    assert_eq!(source_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn chained_pipes_within_one_step_feed_each_other() {
    let registry = default_registry();
    let binary = registry.kind("binary").unwrap();
    let function = registry.kind("function").unwrap();

    let (source, source_calls) =
        CountingPipe::source("generate-seed", "seed", binary.clone(), "seed payload");
    let (fan_out, fan_out_calls) =
        CountingPipe::transform("fan-out", "seed", binary, "out", function);
    let mut combined = Step::new("combined", containers());
    combined.add_pipe(Arc::new(source));
    combined.add_pipe(Arc::new(fan_out));

    let mut runner = Runner::new(registry, model(&["0x1000"]));
    runner.add_step(combined);

    // The fan-out's seed requirement is satisfied by the pipe declared
    // before it, so the whole request resolves inside the single step.
    let request = function_request(&runner, "out", "0x1000:function");
    let produced = runner.run("combined", &request).unwrap();
    assert_eq!(produced.get("out").unwrap().len(), 1);
    assert_eq!(source_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fan_out_calls.load(Ordering::SeqCst), 1);

    runner.run("combined", &request).unwrap();
    assert_eq!(source_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fan_out_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn default_pipeline_decompiles_functions_from_the_model() {
    use revpipe_core::description::{PipelineDescription, DEFAULT_PIPELINE};

    let description = PipelineDescription::from_yaml(DEFAULT_PIPELINE).unwrap();
    let mut runner = description.build(default_registry(), default_globals()).unwrap();
    *runner.globals_mut().get_as_mut::<TreeGlobal>("model").unwrap().value_mut() =
        json!({ "Functions": { "0x1000": { "Name": "main" } } });

    let request = function_request(&runner, "decompiled", "*:function");
    let produced = runner.run("decompile", &request).unwrap();

    let container = produced.get("decompiled").unwrap();
    let target = runner.registry().parse_target("0x1000:function").unwrap();
    let Some(Payload::Text(text)) = container.get(&target) else {
        panic!("expected a decompiled text payload");
    };
    assert!(text.contains("main"), "decompiled output should mention the function name: {text}");
    assert!(text.contains("void fn_"), "decompiled output should be pseudo-C: {text}");
}

#[test]
fn request_no_step_can_satisfy_is_an_invalid_request() {
    let (mut runner, _, _) = counting_runner(&["0x1000"]);

    // A function target requested in the seed container: no contract produces
    // function-kind entries there and nothing is committed.
    let request = function_request(&runner, "seed", "0x1000:function");
    let error = runner.run("expand", &request).unwrap_err();
    assert!(error.to_string().contains("no step in the chain can satisfy"));
}
