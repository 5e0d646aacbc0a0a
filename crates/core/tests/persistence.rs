//! Session persistence: a stored runner reloads into an equivalent session,
//! and the reloaded cache is trusted without recomputation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use revpipe_core::container::{Container, ContainerSet, PayloadFormat};
use revpipe_core::description::{PipelineDescription, DEFAULT_PIPELINE};
use revpipe_core::global::{GlobalsMap, TreeGlobal};
use revpipe_core::pipes::testing::CountingPipe;
use revpipe_core::registry::{default_globals, default_registry};
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

fn counting_runner(
    addresses: &[&str],
) -> (Runner, Arc<std::sync::atomic::AtomicUsize>, Arc<std::sync::atomic::AtomicUsize>) {
    let registry = default_registry();
    let binary = registry.kind("binary").unwrap();
    let function = registry.kind("function").unwrap();

    let mut set = ContainerSet::new();
    set.add(Container::new("seed", PayloadFormat::Text, &["binary"]));
    set.add(Container::new("out", PayloadFormat::Text, &["function"]));

    let (source, source_calls) =
        CountingPipe::source("generate-seed", "seed", binary.clone(), "seed payload");
    let (fan_out, fan_out_calls) =
        CountingPipe::transform("fan-out", "seed", binary, "out", function);

    let mut generate = Step::new("generate", set.clone());
    generate.add_pipe(Arc::new(source));
    let mut expand = Step::new("expand", set);
    expand.add_pipe(Arc::new(fan_out));

    let mut runner = Runner::new(registry, model(addresses));
    runner.add_step(generate);
    runner.add_step(expand);
    (runner, source_calls, fan_out_calls)
}

fn wildcard_request(runner: &Runner) -> ContainerToTargetsMap {
    let mut request = ContainerToTargetsMap::new();
    request.add("out", runner.registry().parse_target("*:function").unwrap());
    request
}

#[test]
fn reloaded_session_serves_from_the_persisted_cache() {
    let dir = tempdir().unwrap();

    let (mut first, _, _) = counting_runner(&["0x1000", "0x2000"]);
    first.run("expand", &wildcard_request(&first)).unwrap();
    first.store_to_disk(dir.path()).unwrap();
    let state = first.current_state();

    let (mut second, source_calls, fan_out_calls) = counting_runner(&["0x1000", "0x2000"]);
    second.load_from_disk(dir.path()).unwrap();
    assert_eq!(second.current_state(), state);

    // Everything requested is already materialized; no pipe runs.
    let produced = second.run("expand", &wildcard_request(&second)).unwrap();
    assert_eq!(produced.get("out").unwrap().len(), 2);
    assert_eq!(source_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fan_out_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn globals_round_trip_through_the_session_directory() {
    let dir = tempdir().unwrap();

    let (first, _, _) = counting_runner(&["0x1000"]);
    first.store_to_disk(dir.path()).unwrap();

    let (mut second, _, _) = counting_runner(&[]);
    second.load_from_disk(dir.path()).unwrap();
    let model = second.globals().get_as::<TreeGlobal>("model").unwrap();
    assert_eq!(model.value()["Functions"]["0x1000"]["Name"], "fn_0x1000");
}

#[test]
fn loading_an_empty_directory_yields_a_fresh_session() {
    let dir = tempdir().unwrap();

    let (mut runner, _, _) = counting_runner(&["0x1000"]);
    runner.run("expand", &wildcard_request(&runner)).unwrap();
    runner.load_from_disk(dir.path()).unwrap();

    for (_, held) in runner.current_state() {
        assert!(held.is_empty());
    }
}

#[test]
fn default_pipeline_state_survives_a_store_load_cycle() {
    let dir = tempdir().unwrap();
    let description = PipelineDescription::from_yaml(DEFAULT_PIPELINE).unwrap();

    let mut first = description.build(default_registry(), default_globals()).unwrap();
    *first.globals_mut().get_as_mut::<TreeGlobal>("model").unwrap().value_mut() =
        json!({ "Functions": { "0x1000": { "Name": "main" } } });
    let mut request = ContainerToTargetsMap::new();
    request.add("decompiled", first.registry().parse_target("*:function").unwrap());
    first.run("decompile", &request).unwrap();
    first.store_to_disk(dir.path()).unwrap();

    let mut second = description.build(default_registry(), default_globals()).unwrap();
    second.load_from_disk(dir.path()).unwrap();
    assert_eq!(second.current_state(), first.current_state());

    let target = second.registry().parse_target("0x1000:function").unwrap();
    let decompiled = second.step("decompile").unwrap().containers().get("decompiled").unwrap();
    assert!(decompiled.contains(&target));
}
