use std::fs;

use anyhow::{Context, Result};

use revpipe_core::global::TreeGlobal;
use serde_json::Value;

use crate::{canonicalize_or_current, open_session, persist_session};

/// Import a model document into the session, invalidating whatever the
/// change makes stale.
///
/// Replacing the model outside an analysis still goes through the same
/// snapshot/diff/invalidate protocol analyses use, so cached artifacts of
/// functions the import touches are recomputed on the next request.
pub fn import_model_command(root: &str, pipeline: Option<&str>, path: &str) -> Result<()> {
    let root = canonicalize_or_current(root)?;
    let mut runner = open_session(&root, pipeline)?;

    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read model file: {path}"))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Model file is not valid JSON: {path}"))?;
    let function_count =
        value.get("Functions").and_then(Value::as_object).map_or(0, |map| map.len());

    let before = runner.globals().clone();
    *runner.globals_mut().get_as_mut::<TreeGlobal>("model")?.value_mut() = value;
    let diffs = before.diff(runner.globals());
    for diff in diffs.values() {
        if diff.is_empty() {
            continue;
        }
        diff.to_invalidation_event().apply(&mut runner)?;
    }

    persist_session(&runner, &root)?;

    println!("Imported model:");
    println!("  File: {path}");
    println!("  Functions: {function_count}");
    println!("  Changed paths: {}", diffs.values().map(|d| d.tree().entries.len()).sum::<usize>());

    Ok(())
}
