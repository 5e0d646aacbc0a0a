//! Structural diffing of Global values and the invalidation protocol built
//! on top of it.
//!
//! A `TreeDiff` is a flat list of path-addressed edits between two JSON
//! trees. `AnyDiff` pairs one with the type tag and name of the Global it was
//! computed from, so it can travel as a self-contained buffer and be applied
//! or dispatched without knowing the concrete model schema.
//!
//! An `InvalidationEvent` turns a diff into the set of stale targets across
//! every step and container of a runner, by asking each registered kind's
//! invalidation predicate. Invalidation is conservative by contract: kinds
//! may over-answer, never under-answer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::runner::Runner;
use crate::target::ContainerToTargetsMap;

/// One edit at a path inside a JSON tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffOp {
    /// The subtree at the path exists only in the new value.
    Add(Value),
    /// The subtree at the path exists only in the old value.
    Remove(Value),
    /// The value at the path changed.
    Change { old: Value, new: Value },
}

/// A path-addressed edit. Paths are sequences of object keys from the root;
/// arrays and scalars are treated as leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: Vec<String>,
    pub op: DiffOp,
}

/// Structural delta between two values of the same Global type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeDiff {
    pub entries: Vec<DiffEntry>,
}

impl TreeDiff {
    /// Compute the structural difference between two JSON trees.
    ///
    /// Uses an explicit worklist rather than recursion, so arbitrarily deep
    /// models cannot exhaust the call stack. Entries come out in a
    /// deterministic order (depth-first, keys sorted by the underlying map).
    pub fn compute(old: &Value, new: &Value) -> TreeDiff {
        let mut entries = Vec::new();
        let mut worklist: Vec<(Vec<String>, &Value, &Value)> = vec![(Vec::new(), old, new)];

        while let Some((path, old_value, new_value)) = worklist.pop() {
            match (old_value, new_value) {
                (Value::Object(old_map), Value::Object(new_map)) => {
                    for (key, old_child) in old_map {
                        let mut child_path = path.clone();
                        child_path.push(key.clone());
                        match new_map.get(key) {
                            Some(new_child) => worklist.push((child_path, old_child, new_child)),
                            None => entries.push(DiffEntry {
                                path: child_path,
                                op: DiffOp::Remove(old_child.clone()),
                            }),
                        }
                    }
                    for (key, new_child) in new_map {
                        if !old_map.contains_key(key) {
                            let mut child_path = path.clone();
                            child_path.push(key.clone());
                            entries.push(DiffEntry {
                                path: child_path,
                                op: DiffOp::Add(new_child.clone()),
                            });
                        }
                    }
                }
                _ => {
                    if old_value != new_value {
                        entries.push(DiffEntry {
                            path,
                            op: DiffOp::Change {
                                old: old_value.clone(),
                                new: new_value.clone(),
                            },
                        });
                    }
                }
            }
        }

        // The worklist pops in LIFO order; sort so the entry order is a
        // stable function of the inputs alone.
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        TreeDiff { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply every edit to `value` in place.
    ///
    /// A path that does not resolve inside `value` means the diff was
    /// computed against a different shape, which is a type mismatch.
    pub fn apply(&self, value: &mut Value) -> EngineResult<()> {
        for entry in &self.entries {
            apply_entry(value, entry)?;
        }
        Ok(())
    }
}

fn apply_entry(root: &mut Value, entry: &DiffEntry) -> EngineResult<()> {
    let (last, parents) = entry.path.split_last().ok_or_else(|| {
        EngineError::TypeMismatch("diff entry with an empty path".to_string())
    })?;

    let mut cursor = root;
    for key in parents {
        cursor = cursor
            .get_mut(key)
            .ok_or_else(|| mismatch(&entry.path, "missing intermediate key"))?;
    }
    let map = cursor
        .as_object_mut()
        .ok_or_else(|| mismatch(&entry.path, "parent is not an object"))?;

    match &entry.op {
        DiffOp::Add(new) => {
            map.insert(last.clone(), new.clone());
        }
        DiffOp::Remove(_) => {
            map.remove(last)
                .ok_or_else(|| mismatch(&entry.path, "removal of an absent key"))?;
        }
        DiffOp::Change { new, .. } => {
            let slot = map
                .get_mut(last)
                .ok_or_else(|| mismatch(&entry.path, "change of an absent key"))?;
            *slot = new.clone();
        }
    }
    Ok(())
}

fn mismatch(path: &[String], detail: &str) -> EngineError {
    EngineError::TypeMismatch(format!(
        "diff does not fit the value it is applied to at '{}': {detail}",
        path.join("/")
    ))
}

/// Type-erased diff: a `TreeDiff` tagged with the Global it belongs to.
///
/// The tag pair (global name, type tag) lets the runner dispatch invalidation
/// without depending on the concrete model type, and lets `apply_diff` reject
/// a diff aimed at the wrong Global with a typed error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyDiff {
    global_name: String,
    type_tag: String,
    diff: TreeDiff,
}

impl AnyDiff {
    pub fn new(global_name: impl Into<String>, type_tag: impl Into<String>, diff: TreeDiff) -> Self {
        Self { global_name: global_name.into(), type_tag: type_tag.into(), diff }
    }

    pub fn global_name(&self) -> &str {
        &self.global_name
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn tree(&self) -> &TreeDiff {
        &self.diff
    }

    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }

    /// Serialize into a self-contained buffer loadable in another process.
    pub fn serialize(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn deserialize(text: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Materialize the invalidation event for this diff.
    pub fn to_invalidation_event(&self) -> InvalidationEvent {
        InvalidationEvent { diff: self.clone() }
    }
}

/// Diffs produced by one analysis run, keyed by Global name.
pub type DiffMap = BTreeMap<String, AnyDiff>;

/// Stale targets per step, as computed by an invalidation event.
pub type InvalidationMap = BTreeMap<String, ContainerToTargetsMap>;

/// The mechanism turning a diff into the set of stale targets across every
/// step of a runner, and removing them.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    diff: AnyDiff,
}

impl InvalidationEvent {
    pub fn diff(&self) -> &AnyDiff {
        &self.diff
    }

    /// For every step, for every container, for every registered kind, ask
    /// the kind which currently materialized targets the wrapped diff
    /// invalidates.
    ///
    /// Deliberately exhaustive: every kind is consulted for every container,
    /// not only for declared kind/container pairings. Extra checks are cheap;
    /// under-invalidation is unsound.
    pub fn invalidations(&self, runner: &Runner) -> InvalidationMap {
        let mut map = InvalidationMap::new();
        for step in runner.steps() {
            let step_invalidations = map.entry(step.name().to_string()).or_default();
            for container in step.containers().iter() {
                for kind in runner.kinds() {
                    for target in container.enumerate() {
                        if target.kind() != kind {
                            continue;
                        }
                        if kind.is_invalidated(&target, &self.diff) {
                            step_invalidations.add(container.name(), target);
                        }
                    }
                }
            }
        }
        map
    }

    /// Compute and apply the invalidation to the runner's committed state.
    pub fn apply(&self, runner: &mut Runner) -> EngineResult<()> {
        let map = self.invalidations(runner);
        runner.invalidate(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_values_yield_empty_diff() {
        let value = json!({"Functions": {"0x1000": {"Name": "foo"}}});
        assert!(TreeDiff::compute(&value, &value).is_empty());
    }

    #[test]
    fn changed_leaf_is_reported_with_full_path() {
        let old = json!({"Functions": {"0x1000": {"Name": "foo"}}});
        let new = json!({"Functions": {"0x1000": {"Name": "bar"}}});
        let diff = TreeDiff::compute(&old, &new);
        assert_eq!(diff.entries.len(), 1);
        assert_eq!(diff.entries[0].path, vec!["Functions", "0x1000", "Name"]);
        assert_eq!(
            diff.entries[0].op,
            DiffOp::Change { old: json!("foo"), new: json!("bar") }
        );
    }

    #[test]
    fn added_and_removed_subtrees_are_single_entries() {
        let old = json!({"Functions": {"0x1000": {"Name": "foo"}}});
        let new = json!({"Functions": {"0x2000": {"Name": "baz"}}});
        let diff = TreeDiff::compute(&old, &new);
        assert_eq!(diff.entries.len(), 2);
        assert!(matches!(diff.entries[0].op, DiffOp::Remove(_)));
        assert!(matches!(diff.entries[1].op, DiffOp::Add(_)));
    }

    #[test]
    fn applying_a_diff_reproduces_the_new_value() {
        let old = json!({"Functions": {"0x1000": {"Name": "foo", "Size": 12}}});
        let new = json!({"Functions": {"0x1000": {"Name": "bar"}, "0x2000": {"Name": "baz"}}});
        let diff = TreeDiff::compute(&old, &new);
        let mut patched = old.clone();
        diff.apply(&mut patched).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn applying_to_the_wrong_shape_is_a_type_mismatch() {
        let old = json!({"Functions": {"0x1000": {"Name": "foo"}}});
        let new = json!({"Functions": {"0x1000": {"Name": "bar"}}});
        let diff = TreeDiff::compute(&old, &new);
        let mut wrong = json!({"Segments": {}});
        let error = diff.apply(&mut wrong).unwrap_err();
        assert!(matches!(error, EngineError::TypeMismatch(_)));
    }

    #[test]
    fn deep_trees_do_not_overflow_the_stack() {
        // The diff computation is worklist-based and depth-insensitive, but
        // `Value` drops recursively, so tearing down a 20k-level tree needs
        // more stack than the test runner's default thread provides.
        std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(|| {
                let mut old = json!("leaf");
                let mut new = json!("other");
                for level in 0..20_000 {
                    let key = format!("k{level}");
                    let mut wrapper = serde_json::Map::new();
                    wrapper.insert(key.clone(), old);
                    old = Value::Object(wrapper);
                    let mut wrapper = serde_json::Map::new();
                    wrapper.insert(key, new);
                    new = Value::Object(wrapper);
                }
                let diff = TreeDiff::compute(&old, &new);
                assert_eq!(diff.entries.len(), 1);
                assert_eq!(diff.entries[0].path.len(), 20_000);
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[test]
    fn any_diff_round_trips_through_serialization() {
        let old = json!({"Functions": {"0x1000": {"Name": "foo"}}});
        let new = json!({"Functions": {"0x1000": {"Name": "bar"}}});
        let diff = AnyDiff::new("model", "tree", TreeDiff::compute(&old, &new));
        let text = diff.serialize().unwrap();
        assert_eq!(AnyDiff::deserialize(&text).unwrap(), diff);
    }
}
