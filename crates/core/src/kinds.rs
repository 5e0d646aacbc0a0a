//! Builtin kinds.
//!
//! `TreeKind` addresses artifacts whose enumerable domain lives under a path
//! prefix inside a tree Global (one entry per key, e.g. one per function
//! address under `Functions`). `SingletonKind` addresses whole-binary
//! artifacts with a fixed path.
//!
//! Externally-pluggable kinds implement the `Kind` trait directly and are
//! registered alongside these.

use std::sync::Arc;

use serde_json::Value;

use crate::diff::AnyDiff;
use crate::error::{EngineError, EngineResult};
use crate::global::{GlobalsMap, TreeGlobal};
use crate::target::{Kind, PathComponent, Rank, Target};

/// Artifact category whose concrete targets mirror the children of a subtree
/// of a Global.
///
/// A target component at position `i` corresponds to the key at depth
/// `prefix.len() + i` inside the Global's tree. Wildcard expansion enumerates
/// those keys; invalidation fires for any diff entry touching the addressed
/// subtree.
pub struct TreeKind {
    name: String,
    rank: Arc<Rank>,
    global_name: String,
    prefix: Vec<String>,
}

impl TreeKind {
    pub fn new(
        name: impl Into<String>,
        rank: &Arc<Rank>,
        global_name: impl Into<String>,
        prefix: &[&str],
    ) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "kind name must not be empty");
        Self {
            name,
            rank: Arc::clone(rank),
            global_name: global_name.into(),
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn domain<'a>(&self, globals: &'a GlobalsMap) -> EngineResult<&'a Value> {
        let tree = globals.get_as::<TreeGlobal>(&self.global_name)?;
        let mut cursor = tree.value();
        for key in &self.prefix {
            cursor = cursor.get(key).ok_or_else(|| {
                EngineError::InvalidRequest(format!(
                    "global '{}' has no '{}' subtree to enumerate kind '{}'",
                    self.global_name,
                    self.prefix.join("/"),
                    self.name
                ))
            })?;
        }
        Ok(cursor)
    }
}

impl Kind for TreeKind {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> &Arc<Rank> {
        &self.rank
    }

    fn expand(&self, target: &Target, globals: &GlobalsMap) -> EngineResult<Vec<Target>> {
        if target.is_concrete() {
            return Ok(vec![target.clone()]);
        }

        let domain = self.domain(globals)?;

        // Resolve components left to right, fanning out at each wildcard.
        // serde_json objects iterate in key order, so expansion order is
        // stable absent intervening model mutations.
        let mut partial: Vec<(Vec<PathComponent>, &Value)> = vec![(Vec::new(), domain)];
        for component in target.components() {
            let mut next = Vec::new();
            for (chosen, cursor) in partial {
                match component {
                    PathComponent::Exact(key) => {
                        if let Some(child) = cursor.get(key) {
                            let mut chosen = chosen.clone();
                            chosen.push(component.clone());
                            next.push((chosen, child));
                        }
                    }
                    PathComponent::All => {
                        if let Some(map) = cursor.as_object() {
                            for (key, child) in map {
                                let mut chosen = chosen.clone();
                                chosen.push(PathComponent::Exact(key.clone()));
                                next.push((chosen, child));
                            }
                        }
                    }
                }
            }
            partial = next;
        }

        partial
            .into_iter()
            .map(|(components, _)| Target::new(target.kind().clone(), components))
            .collect()
    }

    fn is_invalidated(&self, target: &Target, diff: &AnyDiff) -> bool {
        if diff.global_name() != self.global_name {
            return false;
        }
        diff.tree().entries.iter().any(|entry| {
            // Compare the entry path against prefix + target components, up
            // to whichever is shorter: a diff above the target subtree (e.g.
            // the whole `Functions` map replaced) conservatively invalidates
            // everything below it.
            let addressed =
                self.prefix.iter().map(|s| s.as_str()).collect::<Vec<_>>();
            for (index, step) in entry.path.iter().enumerate() {
                if index < addressed.len() {
                    if step != addressed[index] {
                        return false;
                    }
                    continue;
                }
                match target.components().get(index - addressed.len()) {
                    Some(component) => {
                        if !component.matches(step) {
                            return false;
                        }
                    }
                    // The entry is deeper than the target path: it edits data
                    // under this target, so the target is stale.
                    None => return true,
                }
            }
            true
        })
    }
}

/// Artifact category with exactly one instance, addressed by a fixed path.
///
/// Conservatively invalidated by any change to its Global.
pub struct SingletonKind {
    name: String,
    rank: Arc<Rank>,
    global_name: String,
    path: Vec<String>,
}

impl SingletonKind {
    pub fn new(
        name: impl Into<String>,
        rank: &Arc<Rank>,
        global_name: impl Into<String>,
        path: &[&str],
    ) -> Self {
        let name = name.into();
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        assert!(!name.is_empty(), "kind name must not be empty");
        assert_eq!(path.len(), rank.depth(), "singleton path must match its rank depth");
        Self { name, rank: Arc::clone(rank), global_name: global_name.into(), path }
    }

    /// The single concrete target of this kind.
    fn instance(&self, target: &Target) -> EngineResult<Target> {
        let components = self.path.iter().map(|s| PathComponent::Exact(s.clone())).collect();
        Target::new(target.kind().clone(), components)
    }
}

impl Kind for SingletonKind {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> &Arc<Rank> {
        &self.rank
    }

    fn expand(&self, target: &Target, _globals: &GlobalsMap) -> EngineResult<Vec<Target>> {
        if target.is_concrete() {
            return Ok(vec![target.clone()]);
        }
        Ok(vec![self.instance(target)?])
    }

    fn is_invalidated(&self, _target: &Target, diff: &AnyDiff) -> bool {
        diff.global_name() == self.global_name && !diff.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::TreeDiff;
    use crate::target::KindRef;
    use serde_json::json;

    fn function_kind() -> KindRef {
        let binary = Rank::root("binary");
        let function = Rank::child("function", &binary);
        KindRef::new(Arc::new(TreeKind::new("function", &function, "model", &["Functions"])))
    }

    fn globals(value: Value) -> GlobalsMap {
        let mut globals = GlobalsMap::new();
        globals.insert("model", Box::new(TreeGlobal::new(value)));
        globals
    }

    fn rename_diff(address: &str) -> AnyDiff {
        let old = json!({"Functions": {address: {"Name": "foo"}}});
        let new = json!({"Functions": {address: {"Name": "bar"}}});
        AnyDiff::new("model", TreeGlobal::TYPE_TAG, TreeDiff::compute(&old, &new))
    }

    #[test]
    fn wildcard_expansion_enumerates_the_model_domain() {
        let kind = function_kind();
        let globals = globals(json!({"Functions": {"0x1000": {}, "0x2000": {}}}));
        let expanded = kind.expand(&Target::all(kind.clone()), &globals).unwrap();
        let paths: Vec<String> = expanded.iter().map(|t| t.to_string()).collect();
        assert_eq!(paths, vec!["0x1000:function", "0x2000:function"]);
    }

    #[test]
    fn concrete_expansion_is_a_singleton_of_itself() {
        let kind = function_kind();
        let globals = globals(json!({"Functions": {}}));
        let target = Target::concrete(kind.clone(), &["0x1000"]).unwrap();
        let expanded = kind.expand(&target, &globals).unwrap();
        assert_eq!(expanded, vec![target]);
    }

    #[test]
    fn diff_under_the_target_path_invalidates_it() {
        let kind = function_kind();
        let target = Target::concrete(kind.clone(), &["0x1000"]).unwrap();
        assert!(kind.is_invalidated(&target, &rename_diff("0x1000")));
    }

    #[test]
    fn diff_under_a_sibling_path_does_not_invalidate() {
        let kind = function_kind();
        let target = Target::concrete(kind.clone(), &["0x1000"]).unwrap();
        assert!(!kind.is_invalidated(&target, &rename_diff("0x2000")));
    }

    #[test]
    fn diff_of_an_unrelated_global_does_not_invalidate() {
        let kind = function_kind();
        let target = Target::concrete(kind.clone(), &["0x1000"]).unwrap();
        let diff = AnyDiff::new(
            "other",
            TreeGlobal::TYPE_TAG,
            TreeDiff::compute(&json!({"a": 1}), &json!({"a": 2})),
        );
        assert!(!kind.is_invalidated(&target, &diff));
    }
}
