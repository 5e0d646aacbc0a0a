//! Shared mutable model state: Globals and the map that owns them.
//!
//! A Global is a named, diffable, cloneable value shared across a whole
//! runner; the binary model is the one concrete instance in practice. The
//! engine never interprets a Global's schema: `TreeGlobal` stores an
//! arbitrary JSON tree and everything downstream (diffing, invalidation,
//! persistence) works on paths into that tree.
//!
//! `GlobalsMap` has value semantics: cloning it deep-copies every Global, so
//! a pre-analysis snapshot can be retained and diffed against the mutated
//! state afterwards.

use std::any::Any;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::diff::{AnyDiff, DiffMap, TreeDiff};
use crate::error::{EngineError, EngineResult};

/// Directory under the persistence root holding one file per Global.
pub const CONTEXT_DIR: &str = "context";

/// A named, diffable, cloneable value shared across the whole runner.
///
/// Mutated only by analyses; every mutation is paired with a diff used to
/// invalidate dependent cached artifacts.
pub trait Global: Send + Sync {
    /// Process-wide identifier of this Global's concrete type, used to reject
    /// diffs computed against a different type.
    fn type_tag(&self) -> &'static str;

    /// Project the current state into a JSON tree. This is the substrate for
    /// diffing and serialization.
    fn to_value(&self) -> Value;

    /// Replace the current state from a JSON tree.
    fn from_value(&mut self, value: Value) -> EngineResult<()>;

    /// Reset to the default state.
    fn clear(&mut self);

    fn clone_box(&self) -> Box<dyn Global>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Serialize to a self-contained text buffer.
    fn serialize(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_value())?)
    }

    /// Restore from a buffer produced by `serialize`.
    fn deserialize(&mut self, text: &str) -> EngineResult<()> {
        let value: Value = serde_json::from_str(text)?;
        self.from_value(value)
    }

    /// Structural diff against another Global of the same type.
    ///
    /// Called only on same-named entries of two GlobalsMap snapshots; a tag
    /// mismatch there is a build defect, not a runtime condition.
    fn diff(&self, name: &str, other: &dyn Global) -> TreeDiff {
        assert_eq!(
            self.type_tag(),
            other.type_tag(),
            "diffing global '{name}' against a different type"
        );
        TreeDiff::compute(&self.to_value(), &other.to_value())
    }

    /// Apply a serialized diff buffer to this Global.
    fn apply_diff(&mut self, name: &str, diff: &AnyDiff) -> EngineResult<()> {
        if diff.type_tag() != self.type_tag() || diff.global_name() != name {
            return Err(EngineError::TypeMismatch(format!(
                "diff for global '{}' (type '{}') applied to global '{name}' (type '{}')",
                diff.global_name(),
                diff.type_tag(),
                self.type_tag()
            )));
        }
        let mut value = self.to_value();
        diff.tree().apply(&mut value)?;
        self.from_value(value)
    }
}

/// The one concrete Global the engine ships: an arbitrary JSON tree.
///
/// The binary model is an instance of this type; its schema and field-level
/// verification live outside the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeGlobal {
    value: Value,
}

impl TreeGlobal {
    pub const TYPE_TAG: &'static str = "tree";

    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }
}

impl Global for TreeGlobal {
    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn to_value(&self) -> Value {
        self.value.clone()
    }

    fn from_value(&mut self, value: Value) -> EngineResult<()> {
        self.value = value;
        Ok(())
    }

    fn clear(&mut self) {
        self.value = Value::Object(serde_json::Map::new());
    }

    fn clone_box(&self) -> Box<dyn Global> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Name → Global, with deep-copy clone semantics.
#[derive(Default)]
pub struct GlobalsMap {
    map: BTreeMap<String, Box<dyn Global>>,
}

impl Clone for GlobalsMap {
    fn clone(&self) -> Self {
        let map = self
            .map
            .iter()
            .map(|(name, global)| (name.clone(), global.clone_box()))
            .collect();
        Self { map }
    }
}

impl GlobalsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a Global under `name`. Registration happens once at startup;
    /// a duplicate name is a build defect.
    pub fn insert(&mut self, name: impl Into<String>, global: Box<dyn Global>) {
        let name = name.into();
        let previous = self.map.insert(name.clone(), global);
        assert!(previous.is_none(), "global '{name}' registered twice");
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, name: &str) -> EngineResult<&dyn Global> {
        self.map
            .get(name)
            .map(|global| global.as_ref())
            .ok_or_else(|| EngineError::unknown("global", name))
    }

    pub fn get_mut(&mut self, name: &str) -> EngineResult<&mut Box<dyn Global>> {
        self.map.get_mut(name).ok_or_else(|| EngineError::unknown("global", name))
    }

    /// Fetch a Global downcast to its concrete type.
    pub fn get_as<T: Global + 'static>(&self, name: &str) -> EngineResult<&T> {
        self.get(name)?.as_any().downcast_ref::<T>().ok_or_else(|| {
            EngineError::TypeMismatch(format!(
                "global '{name}' requested at the wrong concrete type"
            ))
        })
    }

    /// Fetch a mutable Global downcast to its concrete type.
    pub fn get_as_mut<T: Global + 'static>(&mut self, name: &str) -> EngineResult<&mut T> {
        self.get_mut(name)?.as_any_mut().downcast_mut::<T>().ok_or_else(|| {
            EngineError::TypeMismatch(format!(
                "global '{name}' requested at the wrong concrete type"
            ))
        })
    }

    /// Diff every Global in this snapshot against its counterpart in
    /// `other`. Both maps hold the same registered names by construction.
    pub fn diff(&self, other: &GlobalsMap) -> DiffMap {
        let mut diffs = DiffMap::new();
        for (name, global) in &self.map {
            let counterpart = other
                .map
                .get(name)
                .unwrap_or_else(|| panic!("global '{name}' missing from snapshot"));
            let tree = global.diff(name, counterpart.as_ref());
            diffs.insert(name.clone(), AnyDiff::new(name.clone(), global.type_tag(), tree));
        }
        diffs
    }

    /// Write every Global to `<root>/context/<name>`.
    pub fn store_to_disk(&self, root: &Path) -> EngineResult<()> {
        let context_dir = root.join(CONTEXT_DIR);
        fs::create_dir_all(&context_dir)?;
        for (name, global) in &self.map {
            fs::write(context_dir.join(name), global.serialize()?)?;
        }
        Ok(())
    }

    /// Load every registered Global from `<root>/context/<name>`.
    ///
    /// A missing file resets that Global to its default state instead of
    /// failing, so an empty directory is a valid fresh start.
    pub fn load_from_disk(&mut self, root: &Path) -> EngineResult<()> {
        let context_dir = root.join(CONTEXT_DIR);
        for (name, global) in &mut self.map {
            let path = context_dir.join(name);
            if path.exists() {
                let text = fs::read_to_string(&path)?;
                global.deserialize(&text)?;
            } else {
                global.clear();
            }
        }
        Ok(())
    }
}
