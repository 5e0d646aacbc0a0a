//! Containers: typed stores of materialized artifacts keyed by target.
//!
//! A container belongs to exactly one step and declares which kinds it may
//! hold. The engine never looks inside payloads; it only moves them around,
//! filters them, and persists them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::target::{ContainerToTargetsMap, KindRef, Target, TargetsList};

/// Opaque artifact payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Render for artifact output: text verbatim, bytes as-is.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) => b,
        }
    }
}

/// Declared output format of a container, used when its content is written
/// out as a user-facing artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Text,
    Binary,
}

/// On-disk shape of a persisted container.
#[derive(Debug, Serialize, Deserialize)]
struct ContainerDocument {
    name: String,
    format: PayloadFormat,
    entries: Vec<EntryDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryDocument {
    target: String,
    payload: Payload,
}

/// A named, typed mapping from target to payload.
#[derive(Debug, Clone)]
pub struct Container {
    name: String,
    format: PayloadFormat,
    accepted_kinds: BTreeSet<String>,
    entries: BTreeMap<Target, Payload>,
}

impl Container {
    pub fn new<S: AsRef<str>>(
        name: impl Into<String>,
        format: PayloadFormat,
        accepted_kinds: &[S],
    ) -> Self {
        Self {
            name: name.into(),
            format,
            accepted_kinds: accepted_kinds.iter().map(|k| k.as_ref().to_string()).collect(),
            entries: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// Whether this container was declared to hold artifacts of `kind`.
    pub fn accepts(&self, kind: &KindRef) -> bool {
        self.accepted_kinds.contains(kind.name())
    }

    pub fn accepted_kinds(&self) -> impl Iterator<Item = &String> {
        self.accepted_kinds.iter()
    }

    /// Every target currently materialized in this container.
    pub fn enumerate(&self) -> TargetsList {
        self.entries.keys().cloned().collect()
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.entries.contains_key(target)
    }

    pub fn get(&self, target: &Target) -> Option<&Payload> {
        self.entries.get(target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a payload. Writing a kind the container never declared is a
    /// configuration defect in the pipe or the pipeline description.
    pub fn insert(&mut self, target: Target, payload: Payload) -> EngineResult<()> {
        if !self.accepts(target.kind()) {
            return Err(EngineError::Configuration(format!(
                "container '{}' does not accept kind '{}'",
                self.name,
                target.kind().name()
            )));
        }
        self.entries.insert(target, payload);
        Ok(())
    }

    pub fn remove(&mut self, target: &Target) -> bool {
        self.entries.remove(target).is_some()
    }

    /// Extract exactly the requested subset into a new container, leaving
    /// this one untouched.
    pub fn clone_filtered<'a>(&self, targets: impl IntoIterator<Item = &'a Target>) -> Container {
        let mut filtered = self.schema_clone();
        for target in targets {
            if let Some(payload) = self.entries.get(target) {
                filtered.entries.insert(target.clone(), payload.clone());
            }
        }
        filtered
    }

    /// An empty container with the same declaration.
    pub fn schema_clone(&self) -> Container {
        Container {
            name: self.name.clone(),
            format: self.format,
            accepted_kinds: self.accepted_kinds.clone(),
            entries: BTreeMap::new(),
        }
    }

    /// Absorb another container's entries, overwriting on collision.
    pub fn merge(&mut self, other: Container) {
        self.entries.extend(other.entries);
    }

    /// Write this container to `path` as a single JSON document.
    pub fn store_to_disk(&self, path: &Path) -> EngineResult<()> {
        let document = ContainerDocument {
            name: self.name.clone(),
            format: self.format,
            entries: self
                .entries
                .iter()
                .map(|(target, payload)| EntryDocument {
                    target: target.serialize(),
                    payload: payload.clone(),
                })
                .collect(),
        };
        fs::write(path, serde_json::to_string_pretty(&document)?)?;
        Ok(())
    }

    /// Load this container from `path`, resolving kind names through
    /// `resolve_kind`. A missing file leaves the container empty.
    pub fn load_from_disk(
        &mut self,
        path: &Path,
        resolve_kind: &dyn Fn(&str) -> EngineResult<KindRef>,
    ) -> EngineResult<()> {
        self.entries.clear();
        if !path.exists() {
            return Ok(());
        }
        let text = fs::read_to_string(path)?;
        let document: ContainerDocument = serde_json::from_str(&text)?;
        for entry in document.entries {
            let (components, kind_name) = Target::parse_parts(&entry.target)?;
            let kind = resolve_kind(kind_name)?;
            let target = Target::new(kind, components)?;
            self.insert(target, entry.payload)?;
        }
        Ok(())
    }
}

/// The full named collection of containers belonging to one step.
#[derive(Debug, Clone, Default)]
pub struct ContainerSet {
    containers: BTreeMap<String, Container>,
}

impl ContainerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a container. Container names are unique within a step; a
    /// duplicate is a build defect.
    pub fn add(&mut self, container: Container) {
        let name = container.name().to_string();
        let previous = self.containers.insert(name.clone(), container);
        assert!(previous.is_none(), "container '{name}' declared twice");
    }

    pub fn get(&self, name: &str) -> EngineResult<&Container> {
        self.containers.get(name).ok_or_else(|| EngineError::unknown("container", name))
    }

    pub fn get_mut(&mut self, name: &str) -> EngineResult<&mut Container> {
        self.containers.get_mut(name).ok_or_else(|| EngineError::unknown("container", name))
    }

    pub fn contains_container(&self, name: &str) -> bool {
        self.containers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.containers.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    /// Everything materialized across the whole set.
    pub fn enumerate(&self) -> ContainerToTargetsMap {
        let mut map = ContainerToTargetsMap::new();
        for container in self.containers.values() {
            map.add_all(container.name(), container.enumerate());
        }
        map
    }

    /// Whether every requested target is materialized.
    pub fn contains_all(&self, request: &ContainerToTargetsMap) -> bool {
        request.iter().all(|(name, targets)| {
            self.containers
                .get(name)
                .is_some_and(|container| targets.iter().all(|t| container.contains(t)))
        })
    }

    /// Extract the requested subset into a new set with the same schema.
    pub fn clone_filtered(&self, request: &ContainerToTargetsMap) -> ContainerSet {
        let mut filtered = self.schema_clone();
        for (name, targets) in request.iter() {
            if let Some(container) = self.containers.get(name) {
                filtered.containers.insert(name.clone(), container.clone_filtered(targets));
            }
        }
        filtered
    }

    /// Empty copy with the same container declarations.
    pub fn schema_clone(&self) -> ContainerSet {
        let containers = self
            .containers
            .iter()
            .map(|(name, container)| (name.clone(), container.schema_clone()))
            .collect();
        ContainerSet { containers }
    }

    /// Absorb another set's entries, overwriting on collision. Containers
    /// unknown to this set are ignored; the schema is fixed at build time.
    pub fn merge(&mut self, other: ContainerSet) {
        for (name, incoming) in other.containers {
            if let Some(container) = self.containers.get_mut(&name) {
                container.merge(incoming);
            }
        }
    }

    /// Remove the listed targets from committed state.
    pub fn remove_targets(&mut self, map: &ContainerToTargetsMap) {
        for (name, targets) in map.iter() {
            if let Some(container) = self.containers.get_mut(name) {
                for target in targets {
                    container.remove(target);
                }
            }
        }
    }

    /// Persist every container as `<dir>/<container>.json`.
    pub fn store_to_disk(&self, dir: &Path) -> EngineResult<()> {
        fs::create_dir_all(dir)?;
        for (name, container) in &self.containers {
            container.store_to_disk(&dir.join(format!("{name}.json")))?;
        }
        Ok(())
    }

    /// Load every container from `<dir>/<container>.json`; missing files
    /// leave the corresponding container empty.
    pub fn load_from_disk(
        &mut self,
        dir: &Path,
        resolve_kind: &dyn Fn(&str) -> EngineResult<KindRef>,
    ) -> EngineResult<()> {
        for (name, container) in &mut self.containers {
            container.load_from_disk(&dir.join(format!("{name}.json")), resolve_kind)?;
        }
        Ok(())
    }
}
