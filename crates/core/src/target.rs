//! Target addressing: ranks, kinds, and the targets that key every cached
//! artifact.
//!
//! A `Rank` is one node in the fixed granularity tree (whole binary,
//! per-function, ...). A `Kind` is a named artifact category anchored at one
//! rank; it knows how to expand wildcard targets and how to decide whether a
//! materialized target is stale given a model diff. A `Target` is the address
//! of one artifact instance: an ordered list of path components plus its kind.
//!
//! Targets are query keys, not stored entities: they exist only as container
//! map keys and request/response values.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::diff::AnyDiff;
use crate::error::{EngineError, EngineResult};
use crate::global::GlobalsMap;

/// Wildcard marker used in the serialized target syntax.
pub const WILDCARD: &str = "*";

/// Separator between path components in the serialized target syntax.
pub const PATH_SEPARATOR: char = '/';

/// Separator between the path and the kind name in the serialized syntax.
pub const KIND_SEPARATOR: char = ':';

/// One node in the fixed tree of granularity levels.
///
/// Ranks are created once at registration time and never mutated. The depth
/// of a rank (distance from the tree root) determines how many path
/// components a target of a kind anchored at that rank must carry.
#[derive(Debug)]
pub struct Rank {
    name: String,
    parent: Option<Arc<Rank>>,
}

impl Rank {
    /// Create the root rank of a granularity tree.
    pub fn root(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        assert!(!name.is_empty(), "rank name must not be empty");
        Arc::new(Self { name, parent: None })
    }

    /// Create a rank one level below `parent`.
    pub fn child(name: impl Into<String>, parent: &Arc<Rank>) -> Arc<Self> {
        let name = name.into();
        assert!(!name.is_empty(), "rank name must not be empty");
        Arc::new(Self { name, parent: Some(Arc::clone(parent)) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Rank>> {
        self.parent.as_ref()
    }

    /// Distance from the root rank. The root has depth 0, so targets of a
    /// root-ranked kind carry no path components.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent.as_ref();
        while let Some(rank) = current {
            depth += 1;
            current = rank.parent.as_ref();
        }
        depth
    }
}

/// Semantic category and granularity class of an artifact.
///
/// Kinds are immutable after registration and shared behind `Arc`. Many kinds
/// may be stored in the same container as long as the container declared them.
pub trait Kind: Send + Sync {
    /// Unique kind name used in serialized targets and pipeline descriptions.
    fn name(&self) -> &str;

    /// The rank this kind is anchored at.
    fn rank(&self) -> &Arc<Rank>;

    /// Resolve a possibly-wildcard target of this kind into the full list of
    /// concrete targets, in a deterministic kind-defined order.
    ///
    /// Expansion consults whichever Global holds the enumerable domain for
    /// this kind (e.g. all function addresses currently in the model).
    /// Expanding an already-concrete target returns a singleton.
    fn expand(&self, target: &Target, globals: &GlobalsMap) -> EngineResult<Vec<Target>>;

    /// Invalidation predicate: given a diff of a Global, decide whether a
    /// currently materialized target of this kind is no longer valid.
    ///
    /// Must be conservative: answering `true` for an unaffected target only
    /// costs recomputation, answering `false` for an affected one serves
    /// stale data and is never acceptable.
    fn is_invalidated(&self, target: &Target, diff: &AnyDiff) -> bool;
}

/// Shared, comparable handle to a registered kind.
///
/// Equality and ordering are by kind name; registration guarantees names are
/// unique process-wide.
#[derive(Clone)]
pub struct KindRef(Arc<dyn Kind>);

impl KindRef {
    pub fn new(kind: Arc<dyn Kind>) -> Self {
        Self(kind)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn rank(&self) -> &Arc<Rank> {
        self.0.rank()
    }

    pub fn expand(&self, target: &Target, globals: &GlobalsMap) -> EngineResult<Vec<Target>> {
        self.0.expand(target, globals)
    }

    pub fn is_invalidated(&self, target: &Target, diff: &AnyDiff) -> bool {
        self.0.is_invalidated(target, diff)
    }
}

impl fmt::Debug for KindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KindRef({})", self.name())
    }
}

impl PartialEq for KindRef {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for KindRef {}

impl PartialOrd for KindRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KindRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name().cmp(other.name())
    }
}

impl std::hash::Hash for KindRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

/// One component of a target path: a concrete string or the wildcard marker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathComponent {
    Exact(String),
    All,
}

impl PathComponent {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, PathComponent::All)
    }

    /// Whether this component matches a concrete string (wildcards match
    /// everything).
    pub fn matches(&self, value: &str) -> bool {
        match self {
            PathComponent::Exact(s) => s == value,
            PathComponent::All => true,
        }
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathComponent::Exact(s) => write!(f, "{s}"),
            PathComponent::All => write!(f, "{WILDCARD}"),
        }
    }
}

impl From<&str> for PathComponent {
    fn from(value: &str) -> Self {
        if value == WILDCARD {
            PathComponent::All
        } else {
            PathComponent::Exact(value.to_string())
        }
    }
}

/// The address of one artifact instance, scoped by its kind.
///
/// Invariant: the number of path components equals the kind's rank depth.
/// Two targets are equal iff their components and kind match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    kind: KindRef,
    components: Vec<PathComponent>,
}

impl Target {
    /// Build a target, checking the component count against the kind's rank
    /// depth.
    pub fn new(kind: KindRef, components: Vec<PathComponent>) -> EngineResult<Self> {
        let expected = kind.rank().depth();
        if components.len() != expected {
            return Err(EngineError::InvalidRequest(format!(
                "target of kind '{}' requires {} path component(s), got {}",
                kind.name(),
                expected,
                components.len()
            )));
        }
        Ok(Self { kind, components })
    }

    /// Build a fully concrete target from string components.
    pub fn concrete<S: AsRef<str>>(kind: KindRef, components: &[S]) -> EngineResult<Self> {
        let components = components
            .iter()
            .map(|c| PathComponent::Exact(c.as_ref().to_string()))
            .collect();
        Self::new(kind, components)
    }

    /// A wildcard target covering every concrete target of `kind`.
    pub fn all(kind: KindRef) -> Self {
        let components = vec![PathComponent::All; kind.rank().depth()];
        Self { kind, components }
    }

    pub fn kind(&self) -> &KindRef {
        &self.kind
    }

    pub fn components(&self) -> &[PathComponent] {
        &self.components
    }

    /// Whether every component is concrete (no wildcards left).
    pub fn is_concrete(&self) -> bool {
        self.components.iter().all(|c| !c.is_wildcard())
    }

    /// Whether this (possibly wildcard) target covers `other`.
    pub fn matches(&self, other: &Target) -> bool {
        if self.kind != other.kind || self.components.len() != other.components.len() {
            return false;
        }
        self.components.iter().zip(&other.components).all(|(pattern, concrete)| match concrete {
            PathComponent::Exact(s) => pattern.matches(s),
            PathComponent::All => pattern.is_wildcard(),
        })
    }

    /// Serialized form: `comp0/comp1:kind` (empty path for rank depth 0).
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// Parse the `comp0/comp1:kind` syntax into raw parts. Kind resolution is
    /// the registry's job.
    pub fn parse_parts(text: &str) -> EngineResult<(Vec<PathComponent>, &str)> {
        let (path, kind_name) = text.rsplit_once(KIND_SEPARATOR).ok_or_else(|| {
            EngineError::InvalidRequest(format!(
                "target '{text}' is missing the ':kind' suffix"
            ))
        })?;
        if kind_name.is_empty() {
            return Err(EngineError::InvalidRequest(format!(
                "target '{text}' has an empty kind name"
            )));
        }
        let components = if path.is_empty() {
            Vec::new()
        } else {
            path.split(PATH_SEPARATOR).map(PathComponent::from).collect()
        };
        Ok((components, kind_name))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, component) in self.components.iter().enumerate() {
            if index > 0 {
                write!(f, "{PATH_SEPARATOR}")?;
            }
            write!(f, "{component}")?;
        }
        write!(f, "{KIND_SEPARATOR}{}", self.kind.name())
    }
}

/// Ordered, duplicate-free collection of targets.
pub type TargetsList = BTreeSet<Target>;

/// Request/response shape: which targets are wanted (or held) per container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerToTargetsMap {
    map: BTreeMap<String, TargetsList>,
}

impl ContainerToTargetsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, container: impl Into<String>, target: Target) {
        self.map.entry(container.into()).or_default().insert(target);
    }

    pub fn add_all(&mut self, container: &str, targets: impl IntoIterator<Item = Target>) {
        let entry = self.map.entry(container.to_string()).or_default();
        entry.extend(targets);
    }

    pub fn merge(&mut self, other: &ContainerToTargetsMap) {
        for (container, targets) in &other.map {
            self.add_all(container, targets.iter().cloned());
        }
    }

    pub fn remove(&mut self, container: &str, target: &Target) {
        if let Some(targets) = self.map.get_mut(container) {
            targets.remove(target);
            if targets.is_empty() {
                self.map.remove(container);
            }
        }
    }

    pub fn contains(&self, container: &str, target: &Target) -> bool {
        self.map.get(container).is_some_and(|targets| targets.contains(target))
    }

    pub fn targets(&self, container: &str) -> Option<&TargetsList> {
        self.map.get(container)
    }

    pub fn is_empty(&self) -> bool {
        self.map.values().all(|targets| targets.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TargetsList)> {
        self.map.iter()
    }

    pub fn container_names(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }
}

impl fmt::Display for ContainerToTargetsMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (container, targets) in &self.map {
            for target in targets {
                writeln!(f, "{container}={target}")?;
            }
        }
        Ok(())
    }
}
