//! The registry: the immutable catalog of names the engine resolves at build
//! and load time.
//!
//! Ranks, kinds, pipes, analyses, and container factories are registered once
//! during startup and shared behind an `Arc` for the lifetime of the session.
//! Pipeline descriptions refer to everything by name; the registry is where
//! those names become live objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use crate::container::{Container, PayloadFormat};
use crate::error::{EngineError, EngineResult};
use crate::global::{GlobalsMap, TreeGlobal};
use crate::kinds::{SingletonKind, TreeKind};
use crate::pipe::{Analysis, Pipe};
use crate::pipes::{
    DecompilePipe, ImportBinaryPipe, IsolatePipe, LiftPipe, NormalizeFunctionNamesAnalysis,
    RenameFunctionAnalysis,
};
use crate::target::{Kind, KindRef, Rank, Target};

/// Catalog of registered names. Immutable after construction.
#[derive(Default)]
pub struct Registry {
    ranks: BTreeMap<String, Arc<Rank>>,
    kinds: BTreeMap<String, KindRef>,
    pipes: BTreeMap<String, Arc<dyn Pipe>>,
    analyses: BTreeMap<String, Arc<dyn Analysis>>,
    container_factories: BTreeMap<String, PayloadFormat>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rank. Duplicate registration is a build defect.
    pub fn register_rank(&mut self, rank: Arc<Rank>) {
        let name = rank.name().to_string();
        let previous = self.ranks.insert(name.clone(), rank);
        assert!(previous.is_none(), "rank '{name}' registered twice");
    }

    pub fn rank(&self, name: &str) -> EngineResult<&Arc<Rank>> {
        self.ranks.get(name).ok_or_else(|| EngineError::unknown("rank", name))
    }

    /// Register a kind. Duplicate registration is a build defect.
    pub fn register_kind(&mut self, kind: Arc<dyn Kind>) {
        let name = kind.name().to_string();
        let previous = self.kinds.insert(name.clone(), KindRef::new(kind));
        assert!(previous.is_none(), "kind '{name}' registered twice");
    }

    pub fn kind(&self, name: &str) -> EngineResult<KindRef> {
        self.kinds.get(name).cloned().ok_or_else(|| EngineError::unknown("kind", name))
    }

    /// Every registered kind, in name order. Invalidation iterates this.
    pub fn kinds(&self) -> impl Iterator<Item = &KindRef> {
        self.kinds.values()
    }

    /// Register a pipe prototype under its own name.
    pub fn register_pipe(&mut self, pipe: Arc<dyn Pipe>) {
        let name = pipe.name().to_string();
        let previous = self.pipes.insert(name.clone(), pipe);
        assert!(previous.is_none(), "pipe '{name}' registered twice");
    }

    pub fn pipe(&self, name: &str) -> EngineResult<&Arc<dyn Pipe>> {
        self.pipes.get(name).ok_or_else(|| EngineError::unknown("pipe", name))
    }

    /// Register an analysis prototype under its own name.
    pub fn register_analysis(&mut self, analysis: Arc<dyn Analysis>) {
        let name = analysis.name().to_string();
        let previous = self.analyses.insert(name.clone(), analysis);
        assert!(previous.is_none(), "analysis '{name}' registered twice");
    }

    pub fn analysis(&self, name: &str) -> EngineResult<&Arc<dyn Analysis>> {
        self.analyses.get(name).ok_or_else(|| EngineError::unknown("analysis", name))
    }

    /// Register a container factory: a named payload format containers of
    /// that type are created with.
    pub fn register_container_factory(&mut self, name: impl Into<String>, format: PayloadFormat) {
        let name = name.into();
        let previous = self.container_factories.insert(name.clone(), format);
        assert!(previous.is_none(), "container factory '{name}' registered twice");
    }

    /// Instantiate a container of the named factory type.
    pub fn make_container<S: AsRef<str>>(
        &self,
        factory: &str,
        name: &str,
        accepted_kinds: &[S],
    ) -> EngineResult<Container> {
        let format = self
            .container_factories
            .get(factory)
            .copied()
            .ok_or_else(|| EngineError::unknown("container factory", factory))?;
        Ok(Container::new(name, format, accepted_kinds))
    }

    /// Parse the serialized `comp0/comp1:kind` syntax into a target, resolving
    /// the kind name.
    pub fn parse_target(&self, text: &str) -> EngineResult<Target> {
        let (components, kind_name) = Target::parse_parts(text)?;
        let kind = self.kind(kind_name)?;
        Target::new(kind, components)
    }
}

/// The stock reverse-engineering registry: the binary/function rank tree,
/// the model-backed kinds, the builtin pipes and analyses, and the text and
/// binary container factories.
pub fn default_registry() -> Arc<Registry> {
    let mut registry = Registry::new();

    let binary = Rank::root("binary");
    let function = Rank::child("function", &binary);

    let binary_kind: Arc<dyn Kind> =
        Arc::new(SingletonKind::new("binary", &binary, "model", &[]));
    let function_kind: Arc<dyn Kind> =
        Arc::new(TreeKind::new("function", &function, "model", &["Functions"]));

    registry.register_kind(Arc::clone(&binary_kind));
    registry.register_kind(Arc::clone(&function_kind));
    registry.register_rank(binary);
    registry.register_rank(function);

    let binary_ref = KindRef::new(binary_kind);
    let function_ref = KindRef::new(function_kind);

    registry.register_pipe(Arc::new(ImportBinaryPipe::new(
        "model",
        "input",
        binary_ref.clone(),
    )));
    registry.register_pipe(Arc::new(LiftPipe::new("input", "module", binary_ref.clone())));
    registry.register_pipe(Arc::new(IsolatePipe::new(
        "module",
        binary_ref,
        "isolated",
        function_ref.clone(),
        "model",
    )));
    registry.register_pipe(Arc::new(DecompilePipe::new(
        "isolated",
        "decompiled",
        function_ref,
    )));

    registry.register_analysis(Arc::new(RenameFunctionAnalysis::new("model")));
    registry.register_analysis(Arc::new(NormalizeFunctionNamesAnalysis::new("model")));

    registry.register_container_factory("text", PayloadFormat::Text);
    registry.register_container_factory("binary", PayloadFormat::Binary);

    Arc::new(registry)
}

/// Fresh Globals for the stock registry: an empty model with a `Functions`
/// map ready to be populated.
pub fn default_globals() -> GlobalsMap {
    let mut globals = GlobalsMap::new();
    globals.insert("model", Box::new(TreeGlobal::new(json!({ "Functions": {} }))));
    globals
}
