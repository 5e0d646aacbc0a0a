//! Transformation units: pipes and analyses.
//!
//! A pipe is a pure, deterministic function of its declared input containers
//! and the requested targets; determinism is the soundness precondition for
//! cache reuse, so a pipe must produce byte-identical outputs for identical
//! inputs. An analysis instead mutates a Global; the runner pairs every such
//! mutation with a diff and an invalidation pass.
//!
//! Pipes never touch committed state directly. They read and write through a
//! `StagedContainers` view layering an uncommitted delta over the committed
//! base, so a failing pipe leaves nothing behind and a successful run commits
//! by merging the delta.

use std::collections::BTreeMap;

use crate::container::{ContainerSet, Payload};
use crate::error::EngineResult;
use crate::global::GlobalsMap;
use crate::target::{ContainerToTargetsMap, Target};

/// Static declaration of one production rule of a pipe: targets of
/// `output_kind` in `output_container` are computed from the corresponding
/// targets of `input_kind` in `input_container` (or from the Globals alone
/// for source pipes with no input).
///
/// The path mapping is ancestor-prefix: an output target's requirement is the
/// input-kind target addressed by the first `input rank depth` components of
/// the output path. The runner uses this for backward goal deduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub input: Option<(String, String)>,
    pub output_container: String,
    pub output_kind: String,
}

impl Contract {
    /// A rule deriving outputs from one input container/kind.
    pub fn new(
        input_container: impl Into<String>,
        input_kind: impl Into<String>,
        output_container: impl Into<String>,
        output_kind: impl Into<String>,
    ) -> Self {
        Self {
            input: Some((input_container.into(), input_kind.into())),
            output_container: output_container.into(),
            output_kind: output_kind.into(),
        }
    }

    /// A rule for source pipes producing outputs from Global state alone.
    pub fn source(output_container: impl Into<String>, output_kind: impl Into<String>) -> Self {
        Self { input: None, output_container: output_container.into(), output_kind: output_kind.into() }
    }

    /// Whether this rule can produce `target` in `container`.
    pub fn produces(&self, container: &str, target: &Target) -> bool {
        self.output_container == container && self.output_kind == target.kind().name()
    }
}

/// Read-only execution context handed to pipes.
pub struct PipeContext<'a> {
    globals: &'a GlobalsMap,
}

impl<'a> PipeContext<'a> {
    pub fn new(globals: &'a GlobalsMap) -> Self {
        Self { globals }
    }

    pub fn globals(&self) -> &GlobalsMap {
        self.globals
    }
}

/// Layered container view: an uncommitted delta over the committed base.
///
/// Reads hit the delta first so pipes within a step observe each other's
/// outputs; writes only ever land in the delta.
pub struct StagedContainers<'a> {
    base: &'a ContainerSet,
    delta: &'a mut ContainerSet,
}

impl<'a> StagedContainers<'a> {
    pub fn new(base: &'a ContainerSet, delta: &'a mut ContainerSet) -> Self {
        Self { base, delta }
    }

    /// Fetch a payload, preferring staged writes over committed state.
    pub fn get(&self, container: &str, target: &Target) -> EngineResult<Option<&Payload>> {
        if let Some(payload) = self.delta.get(container)?.get(target) {
            return Ok(Some(payload));
        }
        Ok(self.base.get(container)?.get(target))
    }

    pub fn contains(&self, container: &str, target: &Target) -> EngineResult<bool> {
        Ok(self.get(container, target)?.is_some())
    }

    /// Stage a payload for commit.
    pub fn insert(
        &mut self,
        container: &str,
        target: Target,
        payload: Payload,
    ) -> EngineResult<()> {
        self.delta.get_mut(container)?.insert(target, payload)
    }
}

/// A deterministic transformation over containers.
pub trait Pipe: Send + Sync {
    /// Unique pipe name used in pipeline descriptions.
    fn name(&self) -> &str;

    /// The production rules this pipe implements. Fixed per pipe; consulted
    /// by the runner's backward goal deduction.
    fn contracts(&self) -> Vec<Contract>;

    /// Compute exactly the requested targets into the staged view.
    ///
    /// `request` is restricted to targets this pipe's contracts declare and
    /// that are not already materialized; an empty request means the pipe is
    /// skipped entirely.
    fn run(
        &self,
        ctx: &PipeContext<'_>,
        request: &ContainerToTargetsMap,
        io: &mut StagedContainers<'_>,
    ) -> EngineResult<()>;
}

/// The input target an output target depends on under the ancestor-prefix
/// mapping: the first `input kind rank depth` components of the output path,
/// readdressed at the input kind.
pub fn requirement_target(output: &Target, input_kind: &crate::target::KindRef) -> EngineResult<Target> {
    let depth = input_kind.rank().depth();
    if depth > output.components().len() {
        return Err(crate::error::EngineError::Configuration(format!(
            "contract input kind '{}' is deeper than the produced target '{output}'",
            input_kind.name()
        )));
    }
    Target::new(input_kind.clone(), output.components()[..depth].to_vec())
}

/// String options configuring one analysis run.
pub type AnalysisOptions = BTreeMap<String, String>;

/// A pipe variant whose effect is a mutation of Global state.
///
/// Analyses read committed containers and write Globals; the runner
/// snapshots, diffs, and invalidates around every invocation.
pub trait Analysis: Send + Sync {
    /// Unique analysis name used in pipeline descriptions.
    fn name(&self) -> &str;

    /// Whether this analysis can run without caller-provided options.
    /// Batch runs skip analyses that answer `false`.
    fn runs_unattended(&self) -> bool {
        true
    }

    fn run(
        &self,
        options: &AnalysisOptions,
        containers: &ContainerSet,
        globals: &mut GlobalsMap,
    ) -> EngineResult<()>;
}
