//! Pipeline stages.
//!
//! Steps form a fixed linear chain; each step's committed container set
//! represents the world state after that step, and conceptually extends the
//! predecessor's state. The step owns the goal bookkeeping the runner's
//! backward walk relies on: which requested targets are already materialized
//! here, which its pipes can produce, and what those productions require from
//! the predecessor.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::container::ContainerSet;
use crate::error::{EngineError, EngineResult};
use crate::global::GlobalsMap;
use crate::pipe::{requirement_target, Analysis, Pipe, PipeContext, StagedContainers};
use crate::target::{ContainerToTargetsMap, KindRef, Target};

/// Marks a step as a user-facing artifact producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMarker {
    pub container: String,
    pub kind: String,
}

/// One ordered stage: a name, its committed containers, and the pipes and
/// analyses that populate them.
pub struct Step {
    name: String,
    containers: ContainerSet,
    pipes: Vec<Arc<dyn Pipe>>,
    analyses: BTreeMap<String, Arc<dyn Analysis>>,
    artifact: Option<ArtifactMarker>,
}

impl Step {
    pub fn new(name: impl Into<String>, containers: ContainerSet) -> Self {
        Self {
            name: name.into(),
            containers,
            pipes: Vec::new(),
            analyses: BTreeMap::new(),
            artifact: None,
        }
    }

    pub fn add_pipe(&mut self, pipe: Arc<dyn Pipe>) {
        self.pipes.push(pipe);
    }

    pub fn add_analysis(&mut self, analysis: Arc<dyn Analysis>) {
        let name = analysis.name().to_string();
        let previous = self.analyses.insert(name.clone(), analysis);
        assert!(previous.is_none(), "analysis '{name}' registered twice on one step");
    }

    pub fn set_artifact(&mut self, marker: ArtifactMarker) {
        self.artifact = Some(marker);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn containers(&self) -> &ContainerSet {
        &self.containers
    }

    pub fn containers_mut(&mut self) -> &mut ContainerSet {
        &mut self.containers
    }

    pub fn pipes(&self) -> &[Arc<dyn Pipe>] {
        &self.pipes
    }

    pub fn analyses(&self) -> impl Iterator<Item = (&String, &Arc<dyn Analysis>)> {
        self.analyses.iter()
    }

    pub fn analysis(&self, name: &str) -> EngineResult<&Arc<dyn Analysis>> {
        self.analyses.get(name).ok_or_else(|| EngineError::unknown("analysis", name))
    }

    pub fn artifact(&self) -> Option<&ArtifactMarker> {
        self.artifact.as_ref()
    }

    /// Split `goals` into targets already materialized in this step's
    /// committed state (the cache hits) and targets still missing.
    pub fn analyze_goals(
        &self,
        goals: &ContainerToTargetsMap,
    ) -> (ContainerToTargetsMap, ContainerToTargetsMap) {
        let mut hits = ContainerToTargetsMap::new();
        let mut missing = ContainerToTargetsMap::new();
        for (container_name, targets) in goals.iter() {
            let held = self.containers.get(container_name).ok();
            for target in targets {
                if held.is_some_and(|container| container.contains(target)) {
                    hits.add(container_name.clone(), target.clone());
                } else {
                    missing.add(container_name.clone(), target.clone());
                }
            }
        }
        (hits, missing)
    }

    /// Split missing goals into what this step's pipes can produce and what
    /// must come from the predecessor, translating produced goals into their
    /// contract-declared input requirements.
    ///
    /// Deduction iterates over the step's own pipes: a produced goal's input
    /// requirement may itself be the output of a pipe declared earlier in
    /// the same step, in which case it becomes a local production goal
    /// instead of an upstream one. Only what no pipe here can produce is
    /// pushed upstream.
    pub fn deduce_requirements(
        &self,
        missing: &ContainerToTargetsMap,
        resolve_kind: &dyn Fn(&str) -> EngineResult<KindRef>,
    ) -> EngineResult<(ContainerToTargetsMap, ContainerToTargetsMap)> {
        let mut producible = ContainerToTargetsMap::new();
        let mut upstream = ContainerToTargetsMap::new();

        // Each goal carries the index bound of the pipes allowed to produce
        // it: a pipe's inputs can only come from pipes declared before it.
        let mut worklist: Vec<(String, Target, usize)> = Vec::new();
        for (container_name, targets) in missing.iter() {
            for target in targets {
                worklist.push((container_name.clone(), target.clone(), self.pipes.len()));
            }
        }

        let mut handled: BTreeMap<(String, Target), usize> = BTreeMap::new();
        while let Some((container_name, target, bound)) = worklist.pop() {
            let key = (container_name.clone(), target.clone());
            if handled.get(&key).is_some_and(|&processed| processed <= bound) {
                continue;
            }
            handled.insert(key, bound);

            // A requirement already committed in this step is served by the
            // base layer of the staged view.
            let committed = self
                .containers
                .get(&container_name)
                .is_ok_and(|container| container.contains(&target));
            if committed {
                continue;
            }

            let found = self.pipes[..bound].iter().enumerate().find_map(|(index, pipe)| {
                pipe.contracts()
                    .into_iter()
                    .find(|contract| contract.produces(&container_name, &target))
                    .map(|contract| (index, contract))
            });

            match found {
                Some((index, contract)) => {
                    producible.add(container_name.clone(), target.clone());
                    if let Some((input_container, input_kind)) = &contract.input {
                        let kind = resolve_kind(input_kind)?;
                        let requirement = requirement_target(&target, &kind)?;
                        worklist.push((input_container.clone(), requirement, index));
                    }
                }
                // Not produced here: it may exist upstream and flow
                // forward through state inheritance.
                None => upstream.add(container_name, target),
            }
        }
        Ok((producible, upstream))
    }

    /// Run this step's pipes over the staged delta, restricted to `goals`.
    ///
    /// Pipes execute in declaration order; each is handed only the goals its
    /// contracts declare and that the staged view does not already hold, and
    /// a pipe with an empty request is not invoked at all.
    pub fn run_pipes(
        &self,
        globals: &GlobalsMap,
        goals: &ContainerToTargetsMap,
        delta: &mut ContainerSet,
    ) -> EngineResult<()> {
        let ctx = PipeContext::new(globals);
        for pipe in &self.pipes {
            let mut request = ContainerToTargetsMap::new();
            let contracts = pipe.contracts();
            for (container_name, targets) in goals.iter() {
                for target in targets {
                    if !contracts.iter().any(|c| c.produces(container_name, target)) {
                        continue;
                    }
                    let staged = delta
                        .get(container_name)
                        .is_ok_and(|container| container.contains(target));
                    let committed = self
                        .containers
                        .get(container_name)
                        .is_ok_and(|container| container.contains(target));
                    if !staged && !committed {
                        request.add(container_name.clone(), target.clone());
                    }
                }
            }
            if request.is_empty() {
                continue;
            }
            let mut io = StagedContainers::new(&self.containers, delta);
            pipe.run(&ctx, &request, &mut io)?;
        }
        Ok(())
    }

    /// Remove invalidated targets from committed state.
    pub fn invalidate(&mut self, stale: &ContainerToTargetsMap) {
        self.containers.remove_targets(stale);
    }

    /// Persist committed containers under `<dir>/<step name>/`.
    pub fn store_to_disk(&self, dir: &Path) -> EngineResult<()> {
        self.containers.store_to_disk(&dir.join(&self.name))
    }

    /// Reload committed containers from `<dir>/<step name>/`.
    pub fn load_from_disk(
        &mut self,
        dir: &Path,
        resolve_kind: &dyn Fn(&str) -> EngineResult<KindRef>,
    ) -> EngineResult<()> {
        self.containers.load_from_disk(&dir.join(&self.name), resolve_kind)
    }
}
