//! The runner: top-level mutable aggregate owning the step chain and the
//! Globals.
//!
//! `run` implements the incremental execution algorithm: expand the request,
//! walk the chain backward collecting cache hits and per-step production
//! goals, then execute forward restricted to the delta, staging everything
//! and committing only on success. `run_analysis` wraps every Global
//! mutation in a snapshot/diff/invalidate cycle so cached artifacts can
//! never go silently stale.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use crate::container::ContainerSet;
use crate::diff::{DiffMap, InvalidationMap};
use crate::error::{EngineError, EngineResult};
use crate::global::GlobalsMap;
use crate::pipe::AnalysisOptions;
use crate::registry::Registry;
use crate::step::Step;
use crate::target::{ContainerToTargetsMap, KindRef};
use crate::trace::Tracer;

/// Execution plan entry: one step plus what it must produce and what it
/// already satisfies from cache.
struct PlanEntry {
    step_index: usize,
    hits: ContainerToTargetsMap,
    produce: ContainerToTargetsMap,
}

/// Orchestrates the linear step chain, the Globals, and invalidation.
///
/// One runner per session; exclusively owned, single-threaded, no
/// suspension points.
pub struct Runner {
    steps: Vec<Step>,
    index: BTreeMap<String, usize>,
    globals: GlobalsMap,
    registry: Arc<Registry>,
    tracer: Option<Tracer>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("steps", &self.steps.iter().map(Step::name).collect::<Vec<_>>())
            .field("globals", &self.globals.names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new(registry: Arc<Registry>, globals: GlobalsMap) -> Self {
        Self {
            steps: Vec::new(),
            index: BTreeMap::new(),
            globals,
            registry,
            tracer: Tracer::from_env(),
        }
    }

    /// Append a step to the chain. The chain is fixed before the first run;
    /// a duplicate name is a build defect.
    pub fn add_step(&mut self, step: Step) {
        let name = step.name().to_string();
        let previous = self.index.insert(name.clone(), self.steps.len());
        assert!(previous.is_none(), "step '{name}' added twice");
        self.steps.push(step);
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    pub fn step(&self, name: &str) -> EngineResult<&Step> {
        let index = self.step_index(name)?;
        Ok(&self.steps[index])
    }

    fn step_index(&self, name: &str) -> EngineResult<usize> {
        self.index.get(name).copied().ok_or_else(|| EngineError::unknown("step", name))
    }

    pub fn globals(&self) -> &GlobalsMap {
        &self.globals
    }

    /// Direct Global access for the embedding driver (model overrides before
    /// a run). Inside a run, Globals are mutated only through analyses.
    pub fn globals_mut(&mut self) -> &mut GlobalsMap {
        &mut self.globals
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn kinds(&self) -> impl Iterator<Item = &KindRef> {
        self.registry.kinds()
    }

    /// Everything currently materialized, per step.
    pub fn current_state(&self) -> BTreeMap<String, ContainerToTargetsMap> {
        self.steps
            .iter()
            .map(|step| (step.name().to_string(), step.containers().enumerate()))
            .collect()
    }

    /// Produce the requested targets at the named step and return exactly
    /// the requested subset.
    ///
    /// Atomic per request: on any failure no step's committed state changes.
    pub fn run(
        &mut self,
        step_name: &str,
        request: &ContainerToTargetsMap,
    ) -> EngineResult<ContainerSet> {
        let result = self.run_inner(step_name, request);
        if let Some(tracer) = &self.tracer {
            tracer.record(
                "run",
                json!({ "step": step_name, "targets": request.to_string() }),
                &result,
            );
        }
        result
    }

    fn run_inner(
        &mut self,
        step_name: &str,
        request: &ContainerToTargetsMap,
    ) -> EngineResult<ContainerSet> {
        let end = self.step_index(step_name)?;
        let expanded = self.expand_request(request)?;

        // Backward walk: find per-step production goals and cache hits until
        // the request is fully covered.
        let mut plan: Vec<PlanEntry> = Vec::new();
        let mut goals = expanded.clone();
        let resolve = |name: &str| self.registry.kind(name);
        for step_index in (0..=end).rev() {
            if goals.is_empty() {
                break;
            }
            let step = &self.steps[step_index];
            let (hits, missing) = step.analyze_goals(&goals);
            let (produce, upstream) = step.deduce_requirements(&missing, &resolve)?;
            plan.push(PlanEntry { step_index, hits, produce });
            goals = upstream;
        }
        if !goals.is_empty() {
            return Err(EngineError::InvalidRequest(format!(
                "no step in the chain can satisfy:\n{goals}"
            )));
        }
        plan.reverse();

        // Forward execution over a staged delta; committed state is read but
        // never written until every step has succeeded.
        let mut flow = match plan.first() {
            Some(entry) => self.steps[entry.step_index].containers().schema_clone(),
            None => ContainerSet::new(),
        };
        let mut commits: Vec<(usize, ContainerSet)> = Vec::new();
        for entry in &plan {
            let step = &self.steps[entry.step_index];
            flow.merge(step.containers().clone_filtered(&entry.hits));
            step.run_pipes(&self.globals, &entry.produce, &mut flow)?;
            commits.push((entry.step_index, flow.clone()));
        }

        for (step_index, staged) in commits {
            self.steps[step_index].containers_mut().merge(staged);
        }

        Ok(self.steps[end].containers().clone_filtered(&expanded))
    }

    /// Expand wildcard targets into concrete ones against the current
    /// Globals. Unknown container names are not an error here; a goal nobody
    /// can satisfy is rejected by the backward walk.
    fn expand_request(
        &self,
        request: &ContainerToTargetsMap,
    ) -> EngineResult<ContainerToTargetsMap> {
        let mut expanded = ContainerToTargetsMap::new();
        for (container_name, targets) in request.iter() {
            for target in targets {
                for concrete in target.kind().expand(target, &self.globals)? {
                    expanded.add(container_name.clone(), concrete);
                }
            }
        }
        Ok(expanded)
    }

    /// Run one analysis: snapshot the Globals, execute, diff, and apply the
    /// resulting invalidation before returning.
    ///
    /// The mutation and its invalidation are atomic: a failing analysis
    /// restores the snapshot, and no diff is ever observable without its
    /// invalidation applied.
    pub fn run_analysis(
        &mut self,
        step_name: &str,
        analysis_name: &str,
        options: &AnalysisOptions,
    ) -> EngineResult<DiffMap> {
        let result = self.run_analysis_inner(step_name, analysis_name, options);
        if let Some(tracer) = &self.tracer {
            tracer.record(
                "run_analysis",
                json!({ "step": step_name, "analysis": analysis_name, "options": options }),
                &result,
            );
        }
        result
    }

    fn run_analysis_inner(
        &mut self,
        step_name: &str,
        analysis_name: &str,
        options: &AnalysisOptions,
    ) -> EngineResult<DiffMap> {
        let step_index = self.step_index(step_name)?;
        let analysis = Arc::clone(self.steps[step_index].analysis(analysis_name)?);

        let before = self.globals.clone();
        let step = &self.steps[step_index];
        if let Err(error) = analysis.run(options, step.containers(), &mut self.globals) {
            self.globals = before;
            return Err(error);
        }

        let diffs = before.diff(&self.globals);
        for diff in diffs.values() {
            if diff.is_empty() {
                continue;
            }
            diff.to_invalidation_event().apply(self)?;
        }
        Ok(diffs)
    }

    /// Run every unattended analysis of every step, in chain order, and
    /// return the overall diff of the Globals.
    ///
    /// Atomic on the Globals: a failure anywhere in the schedule restores
    /// the pre-batch snapshot. Invalidation already applied by earlier
    /// analyses stays applied; it only ever removes cached artifacts.
    pub fn run_all_analyses(&mut self) -> EngineResult<DiffMap> {
        let result = self.run_all_analyses_inner();
        if let Some(tracer) = &self.tracer {
            tracer.record("run_all_analyses", json!({}), &result);
        }
        result
    }

    fn run_all_analyses_inner(&mut self) -> EngineResult<DiffMap> {
        let before = self.globals.clone();
        let mut schedule: Vec<(String, String)> = Vec::new();
        for step in &self.steps {
            for (analysis_name, analysis) in step.analyses() {
                if analysis.runs_unattended() {
                    schedule.push((step.name().to_string(), analysis_name.clone()));
                }
            }
        }
        let options = AnalysisOptions::new();
        for (step_name, analysis_name) in schedule {
            if let Err(error) = self.run_analysis_inner(&step_name, &analysis_name, &options) {
                self.globals = before;
                return Err(error);
            }
        }
        Ok(before.diff(&self.globals))
    }

    /// Remove the listed targets from committed state, forcing the next run
    /// touching them to recompute.
    pub fn invalidate(&mut self, map: &InvalidationMap) -> EngineResult<()> {
        for (step_name, stale) in map {
            let step_index = self.step_index(step_name)?;
            self.steps[step_index].invalidate(stale);
        }
        Ok(())
    }

    /// Persist Globals and every step's containers under `dir`.
    pub fn store_to_disk(&self, dir: &Path) -> EngineResult<()> {
        let result = self.store_to_disk_inner(dir);
        if let Some(tracer) = &self.tracer {
            tracer.record("store_to_disk", json!({ "dir": dir.display().to_string() }), &result);
        }
        result
    }

    fn store_to_disk_inner(&self, dir: &Path) -> EngineResult<()> {
        self.globals.store_to_disk(dir)?;
        for step in &self.steps {
            step.store_to_disk(dir)?;
        }
        Ok(())
    }

    /// Restore Globals and containers from `dir`; missing files mean a
    /// fresh start for the corresponding piece of state.
    pub fn load_from_disk(&mut self, dir: &Path) -> EngineResult<()> {
        let result = self.load_from_disk_inner(dir);
        if let Some(tracer) = &self.tracer {
            tracer.record("load_from_disk", json!({ "dir": dir.display().to_string() }), &result);
        }
        result
    }

    fn load_from_disk_inner(&mut self, dir: &Path) -> EngineResult<()> {
        self.globals.load_from_disk(dir)?;
        let registry = Arc::clone(&self.registry);
        let resolve = |name: &str| registry.kind(name);
        for step in &mut self.steps {
            step.load_from_disk(dir, &resolve)?;
        }
        Ok(())
    }
}
