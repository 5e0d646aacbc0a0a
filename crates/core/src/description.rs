//! Declarative pipeline descriptions.
//!
//! A description is the YAML document naming the containers, the step chain,
//! and which registered pipes and analyses each step runs. Everything is
//! referenced by name; `build` resolves the names against a registry and
//! produces a ready `Runner`.
//!
//! Every step carries the full declared container set. A step's committed
//! state conceptually extends its predecessor's, so downstream steps need
//! somewhere to hold the upstream artifacts that flow through them.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::global::GlobalsMap;
use crate::registry::Registry;
use crate::runner::Runner;
use crate::step::{ArtifactMarker, Step};

use std::collections::BTreeSet;
use std::sync::Arc;

/// The stock reverse-engineering pipeline shipped with the engine.
pub const DEFAULT_PIPELINE: &str = "\
containers:
  - name: input
    type: text
    kinds: [binary]
  - name: module
    type: text
    kinds: [binary]
  - name: isolated
    type: text
    kinds: [function]
  - name: decompiled
    type: text
    kinds: [function]
steps:
  - name: import
    pipes: [import-binary]
    analyses: [rename-function, normalize-function-names]
  - name: lift
    pipes: [lift]
    artifact:
      container: module
      kind: binary
  - name: isolate
    pipes: [isolate]
    artifact:
      container: isolated
      kind: function
  - name: decompile
    pipes: [decompile]
    artifact:
      container: decompiled
      kind: function
";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub factory: String,
    pub kinds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescription {
    pub container: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescription {
    pub name: String,
    #[serde(default)]
    pub pipes: Vec<String>,
    #[serde(default)]
    pub analyses: Vec<String>,
    #[serde(default)]
    pub artifact: Option<ArtifactDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDescription {
    pub containers: Vec<ContainerDescription>,
    pub steps: Vec<StepDescription>,
}

impl PipelineDescription {
    /// Parse a YAML description. Malformed documents are configuration
    /// errors, not panics.
    pub fn from_yaml(text: &str) -> EngineResult<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| EngineError::Configuration(format!("malformed pipeline description: {e}")))
    }

    pub fn to_yaml(&self) -> EngineResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| EngineError::Configuration(format!("unserializable description: {e}")))
    }

    /// Resolve every name against `registry` and assemble the runner.
    pub fn build(&self, registry: Arc<Registry>, globals: GlobalsMap) -> EngineResult<Runner> {
        self.validate(&registry)?;

        let mut runner = Runner::new(Arc::clone(&registry), globals);
        for step_description in &self.steps {
            let mut containers = crate::container::ContainerSet::new();
            for container_description in &self.containers {
                containers.add(registry.make_container(
                    &container_description.factory,
                    &container_description.name,
                    &container_description.kinds,
                )?);
            }

            let mut step = Step::new(&step_description.name, containers);
            for pipe_name in &step_description.pipes {
                step.add_pipe(Arc::clone(registry.pipe(pipe_name)?));
            }
            for analysis_name in &step_description.analyses {
                step.add_analysis(Arc::clone(registry.analysis(analysis_name)?));
            }
            if let Some(artifact) = &step_description.artifact {
                step.set_artifact(ArtifactMarker {
                    container: artifact.container.clone(),
                    kind: artifact.kind.clone(),
                });
            }
            runner.add_step(step);
        }
        Ok(runner)
    }

    fn validate(&self, registry: &Registry) -> EngineResult<()> {
        let mut container_names = BTreeSet::new();
        for container in &self.containers {
            if !container_names.insert(container.name.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "container '{}' declared twice",
                    container.name
                )));
            }
            for kind in &container.kinds {
                registry.kind(kind)?;
            }
        }

        let mut step_names = BTreeSet::new();
        for step in &self.steps {
            if !step_names.insert(step.name.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "step '{}' declared twice",
                    step.name
                )));
            }
            if let Some(artifact) = &step.artifact {
                let declared = self
                    .containers
                    .iter()
                    .find(|c| c.name == artifact.container)
                    .ok_or_else(|| {
                        EngineError::Configuration(format!(
                            "step '{}' marks artifact container '{}' which is not declared",
                            step.name, artifact.container
                        ))
                    })?;
                registry.kind(&artifact.kind)?;
                if !declared.kinds.contains(&artifact.kind) {
                    return Err(EngineError::Configuration(format!(
                        "artifact kind '{}' is not accepted by container '{}'",
                        artifact.kind, artifact.container
                    )));
                }
            }
        }
        Ok(())
    }
}
