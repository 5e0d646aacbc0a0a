use anyhow::Result;

use crate::{canonicalize_or_current, load_description, open_session};

/// Show the pipeline layout and what each step currently has materialized.
pub fn describe_command(root: &str, pipeline: Option<&str>, json: bool) -> Result<()> {
    let root = canonicalize_or_current(root)?;
    let description = load_description(&root, pipeline)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&description)?);
        return Ok(());
    }

    println!("Pipeline ({} step(s)):", description.steps.len());
    for step in &description.steps {
        println!("  - {}", step.name);
        if !step.pipes.is_empty() {
            println!("      pipes: {}", step.pipes.join(", "));
        }
        if !step.analyses.is_empty() {
            println!("      analyses: {}", step.analyses.join(", "));
        }
        if let Some(artifact) = &step.artifact {
            println!("      artifact: {} ({})", artifact.container, artifact.kind);
        }
    }

    println!("Containers ({}):", description.containers.len());
    for container in &description.containers {
        println!(
            "  - {} [{}] kinds: {}",
            container.name,
            container.factory,
            container.kinds.join(", ")
        );
    }

    // Session state, if any has been persisted at this root.
    let runner = open_session(&root, pipeline)?;
    println!("Materialized targets:");
    for (step_name, held) in runner.current_state() {
        let count: usize = held.iter().map(|(_, targets)| targets.len()).sum();
        println!("  - {step_name}: {count}");
    }

    Ok(())
}
