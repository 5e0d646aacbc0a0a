use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use revpipe_core::target::{ContainerToTargetsMap, Target};

use crate::{
    artifact_file_name, canonicalize_or_current, open_session, persist_session, sha256_hex,
};

/// Produce an artifact: run the pipeline up to `step_name` for the requested
/// targets and print (and optionally write out) what was produced.
///
/// With no explicit targets, the whole artifact is requested via a wildcard
/// target of the step's artifact kind.
pub fn artifact_command(
    root: &str,
    pipeline: Option<&str>,
    step_name: &str,
    targets: &[String],
    output: Option<&str>,
) -> Result<()> {
    let root = canonicalize_or_current(root)?;
    let mut runner = open_session(&root, pipeline)?;

    let marker = runner
        .step(step_name)?
        .artifact()
        .cloned()
        .ok_or_else(|| anyhow!("Step '{step_name}' does not produce an artifact"))?;

    let mut request = ContainerToTargetsMap::new();
    if targets.is_empty() {
        let kind = runner.registry().kind(&marker.kind)?;
        request.add(marker.container.clone(), Target::all(kind));
    } else {
        for raw in targets {
            let target = runner.registry().parse_target(raw)?;
            if target.kind().name() != marker.kind {
                return Err(anyhow!(
                    "Target '{raw}' is not of the artifact kind '{}' of step '{step_name}'",
                    marker.kind
                ));
            }
            request.add(marker.container.clone(), target);
        }
    }

    let produced = runner.run(step_name, &request).context("Pipeline run failed")?;
    persist_session(&runner, &root)?;

    let container = produced.get(&marker.container)?;
    let mut entries: Vec<(String, String, Vec<u8>)> = Vec::new();
    for target in container.enumerate() {
        let Some(payload) = container.get(&target) else {
            continue;
        };
        let bytes = payload.as_bytes();
        entries.push((target.to_string(), sha256_hex(bytes), bytes.to_vec()));
    }

    // All files land before anything is reported; a failed write removes
    // what already landed, so no partial artifact survives.
    let mut paths: Vec<PathBuf> = Vec::new();
    if let Some(dir) = output {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {dir}"))?;
        for (target, _, bytes) in &entries {
            let path = Path::new(dir).join(artifact_file_name(target));
            if let Err(error) = fs::write(&path, bytes) {
                for written in &paths {
                    let _ = fs::remove_file(written);
                }
                return Err(error)
                    .with_context(|| format!("Failed to write artifact: {}", path.display()));
            }
            paths.push(path);
        }
    }

    println!("Artifact '{}' of step '{step_name}' ({} target(s)):", marker.container, entries.len());
    for (index, (target, digest, _)) in entries.iter().enumerate() {
        println!("  - {target} sha256={digest}");
        if let Some(path) = paths.get(index) {
            println!("    wrote {}", path.display());
        }
    }

    Ok(())
}
