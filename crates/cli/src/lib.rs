use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use revpipe_core::description::{PipelineDescription, DEFAULT_PIPELINE};
use revpipe_core::registry::{default_globals, default_registry};
use revpipe_core::runner::Runner;

pub mod commands;

/// File name of the pipeline description inside a session root.
pub const PIPELINE_FILE: &str = "pipeline.yml";

/// Canonicalize the root path if possible, falling back to the given string
/// relative to the current working directory.
pub fn canonicalize_or_current(root: &str) -> Result<PathBuf> {
    let path = Path::new(root);
    if path == Path::new(".") {
        Ok(env::current_dir().context("Failed to get current directory")?)
    } else {
        // Try to canonicalize; if it fails (e.g., path does not yet exist),
        // join it with the current dir to get an absolute path.
        match path.canonicalize() {
            Ok(p) => Ok(p),
            Err(_) => {
                let cwd = env::current_dir().context("Failed to get current directory")?;
                Ok(cwd.join(path))
            }
        }
    }
}

/// Compute the SHA-256 digest of a payload and return it as a hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Resolve the pipeline description for a session.
///
/// Precedence: an explicit `--pipeline` path, then `<root>/pipeline.yml`,
/// then the builtin default pipeline.
pub fn load_description(root: &Path, pipeline: Option<&str>) -> Result<PipelineDescription> {
    let text = match pipeline {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline description: {path}"))?,
        None => {
            let default_path = root.join(PIPELINE_FILE);
            if default_path.exists() {
                fs::read_to_string(&default_path).with_context(|| {
                    format!("Failed to read pipeline description: {}", default_path.display())
                })?
            } else {
                DEFAULT_PIPELINE.to_string()
            }
        }
    };
    PipelineDescription::from_yaml(&text).context("Invalid pipeline description")
}

/// Build the runner for a session root and restore its persisted state.
///
/// A root with no persisted state yields a fresh session; the directory is
/// created on the first persist.
pub fn open_session(root: &Path, pipeline: Option<&str>) -> Result<Runner> {
    let description = load_description(root, pipeline)?;
    let mut runner = description
        .build(default_registry(), default_globals())
        .context("Failed to assemble the pipeline")?;
    runner.load_from_disk(root).with_context(|| {
        format!("Failed to restore pipeline state from {}", root.display())
    })?;
    Ok(runner)
}

/// Persist the session state back under the root directory.
pub fn persist_session(runner: &Runner, root: &Path) -> Result<()> {
    fs::create_dir_all(root)
        .with_context(|| format!("Failed to create session root: {}", root.display()))?;
    runner
        .store_to_disk(root)
        .with_context(|| format!("Failed to persist pipeline state to {}", root.display()))?;
    Ok(())
}

/// Parse a `key=value` analysis option argument.
pub fn parse_key_value(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Option '{raw}' is not of the form key=value"))?;
    Ok((key.to_string(), value.to_string()))
}

/// Turn a serialized target into a name safe to use as a file name.
pub fn artifact_file_name(target: &str) -> String {
    target.replace(['/', ':'], "_")
}
