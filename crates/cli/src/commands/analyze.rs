use anyhow::{Context, Result};

use revpipe_core::diff::{DiffMap, DiffOp};
use revpipe_core::pipe::AnalysisOptions;

use crate::{canonicalize_or_current, open_session, parse_key_value, persist_session};

/// Run one analysis on one step and report the resulting model changes.
pub fn analyze_command(
    root: &str,
    pipeline: Option<&str>,
    step_name: &str,
    analysis_name: &str,
    options: &[String],
    json: bool,
) -> Result<()> {
    let root = canonicalize_or_current(root)?;
    let mut runner = open_session(&root, pipeline)?;

    let mut parsed = AnalysisOptions::new();
    for raw in options {
        let (key, value) = parse_key_value(raw)?;
        parsed.insert(key, value);
    }

    let diffs = runner
        .run_analysis(step_name, analysis_name, &parsed)
        .with_context(|| format!("Analysis '{analysis_name}' failed"))?;
    persist_session(&runner, &root)?;

    report_diffs(&diffs, json)
}

/// Run every analysis of every step, in pipeline order.
pub fn analyze_all_command(root: &str, pipeline: Option<&str>, json: bool) -> Result<()> {
    let root = canonicalize_or_current(root)?;
    let mut runner = open_session(&root, pipeline)?;

    let diffs = runner.run_all_analyses().context("Analysis run failed")?;
    persist_session(&runner, &root)?;

    report_diffs(&diffs, json)
}

fn report_diffs(diffs: &DiffMap, json: bool) -> Result<()> {
    if json {
        let mut document = serde_json::Map::new();
        for (name, diff) in diffs {
            let serialized = diff.serialize()?;
            document.insert(name.clone(), serde_json::from_str(&serialized)?);
        }
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    let changed: Vec<_> = diffs.iter().filter(|(_, diff)| !diff.is_empty()).collect();
    if changed.is_empty() {
        println!("No changes.");
        return Ok(());
    }
    for (name, diff) in changed {
        let entries = &diff.tree().entries;
        println!("Global '{}' ({} change(s)):", name, entries.len());
        for entry in entries {
            let symbol = match entry.op {
                DiffOp::Add(_) => '+',
                DiffOp::Remove(_) => '-',
                DiffOp::Change { .. } => '~',
            };
            println!("  {} {}", symbol, entry.path.join("/"));
        }
    }
    Ok(())
}
