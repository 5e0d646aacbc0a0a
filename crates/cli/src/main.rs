use anyhow::Result;
use clap::{Parser, Subcommand};
use revpipe::commands::{
    analyze_all_command, analyze_command, artifact_command, describe_command, import_model_command,
};

/// Incremental artifact pipeline for binary reverse engineering.
///
/// This CLI is a thin wrapper around `revpipe-core` (exposed in code as
/// `revpipe_core`). All substantive logic lives in the library so it can be
/// tested thoroughly and reused from other frontends.
#[derive(Parser, Debug)]
#[command(
    name = "revpipe",
    version,
    about = "Incremental artifact pipeline for binary reverse engineering",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the pipeline layout and the materialized state of a session.
    Describe {
        /// Session root directory. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Pipeline description file. Defaults to `<root>/pipeline.yml`, then
        /// the builtin pipeline.
        #[arg(long)]
        pipeline: Option<String>,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Import a model document (JSON) into the session.
    ///
    /// Cached artifacts invalidated by the model change are dropped and will
    /// be recomputed on the next request.
    ImportModel {
        /// Session root directory. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Pipeline description file.
        #[arg(long)]
        pipeline: Option<String>,

        /// Path to the model JSON file.
        #[arg(long)]
        path: String,
    },

    /// Produce an artifact: run the pipeline up to a step and print what it
    /// yields for the requested targets.
    Artifact {
        /// Session root directory. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Pipeline description file.
        #[arg(long)]
        pipeline: Option<String>,

        /// Directory to write one file per produced target into.
        #[arg(long)]
        output: Option<String>,

        /// The artifact-producing step to run up to.
        step: String,

        /// Targets in `path:kind` syntax (e.g. `0x1000:function`). Defaults
        /// to everything of the step's artifact kind.
        targets: Vec<String>,
    },

    /// Run one analysis of one step against the current model.
    Analyze {
        /// Session root directory. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Pipeline description file.
        #[arg(long)]
        pipeline: Option<String>,

        /// Analysis options as `key=value` pairs.
        #[arg(long = "option", short = 'o')]
        options: Vec<String>,

        /// Emit the resulting diff as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,

        /// The step the analysis is registered on.
        step: String,

        /// The analysis to run.
        analysis: String,
    },

    /// Run every analysis of every step, in pipeline order.
    AnalyzeAll {
        /// Session root directory. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Pipeline description file.
        #[arg(long)]
        pipeline: Option<String>,

        /// Emit the resulting diff as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Describe { root, pipeline, json } => {
            describe_command(&root, pipeline.as_deref(), json)?
        }
        Command::ImportModel { root, pipeline, path } => {
            import_model_command(&root, pipeline.as_deref(), &path)?
        }
        Command::Artifact { root, pipeline, output, step, targets } => {
            artifact_command(&root, pipeline.as_deref(), &step, &targets, output.as_deref())?
        }
        Command::Analyze { root, pipeline, options, json, step, analysis } => {
            analyze_command(&root, pipeline.as_deref(), &step, &analysis, &options, json)?
        }
        Command::AnalyzeAll { root, pipeline, json } => {
            analyze_all_command(&root, pipeline.as_deref(), json)?
        }
    }

    Ok(())
}
