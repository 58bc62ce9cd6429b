//! Command line argument parsing for the postings-spill CLI using clap.

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// postings-spill - external merge tools for sorted JSONL runs
#[derive(Parser, Debug, Clone)]
#[command(name = "postings-spill")]
#[command(about = "Merge and inspect sorted JSONL spill runs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct PostingsSpillArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl PostingsSpillArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Merge sorted JSONL runs into one sorted file
    Merge(MergeArgs),

    /// Print a run, manifest or checkpoint summary
    Inspect(InspectArgs),
}

/// Arguments for merging runs
#[derive(Parser, Debug, Clone)]
pub struct MergeArgs {
    /// Sorted input runs, merged in the given order on ties
    #[arg(value_name = "RUN", required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output file
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Field of each row to order by
    #[arg(short, long, default_value = "key")]
    pub key: String,

    /// Maximum runs open at once (overrides the config file)
    #[arg(long)]
    pub max_open_runs: Option<usize>,

    /// Scratch directory for intermediate runs
    #[arg(long, value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Checkpoint file for resuming an interrupted merge
    #[arg(long, value_name = "FILE")]
    pub checkpoint: Option<PathBuf>,

    /// Planner hint cache file
    #[arg(long, value_name = "FILE")]
    pub hints: Option<PathBuf>,

    /// Check comparator antisymmetry while merging
    #[arg(long)]
    pub validate_comparator: bool,

    /// Keep intermediate runs, manifests and the checkpoint
    #[arg(long)]
    pub keep_intermediate: bool,

    /// Configuration file (JSON)
    #[arg(short, long, value_name = "CONFIG_FILE")]
    pub config: Option<PathBuf>,
}

/// Arguments for inspecting a file
#[derive(Parser, Debug, Clone)]
pub struct InspectArgs {
    /// Run (.jsonl), manifest (.meta.json) or checkpoint file
    #[arg(value_name = "FILE")]
    pub path: PathBuf,
}

/// Output formats for CLI
#[derive(ValueEnum, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_args() {
        let args = PostingsSpillArgs::try_parse_from([
            "postings-spill",
            "merge",
            "a.jsonl",
            "b.jsonl",
            "-o",
            "out.jsonl",
            "--max-open-runs",
            "8",
            "--temp-dir",
            "/tmp/scratch",
            "--keep-intermediate",
        ])
        .unwrap();

        if let Command::Merge(merge_args) = args.command {
            assert_eq!(
                merge_args.inputs,
                vec![PathBuf::from("a.jsonl"), PathBuf::from("b.jsonl")]
            );
            assert_eq!(merge_args.output, PathBuf::from("out.jsonl"));
            assert_eq!(merge_args.key, "key");
            assert_eq!(merge_args.max_open_runs, Some(8));
            assert_eq!(merge_args.temp_dir, Some(PathBuf::from("/tmp/scratch")));
            assert!(merge_args.keep_intermediate);
            assert!(!merge_args.validate_comparator);
        } else {
            panic!("Expected Merge command");
        }
    }

    #[test]
    fn test_merge_requires_inputs() {
        assert!(PostingsSpillArgs::try_parse_from(["postings-spill", "merge", "-o", "out"]).is_err());
    }

    #[test]
    fn test_verbosity_levels() {
        let args = PostingsSpillArgs::try_parse_from(["postings-spill", "inspect", "x"]).unwrap();
        assert_eq!(args.verbosity(), 1);

        let args =
            PostingsSpillArgs::try_parse_from(["postings-spill", "-vv", "inspect", "x"]).unwrap();
        assert_eq!(args.verbosity(), 2);

        let args =
            PostingsSpillArgs::try_parse_from(["postings-spill", "--quiet", "inspect", "x"])
                .unwrap();
        assert_eq!(args.verbosity(), 0);
    }

    #[test]
    fn test_output_format() {
        let args =
            PostingsSpillArgs::try_parse_from(["postings-spill", "--format", "json", "inspect", "x"])
                .unwrap();
        assert!(matches!(args.output_format, OutputFormat::Json));
    }
}
