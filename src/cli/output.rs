//! Output formatting for CLI commands.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cli::args::{OutputFormat, PostingsSpillArgs};
use crate::error::Result;
use crate::merge::checkpoint::Checkpoint;
use crate::run::RunManifest;

/// Result structure for a merge.
#[derive(Debug, Serialize, Deserialize)]
pub struct MergeResult {
    pub output: PathBuf,
    pub inputs: usize,
    pub rows: u64,
    pub bytes: u64,
    pub checksum: String,
    pub passes: u32,
    pub runs_merged: u64,
    pub groups_reused: u64,
    pub hint_used: bool,
    pub duration_ms: u64,
    /// Intermediate files left on disk with `--keep-intermediate`.
    pub kept: Vec<PathBuf>,
}

/// Summary of a run file.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub path: PathBuf,
    pub rows: u64,
    pub bytes: u64,
    pub manifest: Option<RunManifest>,
}

/// Result of `inspect`.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InspectResult {
    Run(RunSummary),
    Manifest(RunManifest),
    Checkpoint(Checkpoint),
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(
    message: &str,
    result: &T,
    args: &PostingsSpillArgs,
) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in human-readable format.
fn output_human<T: Serialize>(message: &str, result: &T, args: &PostingsSpillArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!();
    }
    let value = serde_json::to_value(result)?;
    print_human_value(&value, 0);
    Ok(())
}

fn print_human_value(value: &serde_json::Value, indent: usize) {
    let spaces = "  ".repeat(indent);
    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                match val {
                    serde_json::Value::Object(inner) if !inner.is_empty() => {
                        println!("{spaces}{key}:");
                        print_human_value(val, indent + 1);
                    }
                    _ => println!("{spaces}{key}: {}", format_value(val)),
                }
            }
        }
        _ => println!("{spaces}{}", format_value(value)),
    }
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &PostingsSpillArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };

    println!("{json}");
    Ok(())
}

/// Format a JSON value for display.
fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let formatted_values = arr.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{formatted_values}]")
        }
        serde_json::Value::Object(_) => "{}".to_string(),
        serde_json::Value::Null => "-".to_string(),
    }
}
