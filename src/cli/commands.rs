//! Command implementations for the postings-spill CLI.

use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use serde_json::Value;

use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::PostingsConfig;
use crate::context::SpillContext;
use crate::error::{Result, SpillError};
use crate::merge::checkpoint::Checkpoint;
use crate::merge::engine::RowComparator;
use crate::merge::planner::{HintOptions, PlannerOptions, merge_runs_with_planner};
use crate::run::{manifest_path_for, read_manifest, read_run};

/// Execute a CLI command.
pub fn execute_command(args: PostingsSpillArgs) -> Result<()> {
    match &args.command {
        Command::Merge(merge_args) => merge_runs(merge_args.clone(), &args),
        Command::Inspect(inspect_args) => inspect(inspect_args.clone(), &args),
    }
}

fn value_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over optional JSON values.
///
/// Missing sorts first, then values by type (null, bool, number, string,
/// array, object). Strings compare byte-wise and numbers numerically.
pub fn compare_json_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
        (Some(a), Some(b)) => (a, b),
    };
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_u64(), y.as_u64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.total_cmp(&y)
                }
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => value_rank(a)
            .cmp(&value_rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

/// Comparator ordering JSON rows by one field.
pub fn field_comparator(field: &str) -> RowComparator<Value> {
    let key = field.to_string();
    RowComparator::new(move |a: &Value, b: &Value| {
        compare_json_values(a.get(key.as_str()), b.get(key.as_str()))
    })
    .with_id(format!("field:{field}"))
}

fn load_config(path: Option<&Path>) -> Result<PostingsConfig> {
    let Some(path) = path else {
        return Ok(PostingsConfig::default());
    };
    let config = PostingsConfig::load(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    Ok(config)
}

/// Merge sorted runs.
fn merge_runs(args: MergeArgs, cli_args: &PostingsSpillArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    for input in &args.inputs {
        if !input.is_file() {
            return Err(SpillError::invalid_argument(format!(
                "input run not found: {}",
                input.display()
            )));
        }
    }

    if cli_args.verbosity() > 1 {
        println!(
            "Merging {} runs into {}",
            args.inputs.len(),
            args.output.display()
        );
    }

    let start_time = Instant::now();
    let comparator = field_comparator(&args.key)
        .validated(args.validate_comparator || config.validate_comparator);
    let options = PlannerOptions {
        max_open_runs: args.max_open_runs.unwrap_or(config.max_open_runs),
        temp_dir: args.temp_dir.clone(),
        checkpoint_path: args.checkpoint.clone(),
        write: config.write_options(),
        hints: args.hints.clone().map(|cache_path| HintOptions {
            cache_path,
            label: "merge".to_string(),
            input_key: Some(args.key.clone()),
        }),
        ..PlannerOptions::new(&args.output)
    };

    let ctx = SpillContext::new();
    let mut outcome = merge_runs_with_planner(&ctx, &args.inputs, &comparator, &options)
        .with_context(|| format!("failed to merge into {}", args.output.display()))?;
    let kept = if args.keep_intermediate {
        outcome.cleanup.keep()
    } else {
        outcome.cleanup.cleanup()?;
        Vec::new()
    };

    output_result(
        "Runs merged successfully",
        &MergeResult {
            output: outcome.output_path.clone(),
            inputs: args.inputs.len(),
            rows: outcome.stats.rows,
            bytes: outcome.stats.bytes,
            checksum: format!("{:08x}", outcome.stats.checksum),
            passes: outcome.stats.passes,
            runs_merged: outcome.stats.runs_merged,
            groups_reused: outcome.stats.groups_reused,
            hint_used: outcome.hint_used,
            duration_ms: start_time.elapsed().as_millis() as u64,
            kept,
        },
        cli_args,
    )?;

    Ok(())
}

/// Summarize a run, manifest or checkpoint.
fn inspect(args: InspectArgs, cli_args: &PostingsSpillArgs) -> Result<()> {
    let result = inspect_path(&args.path)?;
    output_result(&format!("{}", args.path.display()), &result, cli_args)
}

fn inspect_path(path: &Path) -> Result<InspectResult> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if name.ends_with(".meta.json") {
        return Ok(InspectResult::Manifest(read_manifest(path)?));
    }

    if name.ends_with(".jsonl") {
        let mut rows = 0u64;
        for row in read_run::<Value>(path)? {
            row?;
            rows += 1;
        }
        let bytes = fs::metadata(path)
            .map_err(|e| SpillError::file_io(path, e))?
            .len();
        let manifest_path = manifest_path_for(path);
        let manifest = if manifest_path.exists() {
            Some(read_manifest(&manifest_path)?)
        } else {
            None
        };
        return Ok(InspectResult::Run(RunSummary {
            path: path.to_path_buf(),
            rows,
            bytes,
            manifest,
        }));
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let checkpoint: Checkpoint = serde_json::from_str(&raw)?;
    Ok(InspectResult::Checkpoint(checkpoint))
}
