use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use postings_spill::context::SpillContext;
use postings_spill::error::SpillError;
use postings_spill::merge::{RowComparator, merge_sorted_runs, merge_sorted_runs_to_file};
use postings_spill::run::{read_run, write_run_file};
use postings_spill::storage::WriteOptions;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TokenRow {
    token: String,
    src: String,
}

fn row(token: &str, src: &str) -> TokenRow {
    TokenRow {
        token: token.to_string(),
        src: src.to_string(),
    }
}

fn by_token() -> RowComparator<TokenRow> {
    RowComparator::new(|a: &TokenRow, b: &TokenRow| a.token.cmp(&b.token)).with_id("token")
}

fn write_runs(ctx: &SpillContext, dir: &Path, runs: Vec<Vec<TokenRow>>) -> Vec<PathBuf> {
    runs.into_iter()
        .enumerate()
        .map(|(i, rows)| {
            let path = dir.join(format!("r{i}.jsonl"));
            write_run_file(ctx, &path, rows, &WriteOptions::default()).unwrap();
            path
        })
        .collect()
}

fn three_runs(ctx: &SpillContext, dir: &Path) -> Vec<PathBuf> {
    write_runs(
        ctx,
        dir,
        vec![
            vec![row("a", "r0-0"), row("c", "r0-1")],
            vec![row("a", "r1-0"), row("b", "r1-1")],
            vec![row("a", "r2-0"), row("d", "r2-1")],
        ],
    )
}

#[test]
fn test_ties_follow_run_order() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let ctx = SpillContext::new();
    let runs = three_runs(&ctx, dir.path());

    let sources: Vec<String> = merge_sorted_runs(&runs, &by_token())?
        .map(|r| r.map(|row| row.src))
        .collect::<Result<_, _>>()?;

    assert_eq!(sources, vec!["r0-0", "r1-0", "r2-0", "r1-1", "r0-1", "r2-1"]);
    Ok(())
}

#[test]
fn test_merge_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let ctx = SpillContext::new();
    let mut rng = rand::rng();

    let runs: Vec<Vec<TokenRow>> = (0..6)
        .map(|r| {
            let mut rows: Vec<TokenRow> = (0..40)
                .map(|i| row(&format!("t{:02}", rng.random_range(0..15)), &format!("r{r}-{i}")))
                .collect();
            rows.sort_by(|a, b| a.token.cmp(&b.token));
            rows
        })
        .collect();
    let runs = write_runs(&ctx, dir.path(), runs);

    let first = dir.path().join("first.jsonl");
    let second = dir.path().join("second.jsonl");
    let options = WriteOptions::default();
    let stats_a = merge_sorted_runs_to_file(&ctx, &runs, &first, &by_token(), &options)?;
    let stats_b = merge_sorted_runs_to_file(&ctx, &runs, &second, &by_token(), &options)?;

    assert_eq!(std::fs::read(&first)?, std::fs::read(&second)?);
    assert_eq!(stats_a.checksum, stats_b.checksum);
    assert_eq!(stats_a.rows, 240);
    Ok(())
}

#[test]
fn test_round_trip_preserves_duplicates() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let ctx = SpillContext::new();
    let rows = vec![row("a", "1"), row("a", "1"), row("b", "2"), row("b", "2")];
    let path = dir.path().join("dups.jsonl");
    write_run_file(&ctx, &path, rows.clone(), &WriteOptions::default())?;

    let read: Vec<TokenRow> = read_run(&path)?.collect::<Result<_, _>>()?;
    assert_eq!(read, rows);

    let merged: Vec<TokenRow> = merge_sorted_runs(&[&path], &by_token())?.collect::<Result<_, _>>()?;
    assert_eq!(merged, rows);
    Ok(())
}

#[test]
fn test_inconsistent_comparator_fails_merge() {
    let dir = TempDir::new().unwrap();
    let ctx = SpillContext::new();
    let runs = three_runs(&ctx, dir.path());

    let broken = RowComparator::new(|_: &TokenRow, _: &TokenRow| Ordering::Greater).validated(true);
    let result = merge_sorted_runs(&runs, &broken)
        .and_then(|merged| merged.collect::<Result<Vec<_>, _>>());
    assert!(matches!(result, Err(SpillError::ComparatorInvariant(_))));

    let output = dir.path().join("out.jsonl");
    let result = merge_sorted_runs_to_file(&ctx, &runs, &output, &broken, &WriteOptions::default());
    assert!(matches!(result, Err(SpillError::ComparatorInvariant(_))));
    assert!(!output.exists());
}

#[test]
fn test_corrupt_run_reports_line() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.jsonl");
    std::fs::write(&path, "{\"token\":\"a\",\"src\":\"x\"}\n\n{oops\n").unwrap();

    let merged = merge_sorted_runs::<TokenRow, _>(&[&path], &by_token()).unwrap();
    let results: Vec<_> = merged.collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    match &results[1] {
        Err(SpillError::Parse { line, .. }) => assert_eq!(*line, 3),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn test_missing_run_is_an_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.jsonl");
    let result = merge_sorted_runs::<TokenRow, _>(&[&missing], &by_token());
    assert!(result.is_err());
}
