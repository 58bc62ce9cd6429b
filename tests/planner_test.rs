use std::cell::RefCell;
use std::path::{Path, PathBuf};

use postings_spill::context::SpillContext;
use postings_spill::error::{Result, SpillError};
use postings_spill::merge::checkpoint::Checkpoint;
use postings_spill::merge::{
    HintOptions, PlannerOptions, RowComparator, merge_runs_with_planner,
    merge_runs_with_planner_with,
};
use postings_spill::postings::{PostingRow, Postings};
use postings_spill::run::{JsonlRunSource, RowIter, RunSource, read_manifest, write_run_file};
use postings_spill::storage::WriteOptions;
use rand::Rng;
use tempfile::TempDir;

/// Records every run it opens and optionally refuses one path.
struct RecordingSource {
    fail_on: Option<PathBuf>,
    opened: RefCell<Vec<PathBuf>>,
}

impl RecordingSource {
    fn new(fail_on: Option<PathBuf>) -> Self {
        RecordingSource {
            fail_on,
            opened: RefCell::new(Vec::new()),
        }
    }

    fn opened(&self, path: &Path) -> bool {
        self.opened.borrow().iter().any(|p| p == path)
    }
}

impl RunSource<PostingRow> for RecordingSource {
    fn open(&self, path: &Path) -> Result<RowIter<PostingRow>> {
        self.opened.borrow_mut().push(path.to_path_buf());
        if self.fail_on.as_deref() == Some(path) {
            return Err(SpillError::other(format!("injected failure opening {}", path.display())));
        }
        JsonlRunSource.open(path)
    }
}

fn random_runs(ctx: &SpillContext, dir: &Path, count: usize) -> Vec<PathBuf> {
    let mut rng = rand::rng();
    (0..count)
        .map(|i| {
            let mut rows: Vec<PostingRow> = (0..25)
                .map(|_| {
                    let key = format!("k{:03}", rng.random_range(0..60));
                    PostingRow::new(key, Postings::Ids(vec![i as u64]))
                })
                .collect();
            rows.sort_by(|a, b| a.key.cmp(&b.key));
            let path = dir.join(format!("run-{i:03}.jsonl"));
            write_run_file(ctx, &path, rows, &WriteOptions::default()).unwrap();
            path
        })
        .collect()
}

#[test]
fn test_fan_in_does_not_change_output() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let ctx = SpillContext::new();
    let runs = random_runs(&ctx, dir.path(), 11);
    let comparator = RowComparator::by_key();

    let narrow = PlannerOptions {
        max_open_runs: 2,
        temp_dir: Some(dir.path().join("narrow")),
        ..PlannerOptions::new(dir.path().join("narrow.jsonl"))
    };
    let wide = PlannerOptions {
        max_open_runs: 1000,
        ..PlannerOptions::new(dir.path().join("wide.jsonl"))
    };

    let mut narrow_outcome = merge_runs_with_planner(&ctx, &runs, &comparator, &narrow)?;
    let mut wide_outcome = merge_runs_with_planner(&ctx, &runs, &comparator, &wide)?;

    assert_eq!(
        std::fs::read(&narrow_outcome.output_path)?,
        std::fs::read(&wide_outcome.output_path)?
    );
    assert_eq!(narrow_outcome.stats.checksum, wide_outcome.stats.checksum);
    assert_eq!(narrow_outcome.stats.passes, 3);
    assert_eq!(wide_outcome.stats.passes, 0);
    assert_eq!(narrow_outcome.stats.rows, 11 * 25);

    narrow_outcome.cleanup.cleanup()?;
    wide_outcome.cleanup.cleanup()?;
    assert!(!dir.path().join("narrow").exists());
    Ok(())
}

#[test]
fn test_intermediate_manifests_record_sources() {
    let dir = TempDir::new().unwrap();
    let ctx = SpillContext::new();
    let runs = random_runs(&ctx, dir.path(), 3);
    let options = PlannerOptions {
        max_open_runs: 2,
        run_prefix: "chargram_postings".to_string(),
        ..PlannerOptions::new(dir.path().join("out.jsonl"))
    };

    let outcome = merge_runs_with_planner(&ctx, &runs, &RowComparator::by_key(), &options).unwrap();
    let manifest_path = dir
        .path()
        .join("chargram_postings.pass-00.run-000.jsonl.meta.json");
    let manifest = read_manifest(&manifest_path).unwrap();

    assert_eq!(manifest.version, 1);
    assert_eq!(manifest.format, "jsonl");
    assert_eq!(manifest.compare_id.as_deref(), Some("key"));
    assert_eq!(manifest.rows, Some(50));
    assert_eq!(
        manifest.path.as_deref(),
        Some("chargram_postings.pass-00.run-000.jsonl")
    );
    assert_eq!(manifest.sources.map(|s| s.len()), Some(2));
    assert!(manifest.created_at.ends_with('Z'));
    drop(outcome);
    assert!(!manifest_path.exists());
}

#[test]
fn test_resume_skips_completed_groups() {
    let dir = TempDir::new().unwrap();
    let ctx = SpillContext::new();
    let runs = random_runs(&ctx, dir.path(), 6);
    let comparator = RowComparator::by_key();
    let scratch = dir.path().join("scratch");
    let checkpoint_path = dir.path().join("merge.checkpoint.json");
    let options = PlannerOptions {
        max_open_runs: 2,
        temp_dir: Some(scratch.clone()),
        checkpoint_path: Some(checkpoint_path.clone()),
        ..PlannerOptions::new(dir.path().join("out.jsonl"))
    };

    // Group 1 of pass 0 fails after group 0 completed.
    let failing = RecordingSource::new(Some(runs[2].clone()));
    let err = merge_runs_with_planner_with(&ctx, &failing, &runs, &comparator, &options);
    assert!(matches!(err, Err(SpillError::Other(_))));

    let first_group = scratch.join("merge.pass-00.run-000.jsonl");
    assert!(first_group.exists());
    assert!(!options.output_path.exists());
    let checkpoint = Checkpoint::load(&checkpoint_path).unwrap();
    assert!(checkpoint.completed(0, 0).is_some());
    assert!(checkpoint.completed(0, 1).is_none());

    let counting = RecordingSource::new(None);
    let mut outcome =
        merge_runs_with_planner_with(&ctx, &counting, &runs, &comparator, &options).unwrap();
    assert!(!counting.opened(&runs[0]));
    assert!(!counting.opened(&runs[1]));
    assert!(counting.opened(&runs[2]));
    assert!(counting.opened(&first_group));
    assert_eq!(outcome.stats.groups_reused, 1);

    let reference = dir.path().join("reference.jsonl");
    let wide = PlannerOptions {
        max_open_runs: 100,
        ..PlannerOptions::new(&reference)
    };
    merge_runs_with_planner(&ctx, &runs, &comparator, &wide).unwrap();
    assert_eq!(
        std::fs::read(&outcome.output_path).unwrap(),
        std::fs::read(&reference).unwrap()
    );

    outcome.cleanup.cleanup().unwrap();
    assert!(!first_group.exists());
    assert!(!checkpoint_path.exists());
}

#[test]
fn test_stale_checkpoint_entry_is_rebuilt() {
    let dir = TempDir::new().unwrap();
    let ctx = SpillContext::new();
    let runs = random_runs(&ctx, dir.path(), 4);
    let comparator = RowComparator::by_key();
    let checkpoint_path = dir.path().join("merge.checkpoint.json");
    let options = PlannerOptions {
        max_open_runs: 2,
        checkpoint_path: Some(checkpoint_path.clone()),
        ..PlannerOptions::new(dir.path().join("out.jsonl"))
    };

    let failing = RecordingSource::new(Some(runs[2].clone()));
    assert!(merge_runs_with_planner_with(&ctx, &failing, &runs, &comparator, &options).is_err());
    std::fs::remove_file(dir.path().join("merge.pass-00.run-000.jsonl")).unwrap();

    let counting = RecordingSource::new(None);
    let outcome =
        merge_runs_with_planner_with(&ctx, &counting, &runs, &comparator, &options).unwrap();
    assert!(counting.opened(&runs[0]));
    assert_eq!(outcome.stats.groups_reused, 0);
    assert_eq!(outcome.stats.rows, 100);
}

#[test]
fn test_checkpoint_from_other_runs_is_ignored() {
    let dir = TempDir::new().unwrap();
    let ctx = SpillContext::new();
    let comparator = RowComparator::by_key();
    let old_dir = dir.path().join("old");
    let new_dir = dir.path().join("new");
    std::fs::create_dir_all(&old_dir).unwrap();
    std::fs::create_dir_all(&new_dir).unwrap();
    let old_runs = random_runs(&ctx, &old_dir, 4);
    let checkpoint_path = dir.path().join("merge.checkpoint.json");
    let options = PlannerOptions {
        max_open_runs: 2,
        temp_dir: Some(dir.path().join("scratch")),
        checkpoint_path: Some(checkpoint_path.clone()),
        ..PlannerOptions::new(dir.path().join("out.jsonl"))
    };

    let failing = RecordingSource::new(Some(old_runs[2].clone()));
    assert!(merge_runs_with_planner_with(&ctx, &failing, &old_runs, &comparator, &options).is_err());
    assert!(Checkpoint::load(&checkpoint_path).unwrap().completed(0, 0).is_some());

    let new_runs: Vec<PathBuf> = random_runs(&ctx, &new_dir, 5)
        .into_iter()
        .enumerate()
        .map(|(i, path)| {
            let renamed = new_dir.join(format!("fresh-{i:03}.jsonl"));
            std::fs::rename(&path, &renamed).unwrap();
            renamed
        })
        .collect();
    let counting = RecordingSource::new(None);
    let outcome =
        merge_runs_with_planner_with(&ctx, &counting, &new_runs, &comparator, &options).unwrap();
    assert_eq!(outcome.stats.groups_reused, 0);
    assert!(counting.opened(&new_runs[0]));
    assert!(!old_runs.iter().any(|run| counting.opened(run)));

    let reference = dir.path().join("reference.jsonl");
    let wide = PlannerOptions {
        max_open_runs: 100,
        ..PlannerOptions::new(&reference)
    };
    merge_runs_with_planner(&ctx, &new_runs, &comparator, &wide).unwrap();
    assert_eq!(
        std::fs::read(&outcome.output_path).unwrap(),
        std::fs::read(&reference).unwrap()
    );
}

#[test]
fn test_hint_cache_is_reused() {
    let dir = TempDir::new().unwrap();
    let ctx = SpillContext::new();
    let runs = random_runs(&ctx, dir.path(), 9);
    let comparator = RowComparator::by_key();
    let options = PlannerOptions {
        max_open_runs: 3,
        temp_dir: Some(dir.path().join("scratch")),
        hints: Some(HintOptions {
            cache_path: dir.path().join("planner-hints.json"),
            label: "phrase_postings".to_string(),
            input_key: Some("build-1".to_string()),
        }),
        ..PlannerOptions::new(dir.path().join("out.jsonl"))
    };

    let first = merge_runs_with_planner(&ctx, &runs, &comparator, &options).unwrap();
    assert!(!first.hint_used);
    assert_eq!(first.plan.groups_per_pass, vec![3]);
    let first_bytes = std::fs::read(&first.output_path).unwrap();
    drop(first);

    let second = merge_runs_with_planner(&ctx, &runs, &comparator, &options).unwrap();
    assert!(second.hint_used);
    assert_eq!(second.plan.groups_per_pass, vec![3]);
    assert_eq!(std::fs::read(&second.output_path).unwrap(), first_bytes);
}
