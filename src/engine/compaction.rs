//! Background compaction: table selection, k-way merge, atomic swap.
//!
//! A single long-lived worker waits on the engine's condvar for a flush
//! signal (not a polling sleep), then drains compaction jobs until none
//! remain. Each job merges a set of overlapping tables into the next level
//! down:
//!
//! - level 0 compacts when it accumulates `l0_compaction_trigger` tables;
//!   all level-0 tables plus every overlapping level-1 table are merged
//!   into level 1.
//! - level n (n >= 1) compacts when its bytes exceed
//!   `base_level_bytes * level_size_multiplier^(n-1)`; the oldest table
//!   plus every overlapping level-n+1 table are merged down.
//!
//! The merge runs without the engine lock: inputs are immutable and held by
//! `Arc`, so foreground flushes may append new level-0 tables concurrently.
//! Only the final swap (remove inputs by id, insert outputs) takes the
//! write lock. Input files are doomed after the swap and unlinked when the
//! last in-flight read drops its handle.
//!
//! A tombstone is dropped when the target level is the deepest populated
//! level: no older tier can hold a shadowed value, so the tombstone has
//! nothing left to shadow.

use std::collections::HashSet;
use std::sync::Arc;

use crate::entry::Entry;
use crate::error::Result;
use crate::sstable::SsTable;

use super::iterator::{EntryMerge, EntryStream};
use super::{sort_read_order, Shared, MAX_LEVEL};

struct Job {
    /// Inputs in read order (newest data first).
    inputs: Vec<Arc<SsTable>>,
    input_ids: Vec<u64>,
    target_level: u8,
    drop_tombstones: bool,
}

fn make_job(mut inputs: Vec<Arc<SsTable>>, target_level: u8, deepest_level: u8) -> Job {
    sort_read_order(&mut inputs);
    let input_ids = inputs.iter().map(|t| t.id()).collect();
    Job {
        inputs,
        input_ids,
        // With no populated level below the target, no shadowed value can
        // survive outside the input set.
        drop_tombstones: target_level >= deepest_level,
        target_level,
    }
}

/// Worker loop: wait for a flush signal or shutdown, then drain jobs.
pub(crate) fn run_worker(shared: Arc<Shared>) {
    loop {
        {
            let mut work = match shared.work.lock() {
                Ok(work) => work,
                Err(_) => return,
            };
            while !work.shutdown && !work.pending {
                work = match shared.work_cv.wait(work) {
                    Ok(work) => work,
                    Err(_) => return,
                };
            }
            if work.shutdown {
                return;
            }
            work.pending = false;
        }

        loop {
            match run_one(&shared) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    // The old tables and WAL remain the source of truth;
                    // retried on the next trigger.
                    tracing::warn!(error = %e, "Compaction failed");
                    break;
                }
            }
        }
    }
}

/// Runs at most one compaction job. Returns false when no level needs
/// compacting.
pub(crate) fn run_one(shared: &Shared) -> Result<bool> {
    let _guard = shared.compaction_mutex.lock()?;
    let Some(job) = pick_job(shared)? else {
        return Ok(false);
    };
    execute(shared, job)?;
    Ok(true)
}

/// Forced full compaction: merge every table into a single run at the
/// level below the current deepest.
pub(crate) fn compact_full(shared: &Shared) -> Result<()> {
    let _guard = shared.compaction_mutex.lock()?;

    let inputs = {
        let inner = shared.inner.read()?;
        inner.tables.clone()
    };
    if inputs.len() <= 1 {
        return Ok(());
    }

    let deepest = inputs.iter().map(|t| t.level()).max().unwrap_or(0);
    let target = deepest.saturating_add(1).min(MAX_LEVEL);
    execute(shared, make_job(inputs, target, deepest))
}

/// Applies the selection policy under the engine read lock.
fn pick_job(shared: &Shared) -> Result<Option<Job>> {
    let inner = shared.inner.read()?;
    let tables = &inner.tables;
    if tables.is_empty() {
        return Ok(None);
    }
    let deepest = tables.iter().map(|t| t.level()).max().unwrap_or(0);

    let l0: Vec<Arc<SsTable>> = tables.iter().filter(|t| t.level() == 0).cloned().collect();
    if !l0.is_empty() && l0.len() >= shared.config.l0_compaction_trigger {
        let first = l0.iter().map(|t| t.first_key()).min().unwrap().to_vec();
        let last = l0.iter().map(|t| t.last_key()).max().unwrap().to_vec();

        let mut inputs = l0;
        inputs.extend(
            tables
                .iter()
                .filter(|t| t.level() == 1 && t.overlaps(&first, &last))
                .cloned(),
        );
        return Ok(Some(make_job(inputs, 1, deepest)));
    }

    for level in 1..MAX_LEVEL {
        let level_bytes: u64 = tables
            .iter()
            .filter(|t| t.level() == level)
            .map(|t| t.file_size())
            .sum();
        if level_bytes == 0 {
            continue;
        }
        let budget = shared
            .config
            .base_level_bytes
            .saturating_mul(shared.config.level_size_multiplier.saturating_pow(level as u32 - 1));
        if level_bytes <= budget {
            continue;
        }

        let oldest = tables
            .iter()
            .filter(|t| t.level() == level)
            .min_by_key(|t| t.id())
            .unwrap()
            .clone();
        let first = oldest.first_key().to_vec();
        let last = oldest.last_key().to_vec();

        let mut inputs = vec![oldest];
        inputs.extend(
            tables
                .iter()
                .filter(|t| t.level() == level + 1 && t.overlaps(&first, &last))
                .cloned(),
        );
        return Ok(Some(make_job(inputs, level + 1, deepest)));
    }

    Ok(None)
}

/// Merges the job's inputs into replacement tables and swaps them into the
/// table set.
fn execute(shared: &Shared, job: Job) -> Result<()> {
    tracing::info!(
        inputs = job.inputs.len(),
        target_level = job.target_level,
        drop_tombstones = job.drop_tombstones,
        "Starting compaction"
    );

    let mut outputs: Vec<Arc<SsTable>> = Vec::new();
    if let Err(e) = build_outputs(shared, &job, &mut outputs) {
        // Unlink any half-installed replacement files; the inputs are
        // untouched and remain live.
        for table in &outputs {
            table.doom();
        }
        return Err(e);
    }

    let entries_out: usize = outputs.iter().map(|t| t.num_entries()).sum();
    {
        let mut inner = shared.inner.write()?;
        let input_ids: HashSet<u64> = job.input_ids.iter().copied().collect();
        inner.tables.retain(|t| !input_ids.contains(&t.id()));
        inner.tables.extend(outputs.iter().cloned());
        sort_read_order(&mut inner.tables);
    }

    for table in &job.inputs {
        table.doom();
    }

    tracing::info!(
        input_ids = ?job.input_ids,
        outputs = outputs.len(),
        entries = entries_out,
        target_level = job.target_level,
        "Completed compaction"
    );
    Ok(())
}

/// Streams the merged entries into one or more output tables, splitting at
/// the configured file size cap. Outputs at the target level cannot
/// overlap: the merge emits keys in ascending order, so consecutive chunks
/// cover disjoint key ranges.
fn build_outputs(shared: &Shared, job: &Job, outputs: &mut Vec<Arc<SsTable>>) -> Result<()> {
    let mut sources: Vec<EntryStream> = Vec::with_capacity(job.inputs.len());
    for table in &job.inputs {
        sources.push(Box::new(table.iter()?));
    }

    let options = shared.table_options();
    let mut chunk: Vec<Entry> = Vec::new();
    let mut chunk_bytes = 0u64;

    for item in EntryMerge::new(sources) {
        let entry = item?;
        if job.drop_tombstones && entry.deleted {
            continue;
        }
        chunk_bytes += entry.encoded_len() as u64;
        chunk.push(entry);

        if chunk_bytes >= shared.config.max_output_file_bytes {
            let table = SsTable::create(
                &shared.config.data_dir,
                shared.next_table_id(),
                job.target_level,
                &chunk,
                &options,
            )?;
            outputs.push(Arc::new(table));
            chunk.clear();
            chunk_bytes = 0;
        }
    }

    if !chunk.is_empty() {
        let table = SsTable::create(
            &shared.config.data_dir,
            shared.next_table_id(),
            job.target_level,
            &chunk,
            &options,
        )?;
        outputs.push(Arc::new(table));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Engine;
    use std::time::Duration;

    fn compacting_config(dir: &std::path::Path) -> Config {
        Config::new(dir)
            .memtable_threshold_bytes(4096)
            .l0_compaction_trigger(2)
            .cache_capacity_bytes(1024 * 1024)
    }

    /// Polls `cond` for a few seconds; background compaction has no
    /// completion callback.
    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn test_background_compaction_reduces_l0() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = Engine::open_with_config(compacting_config(dir.path()))
            .expect("Failed to open engine");

        // Three flushed batches over the same key range trip the trigger.
        for round in 0..3 {
            for i in 0..50 {
                engine
                    .put(
                        format!("key_{i:03}").as_bytes(),
                        format!("round_{round}").as_bytes(),
                    )
                    .unwrap();
            }
            engine.flush().unwrap();
        }

        assert!(
            wait_for(|| engine.stats().unwrap().num_sstables < 3),
            "background compaction never ran"
        );

        // The newest round survives for every key.
        for i in 0..50 {
            assert_eq!(
                engine.get(format!("key_{i:03}").as_bytes()).unwrap(),
                Some(b"round_2".to_vec())
            );
        }
    }

    #[test]
    fn test_background_compaction_output_is_level_1() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = Engine::open_with_config(compacting_config(dir.path()))
            .expect("Failed to open engine");

        for round in 0..2 {
            for i in 0..20 {
                engine
                    .put(format!("key_{i:03}").as_bytes(), format!("v{round}").as_bytes())
                    .unwrap();
            }
            engine.flush().unwrap();
        }

        assert!(
            wait_for(|| engine.stats().unwrap().num_sstables == 1),
            "expected a single table after compaction"
        );

        let inner = engine_shared(&engine).inner.read().unwrap();
        assert_eq!(inner.tables.len(), 1);
        assert_eq!(inner.tables[0].level(), 1);
    }

    #[test]
    fn test_foreground_writes_during_compaction_survive() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = Engine::open_with_config(compacting_config(dir.path()))
            .expect("Failed to open engine");

        for round in 0..3 {
            for i in 0..50 {
                engine
                    .put(format!("key_{i:03}").as_bytes(), format!("r{round}").as_bytes())
                    .unwrap();
            }
            engine.flush().unwrap();
        }
        // Keep writing while the worker churns in the background.
        for i in 0..200 {
            engine
                .put(format!("live_{i:04}").as_bytes(), b"fresh")
                .unwrap();
        }

        wait_for(|| engine.stats().unwrap().num_sstables < 3);

        for i in 0..200 {
            assert_eq!(
                engine.get(format!("live_{i:04}").as_bytes()).unwrap(),
                Some(b"fresh".to_vec())
            );
        }
        for i in 0..50 {
            assert_eq!(
                engine.get(format!("key_{i:03}").as_bytes()).unwrap(),
                Some(b"r2".to_vec())
            );
        }
    }

    #[test]
    fn test_input_files_deleted_after_compaction() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = Engine::open_with_config(compacting_config(dir.path()))
            .expect("Failed to open engine");

        for round in 0..2 {
            for i in 0..20 {
                engine
                    .put(format!("key_{i:03}").as_bytes(), format!("v{round}").as_bytes())
                    .unwrap();
            }
            engine.flush().unwrap();
        }

        assert!(wait_for(|| engine.stats().unwrap().num_sstables == 1));

        // Once the swap completes and readers drain, only the replacement
        // file remains on disk.
        assert!(wait_for(|| {
            std::fs::read_dir(dir.path())
                .unwrap()
                .filter(|e| {
                    e.as_ref()
                        .unwrap()
                        .path()
                        .extension()
                        .is_some_and(|ext| ext == "sst")
                })
                .count()
                == 1
        }));
    }

    fn engine_shared(engine: &Engine) -> &Shared {
        &engine.shared
    }
}
