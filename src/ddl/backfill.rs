//! Backfill of existing rows during `WriteReorganization`.
//!
//! Existing rows are discovered through a snapshot taken when the job first
//! entered reorganization; rows written later are already maintained by the
//! foreground dual write. Each round hands up to `reorg_worker_count` ranges
//! of `reorg_chunk_rows` handles to a pool of tasks that rewrite rows in
//! batches of `reorg_batch_size`, then persists the checkpoint. A resumed
//! job continues from the last checkpoint.

use super::observer::ChunkRange;
use super::reorg::{ReorgInfo, RoundProgress};
use super::worker::{DdlWorker, panic_message};
use crate::cast::TypeCoercion;
use crate::catalog::schema::{IndexDef, SchemaState, TableId, TableSchema};
use crate::error::ShiftError;
use crate::job::{Job, JobKind, JobState, ModifyPath};
use crate::meta::Meta;
use crate::storage::codec::{decode_record_handle, key_successor, record_key};
use crate::storage::kv::KvStore;
use crate::storage::txn::{RetryPolicy, Transaction};
use crate::table::{WriteContext, backfill_row};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Whether `job` has rows to backfill before its next step.
pub(crate) fn needed(job: &Job) -> bool {
    if job.state != JobState::Running || job.schema_state != SchemaState::WriteReorganization {
        return false;
    }
    match &job.kind {
        JobKind::AddIndex { .. } => true,
        JobKind::ModifyColumn(args) => args.path == Some(ModifyPath::Rewrite),
        _ => false,
    }
}

/// Copies the backfill totals onto a job leaving reorganization.
pub(crate) fn apply_reorg_totals(meta: &Meta<'_>, job: &mut Job) -> Result<(), ShiftError> {
    if let Some(info) = meta.reorg(job.id)? {
        job.row_count = info.added_rows;
        job.warning_count = info.warnings;
    }
    Ok(())
}

/// Indexes whose entries the backfill writes.
fn target_indexes(table: &TableSchema, job: &Job) -> Vec<IndexDef> {
    match &job.kind {
        JobKind::AddIndex { index } => table.index(index.id).cloned().into_iter().collect(),
        JobKind::ModifyColumn(args) => args
            .changing_indexes
            .iter()
            .filter_map(|(_, shadow)| table.index(*shadow).cloned())
            .collect(),
        _ => Vec::new(),
    }
}

fn cancel_requested(store: &Arc<dyn KvStore>, job_id: i64) -> Result<bool, ShiftError> {
    let mut txn = Transaction::begin(store);
    Meta::new(&mut txn).cancel_requested(job_id)
}

/// Backfills every row of the job's table. Returns early, leaving the
/// checkpoint in place, when the job's cancellation was requested.
pub(crate) async fn run(worker: &DdlWorker, job: &Job) -> Result<(), ShiftError> {
    let ctx = &worker.ctx;
    let store = Arc::clone(&ctx.store);
    let (mut info, table) = worker
        .locked(|meta| {
            let table = meta.require_table(job.schema_id, job.table_id)?;
            if let Some(info) = meta.reorg(job.id)? {
                return Ok((info, table));
            }
            let info = ReorgInfo::begin(job.id, &table, store.current_ts());
            meta.put_reorg(&info)?;
            if let Some(mut current) = meta.queued_job(job.id)? {
                current.start_ts = info.snapshot_ts;
                meta.put_queued_job(&current)?;
            }
            Ok((info, table))
        })
        .await?;
    info!(
        job_id = job.id,
        table_id = job.table_id,
        physical_table_id = info.physical_table_id,
        snapshot_ts = info.snapshot_ts,
        scanned_rows = info.scanned_rows,
        "backfill running"
    );

    let table = Arc::new(table);
    let indexes = Arc::new(target_indexes(&table, job));
    let round_rows = ctx.config.reorg_worker_count * ctx.config.reorg_chunk_rows;
    loop {
        if worker.token.is_cancelled() {
            return Err(ShiftError::OwnershipLost);
        }
        if cancel_requested(&store, job.id)? {
            info!(job_id = job.id, scanned_rows = info.scanned_rows, "backfill stopped by cancel request");
            return Ok(());
        }
        if info.partition_done() {
            if !info.next_partition() {
                break;
            }
            let checkpoint = info.clone();
            worker.locked(|meta| meta.put_reorg(&checkpoint)).await?;
            debug!(job_id = job.id, physical_table_id = info.physical_table_id, "backfill moved to next partition");
            continue;
        }

        let snapshot = Transaction::at(&store, info.snapshot_ts);
        let keys = snapshot.scan(&info.current_key, &info.end_key, round_rows)?;
        let next_key = match keys.last() {
            Some((last, _)) if keys.len() >= round_rows => key_successor(last),
            _ => info.end_key.clone(),
        };
        let handles = keys
            .iter()
            .map(|(key, _)| decode_record_handle(key))
            .collect::<Result<Vec<_>, _>>()?;

        let progress = run_round(worker, job, info.physical_table_id, &table, &indexes, &handles).await?;
        info.advance(next_key, progress);
        let checkpoint = info.clone();
        worker.locked(|meta| meta.put_reorg(&checkpoint)).await?;
        debug!(
            job_id = job.id,
            physical_table_id = info.physical_table_id,
            scanned_rows = info.scanned_rows,
            warnings = info.warnings,
            "reorg checkpoint saved"
        );
        ctx.observer.after_backfill_round(job, &info);
    }
    info!(
        job_id = job.id,
        scanned_rows = info.scanned_rows,
        added_rows = info.added_rows,
        warnings = info.warnings,
        "backfill finished"
    );
    Ok(())
}

async fn run_round(
    worker: &DdlWorker,
    job: &Job,
    physical_id: TableId,
    table: &Arc<TableSchema>,
    indexes: &Arc<Vec<IndexDef>>,
    handles: &[i64],
) -> Result<RoundProgress, ShiftError> {
    let ctx = &worker.ctx;
    let token = worker.token.child_token();
    let mut tasks = JoinSet::new();
    for chunk in handles.chunks(ctx.config.reorg_chunk_rows.max(1)) {
        let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
            continue;
        };
        let range = ChunkRange {
            physical_table_id: physical_id,
            start: record_key(physical_id, *first),
            end: key_successor(&record_key(physical_id, *last)),
            rows: chunk.len(),
        };
        ctx.observer.before_backfill_chunk(job, &range);
        tasks.spawn(backfill_range(RangeTask {
            store: Arc::clone(&ctx.store),
            coercion: Arc::clone(&ctx.coercion),
            table: Arc::clone(table),
            indexes: Arc::clone(indexes),
            physical_id,
            handles: chunk.to_vec(),
            batch_size: ctx.config.reorg_batch_size,
            policy: ctx.retry_policy(),
            token: token.clone(),
        }));
    }

    let mut progress = RoundProgress::default();
    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(ShiftError::Panic(panic_message(e.into_panic().as_ref()))),
            Err(e) => Err(ShiftError::Interrupted(e.to_string())),
        };
        match outcome {
            Ok(range) => progress.merge(range),
            Err(e) => {
                token.cancel();
                tasks.shutdown().await;
                if worker.token.is_cancelled() {
                    return Err(ShiftError::OwnershipLost);
                }
                return Err(e);
            }
        }
    }
    Ok(progress)
}

struct RangeTask {
    store: Arc<dyn KvStore>,
    coercion: Arc<dyn TypeCoercion>,
    table: Arc<TableSchema>,
    indexes: Arc<Vec<IndexDef>>,
    physical_id: TableId,
    handles: Vec<i64>,
    batch_size: usize,
    policy: RetryPolicy,
    token: CancellationToken,
}

/// Rewrites one range of rows, one transaction per batch. Conflicts with
/// foreground writes are retried with backoff.
async fn backfill_range(task: RangeTask) -> Result<RoundProgress, ShiftError> {
    let ctx = WriteContext {
        table: &task.table,
        coercion: task.coercion.as_ref(),
        mode: task.table.sql_mode,
    };
    let mut progress = RoundProgress::default();
    for batch in task.handles.chunks(task.batch_size.max(1)) {
        let mut attempt = 0u32;
        loop {
            if task.token.is_cancelled() {
                return Err(ShiftError::Interrupted("backfill range cancelled".into()));
            }
            let mut txn = Transaction::begin(&task.store);
            let result = backfill_batch(&mut txn, ctx, task.physical_id, batch, &task.indexes)
                .and_then(|w| txn.commit().map(|_| w));
            match result {
                Ok((added, warnings)) => {
                    progress.merge(RoundProgress {
                        scanned: batch.len() as u64,
                        added,
                        warnings,
                    });
                    break;
                }
                Err(e) if e.is_retryable() && attempt < task.policy.max_retries => {
                    debug!(
                        physical_table_id = task.physical_id,
                        attempt,
                        error = %e,
                        "backfill batch conflict, retrying"
                    );
                    tokio::time::sleep(task.policy.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(progress)
}

/// Returns `(rows rewritten, warnings)`.
fn backfill_batch(
    txn: &mut Transaction,
    ctx: WriteContext<'_>,
    physical_id: TableId,
    handles: &[i64],
    indexes: &[IndexDef],
) -> Result<(u64, u64), ShiftError> {
    let (mut added, mut warnings) = (0, 0);
    for handle in handles {
        // Statement-level row numbering: each backfilled row is reported as row 1.
        if let Some(w) = backfill_row(txn, ctx, physical_id, *handle, indexes, 1)? {
            added += 1;
            warnings += w;
        }
    }
    Ok((added, warnings))
}
