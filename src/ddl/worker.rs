//! Executes queued jobs one state-machine step at a time.
//!
//! Every step is one metadata transaction that checks the owner fence,
//! applies the job's next transition, bumps the schema version and rewrites
//! the job record. The worker then blocks on the schema sync barrier before
//! the next step may run. Failed and panicking attempts go to the governor.

use super::governor::{self, Verdict};
use super::{DdlContext, backfill, column, delete_range, index, rollback, table};
use crate::cast::TypeCoercion;
use crate::catalog::schema::{SchemaInfo, SchemaState, TableSchema};
use crate::error::{ResourceType, ShiftError};
use crate::job::{Job, JobId, JobKind, JobState, JobStore};
use crate::meta::{Meta, SchemaDiff};
use crate::publisher::SyncOutcome;
use crate::storage::txn::run_in_new_txn;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Metadata produced by one step, committed together with the job record.
#[derive(Debug)]
pub(crate) struct Transition {
    pub job: Job,
    pub schema: Option<SchemaInfo>,
    pub table: Option<TableSchema>,
}

impl Transition {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            schema: None,
            table: None,
        }
    }

    pub fn with_schema(mut self, schema: SchemaInfo) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.table = Some(table);
        self
    }
}

/// Which jobs a worker serves. Backfilling jobs get their own worker so a
/// long reorganization does not hold up quick metadata changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    General,
    Reorg,
}

impl WorkerKind {
    pub fn accepts(self, job: &Job) -> bool {
        job.kind.needs_reorg_worker() == (self == WorkerKind::Reorg)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::General => "general",
            WorkerKind::Reorg => "reorg",
        }
    }
}

struct Committed {
    job: Job,
    version: Option<u64>,
}

pub(crate) struct DdlWorker {
    pub(crate) ctx: Arc<DdlContext>,
    pub(crate) kind: WorkerKind,
    pub(crate) term: u64,
    pub(crate) token: CancellationToken,
    step_lock: Arc<Mutex<()>>,
}

impl DdlWorker {
    pub(crate) fn new(
        ctx: Arc<DdlContext>,
        kind: WorkerKind,
        term: u64,
        token: CancellationToken,
        step_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            ctx,
            kind,
            term,
            token,
            step_lock,
        }
    }

    pub(crate) async fn run(self) {
        info!(worker = self.kind.as_str(), term = self.term, "ddl worker started");
        let tick = Duration::from_millis(self.ctx.config.owner_tick_interval_ms);
        while !self.token.is_cancelled() {
            let notified = self.ctx.job_events.notified();
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(ShiftError::OwnershipLost) => {
                    warn!(worker = self.kind.as_str(), term = self.term, "ddl ownership lost");
                    self.token.cancel();
                    break;
                }
                Err(e) => warn!(worker = self.kind.as_str(), error = %e, "ddl worker iteration failed"),
            }
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = notified => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
        info!(worker = self.kind.as_str(), term = self.term, "ddl worker stopped");
    }

    /// Runs one metadata transaction under the owner fence. Steps of the two
    /// workers and backfill checkpoints are serialized by the step lock.
    pub(crate) async fn locked<T, F>(&self, mut f: F) -> Result<T, ShiftError>
    where
        F: FnMut(&mut Meta<'_>) -> Result<T, ShiftError>,
    {
        let _guard = self.step_lock.lock().await;
        let term = self.term;
        run_in_new_txn(&self.ctx.store, self.ctx.retry_policy(), |txn| {
            let mut meta = Meta::new(txn);
            meta.check_owner(term)?;
            f(&mut meta)
        })
        .await
    }

    /// Picks and advances one job. Returns `false` when nothing was runnable.
    async fn run_once(&self) -> Result<bool, ShiftError> {
        let Some(job) = self.pick().await? else {
            return Ok(false);
        };
        if job.state.is_terminal() {
            self.sync(job.schema_version).await?;
            self.finish(job).await?;
            return Ok(true);
        }
        self.ctx.observer.on_job_run_before(&job);
        let result = AssertUnwindSafe(self.attempt(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ShiftError::Panic(panic_message(payload.as_ref()))));
        match result {
            Ok(committed) => self.after_commit(committed).await?,
            Err(err) => self.on_failure(&job, err).await?,
        }
        Ok(true)
    }

    /// Claims the oldest runnable job for this term. A job still stamped by
    /// an earlier attempt was interrupted mid-step and that attempt counts as
    /// a failure.
    async fn pick(&self) -> Result<Option<Job>, ShiftError> {
        let kind = self.kind;
        let term = self.term;
        let limit = self.ctx.config.error_count_limit;
        let picked = self
            .locked(|meta| {
                let Some(mut job) = JobStore::next_runnable(meta, |j| kind.accepts(j))? else {
                    return Ok(None);
                };
                let interrupted = job.owner_epoch;
                if interrupted != 0 && !job.state.is_terminal() {
                    let err = ShiftError::Interrupted(format!(
                        "step started under owner term {interrupted} did not finish"
                    ));
                    match governor::judge(&job, &err, limit).job() {
                        Some(next) => job = next.clone(),
                        None => return Err(ShiftError::OwnershipLost),
                    }
                }
                if !job.state.is_terminal() {
                    job.owner_epoch = term;
                }
                meta.put_queued_job(&job)?;
                Ok(Some((job, interrupted)))
            })
            .await?;
        let Some((job, interrupted)) = picked else {
            return Ok(None);
        };
        if interrupted != 0 {
            warn!(
                job_id = job.id,
                previous_term = interrupted,
                error_count = job.error_count,
                state = %job.state,
                "resuming interrupted ddl step"
            );
        }
        Ok(Some(job))
    }

    async fn attempt(&self, job: &Job) -> Result<Committed, ShiftError> {
        self.ctx.observer.before_step(job)?;
        if backfill::needed(job) {
            backfill::run(self, job).await?;
        }
        self.commit_step(job.id).await
    }

    async fn commit_step(&self, job_id: JobId) -> Result<Committed, ShiftError> {
        let coercion = Arc::clone(&self.ctx.coercion);
        self.locked(|meta| {
            let job = meta.queued_job(job_id)?.ok_or_else(|| ShiftError::NotFound {
                resource_type: ResourceType::Job,
                resource_id: job_id.to_string(),
            })?;
            let transition = match apply_cancel_request(meta, &job)? {
                Some(cancelled) => Transition::new(cancelled),
                None => dispatch(meta, &job, coercion.as_ref())?,
            };
            publish(meta, transition)
        })
        .await
    }

    async fn after_commit(&self, committed: Committed) -> Result<(), ShiftError> {
        let Committed { job, version } = committed;
        info!(
            job_id = job.id,
            kind = job.kind.type_name(),
            state = %job.state,
            schema_state = %job.schema_state,
            version = ?version,
            "ddl job step committed"
        );
        self.ctx.observer.on_job_updated(&job);
        let synced = match version {
            Some(version) => self.sync(version).await?,
            None => true,
        };
        if job.state.is_terminal() {
            self.finish(job, synced).await?;
        }
        Ok(())
    }

    /// Waits until the cluster observes `version`. Returns `false` when the
    /// schema lease ran out first.
    async fn sync(&self, version: u64) -> Result<bool, ShiftError> {
        if version == 0 {
            return Ok(true);
        }
        self.ctx.publisher.reload()?;
        let lease = Duration::from_millis(self.ctx.config.schema_lease_ms);
        let poll = Duration::from_millis(self.ctx.config.sync_poll_interval_ms);
        match self.ctx.syncer.wait_synced(version, lease, poll, &self.token).await? {
            SyncOutcome::Synced => {
                debug!(version, "schema version synced");
                Ok(true)
            }
            SyncOutcome::LeaseExpired { .. } => Ok(false),
        }
    }

    async fn finish(&self, job: Job, synced: bool) -> Result<(), ShiftError> {
        let archived = self
            .locked(|meta| JobStore::archive(meta, &job, synced))
            .await?;
        info!(
            job_id = archived.id,
            kind = archived.kind.type_name(),
            state = %archived.state,
            row_count = archived.row_count,
            error_count = archived.error_count,
            error = ?archived.error.as_ref().map(ToString::to_string),
            "ddl job finished"
        );
        self.ctx.observer.on_job_updated(&archived);
        self.ctx.job_events.notify_waiters();
        if let Err(e) = delete_range::drain(
            &self.ctx.store,
            self.ctx.retry_policy(),
            self.ctx.config.gc_batch_size,
        )
        .await
        {
            warn!(error = %e, "delete range drain failed");
        }
        Ok(())
    }

    async fn on_failure(&self, job: &Job, err: ShiftError) -> Result<(), ShiftError> {
        let limit = self.ctx.config.error_count_limit;
        let verdict = self
            .locked(|meta| {
                let current = meta.queued_job(job.id)?.unwrap_or_else(|| job.clone());
                let verdict = governor::judge(&current, &err, limit);
                if let Some(next) = verdict.job() {
                    meta.put_queued_job(next)?;
                }
                Ok(verdict)
            })
            .await?;
        match verdict {
            Verdict::Abandon => Err(ShiftError::OwnershipLost),
            Verdict::Retry(next) => {
                warn!(
                    job_id = next.id,
                    error_count = next.error_count,
                    error = %err,
                    "ddl job step failed, retrying"
                );
                let backoff = self
                    .ctx
                    .retry_policy()
                    .backoff(next.error_count.min(16) as u32);
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep(backoff) => {}
                }
                Ok(())
            }
            Verdict::Revert(next) => {
                self.ctx.observer.on_job_updated(&next);
                Ok(())
            }
            Verdict::Finish(next) => {
                self.ctx.observer.on_job_updated(&next);
                self.finish(next).await
            }
        }
    }
}

/// Turns a pending cancel request into a revert when the job still allows it.
fn apply_cancel_request(meta: &mut Meta<'_>, job: &Job) -> Result<Option<Job>, ShiftError> {
    if !matches!(job.state, JobState::Queued | JobState::Running) || !meta.cancel_requested(job.id)? {
        return Ok(None);
    }
    meta.clear_cancel(job.id);
    if !job.is_rollbackable() {
        warn!(job_id = job.id, schema_state = %job.schema_state, "ignoring cancel request for job past its point of no return");
        return Ok(None);
    }
    let mut next = job.clone();
    next.error = Some(governor::cancelled_error());
    next.state = if next.schema_state == SchemaState::None {
        JobState::Cancelled
    } else {
        JobState::Cancelling
    };
    info!(job_id = job.id, schema_state = %job.schema_state, "ddl job cancelling");
    Ok(Some(next))
}

fn dispatch(
    meta: &mut Meta<'_>,
    job: &Job,
    coercion: &dyn TypeCoercion,
) -> Result<Transition, ShiftError> {
    if job.state.is_reverting() {
        return rollback::on_rollback(meta, job);
    }
    match &job.kind {
        JobKind::CreateSchema { .. } => table::on_create_schema(meta, job),
        JobKind::CreateTable { .. } => table::on_create_table(meta, job),
        JobKind::AddColumn { .. } => column::on_add_column(meta, job),
        JobKind::DropColumn { .. } => column::on_drop_column(meta, job),
        JobKind::ModifyColumn(_) => column::on_modify_column(meta, job, coercion),
        JobKind::AddIndex { .. } => index::on_add_index(meta, job),
        JobKind::DropIndex { .. } => index::on_drop_index(meta, job),
    }
}

/// Writes the transition and, when it changed metadata, a new schema
/// version with its diff.
fn publish(meta: &mut Meta<'_>, transition: Transition) -> Result<Committed, ShiftError> {
    let Transition { mut job, schema, table } = transition;
    job.owner_epoch = 0;
    let mut version = None;
    if schema.is_some() || table.is_some() {
        let next = meta.bump_schema_version()?;
        if let Some(schema) = &schema {
            meta.put_schema(schema)?;
        }
        let mut table_ids = Vec::new();
        if let Some(mut table) = table {
            table.update_version = next;
            table_ids.push(table.id);
            meta.put_table(&table)?;
        }
        meta.put_schema_diff(&SchemaDiff {
            version: next,
            job_id: job.id,
            schema_id: job.schema_id,
            table_ids,
        })?;
        job.schema_version = next;
        version = Some(next);
    }
    meta.put_queued_job(&job)?;
    Ok(Committed { job, version })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
