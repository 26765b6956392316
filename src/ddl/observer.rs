use crate::ddl::reorg::ReorgInfo;
use crate::error::ShiftError;
use crate::job::Job;
use std::sync::Arc;

/// One key range handed to a backfill worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRange {
    pub physical_table_id: i64,
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub rows: usize,
}

/// Hooks invoked at fixed points of job execution. Every method defaults to
/// a no-op; the engine behaves identically with or without an observer.
pub trait DdlObserver: Send + Sync {
    /// Before the owner runs any step of `job`.
    fn on_job_run_before(&self, _job: &Job) {}

    /// Before one state-machine step. An error counts as a failed attempt.
    fn before_step(&self, _job: &Job) -> Result<(), ShiftError> {
        Ok(())
    }

    /// After a job record change was committed.
    fn on_job_updated(&self, _job: &Job) {}

    /// Before one chunk of a round is handed to a backfill task.
    fn before_backfill_chunk(&self, _job: &Job, _chunk: &ChunkRange) {}

    /// After every chunk of a round finished and the round's checkpoint was
    /// committed.
    fn after_backfill_round(&self, _job: &Job, _reorg: &ReorgInfo) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DdlObserver for NoopObserver {}

pub fn noop() -> Arc<dyn DdlObserver> {
    Arc::new(NoopObserver)
}
