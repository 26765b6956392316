use crate::error::{ResourceType, ShiftError};
use crate::job::{Job, JobId, JobState};
use crate::meta::Meta;
use std::collections::HashSet;

/// Queue semantics over the persisted job records.
///
/// Jobs run in submission order per table: a job depends on the latest job
/// queued before it on the same table and is not runnable until that job has
/// left the queue.
pub struct JobStore;

impl JobStore {
    pub fn enqueue(meta: &mut Meta<'_>, mut job: Job) -> Result<Job, ShiftError> {
        let queue = meta.list_queue()?;
        job.dependency_job_id = queue
            .iter()
            .filter(|queued| queued.id < job.id && touches_same_object(queued, &job))
            .map(|queued| queued.id)
            .max();
        job.state = JobState::Queued;
        meta.put_queued_job(&job)?;
        Ok(job)
    }

    /// Oldest queued job accepted by `filter` whose dependency has finished.
    pub fn next_runnable(
        meta: &Meta<'_>,
        filter: impl Fn(&Job) -> bool,
    ) -> Result<Option<Job>, ShiftError> {
        let queue = meta.list_queue()?;
        let queued: HashSet<JobId> = queue.iter().map(|j| j.id).collect();
        Ok(queue.into_iter().find(|job| {
            filter(job)
                && job
                    .dependency_job_id
                    .is_none_or(|dep| !queued.contains(&dep))
        }))
    }

    /// Moves a terminal job from the queue into history. A done job becomes
    /// `Synced` only when every node confirmed its final version; one whose
    /// schema lease expired first stays `Done`.
    pub fn archive(meta: &mut Meta<'_>, job: &Job, synced: bool) -> Result<Job, ShiftError> {
        if !job.state.is_terminal() {
            return Err(ShiftError::Validation(format!(
                "job {} is {} and cannot be archived",
                job.id, job.state
            )));
        }
        let mut archived = job.clone();
        if archived.state == JobState::Done && synced {
            archived.state = JobState::Synced;
        }
        archived.owner_epoch = 0;
        meta.remove_queued_job(job.id);
        meta.remove_reorg(job.id);
        meta.clear_cancel(job.id);
        meta.put_history_job(&archived)?;
        Ok(archived)
    }

    pub fn find(meta: &Meta<'_>, id: JobId) -> Result<Job, ShiftError> {
        if let Some(job) = meta.queued_job(id)? {
            return Ok(job);
        }
        meta.history_job(id)?.ok_or_else(|| ShiftError::NotFound {
            resource_type: ResourceType::Job,
            resource_id: id.to_string(),
        })
    }
}

fn touches_same_object(a: &Job, b: &Job) -> bool {
    if a.table_id != 0 && a.table_id == b.table_id {
        return true;
    }
    // Table creation must wait for its schema to exist.
    a.table_id == 0 && a.schema_id == b.schema_id
}
