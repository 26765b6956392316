//! Decides what happens to a job after a failed step attempt.

use crate::catalog::schema::SchemaState;
use crate::error::{JobError, ShiftError, ShiftErrorCode};
use crate::job::{Job, JobState};
use tracing::{error, warn};

const PANIC_REASON: &str = "panic in handling DDL logic";

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Run the same step again.
    Retry(Job),
    /// Undo the job's changes with a rollback step.
    Revert(Job),
    /// The job reached a terminal state and can be archived.
    Finish(Job),
    /// This owner lost its term; nothing was recorded.
    Abandon,
}

impl Verdict {
    pub fn job(&self) -> Option<&Job> {
        match self {
            Verdict::Retry(job) | Verdict::Revert(job) | Verdict::Finish(job) => Some(job),
            Verdict::Abandon => None,
        }
    }
}

/// Error record for a job cancelled on request.
pub fn cancelled_error() -> JobError {
    JobError {
        code: ShiftErrorCode::JobCancelled,
        message: "Cancelled DDL job".into(),
    }
}

/// Classifies a failed attempt of `job`'s current step.
///
/// Every failure except a lost term counts toward `limit`. Data and
/// constraint errors revert a job that can still be reverted. Crossing the
/// limit forces a revert (or one more retry when the job cannot be reverted);
/// crossing it again, or panicking past it, cancels the job outright.
pub fn judge(job: &Job, err: &ShiftError, limit: u64) -> Verdict {
    if matches!(err, ShiftError::OwnershipLost) {
        return Verdict::Abandon;
    }
    let mut next = job.clone();
    next.owner_epoch = 0;
    next.error_count += 1;
    next.error = Some(JobError::from_error(err));
    let exceeded = next.error_count > limit;
    let forward = matches!(next.state, JobState::Queued | JobState::Running);

    if matches!(err, ShiftError::Panic(_)) && exceeded {
        return fatal(next, limit, PANIC_REASON.to_string());
    }
    if !exceeded {
        if forward && (err.is_data_error() || err.is_constraint_error()) && next.is_rollbackable() {
            warn!(job_id = next.id, error = %err, "ddl job cannot proceed, rolling back");
            return revert(next);
        }
        return Verdict::Retry(next);
    }

    next.ceiling_hits += 1;
    if next.ceiling_hits >= 2 {
        return fatal(next, limit, err.to_string());
    }
    if forward && next.is_rollbackable() {
        next.error = Some(JobError::from_error(&ShiftError::ErrorCountLimit {
            limit,
            reason: err.to_string(),
        }));
        warn!(
            job_id = next.id,
            error_count = next.error_count,
            limit,
            "ddl job exceeded error limit, rolling back"
        );
        return revert(next);
    }
    warn!(
        job_id = next.id,
        error_count = next.error_count,
        limit,
        state = %next.state,
        "ddl job exceeded error limit, retrying once more"
    );
    Verdict::Retry(next)
}

fn revert(mut job: Job) -> Verdict {
    if job.schema_state == SchemaState::None {
        job.state = JobState::RollbackDone;
        return Verdict::Finish(job);
    }
    job.state = JobState::RollingBack;
    Verdict::Revert(job)
}

fn fatal(mut job: Job, limit: u64, reason: String) -> Verdict {
    error!(
        job_id = job.id,
        error_count = job.error_count,
        limit,
        reason = %reason,
        "ddl job cancelled after repeated failures"
    );
    job.state = JobState::Cancelled;
    job.error = Some(JobError::from_error(&ShiftError::ErrorCountLimit { limit, reason }));
    Verdict::Finish(job)
}

#[cfg(test)]
mod tests {
    use super::{Verdict, judge};
    use crate::catalog::schema::SchemaState;
    use crate::error::{ShiftError, ShiftErrorCode};
    use crate::job::{Job, JobKind, JobState};

    fn job(kind: JobKind, state: SchemaState) -> Job {
        Job::new(9, kind, 1, 2, "alter table t").advanced(state)
    }

    fn drop_index(state: SchemaState) -> Job {
        job(JobKind::DropIndex { index: "i".into() }, state)
    }

    fn add_column(state: SchemaState) -> Job {
        let column = crate::catalog::schema::ColumnDef {
            id: 3,
            name: "c".into(),
            offset: 1,
            col_type: crate::catalog::types::ColumnType::int(),
            nullable: true,
            default: None,
            origin_default: None,
            prevent_null_insert: false,
            state: SchemaState::None,
            changing_from: None,
        };
        job(JobKind::AddColumn { column }, state)
    }

    fn timeout() -> ShiftError {
        ShiftError::Timeout("store busy".into())
    }

    #[test]
    fn lost_term_is_not_counted() {
        assert_eq!(judge(&add_column(SchemaState::WriteOnly), &ShiftError::OwnershipLost, 3), Verdict::Abandon);
    }

    #[test]
    fn data_errors_revert_immediately() {
        let err = ShiftError::DataTruncated {
            column: "a".into(),
            row: 1,
        };
        match judge(&add_column(SchemaState::WriteReorganization), &err, 3) {
            Verdict::Revert(next) => {
                assert_eq!(next.state, JobState::RollingBack);
                assert_eq!(next.error_count, 1);
                assert_eq!(next.error.map(|e| e.code), Some(ShiftErrorCode::DataTruncated));
            }
            other => panic!("unexpected verdict {other:?}"),
        }
        match judge(&add_column(SchemaState::None), &err, 3) {
            Verdict::Finish(next) => assert_eq!(next.state, JobState::RollbackDone),
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[test]
    fn failing_forever_stops_after_limit_plus_two_attempts() {
        let limit = 3;
        let mut current = add_column(SchemaState::WriteOnly);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match judge(&current, &timeout(), limit) {
                Verdict::Retry(next) | Verdict::Revert(next) => current = next,
                Verdict::Finish(next) => {
                    current = next;
                    break;
                }
                Verdict::Abandon => unreachable!(),
            }
        }
        assert_eq!(attempts, limit + 2);
        assert_eq!(current.state, JobState::Cancelled);
        assert_eq!(current.error.map(|e| e.code), Some(ShiftErrorCode::ErrorCountLimit));
    }

    #[test]
    fn non_revertible_job_gets_one_extra_retry() {
        let mut current = drop_index(SchemaState::DeleteOnly);
        current.error_count = 3;
        let Verdict::Retry(next) = judge(&current, &timeout(), 3) else {
            panic!("expected a retry past the ceiling");
        };
        assert_eq!(next.ceiling_hits, 1);
        let Verdict::Finish(last) = judge(&next, &timeout(), 3) else {
            panic!("expected the job to be cancelled");
        };
        assert_eq!(last.state, JobState::Cancelled);
        assert_eq!(last.error_count, 5);
    }

    #[test]
    fn panic_past_the_limit_is_fatal() {
        let mut current = drop_index(SchemaState::WriteOnly);
        for _ in 0..3 {
            let Verdict::Retry(next) = judge(&current, &ShiftError::Panic("boom".into()), 3) else {
                panic!("expected a retry under the limit");
            };
            current = next;
        }
        let Verdict::Finish(last) = judge(&current, &ShiftError::Panic("boom".into()), 3) else {
            panic!("expected cancellation");
        };
        assert_eq!(last.error_count, 4);
        let error = last.error.expect("error recorded");
        assert_eq!(error.code, ShiftErrorCode::ErrorCountLimit);
        assert_eq!(
            error.message,
            "panic in handling DDL logic and error count beyond the limitation 3, cancelled"
        );
    }
}
