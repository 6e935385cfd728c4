use super::models::{JobCounts, JobStatus, Lead, OutboundCallJob, OutboundRun, RunStatus};
use crate::slots::StoreError;

/// Persisted runs and jobs. Each method is one atomic step, so several
/// worker processes may share a store; `now` is epoch millis.
pub trait DialStore: Send + Sync {
    fn create_run(
        &self,
        run_id: &str,
        tenant_id: &str,
        leads: &[Lead],
        now: u64,
    ) -> Result<OutboundRun, StoreError>;

    fn get_run(&self, run_id: &str) -> Result<Option<OutboundRun>, StoreError>;

    fn get_job(&self, job_id: &str) -> Result<Option<OutboundCallJob>, StoreError>;

    fn list_jobs(&self, run_id: &str) -> Result<Vec<OutboundCallJob>, StoreError>;

    fn job_counts(&self, run_id: &str) -> Result<JobCounts, StoreError>;

    /// Lease the oldest queued run to `worker`.
    fn acquire_run(&self, worker: &str, now: u64) -> Result<Option<OutboundRun>, StoreError>;

    /// Renew the lease. `None` once `worker` no longer owns a live run.
    fn heartbeat_run(
        &self,
        run_id: &str,
        worker: &str,
        now: u64,
    ) -> Result<Option<RunStatus>, StoreError>;

    /// Claim the run's next queued job, moving it to `dialing`. Succeeds
    /// only while the run is `running` and the job is still queued,
    /// unclaimed and without a call id.
    fn claim_next_job(
        &self,
        run_id: &str,
        lock_token: &str,
        now: u64,
    ) -> Result<Option<OutboundCallJob>, StoreError>;

    fn set_job_call_id(&self, job_id: &str, call_id: &str, now: u64) -> Result<bool, StoreError>;

    fn find_job_by_call_id(&self, call_id: &str) -> Result<Option<OutboundCallJob>, StoreError>;

    /// Move a job out of one of `from`. Reaching a terminal status
    /// advances the run cursor in the same step.
    fn transition_job(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
        error: Option<&str>,
        now: u64,
    ) -> Result<bool, StoreError>;

    /// Queued runs stop at once; running runs are asked to stop. Jobs not
    /// yet claimed are cancelled in the same step and count toward the
    /// cursor.
    fn cancel_run(&self, run_id: &str, now: u64) -> Result<Option<RunStatus>, StoreError>;

    /// Release the lease. A run that was asked to stop ends `stopped` even
    /// when the worker saw nothing left to dial.
    fn finish_run(
        &self,
        run_id: &str,
        worker: &str,
        status: RunStatus,
        error: Option<&str>,
        now: u64,
    ) -> Result<bool, StoreError>;

    /// Fail runs whose lease went stale, along with their in-flight jobs.
    /// Returns the reclaimed run ids.
    fn reclaim_stale_runs(&self, stale_before: u64, now: u64) -> Result<Vec<String>, StoreError>;

    /// Put a failed run back in the queue. Terminal jobs are left alone; a
    /// run with nothing left to dial completes instead. Stopped runs are
    /// final.
    fn resume_run(&self, run_id: &str, now: u64) -> Result<Option<RunStatus>, StoreError>;
}
