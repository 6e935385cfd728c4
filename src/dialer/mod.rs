//! Outbound dial scheduler.
//!
//! Workers lease runs, claim jobs one at a time under the tenant's slot
//! bound and hand each dialed call to the [`CallManager`]. Job state is
//! advanced from call events; the store is authoritative, so a worker that
//! dies only costs its in-flight jobs.
use crate::{
    call::{CallEvent, CallEventReceiver, CallManager, TelephonyStatus},
    callrecord::CallOutcome,
    config::DialerConfig,
    slots::{Acquire, SlotSemaphore, StoreError},
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{select, sync::broadcast::error::RecvError, sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod http;
pub mod models;
pub mod sqlite;
pub mod store;

pub use http::{DialRequest, Dialer, HttpDialer};
pub use models::{JobCounts, JobStatus, Lead, OutboundCallJob, OutboundRun, RunStatus};
pub use sqlite::SqliteDialStore;
pub use store::DialStore;

const IN_FLIGHT: [JobStatus; 2] = [JobStatus::Dialing, JobStatus::Active];

/// Job status a finished call leaves behind.
pub fn job_status_for(outcome: CallOutcome) -> JobStatus {
    match outcome {
        CallOutcome::Completed => JobStatus::Completed,
        CallOutcome::Canceled => JobStatus::Cancelled,
        CallOutcome::NoAnswer | CallOutcome::Busy | CallOutcome::Failed => JobStatus::Failed,
    }
}

fn outcome_error(outcome: CallOutcome) -> Option<&'static str> {
    match outcome {
        CallOutcome::NoAnswer => Some("no_answer"),
        CallOutcome::Busy => Some("busy"),
        CallOutcome::Failed => Some("call_failed"),
        _ => None,
    }
}

pub struct DialScheduler {
    worker_id: String,
    config: DialerConfig,
    store: Arc<dyn DialStore>,
    slots: Arc<SlotSemaphore>,
    calls: CallManager,
    dialer: Arc<dyn Dialer>,
    events: Mutex<Option<CallEventReceiver>>,
    runs: Mutex<HashSet<String>>,
    progress: Notify,
}

impl DialScheduler {
    pub fn new(
        worker_id: String,
        config: DialerConfig,
        store: Arc<dyn DialStore>,
        slots: Arc<SlotSemaphore>,
        calls: CallManager,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        // subscribe now so no call event is missed before serve starts
        let events = calls.subscribe();
        Self {
            worker_id,
            config,
            store,
            slots,
            calls,
            dialer,
            events: Mutex::new(Some(events)),
            runs: Mutex::new(HashSet::new()),
            progress: Notify::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store(&self) -> &Arc<dyn DialStore> {
        &self.store
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    pub fn create_run(&self, tenant_id: &str, leads: &[Lead]) -> Result<OutboundRun, StoreError> {
        if tenant_id.is_empty() {
            return Err(StoreError::Invalid("tenant id is required".to_string()));
        }
        if leads.is_empty() {
            return Err(StoreError::Invalid("a run needs at least one lead".to_string()));
        }
        if let Some(position) = leads.iter().position(|lead| lead.phone.trim().is_empty()) {
            return Err(StoreError::Invalid(format!("lead {} has no phone", position + 1)));
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        let run = self
            .store
            .create_run(&run_id, tenant_id, leads, crate::get_timestamp())?;
        info!(run_id, tenant_id, leads = leads.len(), "outbound run created");
        self.progress.notify_waiters();
        Ok(run)
    }

    pub fn run_summary(&self, run_id: &str) -> Result<Option<(OutboundRun, JobCounts)>, StoreError> {
        let Some(run) = self.store.get_run(run_id)? else {
            return Ok(None);
        };
        let counts = self.store.job_counts(run_id)?;
        Ok(Some((run, counts)))
    }

    pub fn cancel_run(&self, run_id: &str) -> Result<Option<RunStatus>, StoreError> {
        let status = self.store.cancel_run(run_id, crate::get_timestamp())?;
        if let Some(status) = status {
            info!(run_id, status = status.as_str(), "outbound run cancel requested");
            self.progress.notify_waiters();
        }
        Ok(status)
    }

    pub fn resume_run(&self, run_id: &str) -> Result<Option<RunStatus>, StoreError> {
        let status = self.store.resume_run(run_id, crate::get_timestamp())?;
        if let Some(status) = status {
            info!(run_id, status = status.as_str(), "outbound run resumed");
            self.progress.notify_waiters();
        }
        Ok(status)
    }

    /// Status callback for a call no longer held by the call manager.
    /// Returns false if no job belongs to the call.
    pub fn on_status_unknown_call(
        &self,
        call_id: &str,
        status: TelephonyStatus,
    ) -> Result<bool, StoreError> {
        let Some(job) = self.store.find_job_by_call_id(call_id)? else {
            return Ok(false);
        };
        if !status.is_terminal() {
            return Ok(true);
        }
        let (to, error) = match status {
            TelephonyStatus::Completed => (JobStatus::Completed, None),
            TelephonyStatus::Canceled => (JobStatus::Cancelled, None),
            other => (JobStatus::Failed, Some(other.as_str())),
        };
        self.finish_job(&job, to, error);
        Ok(true)
    }

    /// Move a job to its terminal status and give back its slot. Safe to
    /// call more than once; only the first transition counts.
    fn finish_job(&self, job: &OutboundCallJob, to: JobStatus, error: Option<&str>) {
        match self
            .store
            .transition_job(&job.job_id, &IN_FLIGHT, to, error, crate::get_timestamp())
        {
            Ok(true) => {
                crate::metrics::dialer::job_finished(to.as_str());
                info!(
                    run_id = job.run_id,
                    job_id = job.job_id,
                    status = to.as_str(),
                    "outbound job finished"
                );
            }
            Ok(false) => debug!(job_id = job.job_id, "job already finished"),
            Err(e) => warn!(job_id = job.job_id, "job transition failed: {}", e),
        }
        if let Some(token) = &job.lock_token {
            if let Err(e) = self.slots.release(&job.tenant_id, token) {
                warn!(job_id = job.job_id, "slot release failed: {}", e);
            }
        }
        self.progress.notify_waiters();
    }

    pub async fn serve(self: Arc<Self>, token: CancellationToken) {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(events) = events {
            tokio::spawn(self.clone().serve_events(events, token.clone()));
        }
        tokio::spawn(self.clone().serve_reclaim(token.clone()));

        info!(worker_id = self.worker_id, "dial scheduler started");
        loop {
            self.acquire_runs(&token);
            select! {
                _ = token.cancelled() => break,
                _ = self.progress.notified() => {}
                _ = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
        info!(worker_id = self.worker_id, "dial scheduler stopped");
    }

    fn acquire_runs(self: &Arc<Self>, token: &CancellationToken) {
        loop {
            let owned = self.runs.lock().unwrap_or_else(PoisonError::into_inner).len();
            if owned >= self.config.max_runs_per_worker.max(1) {
                return;
            }
            let run = match self.store.acquire_run(&self.worker_id, crate::get_timestamp()) {
                Ok(Some(run)) => run,
                Ok(None) => return,
                Err(e) => {
                    warn!("run acquisition failed: {}", e);
                    return;
                }
            };
            info!(
                run_id = run.run_id,
                tenant_id = run.tenant_id,
                worker_id = self.worker_id,
                "outbound run leased"
            );
            self.runs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(run.run_id.clone());
            tokio::spawn(self.clone().run_worker(run, token.child_token()));
        }
    }

    async fn wait(&self, token: &CancellationToken) {
        select! {
            _ = token.cancelled() => {}
            _ = self.progress.notified() => {}
            _ = tokio::time::sleep(self.poll_interval()) => {}
        }
    }

    async fn run_worker(self: Arc<Self>, run: OutboundRun, token: CancellationToken) {
        let run_id = run.run_id.clone();
        let tenant = run.tenant_id.clone();
        let mut pending_slot: Option<String> = None;
        let mut stop_requested = false;
        let mut last_refresh = Instant::now();

        let finished = loop {
            if token.is_cancelled() {
                break None;
            }
            let status = match self
                .store
                .heartbeat_run(&run_id, &self.worker_id, crate::get_timestamp())
            {
                Ok(Some(status)) => status,
                Ok(None) => {
                    warn!(run_id, worker_id = self.worker_id, "run lease lost");
                    break None;
                }
                Err(e) => {
                    warn!(run_id, "heartbeat failed: {}", e);
                    self.wait(&token).await;
                    continue;
                }
            };
            if last_refresh.elapsed() >= self.slots.refresh_interval() {
                self.refresh_slots(&run_id);
                last_refresh = Instant::now();
            }
            let counts = match self.store.job_counts(&run_id) {
                Ok(counts) => counts,
                Err(e) => {
                    warn!(run_id, "job counts failed: {}", e);
                    self.wait(&token).await;
                    continue;
                }
            };

            if status == RunStatus::Stopping {
                if let Some(slot) = pending_slot.take() {
                    self.slots.release(&tenant, &slot).ok();
                }
                if !stop_requested {
                    stop_requested = true;
                    self.cancel_dialing(&run_id).await;
                }
                if counts.in_flight() == 0 {
                    break Some(RunStatus::Stopped);
                }
                self.wait(&token).await;
                continue;
            }
            if counts.queued == 0 {
                if let Some(slot) = pending_slot.take() {
                    self.slots.release(&tenant, &slot).ok();
                }
                if counts.in_flight() == 0 {
                    break Some(RunStatus::Completed);
                }
                self.wait(&token).await;
                continue;
            }

            let slot = pending_slot
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone();
            let attempt = select! {
                _ = token.cancelled() => continue,
                attempt = self.slots.poll_acquire(&tenant, &slot) => attempt,
            };
            match attempt {
                Ok(Acquire::Acquired) => {
                    pending_slot = None;
                    self.start_job(&run, slot).await;
                }
                Ok(Acquire::Queued { position }) => {
                    debug!(run_id, position, "waiting for a dial slot");
                }
                Err(e) => {
                    warn!(run_id, "slot acquisition failed: {}", e);
                    self.wait(&token).await;
                }
            }
        };

        if let Some(slot) = pending_slot.take() {
            self.slots.release(&tenant, &slot).ok();
        }
        if let Some(status) = finished {
            match self
                .store
                .finish_run(&run_id, &self.worker_id, status, None, crate::get_timestamp())
            {
                Ok(true) => {
                    crate::metrics::dialer::run_finished(status.as_str());
                    info!(run_id, status = status.as_str(), "outbound run finished");
                }
                Ok(false) => debug!(run_id, "run already finished elsewhere"),
                Err(e) => warn!(run_id, "finishing run failed: {}", e),
            }
        }
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run_id);
        self.progress.notify_waiters();
    }

    /// Claim the next job under an already held slot and dial it.
    async fn start_job(&self, run: &OutboundRun, slot: String) {
        let claimed = self
            .store
            .claim_next_job(&run.run_id, &slot, crate::get_timestamp());
        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.slots.release(&run.tenant_id, &slot).ok();
                return;
            }
            Err(e) => {
                warn!(run_id = run.run_id, "job claim failed: {}", e);
                self.slots.release(&run.tenant_id, &slot).ok();
                return;
            }
        };

        let call_id = uuid::Uuid::new_v4().to_string();
        self.calls.prepare_outbound(
            call_id.clone(),
            job.tenant_id.clone(),
            Some(job.job_id.clone()),
            self.config.from_number.clone(),
            Some(job.phone.clone()),
        );
        match self
            .store
            .set_job_call_id(&job.job_id, &call_id, crate::get_timestamp())
        {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                warn!(job_id = job.job_id, call_id, "could not bind call to job");
                self.finish_job(&job, JobStatus::Failed, Some("bind_failed"));
                self.calls.abandon(&call_id).await;
                return;
            }
        }

        info!(
            run_id = job.run_id,
            job_id = job.job_id,
            call_id,
            to = job.phone,
            "dialing lead"
        );
        let request = DialRequest {
            call_id: call_id.clone(),
            tenant_id: job.tenant_id.clone(),
            run_id: job.run_id.clone(),
            job_id: job.job_id.clone(),
            to: job.phone.clone(),
            from: self.config.from_number.clone(),
            stream_url: self.config.stream_url.clone(),
        };
        let started = Instant::now();
        match self.dialer.dial(request).await {
            Ok(()) => {
                crate::metrics::dialer::dial_latency_seconds(started.elapsed().as_secs_f64());
            }
            Err(e) => {
                warn!(job_id = job.job_id, call_id, "dial failed: {}", e);
                let error = e.to_string();
                self.finish_job(&job, JobStatus::Failed, Some(&error));
                self.calls.abandon(&call_id).await;
            }
        }
    }

    /// Keep the slot tokens of this run's live jobs from expiring.
    fn refresh_slots(&self, run_id: &str) {
        let jobs = match self.store.list_jobs(run_id) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(run_id, "listing jobs failed: {}", e);
                return;
            }
        };
        for job in jobs.iter().filter(|job| IN_FLIGHT.contains(&job.status)) {
            if let Some(token) = &job.lock_token {
                match self.slots.refresh(&job.tenant_id, token) {
                    Ok(true) => {}
                    Ok(false) => warn!(job_id = job.job_id, "slot token already expired"),
                    Err(e) => warn!(job_id = job.job_id, "slot refresh failed: {}", e),
                }
            }
        }
    }

    /// Hang up calls that have not been answered yet.
    async fn cancel_dialing(&self, run_id: &str) {
        let Ok(jobs) = self.store.list_jobs(run_id) else {
            return;
        };
        for job in jobs.iter().filter(|job| job.status == JobStatus::Dialing) {
            if let Some(call_id) = &job.call_id {
                if self.calls.hangup(call_id).await.is_none() {
                    self.finish_job(job, JobStatus::Cancelled, None);
                }
            }
        }
    }

    async fn serve_events(self: Arc<Self>, mut events: CallEventReceiver, token: CancellationToken) {
        loop {
            let event = select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(CallEvent::Answered {
                    job_id: Some(job_id),
                    ..
                }) => {
                    match self.store.transition_job(
                        &job_id,
                        &[JobStatus::Dialing],
                        JobStatus::Active,
                        None,
                        crate::get_timestamp(),
                    ) {
                        Ok(true) => debug!(job_id, "outbound job active"),
                        Ok(false) => {}
                        Err(e) => warn!(job_id, "job transition failed: {}", e),
                    }
                }
                Ok(CallEvent::Finished {
                    job_id: Some(job_id),
                    outcome,
                    ..
                }) => match self.store.get_job(&job_id) {
                    Ok(Some(job)) => {
                        self.finish_job(&job, job_status_for(outcome), outcome_error(outcome))
                    }
                    Ok(None) => {}
                    Err(e) => warn!(job_id, "job lookup failed: {}", e),
                },
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "call events lagged, reconciling jobs");
                    self.reconcile();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Fail in-flight jobs whose calls are gone. Only needed when call
    /// events were missed.
    fn reconcile(&self) {
        let runs: Vec<String> = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        for run_id in runs {
            let Ok(jobs) = self.store.list_jobs(&run_id) else {
                continue;
            };
            for job in jobs.iter().filter(|job| IN_FLIGHT.contains(&job.status)) {
                let Some(call_id) = &job.call_id else {
                    continue;
                };
                if self.calls.registry().get(call_id).is_none() {
                    self.finish_job(job, JobStatus::Failed, Some("call_lost"));
                }
            }
        }
    }

    pub fn reclaim(&self) -> Result<Vec<String>, StoreError> {
        let now = crate::get_timestamp();
        let ttl = self.config.run_heartbeat_ttl_secs * 1000;
        let reclaimed = self.store.reclaim_stale_runs(now.saturating_sub(ttl), now)?;
        if !reclaimed.is_empty() {
            crate::metrics::dialer::runs_reclaimed(reclaimed.len());
            warn!(runs = ?reclaimed, "reclaimed runs with stale heartbeats");
        }
        Ok(reclaimed)
    }

    async fn serve_reclaim(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.reclaim_interval_secs.max(1),
        ));
        loop {
            select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.reclaim() {
                warn!("run reclaim failed: {}", e);
            }
        }
    }
}
