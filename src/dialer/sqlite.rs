use super::models::{JobCounts, JobStatus, Lead, OutboundCallJob, OutboundRun, RunStatus};
use super::store::DialStore;
use crate::slots::StoreError;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS outbound_runs (
    run_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    total_leads INTEGER NOT NULL,
    cursor INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    lease_holder TEXT,
    heartbeat_at_ms INTEGER,
    error TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outbound_runs_status ON outbound_runs (status, created_at_ms);
CREATE TABLE IF NOT EXISTS outbound_jobs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL UNIQUE,
    run_id TEXT NOT NULL,
    lead_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    phone TEXT NOT NULL,
    name TEXT,
    status TEXT NOT NULL,
    lock_token TEXT,
    call_id TEXT,
    claimed_at_ms INTEGER,
    error TEXT,
    updated_at_ms INTEGER NOT NULL,
    UNIQUE (run_id, lead_id)
);
CREATE INDEX IF NOT EXISTS idx_outbound_jobs_run ON outbound_jobs (run_id, status, seq);
CREATE INDEX IF NOT EXISTS idx_outbound_jobs_call ON outbound_jobs (call_id);
";

const RUN_COLUMNS: &str = "run_id, tenant_id, total_leads, cursor, status, lease_holder, \
     heartbeat_at_ms, error, created_at_ms, updated_at_ms";
const JOB_COLUMNS: &str = "job_id, run_id, lead_id, tenant_id, phone, name, status, lock_token, \
     call_id, claimed_at_ms, error, updated_at_ms";

#[derive(Clone)]
pub struct SqliteDialStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDialStore {
    /// `:memory:` keeps everything in this process.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<(OutboundRun, String)> {
    let status: String = row.get(4)?;
    let run = OutboundRun {
        run_id: row.get(0)?,
        tenant_id: row.get(1)?,
        total_leads: row.get::<_, i64>(2)? as u64,
        cursor: row.get::<_, i64>(3)? as u64,
        status: RunStatus::Queued,
        lease_holder: row.get(5)?,
        heartbeat_at: row.get(6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    };
    Ok((run, status))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<(OutboundCallJob, String)> {
    let status: String = row.get(6)?;
    let job = OutboundCallJob {
        job_id: row.get(0)?,
        run_id: row.get(1)?,
        lead_id: row.get(2)?,
        tenant_id: row.get(3)?,
        phone: row.get(4)?,
        name: row.get(5)?,
        status: JobStatus::Queued,
        lock_token: row.get(7)?,
        call_id: row.get(8)?,
        claimed_at: row.get(9)?,
        error: row.get(10)?,
        updated_at: row.get(11)?,
    };
    Ok((job, status))
}

fn parse_run(raw: (OutboundRun, String)) -> Result<OutboundRun, StoreError> {
    let (mut run, status) = raw;
    run.status = RunStatus::parse(&status)
        .ok_or_else(|| StoreError::Invalid(format!("run status {}", status)))?;
    Ok(run)
}

fn parse_job(raw: (OutboundCallJob, String)) -> Result<OutboundCallJob, StoreError> {
    let (mut job, status) = raw;
    job.status = JobStatus::parse(&status)
        .ok_or_else(|| StoreError::Invalid(format!("job status {}", status)))?;
    Ok(job)
}

fn load_run(conn: &Connection, run_id: &str) -> Result<Option<OutboundRun>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM outbound_runs WHERE run_id = ?1", RUN_COLUMNS),
            params![run_id],
            run_from_row,
        )
        .optional()?;
    raw.map(parse_run).transpose()
}

fn load_job(conn: &Connection, job_id: &str) -> Result<Option<OutboundCallJob>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM outbound_jobs WHERE job_id = ?1", JOB_COLUMNS),
            params![job_id],
            job_from_row,
        )
        .optional()?;
    raw.map(parse_job).transpose()
}

fn run_status(tx: &Transaction<'_>, run_id: &str) -> Result<Option<RunStatus>, StoreError> {
    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM outbound_runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    status
        .map(|s| RunStatus::parse(&s).ok_or_else(|| StoreError::Invalid(format!("run status {}", s))))
        .transpose()
}

fn advance_cursor(tx: &Transaction<'_>, run_id: &str, by: usize, now: u64) -> Result<(), StoreError> {
    if by == 0 {
        return Ok(());
    }
    tx.execute(
        "UPDATE outbound_runs SET cursor = cursor + ?2, updated_at_ms = ?3 WHERE run_id = ?1",
        params![run_id, by as i64, now as i64],
    )?;
    Ok(())
}

fn queued_jobs(tx: &Transaction<'_>, run_id: &str) -> Result<i64, StoreError> {
    Ok(tx.query_row(
        "SELECT COUNT(*) FROM outbound_jobs WHERE run_id = ?1 AND status = 'queued'",
        params![run_id],
        |row| row.get(0),
    )?)
}

impl DialStore for SqliteDialStore {
    fn create_run(
        &self,
        run_id: &str,
        tenant_id: &str,
        leads: &[Lead],
        now: u64,
    ) -> Result<OutboundRun, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO outbound_runs (run_id, tenant_id, total_leads, cursor, status, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, 0, 'queued', ?4, ?4)",
            params![run_id, tenant_id, leads.len() as i64, now as i64],
        )?;
        for (index, lead) in leads.iter().enumerate() {
            let lead_id = lead
                .lead_id
                .clone()
                .unwrap_or_else(|| format!("lead-{}", index + 1));
            tx.execute(
                "INSERT INTO outbound_jobs (job_id, run_id, lead_id, tenant_id, phone, name, status, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    run_id,
                    lead_id,
                    tenant_id,
                    lead.phone,
                    lead.name,
                    now as i64
                ],
            )?;
        }
        let run = load_run(&tx, run_id)?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        tx.commit()?;
        Ok(run)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<OutboundRun>, StoreError> {
        let conn = self.lock()?;
        load_run(&conn, run_id)
    }

    fn get_job(&self, job_id: &str) -> Result<Option<OutboundCallJob>, StoreError> {
        let conn = self.lock()?;
        load_job(&conn, job_id)
    }

    fn list_jobs(&self, run_id: &str) -> Result<Vec<OutboundCallJob>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM outbound_jobs WHERE run_id = ?1 ORDER BY seq",
            JOB_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id], job_from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(parse_job(row?)?);
        }
        Ok(jobs)
    }

    fn job_counts(&self, run_id: &str) -> Result<JobCounts, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM outbound_jobs WHERE run_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = JobCounts::default();
        for row in rows {
            let (status, count) = row?;
            let status = JobStatus::parse(&status)
                .ok_or_else(|| StoreError::Invalid(format!("job status {}", status)))?;
            counts.add(status, count as u64);
        }
        Ok(counts)
    }

    fn acquire_run(&self, worker: &str, now: u64) -> Result<Option<OutboundRun>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate: Option<String> = tx
            .query_row(
                "SELECT run_id FROM outbound_runs WHERE status = 'queued' ORDER BY created_at_ms, run_id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(run_id) = candidate else {
            return Ok(None);
        };
        let changed = tx.execute(
            "UPDATE outbound_runs SET status = 'running', lease_holder = ?2, heartbeat_at_ms = ?3,
                 error = NULL, updated_at_ms = ?3
             WHERE run_id = ?1 AND status = 'queued'",
            params![run_id, worker, now as i64],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let run = load_run(&tx, &run_id)?;
        tx.commit()?;
        Ok(run)
    }

    fn heartbeat_run(
        &self,
        run_id: &str,
        worker: &str,
        now: u64,
    ) -> Result<Option<RunStatus>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE outbound_runs SET heartbeat_at_ms = ?3
             WHERE run_id = ?1 AND lease_holder = ?2 AND status IN ('running', 'stopping')",
            params![run_id, worker, now as i64],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let status = run_status(&tx, run_id)?;
        tx.commit()?;
        Ok(status)
    }

    fn claim_next_job(
        &self,
        run_id: &str,
        lock_token: &str,
        now: u64,
    ) -> Result<Option<OutboundCallJob>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate: Option<String> = tx
            .query_row(
                "SELECT job_id FROM outbound_jobs
                 WHERE run_id = ?1 AND status = 'queued' AND lock_token IS NULL AND call_id IS NULL
                   AND EXISTS (SELECT 1 FROM outbound_runs WHERE run_id = ?1 AND status = 'running')
                 ORDER BY seq LIMIT 1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(job_id) = candidate else {
            return Ok(None);
        };
        let changed = tx.execute(
            "UPDATE outbound_jobs SET status = 'dialing', lock_token = ?2, claimed_at_ms = ?3, updated_at_ms = ?3
             WHERE job_id = ?1 AND status = 'queued' AND lock_token IS NULL AND call_id IS NULL
               AND EXISTS (SELECT 1 FROM outbound_runs WHERE run_id = ?4 AND status = 'running')",
            params![job_id, lock_token, now as i64, run_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let job = load_job(&tx, &job_id)?;
        tx.commit()?;
        Ok(job)
    }

    fn set_job_call_id(&self, job_id: &str, call_id: &str, now: u64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE outbound_jobs SET call_id = ?2, updated_at_ms = ?3
             WHERE job_id = ?1 AND call_id IS NULL",
            params![job_id, call_id, now as i64],
        )?;
        Ok(changed == 1)
    }

    fn find_job_by_call_id(&self, call_id: &str) -> Result<Option<OutboundCallJob>, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM outbound_jobs WHERE call_id = ?1", JOB_COLUMNS),
                params![call_id],
                job_from_row,
            )
            .optional()?;
        raw.map(parse_job).transpose()
    }

    fn transition_job(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
        error: Option<&str>,
        now: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(job) = load_job(&tx, job_id)? else {
            return Ok(false);
        };
        if !from.contains(&job.status) {
            return Ok(false);
        }
        let changed = tx.execute(
            "UPDATE outbound_jobs SET status = ?3, error = COALESCE(?4, error), updated_at_ms = ?5
             WHERE job_id = ?1 AND status = ?2",
            params![job_id, job.status.as_str(), to.as_str(), error, now as i64],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        if to.is_terminal() {
            advance_cursor(&tx, &job.run_id, 1, now)?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn cancel_run(&self, run_id: &str, now: u64) -> Result<Option<RunStatus>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(status) = run_status(&tx, run_id)? else {
            return Ok(None);
        };
        let next = match status {
            RunStatus::Queued => RunStatus::Stopped,
            RunStatus::Running => RunStatus::Stopping,
            other => return Ok(Some(other)),
        };
        tx.execute(
            "UPDATE outbound_runs SET status = ?3, updated_at_ms = ?4 WHERE run_id = ?1 AND status = ?2",
            params![run_id, status.as_str(), next.as_str(), now as i64],
        )?;
        let cancelled = tx.execute(
            "UPDATE outbound_jobs SET status = 'cancelled', error = 'run cancelled', updated_at_ms = ?2
             WHERE run_id = ?1 AND status = 'queued'",
            params![run_id, now as i64],
        )?;
        advance_cursor(&tx, run_id, cancelled, now)?;
        tx.commit()?;
        Ok(Some(next))
    }

    fn finish_run(
        &self,
        run_id: &str,
        worker: &str,
        status: RunStatus,
        error: Option<&str>,
        now: u64,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE outbound_runs
             SET status = CASE WHEN status = 'stopping' AND ?3 = 'completed' THEN 'stopped' ELSE ?3 END,
                 error = ?4, lease_holder = NULL, updated_at_ms = ?5
             WHERE run_id = ?1 AND lease_holder = ?2 AND status IN ('running', 'stopping')",
            params![run_id, worker, status.as_str(), error, now as i64],
        )?;
        Ok(changed == 1)
    }

    fn reclaim_stale_runs(&self, stale_before: u64, now: u64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT run_id FROM outbound_runs
                 WHERE status IN ('running', 'stopping') AND COALESCE(heartbeat_at_ms, 0) < ?1",
            )?;
            let rows = stmt.query_map(params![stale_before as i64], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for run_id in &stale {
            tx.execute(
                "UPDATE outbound_runs SET status = 'failed', lease_holder = NULL,
                     error = 'worker heartbeat expired', updated_at_ms = ?2
                 WHERE run_id = ?1",
                params![run_id, now as i64],
            )?;
            let failed = tx.execute(
                "UPDATE outbound_jobs SET status = 'failed', error = 'worker lost', updated_at_ms = ?2
                 WHERE run_id = ?1 AND status IN ('dialing', 'active')",
                params![run_id, now as i64],
            )?;
            advance_cursor(&tx, run_id, failed, now)?;
        }
        tx.commit()?;
        Ok(stale)
    }

    fn resume_run(&self, run_id: &str, now: u64) -> Result<Option<RunStatus>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(status) = run_status(&tx, run_id)? else {
            return Ok(None);
        };
        if status != RunStatus::Failed {
            return Ok(Some(status));
        }
        let next = if queued_jobs(&tx, run_id)? > 0 {
            RunStatus::Queued
        } else {
            RunStatus::Completed
        };
        tx.execute(
            "UPDATE outbound_runs SET status = ?3, lease_holder = NULL, heartbeat_at_ms = NULL,
                 error = NULL, updated_at_ms = ?4
             WHERE run_id = ?1 AND status = ?2",
            params![run_id, status.as_str(), next.as_str(), now as i64],
        )?;
        tx.commit()?;
        Ok(Some(next))
    }
}
