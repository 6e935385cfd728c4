//! Slot registry shared between worker processes through one sqlite file.
//! Each operation runs in an IMMEDIATE transaction, which takes the write
//! lock up front so two processes never both see free space.
use super::{Acquire, ReapOutcome, SlotStore, SlotToken, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS slot_holders (
    tenant_id TEXT NOT NULL,
    token TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, token)
);
CREATE TABLE IF NOT EXISTS slot_waiters (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    token TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    UNIQUE (tenant_id, token)
);
CREATE INDEX IF NOT EXISTS idx_slot_waiters_tenant ON slot_waiters (tenant_id, seq);
";

#[derive(Clone)]
pub struct SqliteSlotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSlotStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn expiry(ttl: Duration, now: u64) -> i64 {
    (now + ttl.as_millis() as u64) as i64
}

fn holder_count(tx: &Transaction<'_>, tenant: &str) -> Result<usize, StoreError> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM slot_holders WHERE tenant_id = ?1",
        params![tenant],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn waiter_position(tx: &Transaction<'_>, tenant: &str, token: &str) -> Result<Option<usize>, StoreError> {
    let seq: Option<i64> = tx
        .query_row(
            "SELECT seq FROM slot_waiters WHERE tenant_id = ?1 AND token = ?2",
            params![tenant, token],
            |row| row.get(0),
        )
        .optional()?;
    let Some(seq) = seq else {
        return Ok(None);
    };
    let ahead: i64 = tx.query_row(
        "SELECT COUNT(*) FROM slot_waiters WHERE tenant_id = ?1 AND seq < ?2",
        params![tenant, seq],
        |row| row.get(0),
    )?;
    Ok(Some(ahead as usize))
}

/// Move waiters into free holder space, oldest first.
fn admit(
    tx: &Transaction<'_>,
    tenant: &str,
    max: usize,
    ttl: Duration,
    now: u64,
) -> Result<Vec<SlotToken>, StoreError> {
    let mut admitted = Vec::new();
    let mut held = holder_count(tx, tenant)?;
    while held < max {
        let next: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, token FROM slot_waiters WHERE tenant_id = ?1 ORDER BY seq LIMIT 1",
                params![tenant],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((seq, token)) = next else {
            break;
        };
        tx.execute("DELETE FROM slot_waiters WHERE seq = ?1", params![seq])?;
        tx.execute(
            "INSERT OR REPLACE INTO slot_holders (tenant_id, token, expires_at_ms) VALUES (?1, ?2, ?3)",
            params![tenant, token, expiry(ttl, now)],
        )?;
        admitted.push(token);
        held += 1;
    }
    Ok(admitted)
}

impl SlotStore for SqliteSlotStore {
    fn try_acquire(
        &self,
        tenant: &str,
        token: &str,
        max: usize,
        ttl: Duration,
        now: u64,
    ) -> Result<Acquire, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        admit(&tx, tenant, max, ttl, now)?;

        let refreshed = tx.execute(
            "UPDATE slot_holders SET expires_at_ms = ?3 WHERE tenant_id = ?1 AND token = ?2",
            params![tenant, token, expiry(ttl, now)],
        )?;
        if refreshed > 0 {
            tx.commit()?;
            return Ok(Acquire::Acquired);
        }
        if let Some(position) = waiter_position(&tx, tenant, token)? {
            tx.execute(
                "UPDATE slot_waiters SET expires_at_ms = ?3 WHERE tenant_id = ?1 AND token = ?2",
                params![tenant, token, expiry(ttl, now)],
            )?;
            tx.commit()?;
            return Ok(Acquire::Queued { position });
        }

        let waiting: i64 = tx.query_row(
            "SELECT COUNT(*) FROM slot_waiters WHERE tenant_id = ?1",
            params![tenant],
            |row| row.get(0),
        )?;
        let result = if holder_count(&tx, tenant)? < max && waiting == 0 {
            tx.execute(
                "INSERT INTO slot_holders (tenant_id, token, expires_at_ms) VALUES (?1, ?2, ?3)",
                params![tenant, token, expiry(ttl, now)],
            )?;
            Acquire::Acquired
        } else {
            tx.execute(
                "INSERT INTO slot_waiters (tenant_id, token, expires_at_ms) VALUES (?1, ?2, ?3)",
                params![tenant, token, expiry(ttl, now)],
            )?;
            Acquire::Queued {
                position: waiting as usize,
            }
        };
        tx.commit()?;
        Ok(result)
    }

    fn release(
        &self,
        tenant: &str,
        token: &str,
        max: usize,
        ttl: Duration,
        now: u64,
    ) -> Result<Vec<SlotToken>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM slot_holders WHERE tenant_id = ?1 AND token = ?2",
            params![tenant, token],
        )?;
        tx.execute(
            "DELETE FROM slot_waiters WHERE tenant_id = ?1 AND token = ?2",
            params![tenant, token],
        )?;
        let admitted = admit(&tx, tenant, max, ttl, now)?;
        tx.commit()?;
        Ok(admitted)
    }

    fn refresh(
        &self,
        tenant: &str,
        token: &str,
        ttl: Duration,
        now: u64,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE slot_holders SET expires_at_ms = ?3 WHERE tenant_id = ?1 AND token = ?2",
            params![tenant, token, expiry(ttl, now)],
        )?;
        Ok(updated > 0)
    }

    fn holders(&self, tenant: &str) -> Result<Vec<SlotToken>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT token FROM slot_holders WHERE tenant_id = ?1 ORDER BY token")?;
        let rows = stmt.query_map(params![tenant], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    fn waiters(&self, tenant: &str) -> Result<Vec<SlotToken>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT token FROM slot_waiters WHERE tenant_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![tenant], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    fn reap_expired(
        &self,
        now: u64,
        ttl: Duration,
        max_for: &dyn Fn(&str) -> usize,
    ) -> Result<ReapOutcome, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut outcome = ReapOutcome::default();
        for table in ["slot_holders", "slot_waiters"] {
            let mut stmt = tx.prepare(&format!(
                "SELECT tenant_id, token FROM {} WHERE expires_at_ms <= ?1",
                table
            ))?;
            let rows = stmt.query_map(params![now as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                outcome.expired.push(row?);
            }
            drop(stmt);
            tx.execute(
                &format!("DELETE FROM {} WHERE expires_at_ms <= ?1", table),
                params![now as i64],
            )?;
        }

        let tenants: Vec<String> = {
            let mut stmt = tx.prepare("SELECT DISTINCT tenant_id FROM slot_waiters")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for tenant in tenants {
            for token in admit(&tx, &tenant, max_for(&tenant), ttl, now)? {
                outcome.admitted.push((tenant.clone(), token));
            }
        }
        tx.commit()?;
        Ok(outcome)
    }
}
