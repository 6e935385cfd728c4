//! Per-tenant bound on concurrent use of a scarce resource.
//!
//! A slot is a holder token in a set, never a bare counter: acquiring twice
//! with the same token is a no-op refresh, and a holder that dies simply
//! lets its token expire.
use crate::config::{SlotConfig, SlotStoreConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::{select, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod memory;
pub mod sqlite;
#[cfg(test)]
mod tests;

pub use memory::MemorySlotStore;
pub use sqlite::SqliteSlotStore;

pub type SlotToken = String;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid record: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    /// Zero-based position in the tenant's FIFO
    Queued { position: usize },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapOutcome {
    pub expired: Vec<(String, SlotToken)>,
    pub admitted: Vec<(String, SlotToken)>,
}

/// Backing store. Every method is one atomic step; `now` is epoch millis.
pub trait SlotStore: Send + Sync {
    /// Check-and-insert. Admits queued waiters first so a newcomer never
    /// jumps the queue. Re-acquiring refreshes the token's expiry.
    fn try_acquire(
        &self,
        tenant: &str,
        token: &str,
        max: usize,
        ttl: Duration,
        now: u64,
    ) -> Result<Acquire, StoreError>;

    /// Remove a holder or waiter, admitting waiters into the freed space in
    /// the same step. Returns the admitted tokens in FIFO order.
    fn release(
        &self,
        tenant: &str,
        token: &str,
        max: usize,
        ttl: Duration,
        now: u64,
    ) -> Result<Vec<SlotToken>, StoreError>;

    /// Extend a live holder's expiry. False if it no longer holds a slot.
    fn refresh(&self, tenant: &str, token: &str, ttl: Duration, now: u64)
        -> Result<bool, StoreError>;

    fn holders(&self, tenant: &str) -> Result<Vec<SlotToken>, StoreError>;

    fn waiters(&self, tenant: &str) -> Result<Vec<SlotToken>, StoreError>;

    /// Drop expired holders and waiters everywhere, then admit waiters.
    fn reap_expired(
        &self,
        now: u64,
        ttl: Duration,
        max_for: &dyn Fn(&str) -> usize,
    ) -> Result<ReapOutcome, StoreError>;
}

pub fn create_slot_store(config: &SlotStoreConfig) -> Result<Arc<dyn SlotStore>, StoreError> {
    match config {
        SlotStoreConfig::Memory => Ok(Arc::new(MemorySlotStore::new())),
        SlotStoreConfig::Sqlite { path } => Ok(Arc::new(SqliteSlotStore::open(path)?)),
    }
}

pub struct SlotSemaphore {
    store: Arc<dyn SlotStore>,
    config: SlotConfig,
    released: Notify,
}

impl SlotSemaphore {
    pub fn new(store: Arc<dyn SlotStore>, config: SlotConfig) -> Self {
        Self {
            store,
            config,
            released: Notify::new(),
        }
    }

    pub fn max_for(&self, tenant: &str) -> usize {
        self.config
            .tenant_max_slots
            .get(tenant)
            .copied()
            .unwrap_or(self.config.max_slots)
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.token_ttl_secs)
    }

    /// How often a live holder should refresh its token.
    pub fn refresh_interval(&self) -> Duration {
        (self.ttl() / 3).max(Duration::from_millis(100))
    }

    pub fn try_acquire(&self, tenant: &str, token: &str) -> Result<Acquire, StoreError> {
        let result = self.store.try_acquire(
            tenant,
            token,
            self.max_for(tenant),
            self.ttl(),
            crate::get_timestamp(),
        )?;
        match result {
            Acquire::Acquired => crate::metrics::slots::acquired(tenant),
            Acquire::Queued { position } => {
                crate::metrics::slots::queued(tenant);
                debug!(tenant, token, position, "slot busy, queued");
            }
        }
        Ok(result)
    }

    /// One attempt, then wait for a release or one poll interval. The
    /// caller loops, doing its own liveness work between attempts.
    pub async fn poll_acquire(&self, tenant: &str, token: &str) -> Result<Acquire, StoreError> {
        let notified = self.released.notified();
        let result = self.try_acquire(tenant, token)?;
        if let Acquire::Queued { .. } = result {
            select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(self.config.waiter_poll_ms.max(1))) => {}
            }
        }
        Ok(result)
    }

    /// Wait until `token` holds a slot. Returns false if cancelled first,
    /// in which case the queue entry has been withdrawn.
    pub async fn acquire(
        &self,
        tenant: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        loop {
            let attempt = select! {
                _ = cancel.cancelled() => None,
                result = self.poll_acquire(tenant, token) => Some(result?),
            };
            match attempt {
                Some(Acquire::Acquired) => return Ok(true),
                Some(Acquire::Queued { .. }) => continue,
                None => {
                    self.release(tenant, token)?;
                    return Ok(false);
                }
            }
        }
    }

    /// Idempotent; releasing an unknown token admits nobody.
    pub fn release(&self, tenant: &str, token: &str) -> Result<Vec<SlotToken>, StoreError> {
        let admitted = self.store.release(
            tenant,
            token,
            self.max_for(tenant),
            self.ttl(),
            crate::get_timestamp(),
        )?;
        crate::metrics::slots::released(tenant);
        if !admitted.is_empty() {
            debug!(tenant, token, ?admitted, "slot released, waiters admitted");
        }
        self.released.notify_waiters();
        Ok(admitted)
    }

    pub fn refresh(&self, tenant: &str, token: &str) -> Result<bool, StoreError> {
        self.store
            .refresh(tenant, token, self.ttl(), crate::get_timestamp())
    }

    pub fn holders(&self, tenant: &str) -> Result<Vec<SlotToken>, StoreError> {
        self.store.holders(tenant)
    }

    pub fn waiters(&self, tenant: &str) -> Result<Vec<SlotToken>, StoreError> {
        self.store.waiters(tenant)
    }

    pub fn reap(&self) -> Result<ReapOutcome, StoreError> {
        let outcome = self.store.reap_expired(
            crate::get_timestamp(),
            self.ttl(),
            &|tenant: &str| self.max_for(tenant),
        )?;
        if !outcome.expired.is_empty() {
            crate::metrics::slots::reaped(outcome.expired.len());
            info!(
                expired = outcome.expired.len(),
                admitted = outcome.admitted.len(),
                "reaped expired slot tokens"
            );
            self.released.notify_waiters();
        }
        Ok(outcome)
    }

    pub async fn serve_reaper(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.reap_interval_secs.max(1),
        ));
        loop {
            select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.reap() {
                warn!("slot reap failed: {}", e);
            }
        }
        info!("slot reaper stopped");
    }
}
