use super::{Acquire, ReapOutcome, SlotStore, SlotToken, StoreError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct TenantSlots {
    /// token -> expires_at
    holders: HashMap<SlotToken, u64>,
    waiters: VecDeque<(SlotToken, u64)>,
}

impl TenantSlots {
    fn admit(&mut self, max: usize, ttl: Duration, now: u64) -> Vec<SlotToken> {
        let mut admitted = Vec::new();
        while self.holders.len() < max {
            let Some((token, _)) = self.waiters.pop_front() else {
                break;
            };
            self.holders.insert(token.clone(), now + ttl.as_millis() as u64);
            admitted.push(token);
        }
        admitted
    }

    fn position(&self, token: &str) -> Option<usize> {
        self.waiters.iter().position(|(t, _)| t == token)
    }
}

/// Single-process store. The whole registry sits behind one lock, so every
/// operation is trivially atomic.
#[derive(Default)]
pub struct MemorySlotStore {
    tenants: Mutex<HashMap<String, TenantSlots>>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, TenantSlots>>, StoreError> {
        self.tenants.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl SlotStore for MemorySlotStore {
    fn try_acquire(
        &self,
        tenant: &str,
        token: &str,
        max: usize,
        ttl: Duration,
        now: u64,
    ) -> Result<Acquire, StoreError> {
        let mut tenants = self.lock()?;
        let slots = tenants.entry(tenant.to_string()).or_default();
        let expires_at = now + ttl.as_millis() as u64;
        slots.admit(max, ttl, now);

        if let Some(expiry) = slots.holders.get_mut(token) {
            *expiry = expires_at;
            return Ok(Acquire::Acquired);
        }
        if let Some(position) = slots.position(token) {
            slots.waiters[position].1 = expires_at;
            return Ok(Acquire::Queued { position });
        }
        if slots.holders.len() < max && slots.waiters.is_empty() {
            slots.holders.insert(token.to_string(), expires_at);
            return Ok(Acquire::Acquired);
        }
        slots.waiters.push_back((token.to_string(), expires_at));
        Ok(Acquire::Queued {
            position: slots.waiters.len() - 1,
        })
    }

    fn release(
        &self,
        tenant: &str,
        token: &str,
        max: usize,
        ttl: Duration,
        now: u64,
    ) -> Result<Vec<SlotToken>, StoreError> {
        let mut tenants = self.lock()?;
        let Some(slots) = tenants.get_mut(tenant) else {
            return Ok(vec![]);
        };
        if slots.holders.remove(token).is_none() {
            if let Some(position) = slots.position(token) {
                slots.waiters.remove(position);
            }
        }
        let admitted = slots.admit(max, ttl, now);
        if slots.holders.is_empty() && slots.waiters.is_empty() {
            tenants.remove(tenant);
        }
        Ok(admitted)
    }

    fn refresh(
        &self,
        tenant: &str,
        token: &str,
        ttl: Duration,
        now: u64,
    ) -> Result<bool, StoreError> {
        let mut tenants = self.lock()?;
        let expiry = tenants
            .get_mut(tenant)
            .and_then(|slots| slots.holders.get_mut(token));
        match expiry {
            Some(expiry) => {
                *expiry = now + ttl.as_millis() as u64;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn holders(&self, tenant: &str) -> Result<Vec<SlotToken>, StoreError> {
        let tenants = self.lock()?;
        let mut holders: Vec<SlotToken> = tenants
            .get(tenant)
            .map(|slots| slots.holders.keys().cloned().collect())
            .unwrap_or_default();
        holders.sort();
        Ok(holders)
    }

    fn waiters(&self, tenant: &str) -> Result<Vec<SlotToken>, StoreError> {
        let tenants = self.lock()?;
        Ok(tenants
            .get(tenant)
            .map(|slots| slots.waiters.iter().map(|(t, _)| t.clone()).collect())
            .unwrap_or_default())
    }

    fn reap_expired(
        &self,
        now: u64,
        ttl: Duration,
        max_for: &dyn Fn(&str) -> usize,
    ) -> Result<ReapOutcome, StoreError> {
        let mut tenants = self.lock()?;
        let mut outcome = ReapOutcome::default();
        for (tenant, slots) in tenants.iter_mut() {
            slots.holders.retain(|token, expires_at| {
                if *expires_at <= now {
                    outcome.expired.push((tenant.clone(), token.clone()));
                    return false;
                }
                true
            });
            slots.waiters.retain(|(token, expires_at)| {
                if *expires_at <= now {
                    outcome.expired.push((tenant.clone(), token.clone()));
                    return false;
                }
                true
            });
            for token in slots.admit(max_for(tenant), ttl, now) {
                outcome.admitted.push((tenant.clone(), token));
            }
        }
        tenants.retain(|_, slots| !slots.holders.is_empty() || !slots.waiters.is_empty());
        Ok(outcome)
    }
}
