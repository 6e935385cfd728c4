use super::lifecycle::LifecycleController;
use super::session::{CallSessionInfo, CallSessionRef};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone)]
pub struct CallHandle {
    pub session: CallSessionRef,
    pub lifecycle: Arc<LifecycleController>,
    attached: Arc<AtomicBool>,
}

impl CallHandle {
    pub fn new(session: CallSessionRef, lifecycle: Arc<LifecycleController>) -> Self {
        Self {
            session,
            lifecycle,
            attached: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.session.call_id
    }

    /// Claim the call for a media stream. Only one stream may attach.
    pub fn try_attach(&self) -> bool {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct RegistryState {
    calls: HashMap<String, CallHandle>,
}

#[derive(Default)]
pub struct ActiveCallRegistry {
    inner: Mutex<RegistryState>,
}

impl ActiveCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: CallHandle) {
        let mut guard = self.state();
        guard.calls.insert(handle.session.call_id.clone(), handle);
        crate::metrics::call::set_active(guard.calls.len());
    }

    pub fn remove(&self, call_id: &str) -> Option<CallHandle> {
        let mut guard = self.state();
        let removed = guard.calls.remove(call_id);
        crate::metrics::call::set_active(guard.calls.len());
        removed
    }

    pub fn get(&self, call_id: &str) -> Option<CallHandle> {
        self.state().calls.get(call_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn handles(&self) -> Vec<CallHandle> {
        self.state().calls.values().cloned().collect()
    }

    pub fn list(&self) -> Vec<CallSessionInfo> {
        let mut entries: Vec<_> = self
            .state()
            .calls
            .values()
            .map(|h| h.session.info())
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::lifecycle::{HangupReason, LegControl};
    use crate::call::session::CallSession;
    use crate::CallDirection;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NoopLeg;

    #[async_trait]
    impl LegControl for NoopLeg {
        async fn disconnect(&self, _call_id: &str, _reason: &HangupReason) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn handle(call_id: &str) -> CallHandle {
        let session = Arc::new(CallSession::new(
            call_id.to_string(),
            "tenant-1".to_string(),
            CallDirection::Inbound,
        ));
        let lifecycle = Arc::new(LifecycleController::new(
            session.clone(),
            Arc::new(NoopLeg),
            CancellationToken::new(),
        ));
        CallHandle::new(session, lifecycle)
    }

    #[test]
    fn test_register_get_remove() {
        let registry = ActiveCallRegistry::new();
        registry.register(handle("a"));
        registry.register(handle("b"));
        assert_eq!(registry.count(), 2);
        assert!(registry.get("a").is_some());
        assert_eq!(registry.list().len(), 2);
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn test_single_attach() {
        let h = handle("a");
        assert!(!h.is_attached());
        assert!(h.try_attach());
        assert!(!h.clone().try_attach());
        assert!(h.is_attached());
    }
}
