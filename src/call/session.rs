use super::lifecycle::LifecycleState;
use crate::turn::TurnState;
use crate::{CallDirection, CallId, TenantId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

pub type CallSessionRef = Arc<CallSession>;

/// Shared view of one call.
///
/// Every mutable field has exactly one writer task, named on its setter.
/// Everyone else only loads.
pub struct CallSession {
    pub call_id: CallId,
    pub tenant_id: TenantId,
    pub direction: CallDirection,
    pub caller: Option<String>,
    pub callee: Option<String>,
    /// Outbound job that placed this call, if any
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    epoch: Instant,
    // lifecycle controller
    lifecycle_state: AtomicU8,
    hangup_issued: AtomicBool,
    // conversation task
    turn_state: AtomicU8,
    greeting_protected: AtomicBool,
    // ingress task
    last_inbound_ms: AtomicU64,
    // egress pacer
    last_outbound_ms: AtomicU64,
    media_started: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSessionInfo {
    pub call_id: CallId,
    pub tenant_id: TenantId,
    pub direction: CallDirection,
    pub caller: Option<String>,
    pub callee: Option<String>,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub lifecycle_state: LifecycleState,
    pub turn_state: TurnState,
    pub greeting_protected: bool,
    pub hangup_issued: bool,
}

impl CallSession {
    pub fn new(call_id: CallId, tenant_id: TenantId, direction: CallDirection) -> Self {
        let initial = match direction {
            CallDirection::Inbound => LifecycleState::Ringing,
            CallDirection::Outbound => LifecycleState::Dialing,
        };
        Self {
            call_id,
            tenant_id,
            direction,
            caller: None,
            callee: None,
            job_id: None,
            created_at: Utc::now(),
            epoch: Instant::now(),
            lifecycle_state: AtomicU8::new(initial as u8),
            hangup_issued: AtomicBool::new(false),
            turn_state: AtomicU8::new(TurnState::Silence as u8),
            greeting_protected: AtomicBool::new(true),
            last_inbound_ms: AtomicU64::new(0),
            last_outbound_ms: AtomicU64::new(0),
            media_started: AtomicBool::new(false),
        }
    }

    pub fn with_parties(mut self, caller: Option<String>, callee: Option<String>) -> Self {
        self.caller = caller;
        self.callee = callee;
        self
    }

    pub fn with_job(mut self, job_id: Option<String>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.lifecycle_state.load(Ordering::Acquire))
    }

    /// Writer: lifecycle controller. Compare-and-swap so that a state read by
    /// the controller is the state it replaces.
    pub(crate) fn swap_lifecycle_state(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.lifecycle_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn hangup_issued(&self) -> bool {
        self.hangup_issued.load(Ordering::Acquire)
    }

    /// Writer: lifecycle controller. Returns true for exactly one caller.
    pub(crate) fn claim_hangup(&self) -> bool {
        self.hangup_issued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn turn_state(&self) -> TurnState {
        TurnState::from_u8(self.turn_state.load(Ordering::Acquire))
    }

    /// Writer: conversation task.
    pub fn set_turn_state(&self, state: TurnState) {
        self.turn_state.store(state as u8, Ordering::Release);
    }

    pub fn greeting_protected(&self) -> bool {
        self.greeting_protected.load(Ordering::Acquire)
    }

    /// Writer: conversation task.
    pub fn set_greeting_protected(&self, protected: bool) {
        self.greeting_protected.store(protected, Ordering::Release);
    }

    /// Writer: ingress task. Caller speech was heard at `at`.
    pub fn touch_inbound(&self, at: Instant) {
        self.last_inbound_ms
            .fetch_max(self.offset_ms(at), Ordering::AcqRel);
    }

    /// Writer: egress pacer. AI audio reached the caller at `at`.
    pub fn touch_outbound(&self, at: Instant) {
        self.last_outbound_ms
            .fetch_max(self.offset_ms(at), Ordering::AcqRel);
    }

    /// Writer: egress pacer.
    pub fn mark_media_started(&self) -> bool {
        !self.media_started.swap(true, Ordering::AcqRel)
    }

    pub fn media_started(&self) -> bool {
        self.media_started.load(Ordering::Acquire)
    }

    pub fn last_inbound(&self) -> Option<Instant> {
        self.instant_at(self.last_inbound_ms.load(Ordering::Acquire))
    }

    pub fn last_outbound(&self) -> Option<Instant> {
        self.instant_at(self.last_outbound_ms.load(Ordering::Acquire))
    }

    /// Most recent audio activity from either party.
    pub fn last_activity(&self) -> Option<Instant> {
        match (self.last_inbound(), self.last_outbound()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.lifecycle_state().is_terminal()
    }

    pub fn info(&self) -> CallSessionInfo {
        CallSessionInfo {
            call_id: self.call_id.clone(),
            tenant_id: self.tenant_id.clone(),
            direction: self.direction,
            caller: self.caller.clone(),
            callee: self.callee.clone(),
            job_id: self.job_id.clone(),
            created_at: self.created_at,
            lifecycle_state: self.lifecycle_state(),
            turn_state: self.turn_state(),
            greeting_protected: self.greeting_protected(),
            hangup_issued: self.hangup_issued(),
        }
    }

    // 0 is reserved for "never"
    fn offset_ms(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64 + 1
    }

    fn instant_at(&self, offset: u64) -> Option<Instant> {
        if offset == 0 {
            return None;
        }
        Some(self.epoch + Duration::from_millis(offset - 1))
    }
}
