use crate::{
    backend::AiBackend,
    callrecord::{CallOutcome, CallRecord, CallRecordSender},
    config::Config,
    media::pacer::MediaSink,
    CallDirection, CallId, TenantId,
};
use anyhow::{anyhow, Result};
use std::{sync::Arc, time::Duration};
use tokio::{select, sync::broadcast, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod active_call;
pub mod closing;
pub mod conversation;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod watchdog;
#[cfg(test)]
mod tests;

pub use active_call::{ActiveCall, TelephonyInput};
pub use lifecycle::{HangupReason, LifecycleController, LifecycleState, TelephonyStatus};
pub use registry::{ActiveCallRegistry, CallHandle};
pub use session::{CallSession, CallSessionInfo, CallSessionRef};

pub type CallEventSender = broadcast::Sender<CallEvent>;
pub type CallEventReceiver = broadcast::Receiver<CallEvent>;

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Answered {
        call_id: CallId,
        tenant_id: TenantId,
        job_id: Option<String>,
    },
    /// Emitted exactly once per registered call
    Finished {
        call_id: CallId,
        tenant_id: TenantId,
        job_id: Option<String>,
        outcome: CallOutcome,
        answered: bool,
    },
}

/// Parameters carried by the telephony stream's start message.
#[derive(Debug, Clone, Default)]
pub struct StreamStart {
    pub call_id: CallId,
    pub tenant_id: TenantId,
    pub direction: Option<CallDirection>,
    pub caller: Option<String>,
    pub callee: Option<String>,
    pub job_id: Option<String>,
}

#[derive(Clone)]
pub struct CallManager {
    config: Arc<Config>,
    backend: Arc<dyn AiBackend>,
    registry: Arc<ActiveCallRegistry>,
    callrecord_sender: Option<CallRecordSender>,
    events: CallEventSender,
}

impl CallManager {
    pub fn new(config: Arc<Config>, backend: Arc<dyn AiBackend>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            backend,
            registry: Arc::new(ActiveCallRegistry::new()),
            callrecord_sender: None,
            events,
        }
    }

    pub fn with_callrecord_sender(mut self, sender: CallRecordSender) -> Self {
        self.callrecord_sender = Some(sender);
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ActiveCallRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> CallEventReceiver {
        self.events.subscribe()
    }

    fn new_handle(&self, session: CallSession) -> CallHandle {
        let session = Arc::new(session);
        let token = CancellationToken::new();
        let leg = lifecycle::TelephonyLeg::new(
            token.clone(),
            self.config.dialer.hangup_url.clone(),
            self.config.dialer.auth_token.clone(),
        );
        let lifecycle = Arc::new(LifecycleController::new(
            session.clone(),
            Arc::new(leg),
            token,
        ));
        CallHandle::new(session, lifecycle)
    }

    /// Register a call the dialer has just placed. It stays in `dialing`
    /// until its stream attaches or a status callback ends it.
    pub fn prepare_outbound(
        &self,
        call_id: CallId,
        tenant_id: TenantId,
        job_id: Option<String>,
        caller: Option<String>,
        callee: Option<String>,
    ) -> CallHandle {
        let session = CallSession::new(call_id, tenant_id, CallDirection::Outbound)
            .with_parties(caller, callee)
            .with_job(job_id);
        let handle = self.new_handle(session);
        self.registry.register(handle.clone());

        let manager = self.clone();
        let watched = handle.clone();
        let timeout = Duration::from_secs(self.config.lifecycle.dial_timeout_secs);
        tokio::spawn(async move {
            select! {
                _ = watched.lifecycle.token().cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if !watched.is_attached() {
                        warn!(call_id = watched.call_id(), "dialed call never connected");
                        watched.lifecycle.hangup(HangupReason::StartTimeout).await.ok();
                        manager.finish_unattached(&watched);
                    }
                }
            }
        });
        handle
    }

    /// Bind a telephony stream to its call, creating the call if it was
    /// not dialed by us.
    pub fn attach(&self, start: StreamStart) -> Result<CallHandle> {
        let handle = match self.registry.get(&start.call_id) {
            Some(handle) => handle,
            None => {
                let session = CallSession::new(
                    start.call_id.clone(),
                    start.tenant_id.clone(),
                    start.direction.unwrap_or(CallDirection::Inbound),
                )
                .with_parties(start.caller.clone(), start.callee.clone())
                .with_job(start.job_id.clone());
                let handle = self.new_handle(session);
                self.registry.register(handle.clone());
                handle
            }
        };
        if !handle.try_attach() {
            return Err(anyhow!("call {} already has a media stream", start.call_id));
        }
        if handle.session.hangup_issued() {
            self.finish_unattached(&handle);
            return Err(anyhow!("call {} already ended", start.call_id));
        }
        Ok(handle)
    }

    /// Serve an attached call to completion.
    pub async fn run<S: MediaSink + 'static>(
        &self,
        handle: CallHandle,
        media_rx: mpsc::Receiver<TelephonyInput>,
        sink: S,
    ) -> Result<()> {
        let session = handle.session.clone();
        self.events
            .send(CallEvent::Answered {
                call_id: session.call_id.clone(),
                tenant_id: session.tenant_id.clone(),
                job_id: session.job_id.clone(),
            })
            .ok();

        let start_time = chrono::Utc::now();
        let call = ActiveCall::new(handle.clone(), self.config.clone(), self.backend.clone());
        let record = match call.serve(media_rx, sink).await {
            Ok(record) => record,
            Err(e) => {
                warn!(call_id = session.call_id, "call setup failed: {}", e);
                handle.lifecycle.hangup(HangupReason::Internal).await.ok();
                active_call::build_record(&handle, start_time, Default::default(), 0)
            }
        };
        self.finish(&handle, record, true);
        Ok(())
    }

    /// Vendor status callback. Returns false for calls we do not hold.
    pub async fn on_status(&self, call_id: &str, status: TelephonyStatus) -> Result<bool> {
        let Some(handle) = self.registry.get(call_id) else {
            return Ok(false);
        };
        info!(call_id, status = status.as_str(), "telephony status");
        handle.lifecycle.on_external_status(status).await?;
        if status.is_terminal() && !handle.is_attached() {
            self.finish_unattached(&handle);
        }
        Ok(true)
    }

    /// Hang up a call on request. `None` if the call is unknown.
    pub async fn hangup(&self, call_id: &str) -> Option<bool> {
        let handle = self.registry.get(call_id)?;
        let issued = handle.lifecycle.hangup(HangupReason::Api).await.unwrap_or(false);
        if !handle.is_attached() {
            self.finish_unattached(&handle);
        }
        Some(issued)
    }

    /// Drop a prepared outbound call whose dial request was refused.
    pub async fn abandon(&self, call_id: &str) {
        let Some(handle) = self.registry.get(call_id) else {
            return;
        };
        handle.lifecycle.hangup(HangupReason::DialFailed).await.ok();
        if !handle.is_attached() {
            self.finish_unattached(&handle);
        }
    }

    pub fn list(&self) -> Vec<CallSessionInfo> {
        self.registry.list()
    }

    /// Hang up every call and wait up to `grace` for them to wind down.
    pub async fn shutdown(&self, grace: Duration) {
        let handles = self.registry.handles();
        info!(calls = handles.len(), "hanging up active calls");
        for handle in handles {
            handle.lifecycle.hangup(HangupReason::Shutdown).await.ok();
            if !handle.is_attached() {
                self.finish_unattached(&handle);
            }
        }
        let deadline = tokio::time::Instant::now() + grace;
        while self.registry.count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.registry.count() > 0 {
            warn!(calls = self.registry.count(), "calls still running at shutdown");
        }
    }

    fn finish_unattached(&self, handle: &CallHandle) {
        let mut record = active_call::build_record(
            handle,
            handle.session.created_at,
            Default::default(),
            0,
        );
        if record.outcome == CallOutcome::Completed {
            record.outcome = CallOutcome::Canceled;
        }
        self.finish(handle, record, false);
    }

    /// Removal from the registry is the one-shot guard for completion.
    fn finish(&self, handle: &CallHandle, record: CallRecord, answered: bool) {
        if self.registry.remove(handle.call_id()).is_none() {
            return;
        }
        let outcome = record.outcome;
        if let Some(sender) = &self.callrecord_sender {
            if let Err(e) = sender.send(record) {
                warn!(call_id = handle.call_id(), "call record dropped: {}", e);
            }
        }
        self.events
            .send(CallEvent::Finished {
                call_id: handle.session.call_id.clone(),
                tenant_id: handle.session.tenant_id.clone(),
                job_id: handle.session.job_id.clone(),
                outcome,
                answered,
            })
            .ok();
    }
}
