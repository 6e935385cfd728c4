//! One state machine per call and the single authoritative hang-up.
use super::session::CallSession;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Dialing = 0,
    Ringing = 1,
    Active = 2,
    Closing = 3,
    Ended = 4,
    Failed = 5,
}

impl LifecycleState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Dialing,
            1 => LifecycleState::Ringing,
            2 => LifecycleState::Active,
            3 => LifecycleState::Closing,
            4 => LifecycleState::Ended,
            _ => LifecycleState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Ended | LifecycleState::Failed)
    }

    pub fn can_transition(&self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, to) {
            (Ended | Failed, _) => false,
            (_, Failed) => true,
            (Dialing, Ringing | Active | Closing | Ended) => true,
            (Ringing, Active | Closing | Ended) => true,
            (Active, Closing | Ended) => true,
            (Closing, Ended) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Dialing => "dialing",
            LifecycleState::Ringing => "ringing",
            LifecycleState::Active => "active",
            LifecycleState::Closing => "closing",
            LifecycleState::Ended => "ended",
            LifecycleState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("illegal lifecycle transition {from} -> {to}")]
    IllegalTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Call status as reported by the telephony vendor's status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelephonyStatus {
    Queued,
    Ringing,
    InProgress,
    Completed,
    Busy,
    NoAnswer,
    Failed,
    Canceled,
}

impl TelephonyStatus {
    pub fn parse(value: &str) -> Option<Self> {
        let status = match value.to_ascii_lowercase().replace('_', "-").as_str() {
            "queued" | "initiated" => TelephonyStatus::Queued,
            "ringing" => TelephonyStatus::Ringing,
            "in-progress" | "answered" => TelephonyStatus::InProgress,
            "completed" => TelephonyStatus::Completed,
            "busy" => TelephonyStatus::Busy,
            "no-answer" => TelephonyStatus::NoAnswer,
            "failed" => TelephonyStatus::Failed,
            "canceled" | "cancelled" => TelephonyStatus::Canceled,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TelephonyStatus::Completed
                | TelephonyStatus::Busy
                | TelephonyStatus::NoAnswer
                | TelephonyStatus::Failed
                | TelephonyStatus::Canceled
        )
    }

    /// Terminal without the call ever having been answered normally.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TelephonyStatus::Busy
                | TelephonyStatus::NoAnswer
                | TelephonyStatus::Failed
                | TelephonyStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TelephonyStatus::Queued => "queued",
            TelephonyStatus::Ringing => "ringing",
            TelephonyStatus::InProgress => "in-progress",
            TelephonyStatus::Completed => "completed",
            TelephonyStatus::Busy => "busy",
            TelephonyStatus::NoAnswer => "no-answer",
            TelephonyStatus::Failed => "failed",
            TelephonyStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    ClosingPhrase,
    Silence,
    External(TelephonyStatus),
    StreamStopped,
    Api,
    BackendFailure,
    StartTimeout,
    Shutdown,
    /// The call could not be set up locally
    Internal,
    /// The vendor never accepted the dial request
    DialFailed,
}

impl HangupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HangupReason::ClosingPhrase => "closing_phrase",
            HangupReason::Silence => "silence",
            HangupReason::External(_) => "external",
            HangupReason::StreamStopped => "stream_stopped",
            HangupReason::Api => "api",
            HangupReason::BackendFailure => "backend_failure",
            HangupReason::StartTimeout => "start_timeout",
            HangupReason::Shutdown => "shutdown",
            HangupReason::Internal => "internal",
            HangupReason::DialFailed => "dial_failed",
        }
    }

    /// The far end is already gone; there is nothing to hang up remotely.
    pub fn leg_already_closed(&self) -> bool {
        matches!(
            self,
            HangupReason::External(_) | HangupReason::StreamStopped | HangupReason::DialFailed
        )
    }
}

/// The telephony leg as seen by the lifecycle controller.
#[async_trait]
pub trait LegControl: Send + Sync {
    async fn disconnect(&self, call_id: &str, reason: &HangupReason) -> Result<()>;
}

pub struct LifecycleController {
    session: Arc<CallSession>,
    leg: Arc<dyn LegControl>,
    token: CancellationToken,
    reason: Mutex<Option<HangupReason>>,
}

impl LifecycleController {
    pub fn new(session: Arc<CallSession>, leg: Arc<dyn LegControl>, token: CancellationToken) -> Self {
        Self {
            session,
            leg,
            token,
            reason: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<CallSession> {
        &self.session
    }

    pub fn state(&self) -> LifecycleState {
        self.session.lifecycle_state()
    }

    /// Cancelled once the call has been torn down.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn reason(&self) -> Option<HangupReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `Ok(false)` if already in `to`.
    pub fn transition(&self, to: LifecycleState) -> Result<bool, LifecycleError> {
        loop {
            let from = self.session.lifecycle_state();
            if from == to {
                return Ok(false);
            }
            if !from.can_transition(to) {
                return Err(LifecycleError::IllegalTransition { from, to });
            }
            if self.session.swap_lifecycle_state(from, to) {
                info!(
                    call_id = self.session.call_id,
                    %from,
                    %to,
                    "call lifecycle changed"
                );
                return Ok(true);
            }
        }
    }

    pub fn on_answered(&self) -> bool {
        match self.transition(LifecycleState::Active) {
            Ok(changed) => changed,
            Err(e) => {
                debug!(call_id = self.session.call_id, "answer ignored: {}", e);
                false
            }
        }
    }

    /// Status callback from the vendor. Terminal statuses tear the call
    /// down through the same one-shot path as every other trigger.
    pub async fn on_external_status(&self, status: TelephonyStatus) -> Result<bool> {
        match status {
            TelephonyStatus::Queued => Ok(false),
            TelephonyStatus::Ringing => Ok(self.transition(LifecycleState::Ringing).unwrap_or(false)),
            TelephonyStatus::InProgress => Ok(self.on_answered()),
            _ => self.hangup(HangupReason::External(status)).await,
        }
    }

    /// Disconnect the call. Only the first caller proceeds; the guard is
    /// taken before the leg is touched.
    pub async fn hangup(&self, reason: HangupReason) -> Result<bool> {
        if !self.session.claim_hangup() {
            debug!(
                call_id = self.session.call_id,
                reason = reason.as_str(),
                "hangup already issued, ignoring"
            );
            crate::metrics::call::duplicate_hangup();
            return Ok(false);
        }
        let answered_before = self.state() == LifecycleState::Active
            || self.state() == LifecycleState::Closing;
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(reason.clone());
        self.transition(LifecycleState::Closing).ok();

        info!(
            call_id = self.session.call_id,
            reason = reason.as_str(),
            "hanging up call"
        );
        let result = self.leg.disconnect(&self.session.call_id, &reason).await;
        if let Err(e) = &result {
            warn!(call_id = self.session.call_id, "leg disconnect failed: {}", e);
        }

        let terminal = match &reason {
            HangupReason::External(status) if status.is_failure() && !answered_before => {
                LifecycleState::Failed
            }
            HangupReason::StartTimeout | HangupReason::Internal | HangupReason::DialFailed => {
                LifecycleState::Failed
            }
            _ => LifecycleState::Ended,
        };
        self.transition(terminal).ok();
        crate::metrics::call::ended(&self.session.direction.to_string(), reason.as_str());
        self.token.cancel();
        Ok(true)
    }
}

/// Leg control over the telephony media websocket, with an optional vendor
/// REST endpoint to end the call itself.
pub struct TelephonyLeg {
    stream_token: CancellationToken,
    hangup_url: Option<String>,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl TelephonyLeg {
    pub fn new(
        stream_token: CancellationToken,
        hangup_url: Option<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            stream_token,
            hangup_url,
            auth_token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LegControl for TelephonyLeg {
    async fn disconnect(&self, call_id: &str, reason: &HangupReason) -> Result<()> {
        self.stream_token.cancel();
        if reason.leg_already_closed() {
            return Ok(());
        }
        let Some(url) = &self.hangup_url else {
            return Ok(());
        };
        let mut request = self
            .client
            .post(url.replace("{call_id}", call_id))
            .json(&serde_json::json!({
                "callId": call_id,
                "reason": reason.as_str(),
            }))
            .timeout(std::time::Duration::from_secs(5));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "hangup request for {} failed: {}",
                call_id,
                response.status()
            ));
        }
        Ok(())
    }
}
