//! Floor ownership for one call.
//!
//! The tracker is a plain state machine: it owns no tasks and performs no
//! I/O. The conversation task feeds it [`TurnInput`]s with the instant at
//! which each one happened and acts on the returned [`TurnDecision`].
use crate::config::TurnConfig;
use crate::media::vad::AmbientFloor;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

pub mod echo;
#[cfg(test)]
mod tests;
pub mod validator;

use echo::{EchoGuard, GreetingGuard};
use validator::{Candidate, UtteranceValidator, Verdict};

const CANCELLED_HISTORY: usize = 32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Silence = 0,
    UserSpeaking = 1,
    AiSpeaking = 2,
    Interrupted = 3,
}

impl TurnState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => TurnState::UserSpeaking,
            2 => TurnState::AiSpeaking,
            3 => TurnState::Interrupted,
            _ => TurnState::Silence,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Silence => "silence",
            TurnState::UserSpeaking => "user_speaking",
            TurnState::AiSpeaking => "ai_speaking",
            TurnState::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceSource {
    /// Detector running on inbound telephony audio
    Local,
    /// Speech notifications from the AI backend
    Backend,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    VoiceStarted {
        at: Instant,
        source: VoiceSource,
    },
    VoiceFrame {
        at: Instant,
        energy_db: f32,
        is_voice: bool,
    },
    VoiceStopped {
        at: Instant,
        source: VoiceSource,
    },
    UserTranscript {
        at: Instant,
        text: String,
        confidence: Option<f32>,
        is_final: bool,
    },
    ResponseStarted {
        at: Instant,
        response_id: String,
    },
    ResponseAudio {
        at: Instant,
        response_id: String,
    },
    ResponseAudioDone {
        at: Instant,
        response_id: String,
    },
    ResponseDone {
        at: Instant,
        response_id: String,
    },
    /// The outbound queue went from non-empty to empty.
    PlaybackDrained {
        at: Instant,
    },
}

impl TurnInput {
    pub fn at(&self) -> Instant {
        match self {
            TurnInput::VoiceStarted { at, .. }
            | TurnInput::VoiceFrame { at, .. }
            | TurnInput::VoiceStopped { at, .. }
            | TurnInput::UserTranscript { at, .. }
            | TurnInput::ResponseStarted { at, .. }
            | TurnInput::ResponseAudio { at, .. }
            | TurnInput::ResponseAudioDone { at, .. }
            | TurnInput::ResponseDone { at, .. }
            | TurnInput::PlaybackDrained { at } => *at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EchoGuard,
    GreetingProtected,
    Debounce,
    TooShort,
    TooQuiet,
    TooFewWords,
    ValidationTimeout,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::EchoGuard => "echo_guard",
            RejectReason::GreetingProtected => "greeting_protected",
            RejectReason::Debounce => "debounce",
            RejectReason::TooShort => "too_short",
            RejectReason::TooQuiet => "too_quiet",
            RejectReason::TooFewWords => "too_few_words",
            RejectReason::ValidationTimeout => "validation_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnDecision {
    None,
    Floor { from: TurnState, to: TurnState },
    Rejected(RejectReason),
    /// Barge-in accepted: cancel `response_id` (if still generating), flush
    /// queued audio, then call [`TurnTracker::interruption_applied`].
    Interrupt { response_id: Option<String> },
}

pub struct TurnTracker {
    state: TurnState,
    echo: EchoGuard,
    greeting: GreetingGuard,
    validator: UtteranceValidator,
    validation_window: Duration,
    debounce: Duration,
    debounce_until: Option<Instant>,
    floor: AmbientFloor,
    candidate: Option<Candidate>,
    current_response: Option<String>,
    cancelled: VecDeque<String>,
    playback_active: bool,
    interruptions: u32,
}

impl TurnTracker {
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            state: TurnState::Silence,
            echo: EchoGuard::new(Duration::from_millis(config.echo_guard_ms)),
            greeting: GreetingGuard::new(config.protect_greeting),
            validator: UtteranceValidator::new(config),
            validation_window: Duration::from_millis(config.validation_window_ms),
            debounce: Duration::from_millis(config.debounce_ms),
            debounce_until: None,
            floor: AmbientFloor::new(config.ambient_floor_db),
            candidate: None,
            current_response: None,
            cancelled: VecDeque::with_capacity(CANCELLED_HISTORY),
            playback_active: false,
            interruptions: 0,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn greeting_protected(&self) -> bool {
        self.greeting.is_protected()
    }

    pub fn ambient_floor_db(&self) -> f32 {
        self.floor.level_db()
    }

    pub fn current_response(&self) -> Option<&str> {
        self.current_response.as_deref()
    }

    pub fn is_cancelled(&self, response_id: &str) -> bool {
        self.cancelled.iter().any(|id| id == response_id)
    }

    pub fn has_candidate(&self) -> bool {
        self.candidate.is_some()
    }

    pub fn interruptions(&self) -> u32 {
        self.interruptions
    }

    pub fn handle(&mut self, input: TurnInput) -> TurnDecision {
        if let Some(expired) = self.expire_candidate(input.at()) {
            return expired;
        }
        match input {
            TurnInput::VoiceStarted { at, source } => self.on_voice_started(at, source),
            TurnInput::VoiceFrame {
                at,
                energy_db,
                is_voice,
            } => {
                self.floor.update(energy_db, is_voice);
                match self.candidate.as_mut() {
                    Some(candidate) => {
                        candidate.add_frame(at, energy_db, is_voice);
                        self.evaluate_candidate(at)
                    }
                    None => TurnDecision::None,
                }
            }
            TurnInput::VoiceStopped { at, .. } => {
                if let Some(candidate) = self.candidate.as_mut() {
                    candidate.stop(at);
                    return self.evaluate_candidate(at);
                }
                if self.state == TurnState::UserSpeaking {
                    return self.transition(TurnState::Silence);
                }
                TurnDecision::None
            }
            TurnInput::UserTranscript {
                at,
                text,
                confidence,
                is_final,
            } => match self.candidate.as_mut() {
                Some(candidate) => {
                    candidate.set_transcript(&text, confidence, is_final);
                    self.evaluate_candidate(at)
                }
                None => TurnDecision::None,
            },
            TurnInput::ResponseStarted { response_id, .. } => {
                if self.is_cancelled(&response_id) {
                    return TurnDecision::None;
                }
                if self.greeting.bind(&response_id) {
                    info!(response_id, "greeting response bound");
                }
                self.current_response = Some(response_id);
                self.transition(TurnState::AiSpeaking)
            }
            TurnInput::ResponseAudio { response_id, .. } => {
                if self.is_cancelled(&response_id) {
                    return TurnDecision::None;
                }
                self.playback_active = true;
                if self.current_response.is_none() {
                    self.current_response = Some(response_id);
                }
                self.transition(TurnState::AiSpeaking)
            }
            TurnInput::ResponseAudioDone { at, response_id } => {
                if self.is_cancelled(&response_id) {
                    return TurnDecision::None;
                }
                self.greeting.audio_done(&response_id);
                if !self.playback_active {
                    self.echo.ai_audio_stopped(at);
                }
                self.release_greeting();
                TurnDecision::None
            }
            TurnInput::ResponseDone { at, response_id } => {
                if self.is_cancelled(&response_id) {
                    return TurnDecision::None;
                }
                // no more audio can follow a finished response
                self.greeting.audio_done(&response_id);
                if self.current_response.as_deref() == Some(response_id.as_str()) {
                    self.current_response = None;
                }
                self.release_greeting();
                if self.state == TurnState::AiSpeaking && !self.playback_active {
                    self.candidate = None;
                    self.echo.ai_audio_stopped(at);
                    return self.transition(TurnState::Silence);
                }
                TurnDecision::None
            }
            TurnInput::PlaybackDrained { at } => {
                if !self.playback_active {
                    return TurnDecision::None;
                }
                self.playback_active = false;
                self.echo.ai_audio_stopped(at);
                self.release_greeting();
                if self.state == TurnState::AiSpeaking && self.current_response.is_none() {
                    if self.candidate.take().is_some() {
                        debug!("ai playback finished, dropping barge-in candidate");
                    }
                    return self.transition(TurnState::Silence);
                }
                TurnDecision::None
            }
        }
    }

    /// Deadline check for callers that have no input to deliver.
    pub fn poll(&mut self, at: Instant) -> TurnDecision {
        self.expire_candidate(at).unwrap_or(TurnDecision::None)
    }

    /// The interruption has been carried out: response cancelled, queue
    /// flushed. The caller now holds the floor.
    pub fn interruption_applied(&mut self, _at: Instant) -> TurnDecision {
        if self.state != TurnState::Interrupted {
            return TurnDecision::None;
        }
        self.transition(TurnState::UserSpeaking)
    }

    fn on_voice_started(&mut self, at: Instant, source: VoiceSource) -> TurnDecision {
        if self.echo.is_guarded(at) {
            return self.reject(RejectReason::EchoGuard);
        }
        if self.debounce_until.map(|until| at < until).unwrap_or(false) {
            return self.reject(RejectReason::Debounce);
        }
        match self.state {
            TurnState::Silence => self.transition(TurnState::UserSpeaking),
            TurnState::AiSpeaking => {
                if self.greeting.is_protected() {
                    return self.reject(RejectReason::GreetingProtected);
                }
                if self.candidate.is_none() {
                    debug!(?source, "barge-in candidate opened");
                    self.candidate = Some(Candidate::new(at, self.validation_window));
                }
                TurnDecision::None
            }
            TurnState::UserSpeaking | TurnState::Interrupted => TurnDecision::None,
        }
    }

    fn evaluate_candidate(&mut self, at: Instant) -> TurnDecision {
        let Some(candidate) = self.candidate.as_ref() else {
            return TurnDecision::None;
        };
        match self.validator.evaluate(candidate, self.floor.level_db()) {
            Verdict::Accept => self.accept_interruption(at),
            Verdict::Reject(reason) => {
                self.candidate = None;
                self.reject(reason)
            }
            Verdict::Pending(_) => TurnDecision::None,
        }
    }

    fn expire_candidate(&mut self, at: Instant) -> Option<TurnDecision> {
        let expired = self
            .candidate
            .as_ref()
            .map(|c| c.expired(at))
            .unwrap_or(false);
        if !expired {
            return None;
        }
        if let Some(candidate) = self.candidate.take() {
            let verdict = self.validator.evaluate(&candidate, self.floor.level_db());
            if let Verdict::Accept = verdict {
                self.candidate = Some(candidate);
                return Some(self.accept_interruption(at));
            }
        }
        Some(self.reject(RejectReason::ValidationTimeout))
    }

    fn accept_interruption(&mut self, at: Instant) -> TurnDecision {
        let candidate = self.candidate.take();
        let response_id = self.current_response.take();
        if let Some(id) = &response_id {
            if self.cancelled.len() >= CANCELLED_HISTORY {
                self.cancelled.pop_front();
            }
            self.cancelled.push_back(id.clone());
        }
        self.playback_active = false;
        self.debounce_until = Some(at + self.debounce);
        self.interruptions += 1;
        info!(
            response_id = response_id.as_deref().unwrap_or_default(),
            transcript = candidate
                .as_ref()
                .and_then(|c| c.transcript.as_deref())
                .unwrap_or_default(),
            "barge-in accepted"
        );
        crate::metrics::turn::interruption();
        self.state = TurnState::Interrupted;
        TurnDecision::Interrupt { response_id }
    }

    fn release_greeting(&mut self) {
        if self.greeting.try_release(self.playback_active) {
            info!("greeting finished, interruptions enabled");
        }
    }

    fn reject(&self, reason: RejectReason) -> TurnDecision {
        debug!(reason = reason.as_str(), state = %self.state, "voice trigger rejected");
        crate::metrics::turn::rejected(reason.as_str());
        TurnDecision::Rejected(reason)
    }

    fn transition(&mut self, to: TurnState) -> TurnDecision {
        if self.state == to {
            return TurnDecision::None;
        }
        let from = self.state;
        self.state = to;
        debug!(%from, %to, "floor changed");
        TurnDecision::Floor { from, to }
    }
}
