use tokio::time::{Duration, Instant};

/// Suppresses voice triggers that are really the AI's own audio coming
/// back through the caller's microphone.
///
/// The window is armed each time AI audio stops reaching the caller, and
/// only by that event.
#[derive(Debug, Clone)]
pub struct EchoGuard {
    window: Duration,
    ai_audio_stopped_at: Option<Instant>,
}

impl EchoGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ai_audio_stopped_at: None,
        }
    }

    pub fn ai_audio_stopped(&mut self, at: Instant) {
        self.ai_audio_stopped_at = Some(match self.ai_audio_stopped_at {
            Some(prev) if prev > at => prev,
            _ => at,
        });
    }

    pub fn is_guarded(&self, at: Instant) -> bool {
        match self.ai_audio_stopped_at {
            Some(stopped) => at >= stopped && at.duration_since(stopped) < self.window,
            None => false,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Binds the opening response and keeps it uninterruptible until its audio
/// has finished and played out.
#[derive(Debug, Clone, Default)]
pub struct GreetingGuard {
    enabled: bool,
    response_id: Option<String>,
    audio_done: bool,
    released: bool,
}

impl GreetingGuard {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            released: !enabled,
            ..Default::default()
        }
    }

    /// First response of the call becomes the greeting. Returns true if bound.
    pub fn bind(&mut self, response_id: &str) -> bool {
        if self.released || self.response_id.is_some() {
            return false;
        }
        self.response_id = Some(response_id.to_string());
        true
    }

    pub fn is_greeting(&self, response_id: &str) -> bool {
        self.response_id.as_deref() == Some(response_id)
    }

    pub fn audio_done(&mut self, response_id: &str) {
        if self.is_greeting(response_id) {
            self.audio_done = true;
        }
    }

    /// Returns true on the call that actually releases protection.
    pub fn try_release(&mut self, playback_active: bool) -> bool {
        if self.released || !self.audio_done || playback_active {
            return false;
        }
        self.released = true;
        true
    }

    pub fn is_protected(&self) -> bool {
        self.enabled && !self.released
    }
}
