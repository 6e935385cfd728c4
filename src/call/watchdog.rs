use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Idle,
    Nudge { attempt: u32 },
    Disconnect,
}

/// Silence watchdog. Counts from the moment it is armed, never earlier.
#[derive(Debug, Clone)]
pub struct SilenceWatchdog {
    timeout: Duration,
    max_nudges: u32,
    cooldown: Duration,
    armed: bool,
    window_start: Instant,
    last_inbound: Option<Instant>,
    nudges: u32,
    last_nudge_at: Option<Instant>,
}

impl SilenceWatchdog {
    pub fn new(timeout: Duration, max_nudges: u32, cooldown: Duration) -> Self {
        Self {
            timeout,
            max_nudges,
            cooldown,
            armed: false,
            window_start: Instant::now(),
            last_inbound: None,
            nudges: 0,
            last_nudge_at: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn nudges(&self) -> u32 {
        self.nudges
    }

    pub fn arm(&mut self, now: Instant) {
        if !self.armed {
            self.armed = true;
            self.window_start = now;
        }
    }

    /// `last_inbound`/`last_outbound` are the session's activity stamps.
    /// Caller speech resets the nudge budget; AI audio only restarts the
    /// window.
    pub fn poll(
        &mut self,
        now: Instant,
        last_inbound: Option<Instant>,
        last_outbound: Option<Instant>,
    ) -> WatchdogAction {
        if !self.armed {
            return WatchdogAction::Idle;
        }
        if let Some(inbound) = last_inbound {
            if self.last_inbound.map(|prev| inbound > prev).unwrap_or(true) {
                self.last_inbound = Some(inbound);
                self.nudges = 0;
            }
            self.extend(inbound);
        }
        if let Some(outbound) = last_outbound {
            self.extend(outbound);
        }

        if now.saturating_duration_since(self.window_start) < self.timeout {
            return WatchdogAction::Idle;
        }
        if self.nudges >= self.max_nudges {
            return WatchdogAction::Disconnect;
        }
        let cooling = self
            .last_nudge_at
            .map(|at| now.saturating_duration_since(at) < self.cooldown)
            .unwrap_or(false);
        if cooling {
            return WatchdogAction::Idle;
        }
        self.nudges += 1;
        self.last_nudge_at = Some(now);
        self.window_start = now;
        WatchdogAction::Nudge {
            attempt: self.nudges,
        }
    }

    fn extend(&mut self, at: Instant) {
        if at > self.window_start {
            self.window_start = at;
        }
    }
}
