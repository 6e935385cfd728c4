/// Frame transport and egress pacing
pub mod media {
    /// Increment when the pacer transmits a frame to the telephony leg
    pub fn frames_sent(codec: &str) {
        metrics::counter!(
            "voicebridge_egress_frames_total",
            "codec" => codec.to_string()
        )
        .increment(1);
    }

    /// Increment when a telephony write took longer than the blocked-write threshold
    pub fn blocked_write(duration_secs: f64) {
        metrics::counter!("voicebridge_egress_blocked_writes_total").increment(1);
        metrics::histogram!("voicebridge_egress_blocked_write_seconds").record(duration_secs);
    }

    /// Increment when the pacer fell behind its deadline and resynchronised
    pub fn pacer_resync() {
        metrics::counter!("voicebridge_egress_pacer_resync_total").increment(1);
    }

    /// Record frames dropped by the outbound queue overflow policy
    pub fn queue_dropped(count: usize) {
        metrics::counter!("voicebridge_queue_dropped_frames_total").increment(count as u64);
    }

    /// Record frames discarded by an interruption flush
    pub fn queue_flushed(count: usize) {
        metrics::counter!("voicebridge_queue_flushed_frames_total").increment(count as u64);
    }

    /// Increment when an inbound frame could not be handed to the turn tracker
    pub fn ingress_backpressure(kind: &str) {
        metrics::counter!(
            "voicebridge_ingress_backpressure_total",
            "kind" => kind.to_string()
        )
        .increment(1);
    }
}

/// Turn-taking decisions
pub mod turn {
    /// Increment when an interruption is honored
    pub fn interruption() {
        metrics::counter!("voicebridge_turn_interruptions_total").increment(1);
    }

    /// Increment when a voice-activity trigger or candidate is rejected
    pub fn rejected(reason: &str) {
        metrics::counter!(
            "voicebridge_turn_rejected_total",
            "reason" => reason.to_string()
        )
        .increment(1);
    }
}

/// Call lifecycle
pub mod call {
    pub fn started(direction: &str) {
        metrics::counter!(
            "voicebridge_calls_started_total",
            "direction" => direction.to_string()
        )
        .increment(1);
    }

    pub fn ended(direction: &str, reason: &str) {
        metrics::counter!(
            "voicebridge_calls_ended_total",
            "direction" => direction.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn set_active(count: usize) {
        metrics::gauge!("voicebridge_calls_active").set(count as f64);
    }

    /// Increment when the silence watchdog nudged the caller
    pub fn nudge() {
        metrics::counter!("voicebridge_silence_nudges_total").increment(1);
    }

    /// Increment when a second hang-up attempt was suppressed by the one-shot guard
    pub fn duplicate_hangup() {
        metrics::counter!("voicebridge_duplicate_hangups_total").increment(1);
    }

    pub fn backend_reconnect(success: bool) {
        metrics::counter!(
            "voicebridge_backend_reconnects_total",
            "success" => success.to_string()
        )
        .increment(1);
    }

    pub fn fallback_played() {
        metrics::counter!("voicebridge_backend_fallback_total").increment(1);
    }
}

/// Slot semaphore
pub mod slots {
    pub fn acquired(tenant: &str) {
        metrics::counter!(
            "voicebridge_slots_acquired_total",
            "tenant" => tenant.to_string()
        )
        .increment(1);
    }

    pub fn queued(tenant: &str) {
        metrics::counter!(
            "voicebridge_slots_queued_total",
            "tenant" => tenant.to_string()
        )
        .increment(1);
    }

    pub fn released(tenant: &str) {
        metrics::counter!(
            "voicebridge_slots_released_total",
            "tenant" => tenant.to_string()
        )
        .increment(1);
    }

    pub fn reaped(count: usize) {
        metrics::counter!("voicebridge_slots_reaped_total").increment(count as u64);
    }
}

/// Outbound dial scheduler
pub mod dialer {
    pub fn job_finished(status: &str) {
        metrics::counter!(
            "voicebridge_dialer_jobs_finished_total",
            "status" => status.to_string()
        )
        .increment(1);
    }

    pub fn run_finished(status: &str) {
        metrics::counter!(
            "voicebridge_dialer_runs_finished_total",
            "status" => status.to_string()
        )
        .increment(1);
    }

    pub fn runs_reclaimed(count: usize) {
        metrics::counter!("voicebridge_dialer_runs_reclaimed_total").increment(count as u64);
    }

    pub fn dial_latency_seconds(duration_secs: f64) {
        metrics::histogram!("voicebridge_dialer_dial_latency_seconds").record(duration_secs);
    }
}

/// Completion notifications
pub mod callrecord {
    pub fn delivered(direction: &str, success: bool) {
        metrics::counter!(
            "voicebridge_callrecord_deliveries_total",
            "direction" => direction.to_string(),
            "success" => success.to_string()
        )
        .increment(1);
    }

    pub fn duplicate_suppressed() {
        metrics::counter!("voicebridge_callrecord_duplicates_total").increment(1);
    }
}
