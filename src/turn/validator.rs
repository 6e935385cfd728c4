use super::RejectReason;
use crate::config::TurnConfig;
use crate::media::vad::SILENCE_DB;
use tokio::time::{Duration, Instant};

/// Caller speech heard while the AI holds the floor.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub started_at: Instant,
    pub last_voice_at: Instant,
    pub stopped_at: Option<Instant>,
    pub deadline: Instant,
    energy_sum: f64,
    energy_frames: u32,
    pub transcript: Option<String>,
    pub confidence: Option<f32>,
    pub transcript_final: bool,
}

impl Candidate {
    pub fn new(started_at: Instant, window: Duration) -> Self {
        Self {
            started_at,
            last_voice_at: started_at,
            stopped_at: None,
            deadline: started_at + window,
            energy_sum: 0.0,
            energy_frames: 0,
            transcript: None,
            confidence: None,
            transcript_final: false,
        }
    }

    pub fn add_frame(&mut self, at: Instant, energy_db: f32, is_voice: bool) {
        if self.stopped_at.is_some() || !is_voice {
            return;
        }
        self.energy_sum += energy_db as f64;
        self.energy_frames += 1;
        if at > self.last_voice_at {
            self.last_voice_at = at;
        }
    }

    pub fn stop(&mut self, at: Instant) {
        if self.stopped_at.is_none() {
            self.stopped_at = Some(at.max(self.last_voice_at));
        }
    }

    pub fn set_transcript(&mut self, text: &str, confidence: Option<f32>, is_final: bool) {
        self.transcript = Some(text.to_string());
        self.confidence = confidence;
        self.transcript_final = is_final;
    }

    pub fn duration(&self) -> Duration {
        self.stopped_at
            .unwrap_or(self.last_voice_at)
            .saturating_duration_since(self.started_at)
    }

    pub fn mean_energy_db(&self) -> f32 {
        if self.energy_frames == 0 {
            return SILENCE_DB;
        }
        (self.energy_sum / self.energy_frames as f64) as f32
    }

    pub fn expired(&self, at: Instant) -> bool {
        at >= self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Accept,
    /// Not enough evidence yet
    Pending(RejectReason),
    Reject(RejectReason),
}

pub struct UtteranceValidator {
    min_utterance: Duration,
    min_words: usize,
    energy_margin_db: f32,
    high_energy_margin_db: f32,
    ack_confidence: f32,
    ack_phrases: Vec<String>,
}

impl UtteranceValidator {
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            min_utterance: Duration::from_millis(config.min_utterance_ms),
            min_words: config.min_words.max(1),
            energy_margin_db: config.energy_margin_db,
            high_energy_margin_db: config.high_energy_margin_db,
            ack_confidence: config.ack_confidence,
            ack_phrases: config
                .ack_phrases
                .iter()
                .map(|p| normalize(p).join(" "))
                .collect(),
        }
    }

    pub fn is_acknowledgement(&self, words: &[String]) -> bool {
        !words.is_empty()
            && words.len() < self.min_words
            && self.ack_phrases.iter().any(|p| *p == words.join(" "))
    }

    /// All three checks must pass. A check that may still pass once more
    /// audio or a transcript arrives yields `Pending`; once the caller has
    /// stopped and the final transcript is in, failures are final.
    pub fn evaluate(&self, candidate: &Candidate, floor_db: f32) -> Verdict {
        let words = candidate
            .transcript
            .as_deref()
            .map(normalize)
            .unwrap_or_default();
        let is_ack = self.is_acknowledgement(&words);
        let mean = candidate.mean_energy_db();
        let high_energy = mean >= floor_db + self.high_energy_margin_db;
        let settled = candidate.stopped_at.is_some() && candidate.transcript_final;

        let duration_ok = candidate.duration() >= self.min_utterance || (is_ack && high_energy);
        let energy_ok = mean >= floor_db + self.energy_margin_db;
        let words_ok = words.len() >= self.min_words
            || (is_ack && candidate.confidence.unwrap_or(1.0) >= self.ack_confidence);

        let failed = if !energy_ok {
            Some(RejectReason::TooQuiet)
        } else if !duration_ok {
            Some(RejectReason::TooShort)
        } else if !words_ok {
            Some(RejectReason::TooFewWords)
        } else {
            None
        };

        match failed {
            None => Verdict::Accept,
            Some(reason) if settled => Verdict::Reject(reason),
            Some(reason) => Verdict::Pending(reason),
        }
    }
}

/// Lowercased words with surrounding punctuation removed.
pub fn normalize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}
