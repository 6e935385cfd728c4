use crate::AudioFrame;
use anyhow::Result;
use serde::{Deserialize, Serialize};

mod energy;
#[cfg(feature = "vad_webrtc")]
mod webrtc;

pub use energy::EnergyVad;
#[cfg(feature = "vad_webrtc")]
pub use webrtc::WebRtcVad;

/// Energy reported for digital silence.
pub const SILENCE_DB: f32 = -96.0;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VadType {
    Energy,
    #[cfg(feature = "vad_webrtc")]
    Webrtc,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct VadOption {
    pub r#type: VadType,
    /// Voiced audio needed before a start is reported (in ms)
    pub speech_padding: u64,
    /// Trailing silence needed before a stop is reported (in ms)
    pub silence_padding: u64,
    /// Frames quieter than this never count as voice
    pub energy_threshold_db: f32,
}

impl Default for VadOption {
    fn default() -> Self {
        Self {
            #[cfg(feature = "vad_webrtc")]
            r#type: VadType::Webrtc,
            #[cfg(not(feature = "vad_webrtc"))]
            r#type: VadType::Energy,
            speech_padding: 40,
            silence_padding: 300,
            energy_threshold_db: -45.0,
        }
    }
}

pub trait VadEngine: Send {
    fn process(&mut self, frame: &AudioFrame, energy_db: f32) -> Result<bool>;
}

#[cfg_attr(not(feature = "vad_webrtc"), allow(unused_variables))]
pub fn create_vad_engine(option: &VadOption, sample_rate: u32) -> Result<Box<dyn VadEngine>> {
    let engine: Box<dyn VadEngine> = match option.r#type {
        VadType::Energy => Box::new(EnergyVad::new(option.energy_threshold_db)),
        #[cfg(feature = "vad_webrtc")]
        VadType::Webrtc => Box::new(WebRtcVad::new(sample_rate, option.energy_threshold_db)?),
    };
    Ok(engine)
}

/// RMS level of a frame in dBFS.
pub fn frame_energy_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return SILENCE_DB;
    }
    let sum: f64 = samples.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    let rms = (sum / samples.len() as f64).sqrt();
    if rms < 1.0 {
        return SILENCE_DB;
    }
    (20.0 * (rms / 32768.0).log10()).max(SILENCE_DB as f64) as f32
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VoiceEvent {
    /// `timestamp` is the stream time of the first voiced frame
    Started { timestamp: u64 },
    Stopped { timestamp: u64, duration: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameAnalysis {
    pub energy_db: f32,
    pub is_voice: bool,
    pub event: Option<VoiceEvent>,
}

/// Turns per-frame voice decisions into start/stop edges with padding.
pub struct VoiceDetector {
    engine: Box<dyn VadEngine>,
    option: VadOption,
    triggered: bool,
    voiced_since: Option<u64>,
    current_speech_start: Option<u64>,
    temp_end: Option<u64>,
}

impl VoiceDetector {
    pub fn new(engine: Box<dyn VadEngine>, option: VadOption) -> Self {
        Self {
            engine,
            option,
            triggered: false,
            voiced_since: None,
            current_speech_start: None,
            temp_end: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.triggered
    }

    pub fn process(&mut self, frame: &AudioFrame) -> FrameAnalysis {
        let energy_db = frame_energy_db(&frame.samples);
        let is_voice = match self.engine.process(frame, energy_db) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("vad engine error: {}", e);
                false
            }
        };
        let event = self.advance(is_voice, frame.timestamp, frame.duration_ms());
        FrameAnalysis {
            energy_db,
            is_voice,
            event,
        }
    }

    fn advance(&mut self, is_voice: bool, timestamp: u64, frame_ms: u64) -> Option<VoiceEvent> {
        if !self.triggered {
            if !is_voice {
                self.voiced_since = None;
                return None;
            }
            let since = *self.voiced_since.get_or_insert(timestamp);
            if timestamp + frame_ms - since < self.option.speech_padding.max(frame_ms) {
                return None;
            }
            self.triggered = true;
            self.voiced_since = None;
            self.current_speech_start = Some(since);
            self.temp_end = None;
            return Some(VoiceEvent::Started { timestamp: since });
        }

        if is_voice {
            self.temp_end = None;
            return None;
        }

        let temp_end = *self.temp_end.get_or_insert(timestamp);
        if timestamp + frame_ms - temp_end < self.option.silence_padding {
            return None;
        }
        let start = self.current_speech_start.take().unwrap_or(temp_end);
        self.triggered = false;
        self.temp_end = None;
        Some(VoiceEvent::Stopped {
            timestamp: temp_end,
            duration: temp_end.saturating_sub(start),
        })
    }
}

/// Slowly-moving estimate of the line's background level, fed only with
/// frames the detector did not classify as voice.
#[derive(Debug, Clone, Copy)]
pub struct AmbientFloor {
    level_db: f32,
    alpha: f32,
}

impl AmbientFloor {
    pub const MIN_DB: f32 = -90.0;
    pub const MAX_DB: f32 = -25.0;

    pub fn new(initial_db: f32) -> Self {
        Self {
            level_db: initial_db.clamp(Self::MIN_DB, Self::MAX_DB),
            alpha: 0.05,
        }
    }

    pub fn update(&mut self, energy_db: f32, is_voice: bool) {
        if is_voice {
            return;
        }
        let next = self.level_db + self.alpha * (energy_db - self.level_db);
        self.level_db = next.clamp(Self::MIN_DB, Self::MAX_DB);
    }

    pub fn level_db(&self) -> f32 {
        self.level_db
    }
}
