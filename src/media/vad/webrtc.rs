use super::VadEngine;
use crate::AudioFrame;
use anyhow::{anyhow, Result};
use webrtc_vad::{SampleRate, Vad, VadMode};

// The underlying handle is a raw pointer; each detector owns its own and
// only ever touches it from the task that owns the detector.
struct SendVad(Vad);
unsafe impl Send for SendVad {}

pub struct WebRtcVad {
    vad: SendVad,
    energy_threshold_db: f32,
}

impl WebRtcVad {
    pub fn new(sample_rate: u32, energy_threshold_db: f32) -> Result<Self> {
        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => return Err(anyhow!("webrtc vad: unsupported sample rate {}", other)),
        };
        Ok(Self {
            vad: SendVad(Vad::new_with_rate_and_mode(rate, VadMode::Aggressive)),
            energy_threshold_db,
        })
    }
}

impl VadEngine for WebRtcVad {
    fn process(&mut self, frame: &AudioFrame, energy_db: f32) -> Result<bool> {
        if energy_db < self.energy_threshold_db {
            return Ok(false);
        }
        self.vad
            .0
            .is_voice_segment(&frame.samples)
            .map_err(|_| anyhow!("webrtc vad: invalid frame length {}", frame.samples.len()))
    }
}
