//! Frame transport between the telephony leg and the AI backend.
//!
//! The telephony side speaks a narrowband codec (G.711 by default) in fixed
//! `ptime` frames; the backend speaks wideband linear PCM in whatever chunk
//! size it likes. Each direction gets its own owned half so the ingress
//! task, the response router and the pacer never share codec state.
//!
//! Nothing in here performs I/O, takes a lock or allocates more than a
//! frame's worth of samples: every call is expected to finish well under a
//! millisecond.
use super::codecs::{
    create_decoder, create_encoder, resample::StreamResampler, CodecType, Decoder, Encoder,
};
use crate::{config::MediaConfig, AudioFrame, PcmBuf, Sample};
use anyhow::Result;
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub codec: CodecType,
    pub telephony_sample_rate: u32,
    pub backend_sample_rate: u32,
    pub ptime: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        (&MediaConfig::default()).into()
    }
}

impl From<&MediaConfig> for TransportConfig {
    fn from(config: &MediaConfig) -> Self {
        Self {
            codec: config.telephony_codec,
            telephony_sample_rate: config.telephony_sample_rate,
            backend_sample_rate: config.backend_sample_rate,
            ptime: config.ptime(),
        }
    }
}

impl TransportConfig {
    pub fn samples_per_frame(&self) -> usize {
        ((self.telephony_sample_rate as u128 * self.ptime.as_millis()) / 1000).max(1) as usize
    }

    pub fn ptime_ms(&self) -> u64 {
        self.ptime.as_millis() as u64
    }
}

pub struct FrameTransport {
    config: TransportConfig,
}

impl FrameTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Telephony -> engine half: decode and frame inbound payloads.
    pub fn ingress(&self) -> Result<Ingress> {
        Ok(Ingress {
            decoder: create_decoder(self.config.codec, self.config.telephony_sample_rate),
            to_backend: StreamResampler::for_frames(
                self.config.telephony_sample_rate,
                self.config.backend_sample_rate,
                self.config.ptime_ms(),
            )?,
            framer: Framer::new(
                self.config.samples_per_frame(),
                self.config.telephony_sample_rate,
                self.config.ptime_ms(),
            ),
        })
    }

    /// Backend -> queue half: resample response audio into telephony frames.
    pub fn downlink(&self) -> Result<Downlink> {
        Ok(Downlink {
            from_backend: StreamResampler::for_frames(
                self.config.backend_sample_rate,
                self.config.telephony_sample_rate,
                self.config.ptime_ms(),
            )?,
            framer: Framer::new(
                self.config.samples_per_frame(),
                self.config.telephony_sample_rate,
                self.config.ptime_ms(),
            ),
        })
    }

    /// Queue -> telephony half: encode paced frames.
    pub fn egress(&self) -> Egress {
        Egress {
            codec: self.config.codec,
            encoder: create_encoder(self.config.codec, self.config.telephony_sample_rate),
        }
    }
}

/// Re-chunks an arbitrary sample stream into exact `ptime` frames.
struct Framer {
    pending: PcmBuf,
    samples_per_frame: usize,
    sample_rate: u32,
    ptime_ms: u64,
    next_timestamp: u64,
}

impl Framer {
    fn new(samples_per_frame: usize, sample_rate: u32, ptime_ms: u64) -> Self {
        Self {
            pending: Vec::with_capacity(samples_per_frame * 2),
            samples_per_frame,
            sample_rate,
            ptime_ms,
            next_timestamp: 0,
        }
    }

    fn push(&mut self, samples: &[Sample]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::with_capacity(self.pending.len() / self.samples_per_frame);
        while self.pending.len() >= self.samples_per_frame {
            let rest = self.pending.split_off(self.samples_per_frame);
            let samples = std::mem::replace(&mut self.pending, rest);
            frames.push(self.frame(samples));
        }
        frames
    }

    /// Pads the remainder with silence so the tail of an utterance is not lost.
    fn flush(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let mut samples = std::mem::take(&mut self.pending);
        samples.resize(self.samples_per_frame, 0);
        Some(self.frame(samples))
    }

    fn frame(&mut self, samples: PcmBuf) -> AudioFrame {
        let frame = AudioFrame::new(samples, self.next_timestamp, self.sample_rate);
        self.next_timestamp += self.ptime_ms;
        frame
    }
}

pub struct Ingress {
    decoder: Box<dyn Decoder>,
    to_backend: StreamResampler,
    framer: Framer,
}

impl Ingress {
    /// Decode one telephony payload. Vendors normally send exactly one
    /// frame per message; odd sizes are carried over to the next call.
    pub fn ingress(&mut self, raw: &[u8]) -> Vec<AudioFrame> {
        let samples = self.decoder.decode(raw);
        self.framer.push(&samples)
    }

    /// Convert a telephony frame to the backend's sample rate.
    pub fn uplink(&mut self, frame: &AudioFrame) -> PcmBuf {
        self.to_backend.process(&frame.samples)
    }
}

pub struct Downlink {
    from_backend: StreamResampler,
    framer: Framer,
}

impl Downlink {
    pub fn push(&mut self, pcm: &[Sample]) -> Vec<AudioFrame> {
        let resampled = self.from_backend.process(pcm);
        self.framer.push(&resampled)
    }

    /// End of a response: emit the buffered tail, padded to whole frames.
    pub fn finish(&mut self) -> Vec<AudioFrame> {
        let tail = self.from_backend.flush();
        let mut frames = self.framer.push(&tail);
        frames.extend(self.framer.flush());
        self.from_backend.reset();
        frames
    }

    /// Interruption: drop the partial tail instead of playing it.
    pub fn reset(&mut self) {
        self.framer.pending.clear();
        self.from_backend.reset();
    }
}

pub struct Egress {
    codec: CodecType,
    encoder: Box<dyn Encoder>,
}

impl Egress {
    pub fn egress(&mut self, frame: &AudioFrame) -> Bytes {
        Bytes::from(self.encoder.encode(&frame.samples))
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::codecs::pcmu::PcmuEncoder;
    use crate::media::codecs::Encoder;

    fn transport() -> FrameTransport {
        FrameTransport::new(TransportConfig::default())
    }

    #[test]
    fn test_ingress_frames_and_timestamps() {
        let transport = transport();
        let mut ingress = transport.ingress().unwrap();
        let payload = PcmuEncoder::new().encode(&vec![500i16; 160]);

        let first = ingress.ingress(&payload);
        let second = ingress.ingress(&payload);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].samples.len(), 160);
        assert_eq!(first[0].timestamp, 0);
        assert_eq!(second[0].timestamp, 20);

        let uplink = ingress.uplink(&second[0]);
        assert_eq!(uplink.len(), 480);
    }

    #[test]
    fn test_ingress_carries_partial_payloads() {
        let transport = transport();
        let mut ingress = transport.ingress().unwrap();
        assert!(ingress.ingress(&[0xFF; 100]).is_empty());
        let frames = ingress.ingress(&[0xFF; 100]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples.len(), 160);
    }

    #[test]
    fn test_downlink_rechunks_backend_audio() {
        let transport = transport();
        let mut downlink = transport.downlink().unwrap();
        // 50ms of 24kHz audio in an odd-sized chunk
        let frames = downlink.push(&vec![100i16; 1200]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.samples.len() == 160));
        let tail = downlink.finish();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].samples.len(), 160);
        assert!(downlink.finish().is_empty());
    }

    #[test]
    fn test_downlink_response_maps_to_whole_frames() {
        let transport = transport();
        let mut downlink = transport.downlink().unwrap();
        let mut frames = 0;
        for _ in 0..3 {
            frames += downlink.push(&vec![1000i16; 480]).len();
        }
        frames += downlink.finish().len();
        assert_eq!(frames, 3);
    }

    #[test]
    fn test_downlink_removes_content_above_telephony_band() {
        let transport = transport();
        let mut downlink = transport.downlink().unwrap();
        // 6kHz at 24kHz: would alias to 2kHz without a low-pass
        let tone: Vec<i16> = (0..24000)
            .map(|i| {
                let t = i as f32 / 24000.0;
                (10000.0 * (2.0 * std::f32::consts::PI * 6000.0 * t).sin()) as i16
            })
            .collect();
        let frames = downlink.push(&tone);
        assert_eq!(frames.len(), 50);
        let samples: Vec<i16> = frames[5..].iter().flat_map(|f| f.samples.clone()).collect();
        let energy: f64 = samples.iter().map(|s| (*s as f64).powi(2)).sum::<f64>();
        let rms = (energy / samples.len() as f64).sqrt();
        assert!(rms < 350.0, "alias rms {}", rms);
    }

    #[test]
    fn test_egress_encodes_one_byte_per_sample() {
        let transport = transport();
        let mut egress = transport.egress();
        let frame = AudioFrame::new(vec![0; 160], 0, 8000);
        let raw = egress.egress(&frame);
        assert_eq!(raw.len(), 160);
        assert!(raw.iter().all(|b| *b == 0xFF));
    }
}
