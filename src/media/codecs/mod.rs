use crate::{PcmBuf, Sample};
use serde::{Deserialize, Serialize};
pub mod pcma;
pub mod pcmu;
pub mod resample;
#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize, Deserialize)]
pub enum CodecType {
    #[serde(rename = "pcmu")]
    PCMU,
    #[serde(rename = "pcma")]
    PCMA,
    /// Raw 16-bit little-endian linear PCM
    #[serde(rename = "l16")]
    L16,
}

pub trait Decoder: Send + Sync {
    /// Decode encoded audio data into PCM samples
    fn decode(&mut self, data: &[u8]) -> PcmBuf;

    /// Get the sample rate of the decoded audio
    fn sample_rate(&self) -> u32;
}

pub trait Encoder: Send + Sync {
    /// Encode PCM samples into codec-specific format
    fn encode(&mut self, samples: &[Sample]) -> Vec<u8>;

    /// Get the sample rate expected for input samples
    fn sample_rate(&self) -> u32;
}

pub fn create_decoder(codec: CodecType, sample_rate: u32) -> Box<dyn Decoder> {
    match codec {
        CodecType::PCMU => Box::new(pcmu::PcmuDecoder::new()),
        CodecType::PCMA => Box::new(pcma::PcmaDecoder::new()),
        CodecType::L16 => Box::new(LinearCodec { sample_rate }),
    }
}

pub fn create_encoder(codec: CodecType, sample_rate: u32) -> Box<dyn Encoder> {
    match codec {
        CodecType::PCMU => Box::new(pcmu::PcmuEncoder::new()),
        CodecType::PCMA => Box::new(pcma::PcmaEncoder::new()),
        CodecType::L16 => Box::new(LinearCodec { sample_rate }),
    }
}

impl CodecType {
    pub fn mime_type(&self) -> &str {
        match self {
            CodecType::PCMU => "audio/PCMU",
            CodecType::PCMA => "audio/PCMA",
            CodecType::L16 => "audio/L16",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodecType::PCMU => "pcmu",
            CodecType::PCMA => "pcma",
            CodecType::L16 => "l16",
        }
    }

    /// Encoded bytes per sample
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            CodecType::PCMU | CodecType::PCMA => 1,
            CodecType::L16 => 2,
        }
    }
}

impl TryFrom<&str> for CodecType {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "pcmu" | "mulaw" | "audio/x-mulaw" | "0" => Ok(CodecType::PCMU),
            "pcma" | "alaw" | "audio/x-alaw" | "8" => Ok(CodecType::PCMA),
            "l16" | "pcm" | "linear16" => Ok(CodecType::L16),
            _ => Err(anyhow::anyhow!("Invalid codec type: {}", value)),
        }
    }
}

struct LinearCodec {
    sample_rate: u32,
}

impl Decoder for LinearCodec {
    fn decode(&mut self, data: &[u8]) -> PcmBuf {
        bytes_to_samples(data)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Encoder for LinearCodec {
    fn encode(&mut self, samples: &[Sample]) -> Vec<u8> {
        samples_to_bytes(samples)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

pub fn samples_to_bytes(samples: &[Sample]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

pub fn bytes_to_samples(u8_data: &[u8]) -> PcmBuf {
    u8_data
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}
