use super::{Decoder, Encoder};

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

pub struct PcmuDecoder {}

impl PcmuDecoder {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for PcmuDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PcmuDecoder {
    fn decode(&mut self, samples: &[u8]) -> Vec<i16> {
        samples.iter().map(|sample| decode_mu_law(*sample)).collect()
    }

    fn sample_rate(&self) -> u32 {
        8000
    }
}

fn decode_mu_law(mu_law_sample: u8) -> i16 {
    let value = !mu_law_sample;
    let sign = value & 0x80;
    let exponent = ((value >> 4) & 0x07) as i32;
    let mantissa = (value & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub struct PcmuEncoder {}

impl PcmuEncoder {
    pub fn new() -> Self {
        Self {}
    }

    fn linear2ulaw(&self, pcm_val: i16) -> u8 {
        let mut pcm = pcm_val as i32;
        let sign = if pcm < 0 {
            pcm = -pcm;
            0x80
        } else {
            0
        };
        if pcm > CLIP {
            pcm = CLIP;
        }
        pcm += BIAS;

        let mut exponent = 7;
        let mut mask = 0x4000;
        while exponent > 0 && (pcm & mask) == 0 {
            exponent -= 1;
            mask >>= 1;
        }
        let mantissa = (pcm >> (exponent + 3)) & 0x0F;
        !((sign | (exponent << 4) | mantissa) as u8)
    }
}

impl Default for PcmuEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for PcmuEncoder {
    fn encode(&mut self, samples: &[i16]) -> Vec<u8> {
        samples.iter().map(|s| self.linear2ulaw(*s)).collect()
    }

    fn sample_rate(&self) -> u32 {
        8000
    }
}
