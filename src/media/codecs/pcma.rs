use super::{Decoder, Encoder};

/// Even bits are inverted on the wire.
const ALAW_XOR: u8 = 0x55;
const SIGN_BIT: u8 = 0x80;

pub struct PcmaDecoder {}

impl PcmaDecoder {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for PcmaDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PcmaDecoder {
    fn decode(&mut self, samples: &[u8]) -> Vec<i16> {
        samples.iter().map(|sample| decode_a_law(*sample)).collect()
    }

    fn sample_rate(&self) -> u32 {
        8000
    }
}

fn decode_a_law(a_law_sample: u8) -> i16 {
    let value = a_law_sample ^ ALAW_XOR;
    let segment = ((value >> 4) & 0x07) as i32;
    let mut magnitude = ((value & 0x0F) as i32) << 4;
    magnitude = match segment {
        0 => magnitude + 8,
        1 => magnitude + 0x108,
        _ => (magnitude + 0x108) << (segment - 1),
    };
    if value & SIGN_BIT != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

pub struct PcmaEncoder {}

impl PcmaEncoder {
    pub fn new() -> Self {
        Self {}
    }

    fn linear2alaw(&self, pcm_val: i16) -> u8 {
        let (mask, magnitude) = if pcm_val >= 0 {
            (ALAW_XOR | SIGN_BIT, pcm_val as i32)
        } else {
            // negative values are offset by one 13-bit step
            (ALAW_XOR, (-(pcm_val as i32) - 8).max(0))
        };
        let magnitude = magnitude.min(i16::MAX as i32);

        let segment = if magnitude < 0x100 {
            0
        } else {
            (31 - (magnitude as u32).leading_zeros()) as i32 - 7
        };
        let shift = if segment == 0 { 4 } else { segment + 3 };
        let quant = (magnitude >> shift) & 0x0F;
        (((segment << 4) | quant) as u8) ^ mask
    }
}

impl Default for PcmaEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for PcmaEncoder {
    fn encode(&mut self, samples: &[i16]) -> Vec<u8> {
        samples.iter().map(|s| self.linear2alaw(*s)).collect()
    }

    fn sample_rate(&self) -> u32 {
        8000
    }
}
