use crate::{PcmBuf, Sample};
use anyhow::Result;
use rubato::{FftFixedInOut, Resampler};
use tracing::warn;

const BLOCK_MS: u64 = 20;

/// Band-limited streaming resampler for one mono channel.
///
/// Input is collected into fixed blocks (one frame at the input rate) and
/// each full block goes through rubato's FFT resampler, which low-passes at
/// the lower rate's Nyquist so wideband backend audio does not fold back
/// into the telephony band. A block of `n` input samples always yields
/// exactly `n * output_rate / input_rate` samples. Buffers are allocated
/// once.
pub struct StreamResampler {
    input_rate: u32,
    output_rate: u32,
    chunk: usize,
    inner: Option<FftFixedInOut<f32>>,
    pending: Vec<f32>,
    input: Vec<Vec<f32>>,
    output: Vec<Vec<f32>>,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32, chunk: usize) -> Result<Self> {
        if input_rate == output_rate {
            return Ok(Self {
                input_rate,
                output_rate,
                chunk: chunk.max(1),
                inner: None,
                pending: Vec::new(),
                input: Vec::new(),
                output: Vec::new(),
            });
        }
        let resampler = FftFixedInOut::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            chunk.max(1),
            1,
        )?;
        // the block size is rounded up to whole FFT sub-chunks
        let chunk = resampler.input_frames_next();
        let output = vec![vec![0.0; resampler.output_frames_max()]];
        Ok(Self {
            input_rate,
            output_rate,
            chunk,
            inner: Some(resampler),
            pending: Vec::with_capacity(chunk * 2),
            input: vec![vec![0.0; chunk]],
            output,
        })
    }

    /// One `ptime` frame of input per block.
    pub fn for_frames(input_rate: u32, output_rate: u32, ptime_ms: u64) -> Result<Self> {
        let chunk = (input_rate as u64 * ptime_ms / 1000) as usize;
        Self::new(input_rate, output_rate, chunk)
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Output samples by which the filtered signal trails the input.
    pub fn delay(&self) -> usize {
        self.inner.as_ref().map_or(0, |r| r.output_delay())
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(ref mut resampler) = self.inner {
            resampler.reset();
        }
    }

    /// Resample every full block available; a partial block is kept for
    /// the next call.
    pub fn process(&mut self, input: &[Sample]) -> PcmBuf {
        if self.inner.is_none() {
            return input.to_vec();
        }
        self.pending
            .extend(input.iter().map(|s| *s as f32 / i16::MAX as f32));
        let blocks = self.pending.len() / self.chunk;
        let mut result = Vec::with_capacity(blocks * self.output[0].len());
        for block in 0..blocks {
            let start = block * self.chunk;
            self.input[0].copy_from_slice(&self.pending[start..start + self.chunk]);
            self.run_block(self.chunk, &mut result);
        }
        self.pending.drain(..blocks * self.chunk);
        result
    }

    /// Push out the partial block, padded with silence, trimmed to the
    /// length that block stands for.
    pub fn flush(&mut self) -> PcmBuf {
        if self.inner.is_none() || self.pending.is_empty() {
            return Vec::new();
        }
        let filled = self.pending.len();
        self.input[0][..filled].copy_from_slice(&self.pending);
        self.input[0][filled..].fill(0.0);
        self.pending.clear();
        let mut result = Vec::new();
        self.run_block(filled, &mut result);
        result
    }

    fn run_block(&mut self, filled: usize, result: &mut PcmBuf) {
        let Some(ref mut resampler) = self.inner else {
            return;
        };
        match resampler.process_into_buffer(&self.input, &mut self.output, None) {
            Ok((_, written)) => {
                let keep = if filled == self.chunk {
                    written
                } else {
                    ((filled as u64 * self.output_rate as u64).div_ceil(self.input_rate as u64)
                        as usize)
                        .min(written)
                };
                result.extend(
                    self.output[0][..keep]
                        .iter()
                        .map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32).round() as Sample),
                );
            }
            Err(e) => {
                warn!(
                    input_rate = self.input_rate,
                    output_rate = self.output_rate,
                    "resample failed: {}",
                    e
                );
            }
        }
    }
}

/// One-shot resample of a whole buffer, e.g. a prompt loaded from disk.
/// The filter delay is drained with silence and cut from the front, so the
/// output lines up with the input.
pub fn resample_mono(input: &[Sample], input_rate: u32, output_rate: u32) -> Result<PcmBuf> {
    if input_rate == output_rate || input.is_empty() {
        return Ok(input.to_vec());
    }
    let mut resampler = StreamResampler::for_frames(input_rate, output_rate, BLOCK_MS)?;
    let expected =
        (input.len() as u64 * output_rate as u64).div_ceil(input_rate as u64) as usize;
    let delay = resampler.delay();

    let mut output = resampler.process(input);
    let mut tail = input.len() % resampler.chunk;
    while output.len() < expected + delay {
        let padding = vec![0; resampler.chunk - tail];
        output.extend(resampler.process(&padding));
        tail = 0;
    }
    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}
