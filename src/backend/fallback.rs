use crate::media::codecs::resample::resample_mono;
use crate::PcmBuf;
use anyhow::{anyhow, Result};

/// Load the apology prompt played when the backend cannot be reached,
/// resampled to `sample_rate` and mixed down to mono.
pub fn load_fallback_audio(path: &str, sample_rate: u32) -> Result<PcmBuf> {
    let mut reader =
        hound::WavReader::open(path).map_err(|e| anyhow!("fallback audio {}: {}", path, e))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(anyhow!(
            "fallback audio {}: expected 16-bit PCM, got {} bit {:?}",
            path,
            spec.bits_per_sample,
            spec.sample_format
        ));
    }
    let channels = spec.channels.max(1) as usize;
    let samples = reader
        .samples::<i16>()
        .step_by(channels)
        .collect::<Result<Vec<_>, _>>()?;
    resample_mono(&samples, spec.sample_rate, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &std::path::Path, sample_rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for _ in 0..channels {
                writer.write_sample(((i % 100) * 100) as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_load_and_resample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sorry.wav");
        write_wav(&path, 16000, 2, 16000);
        let pcm = load_fallback_audio(path.to_str().unwrap(), 8000).unwrap();
        assert!((pcm.len() as i64 - 8000).abs() <= 2);
    }

    #[test]
    fn test_missing_file() {
        assert!(load_fallback_audio("/nonexistent/sorry.wav", 8000).is_err());
    }
}
