use super::*;

fn sine(len: usize, amplitude: f32) -> Vec<i16> {
    (0..len)
        .map(|i| ((i as f32 * 0.1).sin() * amplitude) as i16)
        .collect()
}

#[test]
fn test_pcmu_codec() {
    let mut encoder = pcmu::PcmuEncoder::new();
    let mut decoder = pcmu::PcmuDecoder::new();

    let samples = sine(160, 32000.0);
    let encoded = encoder.encode(&samples);
    assert_eq!(encoded.len(), 160);

    let decoded = decoder.decode(&encoded);
    for (orig, dec) in samples.iter().zip(decoded.iter()) {
        // companding error grows with magnitude
        let tolerance = (orig.unsigned_abs() as i32 / 16).max(64);
        assert!((*orig as i32 - *dec as i32).abs() <= tolerance, "{} vs {}", orig, dec);
    }
}

#[test]
fn test_pcmu_silence_is_0xff() {
    let mut encoder = pcmu::PcmuEncoder::new();
    assert_eq!(encoder.encode(&[0, 0]), vec![0xFF, 0xFF]);
    let mut decoder = pcmu::PcmuDecoder::new();
    assert_eq!(decoder.decode(&[0xFF]), vec![0]);
}

#[test]
fn test_pcma_codec() {
    let mut encoder = pcma::PcmaEncoder::new();
    let mut decoder = pcma::PcmaDecoder::new();

    let samples = sine(160, 32000.0);
    let encoded = encoder.encode(&samples);
    let decoded = decoder.decode(&encoded);
    for (orig, dec) in samples.iter().zip(decoded.iter()) {
        assert!((*orig as i32 - *dec as i32).abs() < 2000);
    }
}

#[test]
fn test_pcma_extremes_do_not_overflow() {
    let mut encoder = pcma::PcmaEncoder::new();
    let encoded = encoder.encode(&[i16::MIN, i16::MAX, -1, 1]);
    assert_eq!(encoded.len(), 4);
}

#[test]
fn test_l16_bytes() {
    let mut encoder = create_encoder(CodecType::L16, 8000);
    let bytes = encoder.encode(&[1, -2, 300]);
    assert_eq!(bytes.len(), 6);
    let mut decoder = create_decoder(CodecType::L16, 8000);
    assert_eq!(decoder.decode(&bytes), vec![1, -2, 300]);
}

#[test]
fn test_codec_from_str() {
    assert_eq!(CodecType::try_from("audio/x-mulaw").unwrap(), CodecType::PCMU);
    assert_eq!(CodecType::try_from("PCMA").unwrap(), CodecType::PCMA);
    assert!(CodecType::try_from("opus").is_err());
}
