//! Audio codec helpers: Opus packets ↔ 16-bit PCM, WAV header assembly and
//! asset file → frame-list conversion.
//!
//! Everything in the gateway speaks 16 kHz mono. Frames are 60 ms, so one
//! Opus packet carries 960 samples.

use std::path::Path;

use crate::error::{GatewayError, Result};

pub const SAMPLE_RATE: u32 = 16_000;
pub const FRAME_DURATION_MS: u64 = 60;
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * FRAME_DURATION_MS as usize;

/// Negotiated outbound audio framing for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    #[default]
    Opus,
    Pcm,
}

impl AudioFormat {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("pcm") {
            AudioFormat::Pcm
        } else {
            AudioFormat::Opus
        }
    }
}

fn codec_err(e: opus::Error) -> GatewayError {
    GatewayError::ProviderFatal(format!("opus codec: {e}"))
}

/// Decode a list of Opus packets into one contiguous PCM buffer.
/// Undecodable packets are skipped rather than failing the whole utterance.
pub fn decode_frames_to_pcm(frames: &[Vec<u8>]) -> Result<Vec<i16>> {
    let mut decoder =
        opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono).map_err(codec_err)?;
    let mut pcm = Vec::with_capacity(frames.len() * FRAME_SAMPLES);
    let mut buf = vec![0i16; FRAME_SAMPLES];
    for packet in frames {
        match decoder.decode(packet, &mut buf, false) {
            Ok(n) => pcm.extend_from_slice(&buf[..n]),
            Err(e) => tracing::warn!("dropping undecodable opus packet: {e}"),
        }
    }
    if pcm.is_empty() {
        return Err(GatewayError::ProviderFatal("no decodable pcm data".into()));
    }
    Ok(pcm)
}

/// Encode PCM into 60 ms Opus packets. The tail is zero-padded to a full
/// frame so every packet decodes back to the same duration.
pub fn encode_pcm_to_frames(pcm: &[i16]) -> Result<Vec<Vec<u8>>> {
    let mut encoder =
        opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .map_err(codec_err)?;
    let mut frames = Vec::with_capacity(pcm.len() / FRAME_SAMPLES + 1);
    for chunk in pcm.chunks(FRAME_SAMPLES) {
        let packet = if chunk.len() == FRAME_SAMPLES {
            encoder.encode_vec(chunk, 4000).map_err(codec_err)?
        } else {
            let mut padded = chunk.to_vec();
            padded.resize(FRAME_SAMPLES, 0);
            encoder.encode_vec(&padded, 4000).map_err(codec_err)?
        };
        frames.push(packet);
    }
    Ok(frames)
}

/// Split PCM into raw little-endian 60 ms byte frames (pcm wire format).
pub fn pcm_to_raw_frames(pcm: &[i16]) -> Vec<Vec<u8>> {
    pcm.chunks(FRAME_SAMPLES)
        .map(|chunk| chunk.iter().flat_map(|s| s.to_le_bytes()).collect())
        .collect()
}

/// 44-byte RIFF/WAVE header for 16-bit 16 kHz mono data of `num_samples`.
pub fn wav_header(num_samples: usize) -> Vec<u8> {
    let data_len = (num_samples * 2) as u32;
    let byte_rate = SAMPLE_RATE * 2;
    let mut h = Vec::with_capacity(44);
    h.extend_from_slice(b"RIFF");
    h.extend_from_slice(&(36 + data_len).to_le_bytes());
    h.extend_from_slice(b"WAVE");
    h.extend_from_slice(b"fmt ");
    h.extend_from_slice(&16u32.to_le_bytes());
    h.extend_from_slice(&1u16.to_le_bytes()); // PCM
    h.extend_from_slice(&1u16.to_le_bytes()); // mono
    h.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    h.extend_from_slice(&byte_rate.to_le_bytes());
    h.extend_from_slice(&2u16.to_le_bytes()); // block align
    h.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    h.extend_from_slice(b"data");
    h.extend_from_slice(&data_len.to_le_bytes());
    h
}

/// Re-encode Opus packets as a complete in-memory WAV (report upload path).
pub fn opus_frames_to_wav_bytes(frames: &[Vec<u8>]) -> Result<Vec<u8>> {
    let pcm = decode_frames_to_pcm(frames)?;
    let mut out = wav_header(pcm.len());
    out.reserve(pcm.len() * 2);
    for sample in &pcm {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(out)
}

/// Load a WAV asset and return it as wire frames in the requested format.
/// Assets are expected to already be 16 kHz mono 16-bit.
pub fn wav_file_to_frames(path: &Path, format: AudioFormat) -> Result<Vec<Vec<u8>>> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| GatewayError::ProviderFatal(format!("open {}: {e}", path.display())))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE {
        return Err(GatewayError::ProviderFatal(format!(
            "{}: expected 16 kHz mono, got {} Hz x{}",
            path.display(),
            spec.sample_rate,
            spec.channels
        )));
    }
    let pcm: Vec<i16> = reader
        .samples::<i16>()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| GatewayError::ProviderFatal(format!("read {}: {e}", path.display())))?;
    match format {
        AudioFormat::Opus => encode_pcm_to_frames(&pcm),
        AudioFormat::Pcm => Ok(pcm_to_raw_frames(&pcm)),
    }
}

/// Decode arbitrary synthesized audio bytes (WAV container) into wire frames.
pub fn wav_bytes_to_frames(bytes: &[u8], format: AudioFormat) -> Result<Vec<Vec<u8>>> {
    let cursor = std::io::Cursor::new(bytes);
    let mut reader = hound::WavReader::new(cursor)
        .map_err(|e| GatewayError::Tts(format!("bad wav payload: {e}")))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE {
        return Err(GatewayError::Tts(format!(
            "expected 16 kHz mono synthesis output, got {} Hz x{}",
            spec.sample_rate, spec.channels
        )));
    }
    let pcm: Vec<i16> = reader
        .samples::<i16>()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| GatewayError::Tts(format!("decode wav payload: {e}")))?;
    match format {
        AudioFormat::Opus => encode_pcm_to_frames(&pcm),
        AudioFormat::Pcm => Ok(pcm_to_raw_frames(&pcm)),
    }
}

/// RMS energy of 16-bit samples, used by the energy VAD.
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| (s as f32).powi(2)).sum::<f32>() / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_lengths() {
        let n = 1234usize;
        let h = wav_header(n);
        assert_eq!(h.len(), 44);
        let riff_len = u32::from_le_bytes([h[4], h[5], h[6], h[7]]);
        let data_len = u32::from_le_bytes([h[40], h[41], h[42], h[43]]);
        assert_eq!(data_len as usize, 2 * n);
        assert_eq!(riff_len as usize, 36 + 2 * n);
    }

    #[test]
    fn opus_round_trip_preserves_duration() {
        // 3 full frames plus a partial tail that must pad to a 4th.
        let pcm: Vec<i16> = (0..FRAME_SAMPLES * 3 + 100)
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect();
        let frames = encode_pcm_to_frames(&pcm).unwrap();
        assert_eq!(frames.len(), 4);
        let decoded = decode_frames_to_pcm(&frames).unwrap();
        assert_eq!(decoded.len(), FRAME_SAMPLES * 4);
    }

    #[test]
    fn pcm_raw_framing() {
        let pcm = vec![1i16; FRAME_SAMPLES + 10];
        let frames = pcm_to_raw_frames(&pcm);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), FRAME_SAMPLES * 2);
        assert_eq!(frames[1].len(), 20);
    }

    #[test]
    fn rms_energy_zero_for_silence() {
        assert_eq!(rms_energy(&[]), 0.0);
        assert!(rms_energy(&[0, 0, 0]) < 1.0);
        assert!(rms_energy(&[1000, -1000, 1000, -1000]) > 900.0);
    }
}
