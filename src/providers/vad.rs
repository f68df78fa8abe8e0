//! Voice activity detection.
//!
//! The shared instance is stateless with respect to sessions; all rolling
//! state lives in the per-session `VadState`, so one local VAD can serve
//! every connection.

use std::collections::VecDeque;

use crate::audio::{self, AudioFormat};
use crate::config::ProviderSettings;
use crate::error::{GatewayError, Result};

/// Per-session VAD state: an Opus decoder (packets must be decoded in
/// arrival order) and a short energy window for hangover smoothing.
pub struct VadState {
    decoder: opus::Decoder,
    window: VecDeque<bool>,
}

const WINDOW_FRAMES: usize = 5;

impl VadState {
    pub fn new() -> Result<Self> {
        let decoder = opus::Decoder::new(audio::SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| GatewayError::ProviderFatal(format!("opus decoder: {e}")))?;
        Ok(Self { decoder, window: VecDeque::with_capacity(WINDOW_FRAMES) })
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }

    fn push(&mut self, is_voice: bool) -> bool {
        if self.window.len() == WINDOW_FRAMES {
            self.window.pop_front();
        }
        self.window.push_back(is_voice);
        // One energetic frame inside the window keeps the voice flag up,
        // bridging short intra-word dips.
        self.window.iter().any(|v| *v)
    }
}

pub trait Vad: Send + Sync {
    /// Whether this frame (in the session's negotiated format) carries speech.
    fn is_vad(&self, state: &mut VadState, frame: &[u8], format: AudioFormat) -> Result<bool>;
}

/// RMS-energy VAD over decoded PCM.
pub struct EnergyVad {
    threshold: f32,
}

const DEFAULT_THRESHOLD: f32 = 200.0;

impl EnergyVad {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self { threshold: settings.threshold.unwrap_or(DEFAULT_THRESHOLD) }
    }
}

impl Vad for EnergyVad {
    fn is_vad(&self, state: &mut VadState, frame: &[u8], format: AudioFormat) -> Result<bool> {
        let pcm: Vec<i16> = match format {
            AudioFormat::Pcm => frame
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
            AudioFormat::Opus => {
                let mut buf = vec![0i16; audio::FRAME_SAMPLES];
                match state.decoder.decode(frame, &mut buf, false) {
                    Ok(n) => {
                        buf.truncate(n);
                        buf
                    }
                    // An undecodable frame is treated as silence rather than
                    // failing the intake loop.
                    Err(_) => Vec::new(),
                }
            }
        };
        let energetic = audio::rms_energy(&pcm) > self.threshold;
        Ok(state.push(energetic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_frame(amplitude: i16) -> Vec<u8> {
        std::iter::repeat(amplitude)
            .take(audio::FRAME_SAMPLES)
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    #[test]
    fn loud_pcm_is_voice_silence_is_not() {
        let vad = EnergyVad { threshold: DEFAULT_THRESHOLD };
        let mut state = VadState::new().unwrap();
        assert!(vad.is_vad(&mut state, &pcm_frame(5000), AudioFormat::Pcm).unwrap());
        state.reset();
        assert!(!vad.is_vad(&mut state, &pcm_frame(0), AudioFormat::Pcm).unwrap());
    }

    #[test]
    fn window_bridges_short_dips() {
        let vad = EnergyVad { threshold: DEFAULT_THRESHOLD };
        let mut state = VadState::new().unwrap();
        assert!(vad.is_vad(&mut state, &pcm_frame(5000), AudioFormat::Pcm).unwrap());
        // A single silent frame right after speech still reads as voice.
        assert!(vad.is_vad(&mut state, &pcm_frame(0), AudioFormat::Pcm).unwrap());
        // A long run of silence clears the window.
        for _ in 0..WINDOW_FRAMES {
            vad.is_vad(&mut state, &pcm_frame(0), AudioFormat::Pcm).unwrap();
        }
        assert!(!vad.is_vad(&mut state, &pcm_frame(0), AudioFormat::Pcm).unwrap());
    }

    #[test]
    fn opus_frames_decode_through_state() {
        let vad = EnergyVad { threshold: DEFAULT_THRESHOLD };
        let mut state = VadState::new().unwrap();
        let loud: Vec<i16> =
            (0..audio::FRAME_SAMPLES).map(|i| ((i as f32 * 0.3).sin() * 12000.0) as i16).collect();
        let frames = audio::encode_pcm_to_frames(&loud).unwrap();
        assert!(vad.is_vad(&mut state, &frames[0], AudioFormat::Opus).unwrap());
    }
}
