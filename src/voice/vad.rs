//! Frame demux, voice activity detection and speech statistics
//!
//! Inbound audio is raw PCM16 mono little-endian at 16 kHz. The demux cuts
//! it into fixed 20 ms frames (640 bytes); an undersized tail stays buffered
//! until the next message. Each frame is classified voice/silence, feeding
//! the pause-duration and speech-rate EMAs the endpointer adapts to.

use anyhow::{anyhow, Result};
use earshot::{VoiceActivityDetector, VoiceActivityProfile};

/// Samples per 20 ms frame at 16 kHz.
pub const FRAME_SAMPLES: usize = 320;

/// Bytes per 20 ms frame at 16 kHz PCM16 mono.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Silences longer than this are terminal pauses, not intra-phrase ones,
/// and are excluded from the pause EMA.
pub const MAX_INTRA_PHRASE_PAUSE_MS: f64 = 800.0;

/// Frame classifier seam. Implementations must be `Send`: the detector
/// lives inside the per-connection task.
pub trait VoiceDetector: Send + Sync {
    /// Classify one 20 ms frame as voice (`true`) or silence.
    fn is_voice(&mut self, frame: &[i16]) -> Result<bool>;
}

/// WebRTC-style VAD with aggressiveness 0..3.
pub struct EarshotVad {
    inner: VoiceActivityDetector,
}

impl EarshotVad {
    pub fn new(mode: u8) -> Self {
        let profile = match mode {
            0 => VoiceActivityProfile::QUALITY,
            1 => VoiceActivityProfile::LBR,
            2 => VoiceActivityProfile::AGGRESSIVE,
            _ => VoiceActivityProfile::VERY_AGGRESSIVE,
        };
        Self {
            inner: VoiceActivityDetector::new(profile),
        }
    }
}

impl VoiceDetector for EarshotVad {
    fn is_voice(&mut self, frame: &[i16]) -> Result<bool> {
        self.inner
            .predict_16khz(frame)
            .map_err(|e| anyhow!("vad frame rejected: {e:?}"))
    }
}

/// Splits the inbound byte stream into whole frames.
pub struct FrameDemux {
    buf: Vec<u8>,
    frame_bytes: usize,
}

impl FrameDemux {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(frame_bytes * 4),
            frame_bytes,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame as samples, in arrival order.
    pub fn next_frame(&mut self) -> Option<Vec<i16>> {
        if self.buf.len() < self.frame_bytes {
            return None;
        }
        let frame: Vec<i16> = self.buf[..self.frame_bytes]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        self.buf.drain(..self.frame_bytes);
        Some(frame)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Adaptive estimate of the speaker's typical intra-phrase pause.
#[derive(Debug, Clone)]
pub struct PauseEma {
    value_ms: f64,
    alpha: f64,
    /// When the current silence began; 0 while in voice.
    silence_start_ms: i64,
    was_voice: bool,
}

impl PauseEma {
    pub fn new(alpha: f64) -> Self {
        Self {
            value_ms: 350.0,
            alpha,
            silence_start_ms: 0,
            was_voice: false,
        }
    }

    pub fn value_ms(&self) -> f64 {
        self.value_ms
    }

    /// Feed one frame classification. Folds a finished voice→silence→voice
    /// pause into the EMA when it was short enough to be intra-phrase.
    pub fn observe(&mut self, is_voice: bool, now_ms: i64) {
        if self.was_voice && !is_voice {
            self.silence_start_ms = now_ms;
        }
        if !self.was_voice && is_voice && self.silence_start_ms != 0 {
            let pause_ms = (now_ms - self.silence_start_ms) as f64;
            if pause_ms <= MAX_INTRA_PHRASE_PAUSE_MS {
                self.value_ms = self.value_ms * (1.0 - self.alpha) + pause_ms * self.alpha;
            }
            self.silence_start_ms = 0;
        }
        self.was_voice = is_voice;
    }
}

/// Exponential estimate of speech rate in words per second.
#[derive(Debug, Clone)]
pub struct SpeechRate {
    wps_ema: f64,
    prev_words: usize,
    prev_ts_ms: i64,
}

impl SpeechRate {
    const ALPHA: f64 = 0.2;
    const SEED_WPS: f64 = 2.2;

    pub fn new() -> Self {
        Self {
            wps_ema: Self::SEED_WPS,
            prev_words: 0,
            prev_ts_ms: 0,
        }
    }

    pub fn wps(&self) -> f64 {
        self.wps_ema
    }

    /// Feed the word count of a substantively-changed partial.
    pub fn observe(&mut self, word_count: usize, now_ms: i64) {
        if self.prev_ts_ms > 0 && word_count > self.prev_words {
            let dt_ms = now_ms - self.prev_ts_ms;
            if dt_ms > 0 {
                let dw = (word_count - self.prev_words) as f64;
                let inst = dw * 1000.0 / dt_ms as f64;
                if inst > 0.0 {
                    self.wps_ema = self.wps_ema * (1.0 - Self::ALPHA) + inst * Self::ALPHA;
                }
            }
        }
        self.prev_words = word_count;
        self.prev_ts_ms = now_ms;
    }

    /// Reset for a new user utterance.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for SpeechRate {
    fn default() -> Self {
        Self::new()
    }
}
