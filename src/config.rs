//! Configuration management
//!
//! All settings come from environment variables (optionally via a `.env`
//! file). Each field has a production-sensible default so a bare
//! `voicelink` start works in local mode without any configuration.

use serde::{Deserialize, Serialize};

/// The only sample rate the server speaks: 16 kHz PCM16 mono.
pub const ALLOWED_SAMPLE_RATE: u32 = 16000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub auth: AuthConfig,
    pub asr: AsrConfig,
    pub endpointing: EndpointingConfig,
    pub barge_in: BargeInConfig,
    pub control: ControlConfig,
}

/// Bind addresses and transport limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub health_port: u16,
    /// Optional Origin allowlist; empty set disables the check.
    pub allowed_origins: Vec<String>,
}

/// OpenAI-compatible chat-completions endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// TTS backend (Silero-style HTTP service)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub provider: String,
    pub base_url: String,
    pub model: String,
    pub voice: String,
    pub speed: f32,
    pub emotion: String,
    pub pause: f32,
    pub timeout_secs: f32,
}

/// JWT verification for the WebSocket channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
    /// Development bypass: accept unauthenticated connections.
    pub local_mode: bool,
    pub disable_auth: bool,
}

/// Recognizer and frame pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    pub model_path: String,
    pub sample_rate: u32,
    pub frame_ms: u32,
    /// VAD aggressiveness 0..3.
    pub vad_mode: u8,
    pub partial_rate_limit_ms: i64,
    /// Post-TTS window where audio is buffered but not decoded.
    pub warmup_ms: i64,
    pub decode_in_thread: bool,
}

/// Adaptive endpointing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointingConfig {
    pub early_pause_ms: i64,
    pub final_pause_ms: i64,
    pub stable_ms: i64,
    pub min_words_early: usize,
    pub min_chars_early: usize,
    pub restart_debounce_ms: i64,
    pub pause_ema_alpha: f64,
}

/// Barge-in policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BargeInConfig {
    pub enabled: bool,
    pub min_voice_ms: i64,
    pub cooldown_ms: i64,
    pub ignore_after_tts_ms: i64,
    pub arm_silence_ms: i64,
}

/// Dialog-log sink (voice-control service)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub url: String,
    pub internal_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 2700,
                health_port: 8081,
                allowed_origins: Vec::new(),
            },
            llm: LlmConfig {
                provider: "openai".to_string(),
                base_url: "https://api.openai.com".to_string(),
                api_key: String::new(),
                model: "gpt-3.5-turbo".to_string(),
                max_tokens: 160,
                temperature: 0.3,
            },
            tts: TtsConfig {
                provider: "local".to_string(),
                base_url: "http://127.0.0.1:8002".to_string(),
                model: "silero_ru".to_string(),
                voice: "eugene".to_string(),
                speed: 0.93,
                emotion: "neutral".to_string(),
                pause: 0.12,
                timeout_secs: 10.0,
            },
            auth: AuthConfig {
                jwt_secret: "super-secret-voice-2026".to_string(),
                issuer: "voice-control".to_string(),
                audience: "voice-ws".to_string(),
                local_mode: true,
                disable_auth: true,
            },
            asr: AsrConfig {
                model_path: String::new(),
                sample_rate: ALLOWED_SAMPLE_RATE,
                frame_ms: 20,
                vad_mode: 2,
                partial_rate_limit_ms: 150,
                warmup_ms: 200,
                decode_in_thread: true,
            },
            endpointing: EndpointingConfig {
                early_pause_ms: 300,
                final_pause_ms: 800,
                stable_ms: 250,
                min_words_early: 1,
                min_chars_early: 3,
                restart_debounce_ms: 200,
                pause_ema_alpha: 0.15,
            },
            barge_in: BargeInConfig {
                enabled: true,
                min_voice_ms: 1000,
                cooldown_ms: 2000,
                ignore_after_tts_ms: 500,
                arm_silence_ms: 1000,
            },
            control: ControlConfig {
                url: "http://localhost:8080".to_string(),
                internal_key: String::new(),
            },
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            server: ServerConfig {
                host: env_str("HOST", &d.server.host),
                port: env_parse("PORT", d.server.port),
                health_port: env_parse("HEALTH_PORT", d.server.health_port),
                allowed_origins: env_str("ALLOWED_ORIGINS", "")
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            llm: LlmConfig {
                provider: env_str("LLM_PROVIDER", &d.llm.provider),
                base_url: env_str("LLM_BASE_URL", &d.llm.base_url),
                api_key: env_str("LLM_API_KEY", ""),
                model: env_str("LLM_MODEL", &d.llm.model),
                max_tokens: env_parse("MAX_TOKENS", d.llm.max_tokens),
                temperature: env_parse("TEMPERATURE", d.llm.temperature),
            },
            tts: TtsConfig {
                provider: env_str("TTS_PROVIDER", &d.tts.provider),
                base_url: env_str("TTS_BASE_URL", &d.tts.base_url),
                model: env_str("TTS_MODEL", &d.tts.model),
                voice: env_str("TTS_VOICE", &d.tts.voice),
                speed: env_parse("TTS_SPEED", d.tts.speed),
                emotion: env_str("TTS_EMOTION", &d.tts.emotion),
                pause: env_parse("TTS_PAUSE", d.tts.pause),
                timeout_secs: env_parse("TTS_TIMEOUT", d.tts.timeout_secs),
            },
            auth: AuthConfig {
                jwt_secret: env_str("VOICE_JWT_SECRET", &d.auth.jwt_secret),
                issuer: env_str("VOICE_JWT_ISSUER", &d.auth.issuer),
                audience: d.auth.audience,
                local_mode: env_flag("LOCAL_MODE", d.auth.local_mode),
                disable_auth: env_flag("DISABLE_AUTH", d.auth.disable_auth),
            },
            asr: AsrConfig {
                model_path: env_str("MODEL_PATH", &d.asr.model_path),
                sample_rate: env_parse("SAMPLE_RATE", d.asr.sample_rate),
                frame_ms: env_parse("FRAME_MS", d.asr.frame_ms),
                vad_mode: env_parse("VAD_MODE", d.asr.vad_mode),
                partial_rate_limit_ms: env_parse("PARTIAL_RATE_LIMIT_MS", d.asr.partial_rate_limit_ms),
                warmup_ms: env_parse("ASR_WARMUP_MS", d.asr.warmup_ms),
                decode_in_thread: env_flag("DECODE_IN_THREAD", d.asr.decode_in_thread),
            },
            endpointing: EndpointingConfig {
                early_pause_ms: env_parse("EARLY_PAUSE_MS", d.endpointing.early_pause_ms),
                final_pause_ms: env_parse("FINAL_PAUSE_MS", d.endpointing.final_pause_ms),
                stable_ms: env_parse("STABLE_MS", d.endpointing.stable_ms),
                min_words_early: env_parse("MIN_WORDS_EARLY", d.endpointing.min_words_early),
                min_chars_early: env_parse("MIN_CHARS_EARLY", d.endpointing.min_chars_early),
                restart_debounce_ms: env_parse("RESTART_DEBOUNCE_MS", d.endpointing.restart_debounce_ms),
                pause_ema_alpha: env_parse("PAUSE_EMA_ALPHA", d.endpointing.pause_ema_alpha),
            },
            barge_in: BargeInConfig {
                enabled: env_flag("BARGE_IN_ENABLED", d.barge_in.enabled),
                min_voice_ms: env_parse("BARGE_IN_MIN_VOICE_MS", d.barge_in.min_voice_ms),
                cooldown_ms: env_parse("BARGE_IN_COOLDOWN_MS", d.barge_in.cooldown_ms),
                ignore_after_tts_ms: env_parse("BARGE_IN_IGNORE_AFTER_TTS_MS", d.barge_in.ignore_after_tts_ms),
                arm_silence_ms: env_parse("BARGE_IN_ARM_SILENCE_MS", d.barge_in.arm_silence_ms),
            },
            control: ControlConfig {
                url: env_str("VOICE_CONTROL_URL", &d.control.url),
                internal_key: env_str("VOICE_INTERNAL_KEY", ""),
            },
        }
    }

    /// Bytes per audio frame for mono PCM16.
    pub fn frame_bytes(&self) -> usize {
        (self.asr.sample_rate as usize * self.asr.frame_ms as usize / 1000) * 2
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_realtime_safe() {
        let c = Config::default();
        assert_eq!(c.asr.sample_rate, 16000);
        assert_eq!(c.asr.frame_ms, 20);
        assert_eq!(c.frame_bytes(), 640);
        assert_eq!(c.asr.vad_mode, 2);
        assert_eq!(c.barge_in.min_voice_ms, 1000);
        assert_eq!(c.barge_in.ignore_after_tts_ms, 500);
    }

    #[test]
    fn frame_bytes_tracks_sample_rate() {
        let mut c = Config::default();
        c.asr.sample_rate = 8000;
        assert_eq!(c.frame_bytes(), 320);
    }
}
