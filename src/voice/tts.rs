//! Text-to-speech backend
//!
//! The synthesis engine contract is text in, complete WAV bytes out. The
//! production engine talks to a Silero-style HTTP service; a warmup cache of
//! short acknowledgement phrases is pre-rendered at startup so the ACK tone
//! can be played the instant an LLM round-trip begins.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};

use crate::config::TtsConfig;
use crate::error::UpstreamError;

/// Pre-rendered acknowledgement phrases, one of which is played while the
/// LLM warms up.
pub const ACK_TEXTS: &[&str] = &[
    "Понимаю о чем речь.",
    "Давай разберемся.",
    "Слушаю внимательно.",
    "Продолжаем разговор.",
    "Я готов.",
    "Вникаю в суть.",
    "Разбираюсь в вопросе.",
    "Анализирую информацию.",
    "Обрабатываю данные.",
    "Изучаю детали.",
    "Концентрируюсь на теме.",
    "Воспринимаю информацию.",
    "Осмысливаю вопрос.",
    "Принимаю к сведению.",
    "Извлекаю смысл.",
    "Прорабатываю детали.",
    "Вникаю в контекст.",
    "Уясняю задачу.",
    "Принимаю запрос.",
    "Анализирую ситуацию.",
];

/// Per-utterance synthesis settings (from the agent profile).
#[derive(Debug, Clone)]
pub struct TtsSettings {
    pub model: String,
    pub voice: String,
    pub speed: f32,
    pub emotion: String,
    pub pause: f32,
}

impl TtsSettings {
    pub fn from_config(config: &TtsConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            speed: config.speed,
            emotion: config.emotion.clone(),
            pause: config.pause,
        }
    }

    /// Settings for a session: the agent profile picks the voice.
    pub fn for_agent(config: &TtsConfig, agent: &crate::agents::AgentProfile) -> Self {
        Self {
            model: config.model.clone(),
            voice: agent.tts_voice.clone(),
            speed: agent.tts_speed,
            emotion: agent.tts_emotion.clone(),
            pause: agent.tts_pause,
        }
    }
}

/// Synthesis seam: text to complete WAV bytes.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize_wav(&self, text: &str, settings: &TtsSettings) -> Result<Vec<u8>, UpstreamError>;
}

/// Silero-style HTTP synthesis service (`POST {base}/tts_wav`).
pub struct HttpTts {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTts {
    pub fn new(config: &TtsConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f32(config.timeout_secs))
            .connect_timeout(Duration::from_secs(2))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TtsEngine for HttpTts {
    async fn synthesize_wav(&self, text: &str, settings: &TtsSettings) -> Result<Vec<u8>, UpstreamError> {
        let response = self
            .http
            .post(format!("{}/tts_wav", self.base_url))
            .json(&json!({
                "text": text,
                "model": settings.model,
                "voice": settings.voice,
                "speed": settings.speed,
                "emotion": settings.emotion,
                "pause_between_sentences": settings.pause,
            }))
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status.as_u16(), body));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(UpstreamError::from_reqwest)
    }
}

/// Engine wrapper with the ACK warmup cache. The cache is read-mostly after
/// startup; synthesis of live chunks always goes to the engine.
pub struct TtsBackend {
    engine: Arc<dyn TtsEngine>,
    cache: RwLock<HashMap<String, Vec<u8>>>,
}

impl TtsBackend {
    pub fn new(engine: Arc<dyn TtsEngine>) -> Self {
        Self {
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-render every ACK phrase. Individual failures are logged and
    /// skipped; a cold cache only costs first-response latency.
    pub async fn warmup_ack(&self, settings: &TtsSettings) {
        for text in ACK_TEXTS {
            match self.engine.synthesize_wav(text, settings).await {
                Ok(wav) => {
                    info!("ACK cached: '{text}' ({} bytes)", wav.len());
                    self.cache.write().unwrap().insert(text.to_string(), wav);
                }
                Err(e) => warn!("ACK warmup failed for '{text}': {e}"),
            }
        }
    }

    pub fn random_ack_text(&self) -> &'static str {
        let idx = rand::rng().random_range(0..ACK_TEXTS.len());
        ACK_TEXTS[idx]
    }

    /// A random ACK phrase and its cached WAV, if warmed up.
    pub fn random_ack_wav(&self) -> (&'static str, Option<Vec<u8>>) {
        let text = self.random_ack_text();
        let wav = self.cache.read().unwrap().get(text).cloned();
        (text, wav)
    }

    /// Synthesize, consulting the cache first.
    pub async fn synthesize_wav(&self, text: &str, settings: &TtsSettings) -> Result<Vec<u8>, UpstreamError> {
        if let Some(cached) = self.cache.read().unwrap().get(text).cloned() {
            return Ok(cached);
        }
        self.engine.synthesize_wav(text, settings).await
    }
}
