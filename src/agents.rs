//! Agent profiles
//!
//! Each WebSocket session is bound to an agent profile from the token's
//! `agent` claim. A profile carries the LLM persona and the voice the TTS
//! backend should use.

use std::collections::HashMap;

/// Default agent when auth is bypassed in local mode.
pub const DEFAULT_AGENT_ID: &str = "assistant";

/// LLM + TTS settings for one agent persona.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub system_prompt: String,
    /// Model override; empty means "use the configured default".
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub tts_voice: String,
    pub tts_speed: f32,
    pub tts_emotion: String,
    pub tts_pause: f32,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            system_prompt: "Ты топ 1 в мире ИИ-ассистент. Ты отлично разбираешься во всех темах. \
                            Отвечай кратко и по делу. 1-2 предложения. Без рассуждений."
                .to_string(),
            model: String::new(),
            temperature: 0.4,
            max_tokens: 220,
            tts_voice: "eugene".to_string(),
            tts_speed: 1.05,
            tts_emotion: "neutral".to_string(),
            tts_pause: 0.12,
        }
    }
}

impl AgentProfile {
    /// Model to request, falling back to the server default.
    pub fn effective_model<'a>(&'a self, default_model: &'a str) -> &'a str {
        if self.model.is_empty() {
            default_model
        } else {
            &self.model
        }
    }
}

/// Registry of known agents.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentProfile>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        let mut agents = HashMap::new();
        agents.insert(DEFAULT_AGENT_ID.to_string(), AgentProfile::default());
        Self { agents }
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose default profile inherits the configured generation
    /// limits.
    pub fn from_config(llm: &crate::config::LlmConfig) -> Self {
        let mut registry = Self::default();
        if let Some(profile) = registry.agents.get_mut(DEFAULT_AGENT_ID) {
            profile.max_tokens = llm.max_tokens;
            profile.temperature = llm.temperature;
        }
        registry
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.agents.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }
}
