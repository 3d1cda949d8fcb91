//! Session history and registry
//!
//! A session survives brief disconnects: it is keyed by the stable session id
//! from the auth token and kept in memory until 10 minutes after it is
//! explicitly ended, then garbage-collected by a background sweep.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::llm::ChatMessage;
use crate::now_ms;

/// How long an ended session stays queryable over HTTP.
pub const SESSION_TTL_MS: i64 = 10 * 60 * 1000;

/// Sweep cadence for expired sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One dialog utterance.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub ts: i64,
    pub utterance_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Per-session dialog state.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub agent_id: String,
    pub turns: Vec<Turn>,
    /// In-flight assistant text per utterance id; created on LLM start,
    /// removed when the utterance is committed to `turns`.
    pub llm_buffers: HashMap<u32, String>,
    pub summary: String,
    pub ended: bool,
    pub ended_at_ms: Option<i64>,
}

impl Session {
    pub fn new(session_id: &str, agent_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            turns: Vec::new(),
            llm_buffers: HashMap::new(),
            summary: String::new(),
            ended: false,
            ended_at_ms: None,
        }
    }

    /// Append a turn; empty text is never stored.
    pub fn add_turn(&mut self, role: Role, text: &str, utterance_id: Option<u32>) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        debug!(session = %self.session_id, role = role.as_str(), "added turn: '{}'",
            text.chars().take(50).collect::<String>());
        self.turns.push(Turn {
            role,
            text: text.to_string(),
            ts: now_ms(),
            utterance_id,
        });
    }

    /// System prompt plus the last `max_turns` turns, oldest first.
    pub fn build_llm_messages(&self, system_prompt: &str, max_turns: usize) -> Vec<ChatMessage> {
        let start = self.turns.len().saturating_sub(max_turns);
        let mut messages = vec![ChatMessage::system(system_prompt)];
        for t in &self.turns[start..] {
            messages.push(match t.role {
                Role::User => ChatMessage::user(&t.text),
                Role::Assistant => ChatMessage::assistant(&t.text),
            });
        }
        messages
    }

    /// The most recent assistant turn, if any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Assistant)
            .map(|t| t.text.as_str())
    }
}

/// Heuristic end-of-session summary from the dialog history.
pub fn build_session_summary(session: &Session) -> String {
    let mut user_facts: Vec<&str> = Vec::new();
    let mut emotions: Vec<&str> = Vec::new();

    for t in &session.turns {
        if t.role != Role::User {
            continue;
        }
        user_facts.push(&t.text);
        let lower = t.text.to_lowercase();
        if ["устал", "грустно", "плохо", "стресс", "тревога"]
            .iter()
            .any(|w| lower.contains(w))
        {
            emotions.push("тревожное состояние");
        } else if ["хорошо", "отлично", "в порядке", "спасибо"]
            .iter()
            .any(|w| lower.contains(w))
        {
            emotions.push("положительное");
        } else {
            emotions.push("нейтральное");
        }
    }

    emotions.dedup();
    let key_quotes: Vec<&str> = user_facts.iter().rev().take(3).rev().copied().collect();

    format!(
        "Краткое резюме сессии:\n\
         Основные темы: консультация\n\
         Состояние пользователя: {}\n\
         Ключевые высказывания: {}",
        truncate(&emotions.join(", "), 50),
        truncate(&key_quotes.join(" | "), 100),
    )
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Shared registry of live and recently-ended sessions.
///
/// All access is a short critical section; callers never hold the lock
/// across awaits.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session or resume an existing one. Returns the resumed
    /// turn count, if any.
    pub fn open(&self, session_id: &str, agent_id: &str) -> Option<usize> {
        let mut sessions = self.inner.write().unwrap();
        if let Some(existing) = sessions.get(session_id) {
            info!(session = session_id, "resumed session with {} turns", existing.turns.len());
            return Some(existing.turns.len());
        }
        sessions.insert(session_id.to_string(), Session::new(session_id, agent_id));
        info!(session = session_id, agent = agent_id, "created session");
        None
    }

    /// Run `f` against the session, if it exists.
    pub fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut sessions = self.inner.write().unwrap();
        sessions.get_mut(session_id).map(f)
    }

    pub fn summary(&self, session_id: &str) -> Option<String> {
        let sessions = self.inner.read().unwrap();
        sessions.get(session_id).map(|s| s.summary.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.read().unwrap().contains_key(session_id)
    }

    /// Build the summary if absent, mark the session ended, return the
    /// summary. `None` for unknown sessions.
    pub fn end_session(&self, session_id: &str) -> Option<String> {
        let mut sessions = self.inner.write().unwrap();
        let session = sessions.get_mut(session_id)?;
        if session.summary.is_empty() && !session.turns.is_empty() {
            session.summary = build_session_summary(session);
        }
        session.ended = true;
        session.ended_at_ms = Some(now_ms());
        Some(session.summary.clone())
    }

    /// Drop sessions whose TTL elapsed. Returns the removed ids.
    pub fn sweep_expired(&self, now: i64) -> Vec<String> {
        let mut sessions = self.inner.write().unwrap();
        let dead: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| {
                s.ended && s.ended_at_ms.map(|t| now - t > SESSION_TTL_MS).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            sessions.remove(id);
            info!(session = %id, "session garbage-collected");
        }
        dead
    }

    /// Background sweep loop; runs for the life of the process.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                registry.sweep_expired(now_ms());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_turns_are_dropped() {
        let mut s = Session::new("s1", "assistant");
        s.add_turn(Role::User, "   ", None);
        s.add_turn(Role::User, "привет", None);
        assert_eq!(s.turns.len(), 1);
        assert_eq!(s.turns[0].text, "привет");
    }

    #[test]
    fn llm_messages_keep_last_n_turns() {
        let mut s = Session::new("s1", "assistant");
        for i in 0..20 {
            s.add_turn(Role::User, &format!("вопрос {i}"), None);
            s.add_turn(Role::Assistant, &format!("ответ {i}"), Some(i));
        }
        let messages = s.build_llm_messages("системный промпт", 12);
        assert_eq!(messages.len(), 13);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages.last().unwrap().content, "ответ 19");
    }

    #[test]
    fn last_assistant_text_skips_user_turns() {
        let mut s = Session::new("s1", "assistant");
        s.add_turn(Role::Assistant, "первый ответ", Some(1));
        s.add_turn(Role::User, "ещё вопрос", None);
        assert_eq!(s.last_assistant_text(), Some("первый ответ"));
    }

    #[test]
    fn summary_collects_user_quotes() {
        let mut s = Session::new("s1", "assistant");
        s.add_turn(Role::User, "мне грустно", None);
        s.add_turn(Role::Assistant, "понимаю", Some(1));
        s.add_turn(Role::User, "спасибо, уже хорошо", None);
        let summary = build_session_summary(&s);
        assert!(summary.contains("тревожное состояние"));
        assert!(summary.contains("положительное"));
        assert!(summary.contains("мне грустно"));
    }

    #[test]
    fn registry_open_resume_end() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.open("s1", "assistant"), None);
        registry.with_session("s1", |s| s.add_turn(Role::User, "привет", None));
        assert_eq!(registry.open("s1", "assistant"), Some(1));

        let summary = registry.end_session("s1").unwrap();
        assert!(!summary.is_empty());
        assert!(registry.end_session("missing").is_none());
    }

    #[test]
    fn sweep_removes_only_expired_ended_sessions() {
        let registry = SessionRegistry::new();
        registry.open("alive", "assistant");
        registry.open("done", "assistant");
        registry.with_session("done", |s| s.add_turn(Role::User, "пока", None));
        registry.end_session("done");

        let ended_at = registry.with_session("done", |s| s.ended_at_ms.unwrap()).unwrap();
        assert!(registry.sweep_expired(ended_at + SESSION_TTL_MS - 1).is_empty());
        let dead = registry.sweep_expired(ended_at + SESSION_TTL_MS + 1);
        assert_eq!(dead, vec!["done".to_string()]);
        assert!(registry.contains("alive"));
        assert!(!registry.contains("done"));
    }
}
