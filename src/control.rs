//! Dialog-log push to the voice-control service
//!
//! Every committed user/assistant turn is mirrored to an external
//! voice-control endpoint. Pushes are strictly best-effort: 2 s timeout,
//! fire-and-forget, and a failure never touches the realtime path.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ControlConfig;
use crate::now_ms;
use crate::session::Role;

const PUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Normalize a dialog event for the voice-control consumer. Returns `None`
/// for events that must not be sent (empty text).
pub fn normalize_event(role: Role, text: &str, timestamp_ms: Option<i64>) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(json!({
        "role": role.as_str(),
        "text": text,
        "utterance_id": Value::Null,
        "ts": timestamp_ms.unwrap_or_else(now_ms),
    }))
}

/// Client for the voice-control internal events API.
#[derive(Clone)]
pub struct DialogLog {
    http: reqwest::Client,
    config: Arc<ControlConfig>,
}

impl DialogLog {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(PUSH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            config: Arc::new(config),
        }
    }

    fn enabled(&self) -> bool {
        !self.config.internal_key.is_empty() && !self.config.url.is_empty()
    }

    /// Push one normalized event in the background. Never blocks and never
    /// propagates errors.
    pub fn push(&self, session_id: &str, event: Value) {
        if !self.enabled() {
            return;
        }
        let url = format!(
            "{}/v1/internal/voice/sessions/{}/events",
            self.config.url, session_id
        );
        let http = self.http.clone();
        let key = self.config.internal_key.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            match http
                .post(&url)
                .header("X-Internal-Key", key)
                .json(&event)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    debug!(session = %session_id, "dialog event pushed");
                }
                Ok(resp) => {
                    warn!(session = %session_id, status = %resp.status(), "dialog event push rejected");
                }
                Err(e) => {
                    warn!(session = %session_id, "dialog event push failed: {e}");
                }
            }
        });
    }

    /// Normalize and push a turn.
    pub fn push_turn(&self, session_id: &str, role: Role, text: &str) {
        if let Some(event) = normalize_event(role, text, None) {
            self.push(session_id, event);
        }
    }
}
