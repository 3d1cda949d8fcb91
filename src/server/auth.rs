//! JWT authentication for the voice WebSocket
//!
//! Tokens are HS256, issued by the voice-control service. The token arrives
//! either in the `Authorization: Bearer` header or, because browsers cannot
//! set headers on WebSocket upgrades, in the `token`/`access_token`/`jwt`
//! query parameter. A development bypass accepts unauthenticated
//! connections with a generated local session id.

use anyhow::{Context, Result};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::now_ms;

/// Claims carried by a voice-ws token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Stable session identifier.
    pub sub: String,
    /// Agent profile the session is bound to.
    #[serde(default)]
    pub agent: Option<String>,
    pub aud: String,
    pub iss: String,
    pub exp: i64,
}

/// Outcome of authenticating one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authenticated (or local-mode bypass): session id + agent id.
    Accepted { session_id: String, agent_id: String },
    /// Close with 4001: token missing or invalid.
    MissingToken,
    InvalidToken,
    /// Close with 1008: token fine, agent unknown.
    UnknownAgent(String),
}

/// Verify a raw token string against the configured secret/issuer/audience.
pub fn verify_ws_token(token: &str, config: &AuthConfig) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[&config.audience]);
    validation.set_issuer(&[&config.issuer]);

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .context("invalid voice-ws token")?;

    Ok(data.claims)
}

/// Extract the bearer token from header value or query parameters.
pub fn extract_token(auth_header: Option<&str>, query: &[(String, String)]) -> Option<String> {
    if let Some(header) = auth_header {
        if let Some(token) = header.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    for key in ["token", "access_token", "jwt"] {
        if let Some((_, v)) = query.iter().find(|(k, _)| k == key) {
            if !v.is_empty() {
                return Some(v.clone());
            }
        }
    }
    None
}

/// Full connection authentication: dev bypass, then token verification,
/// then agent lookup against `known_agent`.
pub fn authenticate(
    token: Option<String>,
    config: &AuthConfig,
    known_agent: impl Fn(&str) -> bool,
) -> AuthOutcome {
    if config.disable_auth || config.local_mode {
        tracing::info!("local mode: authentication disabled");
        return AuthOutcome::Accepted {
            session_id: format!("local-{}", now_ms()),
            agent_id: crate::agents::DEFAULT_AGENT_ID.to_string(),
        };
    }

    let Some(token) = token else {
        return AuthOutcome::MissingToken;
    };

    let claims = match verify_ws_token(&token, config) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("invalid token: {e}");
            return AuthOutcome::InvalidToken;
        }
    };

    let Some(agent_id) = claims.agent.filter(|a| !a.is_empty()) else {
        return AuthOutcome::UnknownAgent(String::new());
    };
    if !known_agent(&agent_id) {
        return AuthOutcome::UnknownAgent(agent_id);
    }

    AuthOutcome::Accepted {
        session_id: claims.sub,
        agent_id,
    }
}
