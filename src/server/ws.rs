//! WebSocket voice channel
//!
//! Upgrade, origin check, JWT auth, session open/resume, then the receive
//! loop that drives the per-connection [`VoicePipeline`]. Outbound frames go
//! through a single writer task so control events and binary audio keep the
//! order they were issued in.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::{ClientMessage, Outbound};
use crate::server::auth::{authenticate, extract_token, AuthOutcome};
use crate::server::ServerState;
use crate::voice::vad::EarshotVad;
use crate::voice::{LoopControl, PipelineParams, VoicePipeline};

/// Outbound writer channel depth.
const OUTBOUND_DEPTH: usize = 256;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_voice_session(socket, state, headers, query))
}

async fn handle_voice_session(
    mut ws: WebSocket,
    state: ServerState,
    headers: HeaderMap,
    query: HashMap<String, String>,
) {
    info!("voice session connected");

    // origin allowlist (optional)
    let allowed = &state.config.server.allowed_origins;
    if !allowed.is_empty() {
        let origin = headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !allowed.iter().any(|o| o == origin) {
            warn!("origin not allowed: '{origin}'");
            close_with(&mut ws, 1008, "Origin not allowed").await;
            return;
        }
    }

    // authentication
    let auth_header = headers.get("authorization").and_then(|v| v.to_str().ok());
    let query_pairs: Vec<(String, String)> = query.into_iter().collect();
    let token = extract_token(auth_header, &query_pairs);

    let (session_id, agent_id) =
        match authenticate(token, &state.config.auth, |a| state.agents.contains(a)) {
            AuthOutcome::Accepted { session_id, agent_id } => (session_id, agent_id),
            AuthOutcome::MissingToken => {
                warn!("missing token, closing");
                close_with(&mut ws, 4001, "Missing token").await;
                return;
            }
            AuthOutcome::InvalidToken => {
                close_with(&mut ws, 4001, "Invalid token").await;
                return;
            }
            AuthOutcome::UnknownAgent(agent) => {
                warn!("unknown agent: '{agent}'");
                close_with(&mut ws, 1008, "Unknown agent").await;
                return;
            }
        };

    let agent = state
        .agents
        .get(&agent_id)
        .cloned()
        .unwrap_or_default();
    info!(session = %session_id, agent = %agent_id, "authenticated");

    state.registry.open(&session_id, &agent_id);

    // single writer: everything outbound funnels through one task
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_DEPTH);
    let (mut ws_tx, mut ws_rx) = ws.split();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let result = match msg {
                Outbound::Json(v) => {
                    debug!("→ JSON {}", v.get("type").or_else(|| v.get("event")).and_then(|t| t.as_str()).unwrap_or("?"));
                    ws_tx
                        .send(Message::Text(v.to_string().into()))
                        .await
                }
                Outbound::Binary(b) => {
                    debug!("→ BIN {} bytes", b.len());
                    ws_tx.send(Message::Binary(b.into())).await
                }
            };
            if result.is_err() {
                break;
            }
        }
        ws_tx
    });

    let mut pipeline = match VoicePipeline::start(PipelineParams {
        config: state.config.clone(),
        session_id: session_id.clone(),
        agent_id,
        agent,
        registry: state.registry.clone(),
        dialog_log: state.dialog_log.clone(),
        llm: state.llm.clone(),
        tts: state.tts.clone(),
        recognizer_factory: state.recognizer_factory.clone(),
        vad: Box::new(EarshotVad::new(state.config.asr.vad_mode)),
        outbound: out_tx,
    }) {
        Ok(p) => p,
        Err(e) => {
            error!("pipeline start failed: {e}");
            return;
        }
    };

    pipeline.send_ready().await;

    let mut close: Option<(u16, &'static str)> = None;
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!("transport error: {e}");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let Some(parsed) = ClientMessage::parse(&text) else {
                    debug!(
                        "ignoring unknown message: {}",
                        text.chars().take(100).collect::<String>()
                    );
                    continue;
                };
                let control = match dispatch(&mut pipeline, parsed).await {
                    Ok(c) => c,
                    Err(e) => {
                        error!("handler failed: {e:#}");
                        close = Some((1011, "internal_error"));
                        break;
                    }
                };
                if let LoopControl::Close { code, reason } = control {
                    close = Some((code, reason));
                    break;
                }
            }
            Message::Binary(data) => {
                if let Err(e) = pipeline.on_binary(&data).await {
                    error!("audio path failed: {e:#}");
                    close = Some((1011, "internal_error"));
                    break;
                }
            }
            Message::Close(_) => {
                info!(session = %session_id, "client disconnected");
                break;
            }
            _ => {}
        }
    }

    pipeline.shutdown();
    drop(pipeline);

    // reclaim the sink to deliver the close frame after all queued output
    if let Ok(mut ws_tx) = writer.await {
        if let Some((code, reason)) = close {
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
        }
    }
    info!(session = %session_id, "voice session finished");
}

async fn dispatch(pipeline: &mut VoicePipeline, msg: ClientMessage) -> anyhow::Result<LoopControl> {
    match msg {
        ClientMessage::Config(cfg) => pipeline.on_config(cfg).await,
        ClientMessage::EndSession => Ok(pipeline.on_end_session().await),
        ClientMessage::Reset => {
            pipeline.on_reset().await;
            Ok(LoopControl::Continue)
        }
        ClientMessage::Eof => Ok(pipeline.on_eof().await),
        ClientMessage::Ping(payload) => {
            pipeline.on_ping(payload).await;
            Ok(LoopControl::Continue)
        }
        ClientMessage::SyntheticPartial(text) => {
            pipeline.on_synthetic_partial(text).await;
            Ok(LoopControl::Continue)
        }
        ClientMessage::SyntheticFinal(text) => {
            pipeline.on_synthetic_final(text).await;
            Ok(LoopControl::Continue)
        }
        ClientMessage::Chat(question) => {
            pipeline.on_chat(question).await;
            Ok(LoopControl::Continue)
        }
    }
}

async fn close_with(ws: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = ws
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
