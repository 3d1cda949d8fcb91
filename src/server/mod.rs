//! Server assembly: WebSocket voice channel plus the HTTP side-channel

pub mod auth;
pub mod http;
pub mod ws;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agents::AgentRegistry;
use crate::config::Config;
use crate::control::DialogLog;
use crate::llm::{LlmClient, LlmStreamer};
use crate::session::SessionRegistry;
use crate::voice::asr::RecognizerFactory;
use crate::voice::tts::{HttpTts, TtsBackend, TtsSettings};

/// Shared server state, cloned into every connection.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub agents: Arc<AgentRegistry>,
    pub dialog_log: DialogLog,
    pub llm: Arc<dyn LlmStreamer>,
    pub tts: Arc<TtsBackend>,
    pub recognizer_factory: RecognizerFactory,
}

impl ServerState {
    pub fn new(config: Config) -> Result<Self> {
        let recognizer_factory = build_recognizer_factory(&config)?;
        let config = Arc::new(config);
        Ok(Self {
            registry: SessionRegistry::new(),
            agents: Arc::new(AgentRegistry::from_config(&config.llm)),
            dialog_log: DialogLog::new(config.control.clone()),
            llm: Arc::new(LlmClient::new(&config.llm)),
            tts: Arc::new(TtsBackend::new(Arc::new(HttpTts::new(&config.tts)))),
            recognizer_factory,
            config,
        })
    }
}

#[cfg(feature = "vosk-asr")]
fn build_recognizer_factory(config: &Config) -> Result<RecognizerFactory> {
    if config.asr.model_path.is_empty() {
        anyhow::bail!("MODEL_PATH is not set");
    }
    crate::voice::asr::vosk_factory(&config.asr.model_path)
}

#[cfg(not(feature = "vosk-asr"))]
fn build_recognizer_factory(config: &Config) -> Result<RecognizerFactory> {
    if !config.asr.model_path.is_empty() {
        tracing::warn!(
            "MODEL_PATH is set but this build has no vosk support; \
             audio will not be transcribed (rebuild with --features vosk-asr)"
        );
    }
    Ok(crate::voice::asr::null_factory())
}

/// Start both listeners and run until shutdown.
pub async fn start(config: Config) -> Result<()> {
    let state = ServerState::new(config)?;

    // pre-render the acknowledgement phrases so the first response can
    // play its ACK instantly
    info!("warming up ACK phrases");
    let ack_settings = TtsSettings::from_config(&state.config.tts);
    state.tts.warmup_ack(&ack_settings).await;
    info!("ACK warmup finished");

    state.registry.spawn_sweeper();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ws_app = Router::new()
        .route("/", get(ws::ws_handler))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let health_app = http::router(state.registry.clone())
        .layer(TraceLayer::new_for_http());

    let ws_addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .context("invalid ws bind address")?;
    let health_addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.health_port
    )
    .parse()
    .context("invalid health bind address")?;

    info!("voice ws listening on ws://{ws_addr}");
    info!("health/api listening on http://{health_addr}");

    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .context("failed to bind ws listener")?;
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .context("failed to bind health listener")?;

    tokio::try_join!(
        async { axum::serve(ws_listener, ws_app).await.context("ws server failed") },
        async {
            axum::serve(health_listener, health_app)
                .await
                .context("health server failed")
        },
    )?;

    Ok(())
}
