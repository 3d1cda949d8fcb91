//! Voicelink: realtime full-duplex voice conversation server
//!
//! A per-connection state machine that fuses streaming speech recognition,
//! voice activity detection, adaptive endpointing, a streaming LLM call and
//! incremental TTS into a single low-latency dialog:
//! - three-state voice machine (IDLE → USER_SPEAKING → ASSISTANT_TTS) with
//!   strict wire-protocol invariants;
//! - adaptive endpointing driven by pause/speech-rate statistics and
//!   lexical continuation heuristics;
//! - LLM → chunker → TTS → client streaming with epoch-based cancellation;
//! - barge-in: the user can interrupt assistant speech and in-flight
//!   generation is cancelled without stale audio reaching the wire.

pub mod agents;
pub mod config;
pub mod control;
pub mod error;
pub mod llm;
pub mod protocol;
pub mod server;
pub mod session;
pub mod voice;

pub use config::Config;
pub use server::{start as start_server, ServerState};
pub use session::SessionRegistry;
pub use voice::{VoicePipeline, VoiceState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
