//! Wire protocol for the realtime voice channel
//!
//! One ordered bidirectional stream carrying JSON text frames and binary
//! audio frames. The contract:
//!
//! - JSON control events may appear at any time.
//! - Binary audio (server → client) appears only between `tts_start` and
//!   `tts_end` carrying the same utterance id.
//! - Client PCM frames are exactly one 20 ms frame (640 bytes at 16 kHz
//!   PCM16 mono) and are only accepted outside of assistant speech.
//!
//! Binary framing: `AUD0` magic, u32 utterance id LE, u16 mime LE
//! (1 = WAV), u32 payload length LE, payload.

use serde_json::{json, Value};

/// Magic prefix of every binary audio frame.
pub const AUDIO_MAGIC: &[u8; 4] = b"AUD0";

/// Mime code for WAV payloads.
pub const MIME_WAV: u16 = 1;

/// Size of the binary frame header in bytes.
pub const AUDIO_HEADER_LEN: usize = 4 + 4 + 2 + 4;

/// Messages a client can send. Parsed in the same precedence order the
/// server has always used: handshake first, then session control, then the
/// legacy key-style commands.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `{"config": {...}}` handshake.
    Config(SessionConfig),
    /// `{"type":"end_session"}`
    EndSession,
    /// `{"reset":1}`: finalize the current phrase, keep the connection.
    Reset,
    /// `{"type":"partial","partial":"..."}`: synthetic ASR partial (tests).
    SyntheticPartial(String),
    /// `{"type":"final","text":"..."}`: synthetic ASR final (tests).
    SyntheticFinal(String),
    /// `{"ping": x}` keep-alive.
    Ping(Value),
    /// `{"eof":1}`: finalize and close.
    Eof,
    /// `{"chat":"..."}`: text question through the same pipeline.
    Chat(String),
}

/// Client handshake options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionConfig {
    pub sample_rate: Option<u32>,
    pub words: bool,
    pub phrase_list: Option<Vec<String>>,
}

impl ClientMessage {
    /// Parse a text frame. Returns `None` for unknown or malformed messages,
    /// which the caller ignores (they are not protocol violations).
    pub fn parse(text: &str) -> Option<Self> {
        let data: Value = serde_json::from_str(text).ok()?;

        if let Some(cfg) = data.get("config") {
            let sample_rate = cfg.get("sample_rate").and_then(Value::as_u64).map(|v| v as u32);
            let words = cfg.get("words").and_then(Value::as_bool).unwrap_or(false);
            let phrase_list = cfg.get("phrase_list").and_then(Value::as_array).map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            });
            return Some(Self::Config(SessionConfig {
                sample_rate,
                words,
                phrase_list,
            }));
        }

        if data.get("type").and_then(Value::as_str) == Some("end_session") {
            return Some(Self::EndSession);
        }
        if data.get("reset").and_then(Value::as_i64) == Some(1) {
            return Some(Self::Reset);
        }
        if data.get("type").and_then(Value::as_str) == Some("partial") {
            let partial = data.get("partial").and_then(Value::as_str).unwrap_or("").trim().to_string();
            return Some(Self::SyntheticPartial(partial));
        }
        if data.get("type").and_then(Value::as_str) == Some("final") {
            let text = data.get("text").and_then(Value::as_str).unwrap_or("").trim().to_string();
            return Some(Self::SyntheticFinal(text));
        }
        if let Some(v) = data.get("ping") {
            return Some(Self::Ping(v.clone()));
        }
        if data.get("eof").and_then(Value::as_i64) == Some(1) {
            return Some(Self::Eof);
        }
        if let Some(q) = data.get("chat").and_then(Value::as_str) {
            return Some(Self::Chat(q.trim().to_string()));
        }

        None
    }
}

/// One outbound wire frame, already encoded. All frames traverse a single
/// writer task so JSON and binary keep causal order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Json(Value),
    Binary(Vec<u8>),
}

/// Cancellation scope reported in `abort` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortScope {
    Llm,
    Tts,
}

impl AbortScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Tts => "tts",
        }
    }
}

/// Server event constructors. Shapes match the historical contract exactly:
/// handshake events use an `"event"` key, everything else a `"type"` key.
pub mod events {
    use super::*;

    pub fn ready(sample_rate: u32, frame_ms: u32, vad_mode: u8, early_pause_ms: i64, final_pause_ms: i64, stable_ms: i64) -> Value {
        json!({
            "event": "ready",
            "sample_rate": sample_rate,
            "frame_ms": frame_ms,
            "vad_mode": vad_mode,
            "early_pause_ms": early_pause_ms,
            "final_pause_ms": final_pause_ms,
            "stable_ms": stable_ms,
        })
    }

    pub fn reconfigured(sample_rate: u32) -> Value {
        json!({
            "event": "reconfigured",
            "sample_rate": sample_rate,
            "note": "server supports pcm16 mono 16000 only",
        })
    }

    pub fn warning(reason: &str) -> Value {
        json!({"event": "warning", "reason": reason})
    }

    pub fn pong(payload: Value) -> Value {
        json!({"pong": payload})
    }

    pub fn partial(text: &str) -> Value {
        json!({"type": "partial", "partial": text})
    }

    pub fn final_text(text: &str) -> Value {
        json!({"type": "final", "text": text})
    }

    pub fn nlu_start(utterance_id: u32, text: &str) -> Value {
        json!({"type": "nlu_start", "utterance_id": utterance_id, "text": text})
    }

    pub fn llm_start(utterance_id: u32, text: &str) -> Value {
        json!({"type": "llm_start", "utterance_id": utterance_id, "text": text})
    }

    pub fn llm_delta(utterance_id: u32, delta: &str) -> Value {
        json!({"type": "llm_delta", "utterance_id": utterance_id, "delta": delta})
    }

    pub fn llm_end(utterance_id: u32) -> Value {
        json!({"type": "llm_end", "utterance_id": utterance_id})
    }

    pub fn llm_error(utterance_id: u32, error: &str) -> Value {
        json!({"type": "llm_error", "utterance_id": utterance_id, "error": error})
    }

    pub fn metric_first_token(utterance_id: u32, llm_first_token_ms: i64) -> Value {
        json!({
            "type": "metric",
            "utterance_id": utterance_id,
            "llm_first_token_ms": llm_first_token_ms,
        })
    }

    pub fn tts_start(utterance_id: u32) -> Value {
        json!({"type": "tts_start", "utterance_id": utterance_id, "mime": "audio/wav"})
    }

    pub fn tts_start_ack(utterance_id: u32) -> Value {
        json!({"type": "tts_start", "utterance_id": utterance_id, "mime": "audio/wav", "note": "ack"})
    }

    pub fn tts_audio(utterance_id: u32) -> Value {
        json!({"type": "tts_audio", "utterance_id": utterance_id, "mime": "audio/wav"})
    }

    pub fn tts_end(utterance_id: u32) -> Value {
        json!({"type": "tts_end", "utterance_id": utterance_id})
    }

    pub fn tts_error(utterance_id: u32, error: &str) -> Value {
        json!({"type": "tts_error", "utterance_id": utterance_id, "error": error})
    }

    pub fn abort(scope: AbortScope, reason: &str, utterance_id: u32) -> Value {
        json!({
            "type": "abort",
            "scope": scope.as_str(),
            "reason": reason,
            "utterance_id": utterance_id,
        })
    }

    pub fn tentative_pause(text: &str, silent_ms: i64, stable_ms: i64, tentative_ms: i64, confirm_ms: i64) -> Value {
        json!({
            "type": "asr_tentative_pause",
            "text": text,
            "silent_ms": silent_ms,
            "stable_ms": stable_ms,
            "tentative_ms": tentative_ms,
            "confirm_ms": confirm_ms,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn confirmed_end(
        text: &str,
        silent_ms: i64,
        stable_ms: i64,
        tentative_ms: i64,
        confirm_ms: i64,
        final_ms: i64,
        pause_ema_ms: f64,
        wps_ema: f64,
        word_count: usize,
        is_good_end: bool,
    ) -> Value {
        json!({
            "type": "asr_confirmed_end",
            "text": text,
            "silent_ms": silent_ms,
            "stable_ms": stable_ms,
            "confirm_ms": confirm_ms,
            "tentative_ms": tentative_ms,
            "final_ms": final_ms,
            "pause_ema_ms": pause_ema_ms,
            "wps_ema": wps_ema,
            "word_count": word_count,
            "is_good_end": is_good_end,
        })
    }

    pub fn session_summary(session_id: &str, agent_id: &str, summary: &str) -> Value {
        json!({
            "type": "session_summary",
            "session_id": session_id,
            "agent_id": agent_id,
            "summary": summary,
        })
    }

    pub fn session_end(session_id: &str) -> Value {
        json!({"type": "session_end", "session_id": session_id})
    }

    pub fn chat_start(question: &str) -> Value {
        json!({"type": "chat_start", "question": question})
    }

    pub fn chat_end(question: &str, answer: &str) -> Value {
        json!({"type": "chat_end", "question": question, "answer": answer})
    }

    pub fn chat_error(error: &str) -> Value {
        json!({"type": "chat_error", "error": error})
    }
}

/// Encode one binary audio frame.
pub fn encode_audio_frame(utterance_id: u32, wav: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(AUDIO_HEADER_LEN + wav.len());
    out.extend_from_slice(AUDIO_MAGIC);
    out.extend_from_slice(&utterance_id.to_le_bytes());
    out.extend_from_slice(&MIME_WAV.to_le_bytes());
    out.extend_from_slice(&(wav.len() as u32).to_le_bytes());
    out.extend_from_slice(wav);
    out
}

/// Decode the header of a binary audio frame (used by clients and tests).
pub fn decode_audio_frame(frame: &[u8]) -> Option<(u32, u16, &[u8])> {
    if frame.len() < AUDIO_HEADER_LEN || &frame[..4] != AUDIO_MAGIC {
        return None;
    }
    let utterance_id = u32::from_le_bytes(frame[4..8].try_into().ok()?);
    let mime = u16::from_le_bytes(frame[8..10].try_into().ok()?);
    let len = u32::from_le_bytes(frame[10..14].try_into().ok()?) as usize;
    let payload = &frame[AUDIO_HEADER_LEN..];
    if payload.len() != len {
        return None;
    }
    Some((utterance_id, mime, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handshake() {
        let msg = ClientMessage::parse(r#"{"config":{"sample_rate":48000,"words":true,"phrase_list":["да","нет"]}}"#).unwrap();
        match msg {
            ClientMessage::Config(cfg) => {
                assert_eq!(cfg.sample_rate, Some(48000));
                assert!(cfg.words);
                assert_eq!(cfg.phrase_list.unwrap().len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_control_messages() {
        assert_eq!(ClientMessage::parse(r#"{"reset":1}"#), Some(ClientMessage::Reset));
        assert_eq!(ClientMessage::parse(r#"{"eof":1}"#), Some(ClientMessage::Eof));
        assert_eq!(
            ClientMessage::parse(r#"{"type":"end_session"}"#),
            Some(ClientMessage::EndSession)
        );
        assert_eq!(
            ClientMessage::parse(r#"{"chat":" привет "}"#),
            Some(ClientMessage::Chat("привет".to_string()))
        );
        assert!(matches!(
            ClientMessage::parse(r#"{"ping":42}"#),
            Some(ClientMessage::Ping(_))
        ));
        assert_eq!(ClientMessage::parse(r#"{"unknown":true}"#), None);
        assert_eq!(ClientMessage::parse("not json"), None);
    }

    #[test]
    fn parses_synthetic_asr_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"partial","partial":"я хочу"}"#),
            Some(ClientMessage::SyntheticPartial("я хочу".to_string()))
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"final","text":"привет как дела"}"#),
            Some(ClientMessage::SyntheticFinal("привет как дела".to_string()))
        );
    }

    #[test]
    fn audio_frame_roundtrip() {
        let wav = vec![1u8, 2, 3, 4, 5];
        let frame = encode_audio_frame(7, &wav);
        assert_eq!(frame.len(), AUDIO_HEADER_LEN + wav.len());
        assert_eq!(&frame[..4], b"AUD0");
        let (u, mime, payload) = decode_audio_frame(&frame).unwrap();
        assert_eq!(u, 7);
        assert_eq!(mime, MIME_WAV);
        assert_eq!(payload, &wav[..]);
    }

    #[test]
    fn audio_frame_header_is_little_endian() {
        let frame = encode_audio_frame(0x0102_0304, &[]);
        assert_eq!(&frame[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&frame[8..10], &[0x01, 0x00]);
    }

    #[test]
    fn rejects_truncated_audio_frame() {
        let mut frame = encode_audio_frame(1, &[9, 9, 9]);
        frame.pop();
        assert!(decode_audio_frame(&frame).is_none());
        assert!(decode_audio_frame(b"BAD0").is_none());
    }

    #[test]
    fn event_shapes_match_contract() {
        let v = events::ready(16000, 20, 2, 300, 800, 250);
        assert_eq!(v["event"], "ready");
        assert_eq!(v["sample_rate"], 16000);

        let v = events::abort(AbortScope::Tts, "barge_in_user_speaking", 3);
        assert_eq!(v["type"], "abort");
        assert_eq!(v["scope"], "tts");
        assert_eq!(v["utterance_id"], 3);

        let v = events::pong(serde_json::json!(17));
        assert_eq!(v["pong"], 17);
    }
}
