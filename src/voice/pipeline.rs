//! Per-connection voice orchestrator
//!
//! Fuses the frame demux, VAD gate, ASR feeder, endpointing FSM, turn
//! controller, streaming LLM and incremental TTS into one full-duplex
//! dialog with barge-in.
//!
//! Concurrency shape: the transport receive loop drives this struct; one
//! spawned LLM streamer task per utterance; one long-lived TTS consumer
//! task; a single outbound writer fed through a bounded channel so JSON
//! control events and binary audio keep causal order. Cross-task state
//! lives in one mutex with short, await-free critical sections.
//!
//! Cancellation is epoch-based: every TTS chunk captures `tts_epoch` at
//! submission and re-checks it before send. Abort is an epoch bump plus a
//! cancelled LLM token; the sentinel still flows through the queue so the
//! open `tts_start` window always gets its matching `tts_end`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::AgentProfile;
use crate::config::{Config, ALLOWED_SAMPLE_RATE};
use crate::control::DialogLog;
use crate::error::call_with_retry;
use crate::llm::{ChatMessage, LlmParams, LlmStreamer};
use crate::now_ms;
use crate::protocol::{encode_audio_frame, events, AbortScope, Outbound, SessionConfig};
use crate::session::{Role, SessionRegistry};
use crate::voice::asr::{DecodeOutcome, RecognizerFactory, RecognizerOptions, SharedRecognizer};
use crate::voice::endpoint::{compute_adaptive_thresholds, Decision, EndpointFsm, DEFAULT_THRESHOLDS};
use crate::voice::text::{
    dedupe_repeated_words, is_echo_like, is_good_end, is_meaningful, is_tail_jitter,
    should_restart_llm, split_for_tts, word_count,
};
use crate::voice::tts::{TtsBackend, TtsSettings};
use crate::voice::vad::{FrameDemux, PauseEma, SpeechRate, VoiceDetector};

/// LLM→TTS channel depth (tokens).
const TTS_QUEUE_DEPTH: usize = 5000;

/// History window handed to the LLM.
const LLM_MAX_TURNS: usize = 12;

/// Chunks shorter than this are deferred unless they end a sentence.
const MIN_TTS_CHUNK_CHARS: usize = 10;

/// Tail-jitter tolerance in characters.
const TAIL_JITTER_CHARS: usize = 3;

/// Upstream retry backoff start (doubles once).
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Exactly one of these holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    UserSpeaking,
    AssistantTts,
}

/// What the receive loop should do after a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Close { code: u16, reason: &'static str },
}

/// Everything the pipeline needs at construction.
pub struct PipelineParams {
    pub config: Arc<Config>,
    pub session_id: String,
    pub agent_id: String,
    pub agent: AgentProfile,
    pub registry: SessionRegistry,
    pub dialog_log: DialogLog,
    pub llm: Arc<dyn LlmStreamer>,
    pub tts: Arc<TtsBackend>,
    pub recognizer_factory: RecognizerFactory,
    pub vad: Box<dyn VoiceDetector>,
    pub outbound: mpsc::Sender<Outbound>,
}

/// Cross-task mutable state. Guarded by one mutex; never held across await.
struct Ctl {
    voice_state: VoiceState,
    handshake_done: bool,

    // turn controller
    utterance_id: u32,
    active_output_u: u32,
    tts_allowed_u: u32,
    output_active: bool,
    tts_epoch: u64,
    llm_started: bool,
    current_llm_input: String,
    llm_started_at_ms: i64,
    llm_first_token_at_ms: i64,
    ack_sent_for_turn: bool,
    llm_cancel: Option<CancellationToken>,

    // tts window
    tts_playing: bool,
    tts_sending: bool,
    last_tts_chunk_ms: i64,

    // barge-in
    barge_armed: bool,
    silent_run_ms: i64,
    voice_run_ms: i64,
    last_barge_in_ms: i64,

    // asr gate
    asr_enabled: bool,
    asr_warming_up: bool,
    asr_warmup_deadline_ms: i64,

    // feeder + endpointing (reset by the TTS consumer after each window)
    last_voice_ms: i64,
    last_partial: String,
    last_partial_change_ms: i64,
    last_partial_sent_ms: i64,
    fsm: EndpointFsm,
    pause_ema: PauseEma,
    speech_rate: SpeechRate,
}

struct Shared {
    config: Arc<Config>,
    session_id: String,
    agent_id: String,
    agent: AgentProfile,
    registry: SessionRegistry,
    dialog_log: DialogLog,
    llm: Arc<dyn LlmStreamer>,
    tts: Arc<TtsBackend>,
    tts_settings: TtsSettings,
    recognizer: SharedRecognizer,
    outbound: mpsc::Sender<Outbound>,
    tts_tx: mpsc::Sender<(u32, String)>,
    ctl: Mutex<Ctl>,
    conn_cancel: CancellationToken,
}

impl Shared {
    async fn send_json(&self, value: serde_json::Value) {
        let _ = self.outbound.send(Outbound::Json(value)).await;
    }

    /// Binary audio is legal only inside an open TTS window.
    async fn send_audio_binary(&self, u_id: u32, wav: &[u8]) {
        {
            let ctl = self.ctl.lock().unwrap();
            if ctl.voice_state != VoiceState::AssistantTts {
                proto_violation(&format!(
                    "audio chunk outside ASSISTANT_TTS state (u_id={u_id})"
                ));
                return;
            }
            if !ctl.tts_sending {
                proto_violation(&format!("audio chunk outside tts window (u_id={u_id})"));
                return;
            }
        }
        let _ = self
            .outbound
            .send(Outbound::Binary(encode_audio_frame(u_id, wav)))
            .await;
    }

    fn llm_params(&self) -> LlmParams {
        LlmParams {
            model: self
                .agent
                .effective_model(&self.config.llm.model)
                .to_string(),
            temperature: self.agent.temperature,
            max_tokens: self.agent.max_tokens,
        }
    }
}

fn proto_violation(msg: &str) {
    warn!(target: "proto", "PROTO VIOLATION: {msg}");
}

/// The per-connection orchestrator. Owned and driven by the receive loop.
pub struct VoicePipeline {
    shared: Arc<Shared>,
    demux: FrameDemux,
    vad: Box<dyn VoiceDetector>,
    factory: RecognizerFactory,
    rec_options: RecognizerOptions,
    /// Audio held back during the post-TTS warmup, decoded in one burst.
    warmup_pcm: Vec<i16>,
    tts_task: tokio::task::JoinHandle<()>,
}

impl VoicePipeline {
    /// Build the pipeline and start its TTS consumer.
    pub fn start(params: PipelineParams) -> Result<Self> {
        let rec_options = RecognizerOptions {
            sample_rate: params.config.asr.sample_rate,
            words: false,
            phrase_list: None,
        };
        let recognizer = SharedRecognizer::new((params.recognizer_factory)(&rec_options)?);
        let (tts_tx, tts_rx) = mpsc::channel(TTS_QUEUE_DEPTH);

        let pause_alpha = params.config.endpointing.pause_ema_alpha;
        let now = now_ms();
        let shared = Arc::new(Shared {
            tts_settings: TtsSettings::for_agent(&params.config.tts, &params.agent),
            config: params.config,
            session_id: params.session_id,
            agent_id: params.agent_id,
            agent: params.agent,
            registry: params.registry,
            dialog_log: params.dialog_log,
            llm: params.llm,
            tts: params.tts,
            recognizer,
            outbound: params.outbound,
            tts_tx,
            ctl: Mutex::new(Ctl {
                voice_state: VoiceState::UserSpeaking,
                handshake_done: false,
                utterance_id: 0,
                active_output_u: 0,
                tts_allowed_u: 0,
                output_active: false,
                tts_epoch: 0,
                llm_started: false,
                current_llm_input: String::new(),
                llm_started_at_ms: 0,
                llm_first_token_at_ms: 0,
                ack_sent_for_turn: false,
                llm_cancel: None,
                tts_playing: false,
                tts_sending: false,
                last_tts_chunk_ms: 0,
                barge_armed: false,
                silent_run_ms: 0,
                voice_run_ms: 0,
                last_barge_in_ms: 0,
                asr_enabled: true,
                asr_warming_up: false,
                asr_warmup_deadline_ms: 0,
                last_voice_ms: now,
                last_partial: String::new(),
                last_partial_change_ms: now,
                last_partial_sent_ms: 0,
                fsm: EndpointFsm::new(),
                pause_ema: PauseEma::new(pause_alpha),
                speech_rate: SpeechRate::new(),
            }),
            conn_cancel: CancellationToken::new(),
        });

        let tts_task = tokio::spawn(run_tts(shared.clone(), tts_rx));

        Ok(Self {
            demux: FrameDemux::new(shared.config.frame_bytes()),
            factory: params.recognizer_factory,
            rec_options,
            warmup_pcm: Vec::new(),
            vad: params.vad,
            shared,
            tts_task,
        })
    }

    /// Post-auth `ready` announcement.
    pub async fn send_ready(&self) {
        let c = &self.shared.config;
        self.shared
            .send_json(events::ready(
                c.asr.sample_rate,
                c.asr.frame_ms,
                c.asr.vad_mode,
                c.endpointing.early_pause_ms,
                c.endpointing.final_pause_ms,
                c.endpointing.stable_ms,
            ))
            .await;
    }

    /// Cancel everything on transport close.
    pub fn shutdown(&self) {
        self.shared.conn_cancel.cancel();
        let cancel = self.shared.ctl.lock().unwrap().llm_cancel.take();
        if let Some(tok) = cancel {
            tok.cancel();
        }
        self.tts_task.abort();
    }

    // ─── Control messages ────────────────────────────────────────

    pub async fn on_config(&mut self, cfg: SessionConfig) -> Result<LoopControl> {
        let already_done = self.shared.ctl.lock().unwrap().handshake_done;
        if already_done {
            warn!(target: "proto", "duplicate config received, ignored");
            self.shared
                .send_json(events::warning("config_already_applied"))
                .await;
            return Ok(LoopControl::Continue);
        }

        // The server speaks 16 kHz PCM16 mono, full stop.
        if let Some(requested) = cfg.sample_rate {
            if requested != ALLOWED_SAMPLE_RATE {
                info!("client requested sample_rate={requested}, forcing {ALLOWED_SAMPLE_RATE}");
                self.shared
                    .send_json(events::reconfigured(ALLOWED_SAMPLE_RATE))
                    .await;
            }
        }

        self.rec_options.words = cfg.words;
        self.rec_options.phrase_list = cfg.phrase_list;
        self.demux.clear();
        self.shared.recognizer.replace((self.factory)(&self.rec_options)?);

        {
            let mut ctl = self.shared.ctl.lock().unwrap();
            ctl.handshake_done = true;
            ctl.asr_enabled = true;
        }

        self.send_ready().await;
        Ok(LoopControl::Continue)
    }

    pub async fn on_end_session(&mut self) -> LoopControl {
        let summary = self
            .shared
            .registry
            .end_session(&self.shared.session_id)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Сессия пуста или не найдена".to_string());

        self.shared
            .send_json(events::session_summary(
                &self.shared.session_id,
                &self.shared.agent_id,
                &summary,
            ))
            .await;
        self.shared
            .send_json(events::session_end(&self.shared.session_id))
            .await;
        info!(session = %self.shared.session_id, "session ended by client");
        LoopControl::Close {
            code: 1000,
            reason: "client_end",
        }
    }

    /// `{"reset":1}`: finalize the phrase in flight, keep the connection.
    pub async fn on_reset(&mut self) {
        let final_text = self.shared.recognizer.final_result();
        self.emit_final_and_handle(&final_text, "final_reset").await;
        self.begin_new_phrase(true);
    }

    /// `{"eof":1}`: finalize and close.
    pub async fn on_eof(&mut self) -> LoopControl {
        let final_text = self.shared.recognizer.final_result();
        if !final_text.is_empty() {
            self.shared.send_json(events::final_text(&final_text)).await;
        }
        LoopControl::Close {
            code: 1000,
            reason: "eof",
        }
    }

    pub async fn on_ping(&self, payload: serde_json::Value) {
        self.shared.send_json(events::pong(payload)).await;
    }

    /// Synthetic ASR partial (test hook).
    pub async fn on_synthetic_partial(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        {
            let mut ctl = self.shared.ctl.lock().unwrap();
            ctl.last_partial = text.clone();
            ctl.last_partial_change_ms = now_ms();
        }
        self.shared.send_json(events::partial(&text)).await;
    }

    /// Synthetic ASR final (test hook): runs the full final-endpoint logic.
    pub async fn on_synthetic_final(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        self.handle_final_text(&text, "final_json").await;
        self.shared.send_json(events::final_text(&text)).await;
        {
            let mut ctl = self.shared.ctl.lock().unwrap();
            if ctl.voice_state == VoiceState::UserSpeaking {
                ctl.voice_state = VoiceState::Idle;
            }
            ctl.speech_rate.reset();
            ctl.fsm.reset();
        }
    }

    /// `{"chat": ...}`: typed question through the same turn controller.
    pub async fn on_chat(&mut self, question: String) {
        if question.is_empty() {
            return;
        }
        self.shared.send_json(events::chat_start(&question)).await;

        self.shared.registry.with_session(&self.shared.session_id, |s| {
            s.add_turn(Role::User, &question, None)
        });
        self.shared
            .dialog_log
            .push_turn(&self.shared.session_id, Role::User, &question);

        self.launch_or_steer_llm(&question, "chat", Some(question.clone()))
            .await;
    }

    // ─── Binary audio path ───────────────────────────────────────

    pub async fn on_binary(&mut self, data: &[u8]) -> Result<()> {
        let handshake_done = self.shared.ctl.lock().unwrap().handshake_done;
        if !handshake_done {
            proto_violation("PCM received before READY");
            return Ok(());
        }
        if data.len() % 2 != 0 {
            proto_violation(&format!(
                "PCM data size {} not divisible by 2 (expected int16)",
                data.len()
            ));
            return Ok(());
        }
        let expected = self.shared.config.frame_bytes();
        if data.len() != expected {
            proto_violation(&format!(
                "bad PCM frame size: {} bytes, expected {expected} (20ms @ {}Hz int16 mono)",
                data.len(),
                self.shared.config.asr.sample_rate
            ));
            return Ok(());
        }

        self.demux.push(data);
        while let Some(frame) = self.demux.next_frame() {
            self.process_frame(frame).await?;
        }
        Ok(())
    }

    /// One 20 ms frame: VAD, statistics, barge-in, ASR feed, endpointing.
    async fn process_frame(&mut self, frame: Vec<i16>) -> Result<()> {
        let now = now_ms();
        let config = self.shared.config.clone();
        let frame_ms = config.asr.frame_ms as i64;
        let barge = &config.barge_in;

        let is_voice = match self.vad.is_voice(&frame) {
            Ok(v) => v,
            Err(e) => {
                proto_violation(&format!("VAD frame mismatch: {e}"));
                self.demux.clear();
                return Ok(());
            }
        };

        // state transitions, statistics, barge-in arming and trigger
        let fire_barge_in = {
            let mut ctl = self.shared.ctl.lock().unwrap();

            if is_voice {
                ctl.last_voice_ms = now;
                if ctl.voice_state == VoiceState::Idle {
                    ctl.voice_state = VoiceState::UserSpeaking;
                    debug!("IDLE → USER_SPEAKING");
                }
            }

            ctl.pause_ema.observe(is_voice, now);

            // arming: barge-in unlocks only after sustained silence while
            // the assistant holds the floor
            if ctl.output_active {
                if !is_voice {
                    ctl.silent_run_ms += frame_ms;
                    if ctl.silent_run_ms >= barge.arm_silence_ms {
                        ctl.barge_armed = true;
                    }
                } else {
                    ctl.silent_run_ms = 0;
                }
            } else {
                ctl.barge_armed = false;
                ctl.silent_run_ms = 0;
                ctl.voice_run_ms = 0;
            }

            let mut fire = false;
            if barge.enabled && ctl.output_active && is_voice {
                if ctl.tts_playing {
                    // assistant's own speech is not an interruption
                    ctl.voice_run_ms = 0;
                } else if !ctl.barge_armed {
                    // tail of the user's own turn
                    ctl.voice_run_ms = 0;
                } else if now - ctl.last_barge_in_ms < barge.cooldown_ms {
                    // within cooldown: ignore, keep the counter
                } else if now - ctl.last_tts_chunk_ms < barge.ignore_after_tts_ms {
                    ctl.voice_run_ms = 0;
                } else {
                    ctl.voice_run_ms += frame_ms;
                    if ctl.voice_run_ms >= barge.min_voice_ms {
                        fire = true;
                    }
                }
            } else if !is_voice {
                ctl.voice_run_ms = 0;
            }
            fire
        };

        if fire_barge_in {
            self.abort_output("barge_in_user_speaking").await;
        }

        // ASR gate: muted during assistant speech and the anti-echo window
        enum Gate {
            Feed(bool), // decode; bool = flush warmup buffer first
            Buffer,
            Skip,
        }
        let gate = {
            let mut ctl = self.shared.ctl.lock().unwrap();
            if !ctl.asr_enabled {
                Gate::Skip
            } else if ctl.asr_warming_up {
                if now >= ctl.asr_warmup_deadline_ms {
                    ctl.asr_warming_up = false;
                    debug!("ASR warmup completed, draining buffered audio");
                    Gate::Feed(true)
                } else {
                    Gate::Buffer
                }
            } else if ctl.output_active && ctl.tts_playing {
                Gate::Skip
            } else if ctl.output_active
                && now - ctl.last_tts_chunk_ms < barge.ignore_after_tts_ms
            {
                Gate::Skip
            } else {
                Gate::Feed(false)
            }
        };

        let decode_input = match gate {
            Gate::Skip => return Ok(()),
            Gate::Buffer => {
                self.warmup_pcm.extend_from_slice(&frame);
                return Ok(());
            }
            Gate::Feed(flush_warmup) => {
                if flush_warmup && !self.warmup_pcm.is_empty() {
                    let mut buffered = std::mem::take(&mut self.warmup_pcm);
                    buffered.extend_from_slice(&frame);
                    buffered
                } else {
                    frame
                }
            }
        };

        let in_thread = self.shared.config.asr.decode_in_thread;
        let outcome = self
            .shared
            .recognizer
            .accept_frame(decode_input, in_thread)
            .await?;

        if outcome == DecodeOutcome::Finalized {
            // the recognizer committed a phrase boundary on its own
            let final_text = self.shared.recognizer.result();
            self.emit_final_and_handle(&final_text, "final_vosk_result").await;
            let mut ctl = self.shared.ctl.lock().unwrap();
            ctl.last_partial.clear();
            ctl.last_partial_change_ms = now;
            return Ok(());
        }

        // rate-limited partials with tail-jitter suppression
        let rate_limit = self.shared.config.asr.partial_rate_limit_ms;
        let mut partial_event = None;
        {
            let mut ctl = self.shared.ctl.lock().unwrap();
            if now - ctl.last_partial_sent_ms >= rate_limit {
                let partial = self.shared.recognizer.partial();
                if !partial.is_empty() && partial != ctl.last_partial {
                    if ctl.voice_state == VoiceState::Idle {
                        ctl.voice_state = VoiceState::UserSpeaking;
                        debug!("IDLE → USER_SPEAKING (partial)");
                    }
                    if !is_tail_jitter(&partial, &ctl.last_partial, TAIL_JITTER_CHARS) {
                        ctl.last_partial_change_ms = now;
                        let wc = word_count(&partial);
                        ctl.speech_rate.observe(wc, now);
                    }
                    // any textual change drops the FSM back to listening
                    ctl.fsm.on_partial_changed();
                    ctl.last_partial = partial.clone();
                    ctl.last_partial_sent_ms = now;
                    partial_event = Some(partial);
                }
            }
        }
        if let Some(p) = partial_event {
            self.shared.send_json(events::partial(&p)).await;
        }

        self.endpoint_tick(is_voice, now).await;
        Ok(())
    }

    /// Endpointing FSM tick plus the forced finalization on a long pause.
    async fn endpoint_tick(&mut self, is_voice: bool, now: i64) {
        let ep = &self.shared.config.endpointing;
        let mut tentative_event = None;
        let mut confirmed_event = None;
        let mut fire_final = false;

        {
            let mut ctl = self.shared.ctl.lock().unwrap();
            let silent_ms = now - ctl.last_voice_ms;
            let stable_ms = now - ctl.last_partial_change_ms;

            let th = if ctl.last_partial.is_empty() {
                DEFAULT_THRESHOLDS
            } else {
                compute_adaptive_thresholds(
                    &ctl.last_partial,
                    ctl.speech_rate.wps(),
                    ctl.pause_ema.value_ms(),
                )
            };

            let meaningful =
                is_meaningful(&ctl.last_partial, ep.min_chars_early, ep.min_words_early);
            let good_end = is_good_end(&ctl.last_partial);

            match ctl.fsm.tick(meaningful, good_end, silent_ms, stable_ms, &th) {
                Some(Decision::EnterTentative) => {
                    tentative_event = Some(events::tentative_pause(
                        &ctl.last_partial,
                        silent_ms,
                        stable_ms,
                        th.tentative_ms,
                        th.confirm_ms,
                    ));
                }
                Some(Decision::EnterConfirmed) => {
                    confirmed_event = Some(events::confirmed_end(
                        &ctl.last_partial,
                        silent_ms,
                        stable_ms,
                        th.tentative_ms,
                        th.confirm_ms,
                        th.final_ms,
                        ctl.pause_ema.value_ms(),
                        ctl.speech_rate.wps(),
                        word_count(&ctl.last_partial),
                        good_end,
                    ));
                }
                Some(Decision::EnterFinal) | None => {}
            }

            if is_voice {
                ctl.fsm.on_voice();
            }

            if !ctl.last_partial.is_empty() && silent_ms >= th.final_ms {
                fire_final = true;
            }
        }

        if let Some(e) = tentative_event {
            self.shared.send_json(e).await;
        }
        if let Some(e) = confirmed_event {
            self.shared.send_json(e).await;
        }

        if fire_final {
            let final_text = self.shared.recognizer.final_result();
            self.emit_final_and_handle(&final_text, "final_pause").await;
            self.begin_new_phrase(true);
        }
    }

    /// Emit the `final` event (non-empty only) and run the turn controller.
    async fn emit_final_and_handle(&mut self, final_text: &str, reason: &str) {
        let final_text = final_text.trim();
        if !final_text.is_empty() {
            self.shared.send_json(events::final_text(final_text)).await;
            let mut ctl = self.shared.ctl.lock().unwrap();
            if ctl.voice_state == VoiceState::UserSpeaking {
                ctl.voice_state = VoiceState::Idle;
                debug!("USER_SPEAKING → IDLE (final)");
            }
        }
        self.handle_final_text(final_text, reason).await;
    }

    /// Reset the per-phrase feeder and endpointing state; optionally
    /// rebuild the recognizer for the next phrase.
    fn begin_new_phrase(&mut self, rebuild_recognizer: bool) {
        if rebuild_recognizer {
            match (self.factory)(&self.rec_options) {
                Ok(rec) => self.shared.recognizer.replace(rec),
                Err(e) => warn!("recognizer rebuild failed: {e}"),
            }
        }
        let mut ctl = self.shared.ctl.lock().unwrap();
        let now = now_ms();
        ctl.last_partial.clear();
        ctl.last_partial_change_ms = now;
        ctl.speech_rate.reset();
        ctl.fsm.reset();
    }

    // ─── Turn controller ─────────────────────────────────────────

    /// Entry point for every user final, from the endpointer, the
    /// recognizer or the synthetic test path.
    pub async fn handle_final_text(&mut self, final_text: &str, reason: &str) {
        let final_text = final_text.trim();
        if final_text.is_empty() {
            return;
        }

        // anti-echo, time-based: during playback or too close to the last
        // audio chunk, a final is almost certainly the assistant's echo
        let now = now_ms();
        let ignore_after = self.shared.config.barge_in.ignore_after_tts_ms;
        {
            let ctl = self.shared.ctl.lock().unwrap();
            if ctl.tts_playing || now - ctl.last_tts_chunk_ms < ignore_after {
                info!("echo drop (tts window): '{}'", head(final_text, 80));
                return;
            }
        }

        // anti-echo, content-based
        let last_assistant = self
            .shared
            .registry
            .with_session(&self.shared.session_id, |s| {
                s.last_assistant_text().map(str::to_string)
            })
            .flatten()
            .unwrap_or_default();
        if is_echo_like(final_text, &last_assistant) {
            info!("echo drop (content match): '{}'", head(final_text, 80));
            return;
        }

        self.shared.registry.with_session(&self.shared.session_id, |s| {
            s.add_turn(Role::User, final_text, None)
        });
        self.shared
            .dialog_log
            .push_turn(&self.shared.session_id, Role::User, final_text);

        debug!(reason, "user final accepted: '{}'", head(final_text, 50));
        self.launch_or_steer_llm(final_text, reason, None).await;
    }

    /// Start the LLM, restart it on a significant revision, or let the
    /// running generation continue.
    async fn launch_or_steer_llm(&mut self, text: &str, reason: &str, chat: Option<String>) {
        enum Action {
            Start { play_ack: bool },
            Restart,
            Keep,
        }
        let action = {
            let mut ctl = self.shared.ctl.lock().unwrap();
            if !ctl.llm_started {
                let play_ack = !ctl.ack_sent_for_turn;
                if play_ack {
                    ctl.ack_sent_for_turn = true;
                }
                Action::Start { play_ack }
            } else if should_restart_llm(text, &ctl.current_llm_input) {
                Action::Restart
            } else {
                // same request already generating; just unlock its audio
                if ctl.tts_allowed_u == 0 && ctl.active_output_u != 0 {
                    ctl.tts_allowed_u = ctl.active_output_u;
                }
                Action::Keep
            }
        };

        match action {
            Action::Start { play_ack } => {
                self.start_or_restart_llm(text, reason, play_ack, true, chat).await;
            }
            Action::Restart => {
                let reason = format!("{reason}_restart");
                self.start_or_restart_llm(text, &reason, false, true, chat).await;
            }
            Action::Keep => {
                debug!("LLM already running for equivalent input, keeping it");
            }
        }
    }

    /// Allocate a new utterance, cancel any in-flight response, optionally
    /// play the acknowledgement tone, and spawn the streamer.
    pub async fn start_or_restart_llm(
        &mut self,
        text: &str,
        reason: &str,
        play_ack: bool,
        allow_tts: bool,
        chat: Option<String>,
    ) {
        let now = now_ms();
        let (prev_u, u_id, old_cancel) = {
            let mut ctl = self.shared.ctl.lock().unwrap();
            let prev_u = ctl.active_output_u;

            // a new response re-locks barge-in until silence is seen again
            ctl.barge_armed = false;
            ctl.silent_run_ms = 0;
            ctl.voice_run_ms = 0;
            ctl.tts_playing = false;

            ctl.utterance_id += 1;
            let u_id = ctl.utterance_id;
            ctl.tts_allowed_u = if allow_tts { u_id } else { 0 };

            let old_cancel = ctl.llm_cancel.take();

            // devalue every in-flight synthesis result
            ctl.tts_epoch += 1;

            ctl.active_output_u = u_id;
            ctl.output_active = true;
            ctl.llm_started = true;
            ctl.current_llm_input = text.to_string();
            ctl.llm_started_at_ms = now;
            ctl.llm_first_token_at_ms = 0;

            (prev_u, u_id, old_cancel)
        };

        if let Some(cancel) = old_cancel {
            cancel.cancel();
            if prev_u != 0 {
                self.shared
                    .send_json(events::abort(AbortScope::Llm, reason, prev_u))
                    .await;
            }
        }
        if prev_u != 0 {
            self.shared
                .send_json(events::abort(AbortScope::Tts, reason, prev_u))
                .await;
        }

        info!(utterance = u_id, reason, allow_tts, "llm start: '{}'", head(text, 50));
        self.shared.send_json(events::llm_start(u_id, text)).await;

        if play_ack && allow_tts {
            self.play_ack(u_id).await;
        }

        let cancel = CancellationToken::new();
        self.shared.ctl.lock().unwrap().llm_cancel = Some(cancel.clone());
        tokio::spawn(run_llm(
            self.shared.clone(),
            u_id,
            text.to_string(),
            cancel,
            chat,
        ));
    }

    /// Mini TTS window with a pre-warmed acknowledgement phrase.
    async fn play_ack(&mut self, u_id: u32) {
        {
            let mut ctl = self.shared.ctl.lock().unwrap();
            if ctl.tts_sending {
                proto_violation("attempted ACK while TTS window is active");
                return;
            }
            if ctl.voice_state == VoiceState::AssistantTts {
                proto_violation("attempted ACK while in ASSISTANT_TTS state");
                return;
            }
            ctl.voice_state = VoiceState::AssistantTts;
            ctl.tts_sending = true;
        }

        let (ack_text, cached) = self.shared.tts.random_ack_wav();
        let wav = match cached {
            Some(wav) => wav,
            None => {
                let tts = self.shared.tts.clone();
                let settings = self.shared.tts_settings.clone();
                match call_with_retry(|| tts.synthesize_wav(ack_text, &settings), 1, RETRY_BACKOFF)
                    .await
                {
                    Ok(wav) => wav,
                    Err(e) => {
                        warn!("ACK synthesis failed: {e}");
                        let mut ctl = self.shared.ctl.lock().unwrap();
                        ctl.tts_sending = false;
                        ctl.voice_state = VoiceState::UserSpeaking;
                        return;
                    }
                }
            }
        };

        self.shared.send_json(events::tts_start_ack(u_id)).await;
        self.shared.send_audio_binary(u_id, &wav).await;
        self.shared.send_json(events::tts_end(u_id)).await;

        // the main response opens its own window from the TTS consumer;
        // voice_state intentionally stays ASSISTANT_TTS
        let mut ctl = self.shared.ctl.lock().unwrap();
        ctl.tts_sending = false;
        ctl.tts_playing = true;
        ctl.last_tts_chunk_ms = now_ms();
        info!(utterance = u_id, "ACK sent: '{ack_text}'");
    }

    /// Cancel the in-flight response: barge-in, or a new final while the
    /// assistant holds the floor.
    pub async fn abort_output(&mut self, reason: &str) {
        let (u, old_cancel) = {
            let mut ctl = self.shared.ctl.lock().unwrap();
            if !ctl.output_active || ctl.active_output_u == 0 {
                return;
            }
            let u = ctl.active_output_u;
            ctl.output_active = false;
            ctl.active_output_u = 0;
            ctl.tts_epoch += 1;

            ctl.tts_playing = false;
            ctl.tts_sending = false;
            ctl.barge_armed = false;
            if ctl.voice_state == VoiceState::AssistantTts {
                ctl.voice_state = VoiceState::UserSpeaking;
            }
            ctl.silent_run_ms = 0;
            ctl.voice_run_ms = 0;
            ctl.tts_allowed_u = 0;
            ctl.llm_started = false;
            ctl.current_llm_input.clear();
            ctl.last_barge_in_ms = now_ms();

            (u, ctl.llm_cancel.take())
        };

        if let Some(cancel) = old_cancel {
            cancel.cancel();
        }

        info!(utterance = u, reason, "output aborted");
        self.shared
            .send_json(events::abort(AbortScope::Llm, reason, u))
            .await;
        self.shared
            .send_json(events::abort(AbortScope::Tts, reason, u))
            .await;
        // the TTS consumer drains the sentinel and closes the window,
        // preserving the tts_start/tts_end pairing
    }

    #[cfg(test)]
    fn ctl_snapshot<R>(&self, f: impl FnOnce(&Ctl) -> R) -> R {
        f(&self.shared.ctl.lock().unwrap())
    }
}

fn head(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

// ─── LLM streamer task ───────────────────────────────────────────

async fn run_llm(
    shared: Arc<Shared>,
    u_id: u32,
    prompt: String,
    cancel: CancellationToken,
    chat: Option<String>,
) {
    shared.send_json(events::nlu_start(u_id, &prompt)).await;

    let messages = shared
        .registry
        .with_session(&shared.session_id, |s| {
            s.llm_buffers.insert(u_id, String::new());
            s.build_llm_messages(&shared.agent.system_prompt, LLM_MAX_TURNS)
        })
        .unwrap_or_else(|| {
            vec![
                ChatMessage::system(&shared.agent.system_prompt),
                ChatMessage::user(&prompt),
            ]
        });

    let params = shared.llm_params();
    let mut acc = String::new();

    let open = tokio::select! {
        _ = cancel.cancelled() => None,
        r = call_with_retry(|| shared.llm.open(&params, &messages), 1, RETRY_BACKOFF) => Some(r),
    };

    match open {
        Some(Ok(mut stream)) => {
            let mut first = true;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    t = stream.next_token() => t,
                };
                match next {
                    Ok(Some(tok)) => {
                        if first {
                            first = false;
                            let elapsed = {
                                let mut ctl = shared.ctl.lock().unwrap();
                                ctl.llm_first_token_at_ms = now_ms();
                                ctl.llm_first_token_at_ms - ctl.llm_started_at_ms
                            };
                            shared
                                .send_json(events::metric_first_token(u_id, elapsed))
                                .await;
                        }

                        acc.push_str(&tok);
                        shared.registry.with_session(&shared.session_id, |s| {
                            if let Some(buf) = s.llm_buffers.get_mut(&u_id) {
                                buf.push_str(&tok);
                            }
                        });

                        shared.send_json(events::llm_delta(u_id, &tok)).await;

                        let tts_allowed =
                            shared.ctl.lock().unwrap().tts_allowed_u == u_id;
                        if tts_allowed {
                            let _ = shared.tts_tx.send((u_id, tok)).await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(utterance = u_id, "llm stream error: {e}");
                        shared
                            .send_json(events::llm_error(u_id, &e.to_string()))
                            .await;
                        break;
                    }
                }
            }
        }
        Some(Err(e)) => {
            warn!(utterance = u_id, "llm request failed: {e}");
            shared.send_json(events::llm_error(u_id, &e.to_string())).await;
        }
        None => {}
    }

    // finally-phase: the sentinel must reach the TTS consumer so the
    // window closes even on cancellation or upstream failure
    let _ = shared.tts_tx.send((u_id, String::new())).await;
    if let Some(question) = chat {
        shared.send_json(events::chat_end(&question, &acc)).await;
    }
    shared.send_json(events::llm_end(u_id)).await;
}

// ─── TTS consumer task ───────────────────────────────────────────

async fn run_tts(shared: Arc<Shared>, mut rx: mpsc::Receiver<(u32, String)>) {
    let mut current_u: Option<u32> = None;
    let mut buf = String::new();
    let mut local_epoch: u64 = 0;

    loop {
        let msg = tokio::select! {
            _ = shared.conn_cancel.cancelled() => break,
            m = rx.recv() => m,
        };
        let Some((u_id, tok)) = msg else { break };

        // utterance switch: close a stale window, open a fresh one
        if current_u != Some(u_id) {
            if let Some(prev) = current_u {
                let stale_open = {
                    let mut ctl = shared.ctl.lock().unwrap();
                    let open = ctl.tts_sending;
                    ctl.tts_sending = false;
                    open
                };
                if stale_open {
                    debug!(utterance = prev, "closing overlapped tts window");
                    shared.send_json(events::tts_end(prev)).await;
                }
            }

            current_u = Some(u_id);
            buf.clear();
            {
                let mut ctl = shared.ctl.lock().unwrap();
                local_epoch = ctl.tts_epoch;
                ctl.voice_state = VoiceState::AssistantTts;
                ctl.tts_sending = true;
                // hard-mute the recognizer for the whole window
                ctl.asr_enabled = false;
                ctl.asr_warming_up = false;
            }
            shared.send_json(events::tts_start(u_id)).await;
            debug!(utterance = u_id, "tts window opened, ASR muted");
        }

        if tok.is_empty() {
            // end-of-utterance sentinel: flush, close, restore listening
            flush_buffer(&shared, u_id, local_epoch, &mut buf).await;
            close_window(&shared, u_id).await;
            current_u = None;
            continue;
        }

        // accumulate with the duplicate-word filter, then cut chunks
        buf.push_str(&tok);
        buf = dedupe_repeated_words(&buf);

        let (chunks, rest) = split_for_tts(&buf);
        buf = rest;
        for chunk in chunks {
            if chunk.chars().count() < MIN_TTS_CHUNK_CHARS
                && !chunk.ends_with(['.', '!', '?', '\n', ','])
            {
                // too small to speak yet; push back and wait for more
                buf = if buf.is_empty() {
                    chunk
                } else {
                    format!("{chunk} {buf}")
                };
                continue;
            }
            synth_and_send(&shared, u_id, local_epoch, &chunk).await;
        }
    }
}

/// Synthesize the tail of the buffer when the utterance ends.
async fn flush_buffer(shared: &Arc<Shared>, u_id: u32, local_epoch: u64, buf: &mut String) {
    while !buf.trim().is_empty() {
        let (chunks, rest) = split_for_tts(buf);
        *buf = rest;
        for chunk in chunks {
            if chunk.chars().count() < MIN_TTS_CHUNK_CHARS {
                continue;
            }
            synth_and_send(shared, u_id, local_epoch, &chunk).await;
        }
        let tail = buf.trim().to_string();
        if !tail.is_empty() && tail.chars().count() >= MIN_TTS_CHUNK_CHARS {
            synth_and_send(shared, u_id, local_epoch, &tail).await;
        }
        buf.clear();
    }
}

/// Synthesize one chunk and send it, re-checking every staleness guard at
/// send time. A failed guard is a silent drop: that is how barge-in kills
/// in-flight synthesis without races.
async fn synth_and_send(shared: &Arc<Shared>, u_id: u32, local_epoch: u64, chunk: &str) {
    let tts = shared.tts.clone();
    let settings = shared.tts_settings.clone();
    match call_with_retry(|| tts.synthesize_wav(chunk, &settings), 1, RETRY_BACKOFF).await {
        Ok(wav) => {
            let pass = {
                let ctl = shared.ctl.lock().unwrap();
                ctl.output_active
                    && ctl.active_output_u == u_id
                    && ctl.tts_epoch == local_epoch
                    && ctl.tts_allowed_u == u_id
            };
            if !pass {
                debug!(utterance = u_id, "stale tts chunk dropped: '{}'", head(chunk, 30));
                return;
            }

            shared.send_json(events::tts_audio(u_id)).await;
            shared.ctl.lock().unwrap().tts_playing = true;
            shared.send_audio_binary(u_id, &wav).await;
            shared.ctl.lock().unwrap().last_tts_chunk_ms = now_ms();
            debug!(utterance = u_id, "tts chunk sent: '{}' ({} bytes)", head(chunk, 30), wav.len());
        }
        Err(e) => {
            warn!(utterance = u_id, "tts chunk failed: {e}");
            shared
                .send_json(events::tts_error(u_id, &format!("chunk failed: {e}")))
                .await;
        }
    }
}

/// Close the TTS window for `u_id` and, unless a newer utterance already
/// took the floor, restore the listening state.
async fn close_window(shared: &Arc<Shared>, u_id: u32) {
    let newer_active = {
        let mut ctl = shared.ctl.lock().unwrap();
        let newer = ctl.active_output_u != 0 && ctl.active_output_u != u_id;

        if ctl.active_output_u == u_id {
            ctl.output_active = false;
            ctl.active_output_u = 0;
        }
        ctl.tts_playing = false;
        ctl.tts_sending = false;

        if !newer {
            if ctl.voice_state != VoiceState::AssistantTts {
                proto_violation("tts_end while not in TTS state");
            }
            ctl.voice_state = VoiceState::Idle;
        }
        newer
    };

    shared.send_json(events::tts_end(u_id)).await;
    debug!(utterance = u_id, "ASSISTANT_TTS → IDLE (tts window closed)");

    if !newer_active {
        // drop residual echo from the recognizer and restart the silence
        // clocks so the next phrase is measured from here
        shared.recognizer.reset();
        let warmup_ms = shared.config.asr.warmup_ms;
        let mut ctl = shared.ctl.lock().unwrap();
        let now = now_ms();
        ctl.last_voice_ms = now;
        ctl.last_partial_change_ms = now;
        ctl.last_tts_chunk_ms = 0;
        ctl.last_partial.clear();
        ctl.fsm.reset();
        ctl.ack_sent_for_turn = false;
        ctl.asr_enabled = true;
        ctl.asr_warming_up = true;
        ctl.asr_warmup_deadline_ms = now + warmup_ms;
        ctl.llm_started = false;
        ctl.current_llm_input.clear();
        ctl.tts_allowed_u = 0;
    }

    // commit the full response exactly once
    let assistant_text = shared
        .registry
        .with_session(&shared.session_id, |s| s.llm_buffers.remove(&u_id))
        .flatten()
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    if !assistant_text.is_empty() {
        shared.registry.with_session(&shared.session_id, |s| {
            s.add_turn(Role::Assistant, &assistant_text, Some(u_id))
        });
        shared
            .dialog_log
            .push_turn(&shared.session_id, Role::Assistant, &assistant_text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::DEFAULT_AGENT_ID;
    use crate::config::ControlConfig;
    use crate::llm::testing::ScriptedLlm;
    use crate::protocol::decode_audio_frame;
    use crate::voice::asr::null_factory;
    use crate::voice::tts::testing::StubTts;
    use serde_json::Value;
    use tokio::time::{timeout, Duration};

    const SESSION: &str = "s-test";

    /// Voice when any sample clears a fixed amplitude.
    struct AmplitudeVad;

    impl VoiceDetector for AmplitudeVad {
        fn is_voice(&mut self, frame: &[i16]) -> Result<bool> {
            Ok(frame.iter().any(|s| s.unsigned_abs() > 1000))
        }
    }

    struct Harness {
        pipeline: VoicePipeline,
        rx: mpsc::Receiver<Outbound>,
        registry: SessionRegistry,
    }

    fn harness(llm: ScriptedLlm) -> Harness {
        harness_with(llm, Config::default(), false)
    }

    fn harness_with(llm: ScriptedLlm, config: Config, failing_tts: bool) -> Harness {
        harness_full(llm, config, failing_tts, null_factory())
    }

    fn harness_full(
        llm: ScriptedLlm,
        config: Config,
        failing_tts: bool,
        factory: crate::voice::asr::RecognizerFactory,
    ) -> Harness {
        let registry = SessionRegistry::new();
        registry.open(SESSION, DEFAULT_AGENT_ID);
        let (tx, rx) = mpsc::channel(1024);
        let tts_engine: Arc<dyn crate::voice::tts::TtsEngine> = if failing_tts {
            Arc::new(StubTts::failing())
        } else {
            Arc::new(StubTts::new())
        };
        let pipeline = VoicePipeline::start(PipelineParams {
            config: Arc::new(config),
            session_id: SESSION.to_string(),
            agent_id: DEFAULT_AGENT_ID.to_string(),
            agent: AgentProfile::default(),
            registry: registry.clone(),
            dialog_log: DialogLog::new(ControlConfig {
                url: String::new(),
                internal_key: String::new(),
            }),
            llm: Arc::new(llm),
            tts: Arc::new(TtsBackend::new(tts_engine)),
            recognizer_factory: factory,
            vad: Box::new(AmplitudeVad),
            outbound: tx,
        })
        .unwrap();
        Harness {
            pipeline,
            rx,
            registry,
        }
    }

    fn ev_type(o: &Outbound) -> Option<String> {
        match o {
            Outbound::Json(v) => v
                .get("type")
                .or_else(|| v.get("event"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Outbound::Binary(_) => Some("binary".to_string()),
        }
    }

    fn ev_u(o: &Outbound) -> Option<u32> {
        match o {
            Outbound::Json(v) => v.get("utterance_id").and_then(Value::as_u64).map(|u| u as u32),
            Outbound::Binary(b) => decode_audio_frame(b).map(|(u, _, _)| u),
        }
    }

    fn count(events: &[Outbound], kind: &str) -> usize {
        events.iter().filter(|e| ev_type(e).as_deref() == Some(kind)).count()
    }

    /// Receive events until the accumulated list satisfies `done`.
    async fn collect_until(
        rx: &mut mpsc::Receiver<Outbound>,
        done: impl Fn(&[Outbound]) -> bool,
    ) -> Vec<Outbound> {
        let mut events = Vec::new();
        loop {
            let msg = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for events")
                .expect("outbound channel closed");
            events.push(msg);
            if done(&events) {
                return events;
            }
        }
    }

    /// Binary frames appear only between tts_start and the matching
    /// tts_end, and carry that window's utterance id.
    fn assert_audio_inside_windows(events: &[Outbound]) {
        let mut open: Option<u32> = None;
        for e in events {
            match ev_type(e).as_deref() {
                Some("tts_start") => {
                    assert!(open.is_none(), "overlapping tts windows");
                    open = ev_u(e);
                }
                Some("tts_end") => {
                    assert_eq!(open, ev_u(e), "tts_end for a window that is not open");
                    open = None;
                }
                Some("binary") => {
                    let u = ev_u(e).expect("undecodable audio frame");
                    assert_eq!(Some(u), open, "binary audio outside tts window");
                }
                _ => {}
            }
        }
        assert!(open.is_none(), "unclosed tts window");
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn silence_frame() -> Vec<u8> {
        vec![0u8; 640]
    }

    fn voice_frame() -> Vec<u8> {
        let samples = vec![3000i16; 320];
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    // ─── scenarios ───────────────────────────────────────────────

    #[tokio::test]
    async fn handshake_forces_sample_rate() {
        let mut h = harness(ScriptedLlm::new(vec![]));
        let ctl = h
            .pipeline
            .on_config(SessionConfig {
                sample_rate: Some(48000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(ctl, LoopControl::Continue);

        let events = collect_until(&mut h.rx, |e| count(e, "ready") == 1).await;
        assert_eq!(ev_type(&events[0]).as_deref(), Some("reconfigured"));
        if let Outbound::Json(v) = &events[0] {
            assert_eq!(v["sample_rate"], 16000);
        }
        if let Outbound::Json(v) = events.last().unwrap() {
            assert_eq!(v["event"], "ready");
            assert_eq!(v["sample_rate"], 16000);
            assert_eq!(v["frame_ms"], 20);
        }
    }

    #[tokio::test]
    async fn duplicate_config_warns_but_keeps_connection() {
        let mut h = harness(ScriptedLlm::new(vec![]));
        h.pipeline.on_config(SessionConfig::default()).await.unwrap();
        let ctl = h.pipeline.on_config(SessionConfig::default()).await.unwrap();
        assert_eq!(ctl, LoopControl::Continue);

        let events = collect_until(&mut h.rx, |e| count(e, "warning") == 1).await;
        if let Outbound::Json(v) = events.last().unwrap() {
            assert_eq!(v["reason"], "config_already_applied");
        }
    }

    #[tokio::test]
    async fn simple_turn_streams_llm_and_tts() {
        let mut h = harness(ScriptedLlm::new(vec![vec!["Привет!", " Чем могу помочь?"]]));
        h.pipeline.on_config(SessionConfig::default()).await.unwrap();
        h.pipeline.on_synthetic_final("привет как дела".to_string()).await;

        let events = collect_until(&mut h.rx, |e| {
            count(e, "llm_end") == 1
                && count(e, "tts_start") >= 2
                && count(e, "tts_start") == count(e, "tts_end")
                && count(e, "binary") >= 2
        })
        .await;

        assert_eq!(count(&events, "llm_start"), 1);
        assert!(count(&events, "llm_delta") >= 2);
        assert_eq!(count(&events, "metric"), 1);
        assert_eq!(count(&events, "final"), 1);

        for e in &events {
            if matches!(ev_type(e).as_deref(), Some("llm_start" | "llm_delta" | "llm_end")) {
                assert_eq!(ev_u(e), Some(1));
            }
        }
        assert_audio_inside_windows(&events);

        wait_for(|| {
            h.registry
                .with_session(SESSION, |s| {
                    s.turns.len() == 2 && s.llm_buffers.is_empty()
                })
                .unwrap()
        })
        .await;
        h.registry
            .with_session(SESSION, |s| {
                assert_eq!(s.turns[0].role, Role::User);
                assert_eq!(s.turns[0].text, "привет как дела");
                assert_eq!(s.turns[1].role, Role::Assistant);
                assert_eq!(s.turns[1].text, "Привет! Чем могу помочь?");
                assert_eq!(s.turns[1].utterance_id, Some(1));
            })
            .unwrap();
    }

    #[tokio::test]
    async fn replayed_final_starts_exactly_one_llm() {
        // failing TTS keeps tts_playing false so the anti-echo gate is not
        // what dedupes the second final
        let llm = ScriptedLlm::with_delay(
            vec![vec!["Долгий", " ответ", " пользователю."]],
            Duration::from_millis(150),
        );
        let mut h = harness_with(llm, Config::default(), true);

        h.pipeline.on_synthetic_final("привет как дела".to_string()).await;
        h.pipeline.on_synthetic_final("привет как дела".to_string()).await;

        let events = collect_until(&mut h.rx, |e| count(e, "llm_end") == 1).await;
        assert_eq!(count(&events, "llm_start"), 1);
        assert_eq!(count(&events, "abort"), 0);
    }

    #[tokio::test]
    async fn significant_revision_restarts_llm() {
        let llm = ScriptedLlm::with_delay(
            vec![
                vec!["Первый", " ответ", " который не успеет."],
                vec!["Второй ответ."],
            ],
            Duration::from_millis(120),
        );
        let mut h = harness_with(llm, Config::default(), true);

        h.pipeline.on_synthetic_final("привет".to_string()).await;
        let _ = collect_until(&mut h.rx, |e| count(e, "llm_start") == 1).await;

        // ≥30% longer input while the first generation is in flight
        h.pipeline
            .on_synthetic_final("привет расскажи пожалуйста анекдот".to_string())
            .await;

        let events = collect_until(&mut h.rx, |e| count(e, "llm_start") >= 1 && count(e, "llm_end") >= 2).await;
        let aborts: Vec<&Outbound> = events
            .iter()
            .filter(|e| ev_type(e).as_deref() == Some("abort"))
            .collect();
        assert!(aborts.len() >= 2, "expected llm+tts aborts for utterance 1");
        for a in &aborts {
            assert_eq!(ev_u(a), Some(1));
        }
        let restart = events
            .iter()
            .find(|e| ev_type(e).as_deref() == Some("llm_start"))
            .unwrap();
        assert_eq!(ev_u(restart), Some(2));
    }

    #[tokio::test]
    async fn barge_in_aborts_assistant_output() {
        let mut config = Config::default();
        config.barge_in.min_voice_ms = 200;

        // failing TTS: no ACK and no audio chunk marks tts_playing, so the
        // armed user voice can interrupt; the first token still opens the
        // window and the stream then stalls mid-generation
        let llm = ScriptedLlm::with_delay(
            vec![vec!["Сейчас я расскажу", " очень длинную историю"]],
            Duration::from_millis(5000),
        );
        let mut h = harness_with(llm, config, true);
        h.pipeline.on_config(SessionConfig::default()).await.unwrap();
        h.pipeline.on_synthetic_final("расскажи историю".to_string()).await;

        // wait for the assistant to take the floor
        let _ = collect_until(&mut h.rx, |e| count(e, "tts_start") >= 1).await;

        // 1 s of silence arms barge-in, 200 ms of voice triggers it
        for _ in 0..50 {
            h.pipeline.on_binary(&silence_frame()).await.unwrap();
        }
        for _ in 0..10 {
            h.pipeline.on_binary(&voice_frame()).await.unwrap();
        }

        let events = collect_until(&mut h.rx, |e| {
            count(e, "abort") >= 2 && count(e, "tts_end") >= 1
        })
        .await;

        let abort_scopes: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                Outbound::Json(v) if v["type"] == "abort" => {
                    Some(v["scope"].as_str().unwrap().to_string())
                }
                _ => None,
            })
            .collect();
        assert!(abort_scopes.contains(&"llm".to_string()));
        assert!(abort_scopes.contains(&"tts".to_string()));

        // pairing survives the abort; the next turn gets utterance 2
        h.pipeline.on_synthetic_final("новый вопрос".to_string()).await;
        let events2 = collect_until(&mut h.rx, |e| count(e, "llm_start") >= 1).await;
        let start = events2
            .iter()
            .find(|e| ev_type(e).as_deref() == Some("llm_start"))
            .unwrap();
        assert_eq!(ev_u(start), Some(2));
    }

    #[tokio::test]
    async fn echo_like_final_is_dropped() {
        let mut h = harness(ScriptedLlm::new(vec![vec!["Рад помочь!", " Чем займёмся сегодня?"]]));
        h.pipeline.on_config(SessionConfig::default()).await.unwrap();
        h.pipeline.on_synthetic_final("привет".to_string()).await;

        let _ = collect_until(&mut h.rx, |e| {
            count(e, "llm_end") == 1 && count(e, "tts_start") == count(e, "tts_end") && count(e, "tts_start") >= 2
        })
        .await;
        wait_for(|| h.registry.with_session(SESSION, |s| s.turns.len() == 2).unwrap()).await;

        // the recognizer "hears" the assistant's own words
        h.pipeline.on_synthetic_final("рад помочь".to_string()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.registry
            .with_session(SESSION, |s| {
                assert_eq!(s.turns.len(), 2, "echo final must not create a user turn");
            })
            .unwrap();
        assert_eq!(h.pipeline.ctl_snapshot(|c| c.utterance_id), 1);
    }

    #[tokio::test]
    async fn final_during_tts_window_is_dropped() {
        let llm = ScriptedLlm::with_delay(
            vec![vec!["Вот первое предложение ответа. ", "и долгое продолжение"]],
            Duration::from_millis(300),
        );
        let mut h = harness_with(llm, Config::default(), false);
        h.pipeline.on_synthetic_final("вопрос пользователя".to_string()).await;

        // first sentence synthesized and sent while the stream continues
        let _ = collect_until(&mut h.rx, |e| count(e, "binary") >= 1).await;

        h.pipeline.on_synthetic_final("совсем новый текст".to_string()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.registry
            .with_session(SESSION, |s| {
                assert_eq!(s.turns.len(), 1, "final during playback must be dropped");
            })
            .unwrap();
    }

    #[tokio::test]
    async fn missized_pcm_is_discarded() {
        let mut h = harness(ScriptedLlm::new(vec![]));
        h.pipeline.on_config(SessionConfig::default()).await.unwrap();
        let _ = collect_until(&mut h.rx, |e| count(e, "ready") >= 1).await;

        h.pipeline.on_binary(&vec![0u8; 100]).await.unwrap();
        h.pipeline.on_binary(&vec![0u8; 641]).await.unwrap();
        h.pipeline.on_binary(&vec![0u8; 1280]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.rx.try_recv().is_err(), "bad frames must produce no events");
    }

    #[tokio::test]
    async fn pcm_before_handshake_is_discarded() {
        let mut h = harness(ScriptedLlm::new(vec![]));
        h.pipeline.on_binary(&silence_frame()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn end_session_reports_summary_and_closes() {
        let mut h = harness(ScriptedLlm::new(vec![]));
        h.registry
            .with_session(SESSION, |s| {
                s.add_turn(Role::User, "мне грустно", None);
                s.add_turn(Role::Assistant, "понимаю вас", Some(1));
            })
            .unwrap();

        let ctl = h.pipeline.on_end_session().await;
        assert_eq!(
            ctl,
            LoopControl::Close {
                code: 1000,
                reason: "client_end"
            }
        );

        let events = collect_until(&mut h.rx, |e| count(e, "session_end") == 1).await;
        let summary = events
            .iter()
            .find(|e| ev_type(e).as_deref() == Some("session_summary"))
            .unwrap();
        if let Outbound::Json(v) = summary {
            assert_eq!(v["session_id"], SESSION);
            assert!(!v["summary"].as_str().unwrap().is_empty());
        }
        assert!(h.registry.with_session(SESSION, |s| s.ended).unwrap());
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let mut h = harness(ScriptedLlm::new(vec![]));
        h.pipeline.on_ping(serde_json::json!(17)).await;
        let events = collect_until(&mut h.rx, |e| !e.is_empty()).await;
        if let Outbound::Json(v) = &events[0] {
            assert_eq!(v["pong"], 17);
        }
    }

    #[tokio::test]
    async fn tail_jitter_does_not_reset_stability() {
        use crate::voice::asr::testing::{ScriptedRecognizer, Step};

        // recognizer script: a partial, then a ≤3-char tail correction,
        // then silence
        let steps = vec![
            Step::Partial("я хочу сказат"),
            Step::Partial("я хочу сказать"),
            Step::Silence,
        ];
        let factory: crate::voice::asr::RecognizerFactory = Arc::new(move |_| {
            Ok(Box::new(ScriptedRecognizer::new(steps.clone())) as Box<dyn crate::voice::asr::SpeechRecognizer>)
        });
        let mut h = harness_full(ScriptedLlm::new(vec![]), Config::default(), true, factory);
        h.pipeline.on_config(SessionConfig::default()).await.unwrap();
        let _ = collect_until(&mut h.rx, |e| count(e, "ready") >= 1).await;

        // first partial starts the stability clock
        h.pipeline.on_binary(&silence_frame()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // tail jitter: "сказат" → "сказать" must not look like progress
        h.pipeline.on_binary(&silence_frame()).await.unwrap();
        let events = collect_until(&mut h.rx, |e| count(e, "partial") >= 2).await;
        assert_eq!(count(&events, "asr_tentative_pause"), 0);

        // 450 ms after the substantive partial: stable_ms kept growing
        // through the jitter, so the pause threshold fires now
        tokio::time::sleep(Duration::from_millis(250)).await;
        h.pipeline.on_binary(&silence_frame()).await.unwrap();
        let events = collect_until(&mut h.rx, |e| count(e, "asr_tentative_pause") >= 1).await;
        if let Some(Outbound::Json(v)) = events
            .iter()
            .find(|e| ev_type(e).as_deref() == Some("asr_tentative_pause"))
        {
            assert_eq!(v["text"], "я хочу сказать");
            assert!(v["stable_ms"].as_i64().unwrap() >= 400);
        }
    }

    #[tokio::test]
    async fn chat_question_flows_through_turn_controller() {
        let mut h = harness(ScriptedLlm::new(vec![vec!["Конечно,", " помогу."]]));
        h.pipeline.on_chat("помоги мне с задачей".to_string()).await;

        let events = collect_until(&mut h.rx, |e| count(e, "chat_end") == 1 && count(e, "llm_end") == 1).await;
        assert_eq!(count(&events, "chat_start"), 1);
        assert_eq!(count(&events, "llm_start"), 1);
        if let Some(Outbound::Json(v)) = events
            .iter()
            .find(|e| ev_type(e).as_deref() == Some("chat_end"))
        {
            assert_eq!(v["answer"], "Конечно, помогу.");
        }

        wait_for(|| h.registry.with_session(SESSION, |s| s.turns.len() == 2).unwrap()).await;
    }
}
