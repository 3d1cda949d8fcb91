//! Speech recognition seam
//!
//! The recognizer contract is narrow: frames go in, partial or final text
//! comes out. The Kaldi-backed implementation (vosk) is CPU-bound per frame,
//! so decoding is offloaded to the blocking pool and the recognizer itself
//! sits behind a mutex shared between the frame loop and the TTS consumer
//! (which resets it after assistant speech).

use std::sync::{Arc, Mutex};

use anyhow::Result;

/// What the decoder concluded about the frame just fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Still inside a phrase; a partial may be available.
    Running,
    /// The recognizer committed a phrase boundary on its own.
    Finalized,
}

/// Streaming recognizer contract: 20 ms PCM16 frames in, text out.
pub trait SpeechRecognizer: Send {
    fn accept_frame(&mut self, pcm: &[i16]) -> Result<DecodeOutcome>;

    /// Current non-final hypothesis (may be empty).
    fn partial(&mut self) -> String;

    /// Committed phrase after [`DecodeOutcome::Finalized`].
    fn result(&mut self) -> String;

    /// Force-finalize whatever is buffered.
    fn final_result(&mut self) -> String;

    /// Drop buffered audio state (used after assistant speech so residual
    /// echo cannot leak into the next phrase).
    fn reset(&mut self);
}

/// Options applied when (re)building a recognizer for a session.
#[derive(Debug, Clone, Default)]
pub struct RecognizerOptions {
    pub sample_rate: u32,
    /// Emit word-level metadata.
    pub words: bool,
    /// Grammar restriction; speeds up narrow domains.
    pub phrase_list: Option<Vec<String>>,
}

/// Builds a fresh recognizer for given options. The factory is shared across
/// sessions; the model behind it is immutable after load.
pub type RecognizerFactory =
    Arc<dyn Fn(&RecognizerOptions) -> Result<Box<dyn SpeechRecognizer>> + Send + Sync>;

/// Recognizer handle shared between the frame loop and the TTS consumer.
#[derive(Clone)]
pub struct SharedRecognizer {
    inner: Arc<Mutex<Box<dyn SpeechRecognizer>>>,
}

impl SharedRecognizer {
    pub fn new(rec: Box<dyn SpeechRecognizer>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rec)),
        }
    }

    /// Feed one frame, optionally off the async runtime (the decode is
    /// CPU-bound and must not stall the event loop).
    pub async fn accept_frame(&self, frame: Vec<i16>, in_thread: bool) -> Result<DecodeOutcome> {
        if in_thread {
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || inner.lock().unwrap().accept_frame(&frame))
                .await
                .map_err(|e| anyhow::anyhow!("decode worker failed: {e}"))?
        } else {
            self.inner.lock().unwrap().accept_frame(&frame)
        }
    }

    pub fn partial(&self) -> String {
        self.inner.lock().unwrap().partial()
    }

    pub fn result(&self) -> String {
        self.inner.lock().unwrap().result()
    }

    pub fn final_result(&self) -> String {
        self.inner.lock().unwrap().final_result()
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap().reset()
    }

    /// Swap in a freshly-built recognizer (config handshake, next phrase).
    pub fn replace(&self, rec: Box<dyn SpeechRecognizer>) {
        *self.inner.lock().unwrap() = rec;
    }
}

/// Recognizer that never produces text. Used when the crate is built
/// without the `vosk-asr` feature: the synthetic `partial`/`final` test
/// messages and the `chat` path still exercise the whole pipeline.
#[derive(Default)]
pub struct NullRecognizer;

impl SpeechRecognizer for NullRecognizer {
    fn accept_frame(&mut self, _pcm: &[i16]) -> Result<DecodeOutcome> {
        Ok(DecodeOutcome::Running)
    }

    fn partial(&mut self) -> String {
        String::new()
    }

    fn result(&mut self) -> String {
        String::new()
    }

    fn final_result(&mut self) -> String {
        String::new()
    }

    fn reset(&mut self) {}
}

/// Factory for the null recognizer.
pub fn null_factory() -> RecognizerFactory {
    Arc::new(|_opts| Ok(Box::new(NullRecognizer) as Box<dyn SpeechRecognizer>))
}

#[cfg(feature = "vosk-asr")]
pub use vosk_backend::vosk_factory;

#[cfg(feature = "vosk-asr")]
mod vosk_backend {
    use super::*;
    use anyhow::Context;
    use tracing::info;

    struct VoskRecognizer {
        rec: vosk::Recognizer,
    }

    impl SpeechRecognizer for VoskRecognizer {
        fn accept_frame(&mut self, pcm: &[i16]) -> Result<DecodeOutcome> {
            match self.rec.accept_waveform(pcm) {
                Ok(vosk::DecodingState::Finalized) => Ok(DecodeOutcome::Finalized),
                Ok(_) => Ok(DecodeOutcome::Running),
                Err(e) => Err(anyhow::anyhow!("vosk rejected waveform: {e:?}")),
            }
        }

        fn partial(&mut self) -> String {
            self.rec.partial_result().partial.trim().to_string()
        }

        fn result(&mut self) -> String {
            self.rec
                .result()
                .single()
                .map(|r| r.text.trim().to_string())
                .unwrap_or_default()
        }

        fn final_result(&mut self) -> String {
            self.rec
                .final_result()
                .single()
                .map(|r| r.text.trim().to_string())
                .unwrap_or_default()
        }

        fn reset(&mut self) {
            self.rec.reset();
        }
    }

    /// Load the model once and return a per-session recognizer factory.
    pub fn vosk_factory(model_path: &str) -> Result<RecognizerFactory> {
        info!("loading vosk model: {model_path}");
        let model = Arc::new(
            vosk::Model::new(model_path)
                .with_context(|| format!("failed to load vosk model at {model_path}"))?,
        );
        info!("vosk model loaded");

        Ok(Arc::new(move |opts: &RecognizerOptions| {
            let mut rec = match &opts.phrase_list {
                Some(phrases) if !phrases.is_empty() => {
                    let grammar: Vec<&str> = phrases.iter().map(String::as_str).collect();
                    vosk::Recognizer::new_with_grammar(&model, opts.sample_rate as f32, &grammar)
                        .context("failed to create grammar recognizer")?
                }
                _ => vosk::Recognizer::new(&model, opts.sample_rate as f32)
                    .context("failed to create recognizer")?,
            };
            rec.set_words(opts.words);
            Ok(Box::new(VoskRecognizer { rec }) as Box<dyn SpeechRecognizer>)
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedRecognizer, Step};
    use super::*;

    #[tokio::test]
    async fn shared_recognizer_offloads_decode() {
        let rec = SharedRecognizer::new(Box::new(ScriptedRecognizer::new(vec![
            Step::Partial("привет"),
            Step::Final("привет мир"),
        ])));

        assert_eq!(rec.accept_frame(vec![0; 320], true).await.unwrap(), DecodeOutcome::Running);
        assert_eq!(rec.partial(), "привет");
        assert_eq!(rec.accept_frame(vec![0; 320], false).await.unwrap(), DecodeOutcome::Finalized);
        assert_eq!(rec.result(), "привет мир");
    }

    #[test]
    fn null_recognizer_stays_silent() {
        let mut rec = NullRecognizer;
        assert_eq!(rec.accept_frame(&[0; 320]).unwrap(), DecodeOutcome::Running);
        assert!(rec.partial().is_empty());
        assert!(rec.final_result().is_empty());
    }

    #[tokio::test]
    async fn replace_swaps_recognizer() {
        let shared = SharedRecognizer::new(Box::new(NullRecognizer));
        shared.replace(Box::new(ScriptedRecognizer::new(vec![Step::Partial("да")])));
        // the scripted recognizer is now live; one frame yields its partial
        shared.accept_frame(vec![0; 320], false).await.unwrap();
        assert_eq!(shared.partial(), "да");
    }
}
