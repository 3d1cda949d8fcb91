//! Adaptive endpointing: deciding when a user turn is complete
//!
//! A four-state machine (listening → tentative → confirmed → final) driven
//! by elapsed silence, partial-text stability and lexical shape. Thresholds
//! are not fixed: they scale with the speaker's typical intra-phrase pause
//! (EMA) and speech rate, and stretch when the last word signals the phrase
//! continues.

use super::text::{continuation_penalty_ms, is_good_end, word_count};

/// Stability the listening→tentative transition requires.
const TENTATIVE_STABLE_MS: i64 = 300;

/// Stability the tentative→confirmed transition requires.
const CONFIRM_STABLE_MS: i64 = 500;

/// Computed pause thresholds for the current partial text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub tentative_ms: i64,
    pub confirm_ms: i64,
    pub final_ms: i64,
}

/// Defaults used while no partial text exists yet.
pub const DEFAULT_THRESHOLDS: Thresholds = Thresholds {
    tentative_ms: 350,
    confirm_ms: 1100,
    final_ms: 1600,
};

/// Derive thresholds from the partial text and the adaptive statistics.
pub fn compute_adaptive_thresholds(text: &str, wps: f64, pause_ema_ms: f64) -> Thresholds {
    let wc = word_count(text);

    let tentative = ((pause_ema_ms * 1.2) as i64).max(300);
    let mut confirm = ((pause_ema_ms * 2.5) as i64).max(900);
    let mut final_ms = confirm + 500;

    // Short phrases get extra room; they are often mid-thought.
    if wc < 4 {
        confirm += 200;
        final_ms += 300;
    }

    if !is_good_end(text) {
        confirm += 300;
    }

    // Fast speakers pause longer relative to their cadence.
    if wps > 2.5 {
        confirm += 100;
    }

    confirm += continuation_penalty_ms(text);

    Thresholds {
        tentative_ms: tentative,
        confirm_ms: confirm,
        final_ms,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsmState {
    #[default]
    Listening,
    Tentative,
    Confirmed,
    Final,
}

/// State transition the caller should announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    EnterTentative,
    EnterConfirmed,
    EnterFinal,
}

/// The endpointing state machine proper. Purely synchronous; the pipeline
/// feeds it clocks and text features.
#[derive(Debug, Default)]
pub struct EndpointFsm {
    state: FsmState,
}

impl EndpointFsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    /// A voice frame arrived: any non-listening state falls back instantly.
    pub fn on_voice(&mut self) -> bool {
        if self.state != FsmState::Listening {
            self.state = FsmState::Listening;
            return true;
        }
        false
    }

    /// The partial text substantively changed: fall back to listening.
    pub fn on_partial_changed(&mut self) -> bool {
        if self.state != FsmState::Listening {
            self.state = FsmState::Listening;
            return true;
        }
        false
    }

    /// Evaluate transitions for the current tick.
    pub fn tick(
        &mut self,
        meaningful: bool,
        good_end: bool,
        silent_ms: i64,
        stable_ms: i64,
        th: &Thresholds,
    ) -> Option<Decision> {
        match self.state {
            FsmState::Listening => {
                if meaningful && stable_ms >= TENTATIVE_STABLE_MS && silent_ms >= th.tentative_ms {
                    self.state = FsmState::Tentative;
                    return Some(Decision::EnterTentative);
                }
            }
            FsmState::Tentative => {
                if silent_ms >= th.confirm_ms && stable_ms >= CONFIRM_STABLE_MS && good_end {
                    self.state = FsmState::Confirmed;
                    return Some(Decision::EnterConfirmed);
                }
            }
            FsmState::Confirmed => {
                if silent_ms >= th.final_ms {
                    self.state = FsmState::Final;
                    return Some(Decision::EnterFinal);
                }
            }
            FsmState::Final => {}
        }
        None
    }

    /// Back to listening for the next phrase.
    pub fn reset(&mut self) {
        self.state = FsmState::Listening;
    }
}
