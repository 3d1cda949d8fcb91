//! Lexical heuristics for endpointing, restart decisions and TTS chunking
//!
//! The word lists are Russian because the recognizer and the TTS voices are;
//! the heuristics themselves are language-agnostic: a turn that ends on a
//! conjunction or a filler is probably not finished.

/// Words that signal the phrase continues.
pub const CONTINUE_WORDS: &[&str] = &[
    "что", "который", "которая", "которые", "чтобы", "потому", "потому что",
    "если", "когда", "почему", "зачем", "как", "где", "куда", "откуда",
    "и", "а", "но", "или", "ли", "то", "это", "вот",
];

/// Hesitation fillers.
pub const FILLERS: &[&str] = &["э", "эм", "ну", "типа", "короче", "значит", "мм"];

/// Words a finished phrase does not end on.
pub const BAD_ENDINGS: &[&str] = &[
    "и", "а", "но", "или", "что", "если", "то", "который", "которая", "которые",
    "чтобы", "потому", "также", "либо", "вот", "это", "так", "как", "где", "куда",
    "откуда", "зачем", "почему", "когда", "тогда", "здесь", "там", "тут",
];

/// Conjunctions carrying the hardest continuation penalty.
const CONJ: &[&str] = &[
    "и", "а", "но", "или", "либо", "что", "чтобы", "потому", "также", "то",
];

/// Prepositions (same penalty class as conjunctions).
const PREPOSITIONS: &[&str] = &[
    "в", "на", "по", "за", "из", "от", "до", "у", "о", "об", "с", "к", "про", "под", "над", "без", "для",
];

/// Maximum TTS chunk length in characters.
const CHUNK_LIMIT: usize = 120;

/// Soft-cut positions closer to the start than this fall back to a hard cut.
const CHUNK_SOFT_CUT_MIN: usize = 50;

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn last_word(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .split_whitespace()
        .last()
        .unwrap_or("")
        .to_string()
}

/// Enough substance to start a response: ≥3 chars and ≥1 word by default.
pub fn is_meaningful(text: &str, min_chars: usize, min_words: usize) -> bool {
    let t = text.trim();
    t.chars().count() >= min_chars && word_count(t) >= min_words
}

/// A phrase end good enough to confirm: at least three words and the last
/// one is not a connective.
pub fn is_good_end(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    if words.len() < 3 {
        return false;
    }
    !BAD_ENDINGS.contains(words.last().unwrap())
}

/// Extra confirm-delay when the final word signals continuation.
pub fn continuation_penalty_ms(text: &str) -> i64 {
    let w = last_word(text);
    if w.is_empty() {
        return 0;
    }
    if CONJ.contains(&w.as_str()) || PREPOSITIONS.contains(&w.as_str()) {
        return 450;
    }
    if CONTINUE_WORDS.contains(&w.as_str()) || FILLERS.contains(&w.as_str()) {
        return 300;
    }
    if w.chars().count() <= 2 {
        return 250;
    }
    if w.chars().all(|c| c.is_ascii_digit()) {
        return 300;
    }
    0
}

pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// True when `new` differs from `old` only within the last `max_tail`
/// characters past the common prefix. Such recognizer jitter must not look
/// like progress to the endpointer.
pub fn is_tail_jitter(new: &str, old: &str, max_tail: usize) -> bool {
    let new = new.trim();
    let old = old.trim();
    if old.is_empty() || new.is_empty() || new == old {
        return false;
    }
    let cp = common_prefix_len(new, old);
    let tail_new = new.chars().count() - cp;
    let tail_old = old.chars().count() - cp;
    tail_new.max(tail_old) <= max_tail
}

/// Whether a revised final warrants cancelling the running LLM: the text
/// grew by more than 30 %, or it restructured so much that the common prefix
/// is shorter than half the previous input.
pub fn should_restart_llm(new_text: &str, old_text: &str) -> bool {
    let new_text = new_text.trim();
    let old_text = old_text.trim();
    if old_text.is_empty() {
        return true;
    }
    if new_text == old_text {
        return false;
    }

    let new_len = new_text.chars().count();
    let old_len = old_text.chars().count();
    if new_len > old_len + old_len * 3 / 10 {
        return true;
    }

    common_prefix_len(new_text, old_text) < (old_len / 2).max(1)
}

/// Lowercase and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a recognized final looks like the assistant's own speech picked
/// up by the microphone: substring match either way, or identical 40-char
/// prefixes. Short candidates (<8 chars) are never judged echo.
pub fn is_echo_like(candidate: &str, last_assistant: &str) -> bool {
    let u = normalize(candidate);
    if u.chars().count() < 8 {
        return false;
    }
    let a = normalize(last_assistant);
    if a.is_empty() {
        return false;
    }
    if a.contains(&u) || u.contains(&a) {
        return true;
    }
    let u40: String = u.chars().take(40).collect();
    let a40: String = a.chars().take(40).collect();
    u40 == a40
}

/// Split accumulated LLM text into speakable chunks.
///
/// Sentences are cut at the earliest of `. ! ? \n` (inclusive). Overlong
/// sentence-less text is cut at the latest space or comma inside the limit
/// when that point is past character 50, else hard-cut at the limit.
/// Returns the ready chunks and the remaining buffer.
pub fn split_for_tts(buf: &str) -> (Vec<String>, String) {
    let mut out = Vec::new();
    let mut chars: Vec<char> = buf.chars().collect();

    loop {
        let cut = chars
            .iter()
            .position(|c| matches!(c, '.' | '!' | '?' | '\n'));

        if let Some(idx) = cut {
            let chunk: String = chars.drain(..=idx).collect();
            let chunk = chunk.trim().to_string();
            while chars.first().map(|c| c.is_whitespace()).unwrap_or(false) {
                chars.remove(0);
            }
            if !chunk.is_empty() {
                out.push(chunk);
            }
            continue;
        }

        if chars.len() >= CHUNK_LIMIT {
            let window = &chars[..CHUNK_LIMIT];
            let space_cut = window.iter().rposition(|c| *c == ' ');
            let comma_cut = window.iter().rposition(|c| *c == ',');
            let best = match (space_cut, comma_cut) {
                (Some(s), Some(c)) => Some(s.max(c)),
                (Some(s), None) => Some(s),
                (None, Some(c)) => Some(c),
                (None, None) => None,
            };

            let end = match best {
                Some(idx) if idx > CHUNK_SOFT_CUT_MIN => idx + 1,
                _ => CHUNK_LIMIT,
            };
            let chunk: String = chars.drain(..end).collect();
            let chunk = chunk.trim().to_string();
            while chars.first().map(|c| c.is_whitespace()).unwrap_or(false) {
                chars.remove(0);
            }
            if !chunk.is_empty() {
                out.push(chunk);
            }
            continue;
        }

        break;
    }

    (out, chars.into_iter().collect())
}

/// Collapse immediately-repeated long words. Streaming LLMs occasionally
/// stutter a word across a token boundary; repeating short words ("да да")
/// is legitimate speech.
pub fn dedupe_repeated_words(text: &str) -> String {
    let mut filtered: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        if let Some(prev) = filtered.last() {
            if *prev == word && word.chars().count() > 3 {
                continue;
            }
        }
        filtered.push(word);
    }
    filtered.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_end_requires_three_words_and_clean_tail() {
        assert!(is_good_end("я хочу спать"));
        assert!(!is_good_end("я хочу"));
        assert!(!is_good_end("я пойду туда где"));
        assert!(!is_good_end("расскажи мне что"));
    }

    #[test]
    fn continuation_penalties() {
        assert_eq!(continuation_penalty_ms("я пойду и"), 450);
        assert_eq!(continuation_penalty_ms("поеду в"), 450);
        assert_eq!(continuation_penalty_ms("это типа"), 300);
        // short words hit the two-char rule before the digit rule
        assert_eq!(continuation_penalty_ms("ответ 42"), 250);
        assert_eq!(continuation_penalty_ms("ответ 123"), 300);
        assert_eq!(continuation_penalty_ms("хорошо же"), 250);
        assert_eq!(continuation_penalty_ms("всё понятно"), 0);
        assert_eq!(continuation_penalty_ms(""), 0);
    }

    #[test]
    fn tail_jitter_detection() {
        // "сказат" -> "сказать": one char past the common prefix
        assert!(is_tail_jitter("я хочу сказать", "я хочу сказат", 3));
        assert!(!is_tail_jitter("я хочу сказать тебе", "я хочу", 3));
        assert!(!is_tail_jitter("same", "same", 3));
        assert!(!is_tail_jitter("new", "", 3));
    }

    #[test]
    fn restart_on_growth_or_restructure() {
        assert!(should_restart_llm("что угодно", ""));
        assert!(!should_restart_llm("привет", "привет"));
        // >30% longer
        assert!(should_restart_llm("привет как дела сегодня", "привет как"));
        // same length but rebuilt from the start
        assert!(should_restart_llm("пока пока", "привет да"));
        // small tail growth keeps the run
        assert!(!should_restart_llm("привет как дела", "привет как дел"));
    }

    #[test]
    fn echo_likeness() {
        let assistant = "Рад помочь! Чем займёмся сегодня?";
        assert!(is_echo_like("рад помочь", assistant));
        assert!(is_echo_like("РАД ПОМОЧЬ! ЧЕМ займёмся сегодня", assistant));
        // too short to judge
        assert!(!is_echo_like("рад", assistant));
        assert!(!is_echo_like("совсем другая фраза", assistant));
        assert!(!is_echo_like("что нибудь", ""));
    }

    #[test]
    fn chunker_cuts_at_sentence_boundaries() {
        let (chunks, rest) = split_for_tts("Привет! Как дела? Я тут");
        assert_eq!(chunks, vec!["Привет!", "Как дела?"]);
        assert_eq!(rest, "Я тут");
    }

    #[test]
    fn chunker_soft_cuts_long_text() {
        let long = "слово ".repeat(30); // 180 chars, no sentence marks
        let (chunks, rest) = split_for_tts(&long);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.chars().count() <= CHUNK_LIMIT);
        }
        assert!(rest.chars().count() < CHUNK_LIMIT);
    }

    #[test]
    fn chunker_hard_cuts_unbreakable_text() {
        let unbreakable: String = "а".repeat(130);
        let (chunks, rest) = split_for_tts(&unbreakable);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chars().count(), CHUNK_LIMIT);
        assert_eq!(rest.chars().count(), 10);
    }

    #[test]
    fn dedupe_suppresses_long_repeats_only() {
        assert_eq!(
            dedupe_repeated_words("сегодня сегодня хорошая погода"),
            "сегодня хорошая погода"
        );
        assert_eq!(dedupe_repeated_words("да да конечно"), "да да конечно");
    }

    #[test]
    fn meaningful_text_threshold() {
        assert!(is_meaningful("да!", 3, 1));
        assert!(!is_meaningful("а", 3, 1));
        assert!(!is_meaningful("  ", 3, 1));
    }
}
