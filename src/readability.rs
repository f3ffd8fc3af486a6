//! Readability and complexity metrics.
//!
//! [`TextAnalyzer`] computes plain counts (words, sentences, paragraphs) and
//! three classical readability formulas, each normalized to `0..=100` where
//! higher means easier to read, then blends them into one combined score:
//!
//! | Score | Weight | Normalization |
//! |-------|--------|---------------|
//! | Flesch Reading Ease | 0.50 | clamped to `[0, 100]` |
//! | SMOG Index | 0.25 | `100 − (raw − 6) · 100/14`, `0` below 30 sentences |
//! | Automated Readability Index | 0.25 | `100 − (raw − 1) · 100/13` |
//!
//! Tokenization is deliberately simple:
//! - a word is a `\b\w+\b` match (Unicode word characters, combining marks
//!   included)
//! - a sentence is a non-empty segment between `[.!?]+` runs
//! - a paragraph is a non-empty block between blank lines

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Minimum sentence count for the SMOG formula to be meaningful.
pub const SMOG_MIN_SENTENCES: usize = 30;

const FLESCH_WEIGHT: f64 = 0.5;
const SMOG_WEIGHT: f64 = 0.25;
const ARI_WEIGHT: f64 = 0.25;

/// Everything the analyzer produces for one text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TextMetrics {
    pub word_count: usize,
    pub sentence_count: usize,
    pub paragraph_count: usize,
    pub flesch_reading_ease: f64,
    pub smog_index: f64,
    pub automated_readability_index: f64,
    pub combined_score: f64,
}

/// Stateless text analyzer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextAnalyzer;

impl TextAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyze `text`. Empty or whitespace-only input yields all zeros.
    pub fn analyze(&self, text: &str) -> TextMetrics {
        if text.trim().is_empty() {
            return TextMetrics::default();
        }

        let words = words(text);
        let sentence_count = sentences(text).len();
        let paragraph_count = paragraph_count(text);

        if words.is_empty() || sentence_count == 0 {
            return TextMetrics {
                word_count: words.len(),
                sentence_count,
                paragraph_count,
                ..TextMetrics::default()
            };
        }

        let syllables: Vec<usize> = words.iter().map(|w| count_syllables(w)).collect();
        let total_syllables: usize = syllables.iter().sum();
        let complex_words = syllables.iter().filter(|&&s| s >= 3).count();
        let characters = text.chars().filter(|c| !c.is_whitespace()).count();

        let flesch = clamp_score(flesch_reading_ease_raw(
            words.len(),
            sentence_count,
            total_syllables,
        ));
        let smog = if sentence_count < SMOG_MIN_SENTENCES {
            0.0
        } else {
            clamp_score(100.0 - (smog_raw(complex_words, sentence_count) - 6.0) * (100.0 / 14.0))
        };
        let ari = clamp_score(
            100.0 - (ari_raw(characters, words.len(), sentence_count) - 1.0) * (100.0 / 13.0),
        );

        TextMetrics {
            word_count: words.len(),
            sentence_count,
            paragraph_count,
            flesch_reading_ease: flesch,
            smog_index: smog,
            automated_readability_index: ari,
            combined_score: FLESCH_WEIGHT * flesch + SMOG_WEIGHT * smog + ARI_WEIGHT * ari,
        }
    }
}

/// Unclamped Flesch Reading Ease.
pub fn flesch_reading_ease_raw(words: usize, sentences: usize, syllables: usize) -> f64 {
    if words == 0 || sentences == 0 {
        return 0.0;
    }
    let words = words as f64;
    206.835 - 1.015 * (words / sentences as f64) - 84.6 * (syllables as f64 / words)
}

/// SMOG grade before normalization.
pub fn smog_raw(complex_words: usize, sentences: usize) -> f64 {
    if sentences == 0 {
        return 0.0;
    }
    1.0430 * (complex_words as f64 * 30.0 / sentences as f64).sqrt() + 3.1291
}

/// Automated Readability Index before normalization.
pub fn ari_raw(characters: usize, words: usize, sentences: usize) -> f64 {
    if words == 0 || sentences == 0 {
        return 0.0;
    }
    let words = words as f64;
    4.71 * (characters as f64 / words) + 0.5 * (words / sentences as f64) - 21.43
}

fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w+\b").expect("word pattern"));
static SENTENCE_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+").expect("sentence pattern"));

/// Lowercased word matches.
pub fn words(text: &str) -> Vec<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Trimmed, non-empty segments between terminal punctuation.
pub fn sentences(text: &str) -> Vec<&str> {
    SENTENCE_END_RE
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Number of non-empty blocks separated by whitespace-only lines.
pub fn paragraph_count(text: &str) -> usize {
    let mut count = 0;
    let mut in_paragraph = false;
    for line in text.lines() {
        if line.trim().is_empty() {
            in_paragraph = false;
        } else if !in_paragraph {
            in_paragraph = true;
            count += 1;
        }
    }
    count
}

/// Heuristic syllable count: drop a trailing silent `e`, count vowel groups,
/// never less than one.
pub fn count_syllables(word: &str) -> usize {
    let lower = word.trim().to_lowercase();
    let stem = lower.strip_suffix('e').unwrap_or(&lower);
    let mut count = 0;
    let mut prev_vowel = false;
    for c in stem.chars() {
        let vowel = matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
        if vowel && !prev_vowel {
            count += 1;
        }
        prev_vowel = vowel;
    }
    count.max(1)
}
