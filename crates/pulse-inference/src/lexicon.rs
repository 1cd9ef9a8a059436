//! Lexicon-based sentiment classifier
//!
//! Deterministic, in-process scoring from a static valence dictionary with
//! negation handling and intensity amplifiers. This is the fallback path of
//! the failsafe dispatcher; verdicts carry `source = fallback` and
//! `model = "lexicon"`.

use once_cell::sync::Lazy;
use pulse_common::{SentimentLabel, SentimentVerdict, VerdictSource};
use std::collections::HashMap;
use std::time::Instant;

/// Name reported by fallback verdicts
pub const LEXICON_MODEL_NAME: &str = "lexicon";

/// Compound thresholds for the positive/negative labels
const LABEL_THRESHOLD: f64 = 0.05;

/// Magnitude multiplier applied by an intensifier to the following token
const AMPLIFIER_BOOST: f64 = 1.5;

/// Content tokens looked back through when applying negation
const NEGATION_WINDOW: usize = 3;

static VALENCE: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    // token -> signed valence; magnitudes roughly follow common sentiment
    // lexicons, with campus-life vocabulary weighted where it matters
    let entries: &[(&str, f64)] = &[
        // positive
        ("amazing", 2.8),
        ("awesome", 2.7),
        ("excellent", 2.7),
        ("fantastic", 2.6),
        ("wonderful", 2.6),
        ("love", 2.5),
        ("loved", 2.5),
        ("great", 2.2),
        ("best", 2.2),
        ("brilliant", 2.2),
        ("excited", 2.0),
        ("happy", 2.0),
        ("proud", 2.0),
        ("grateful", 2.0),
        ("glad", 1.8),
        ("enjoy", 1.8),
        ("enjoyed", 1.8),
        ("good", 1.7),
        ("helpful", 1.6),
        ("thanks", 1.6),
        ("thank", 1.6),
        ("win", 1.6),
        ("won", 1.6),
        ("passed", 1.5),
        ("nice", 1.4),
        ("fun", 1.4),
        ("cool", 1.3),
        ("better", 1.2),
        ("interesting", 1.1),
        ("fine", 0.8),
        ("okay", 0.5),
        ("ok", 0.5),
        // negative
        ("suicide", -3.2),
        ("hopeless", -2.9),
        ("worthless", -2.9),
        ("devastated", -2.8),
        ("miserable", -2.7),
        ("terrible", -2.6),
        ("horrible", -2.6),
        ("awful", -2.5),
        ("hate", -2.5),
        ("hated", -2.5),
        ("depressed", -2.5),
        ("depressing", -2.4),
        ("worst", -2.4),
        ("overwhelmed", -2.2),
        ("breakdown", -2.2),
        ("panic", -2.1),
        ("failing", -2.1),
        ("failed", -2.0),
        ("fail", -2.0),
        ("expelled", -2.0),
        ("harassed", -2.0),
        ("threatened", -2.0),
        ("stalked", -2.0),
        ("scared", -1.9),
        ("anxious", -1.9),
        ("anxiety", -1.9),
        ("stressed", -1.8),
        ("stress", -1.7),
        ("angry", -1.8),
        ("lonely", -1.8),
        ("crying", -1.8),
        ("sad", -1.7),
        ("exhausted", -1.7),
        ("bad", -1.5),
        ("tired", -1.3),
        ("worried", -1.3),
        ("struggling", -1.3),
        ("hard", -0.9),
        ("difficult", -0.9),
        ("boring", -0.9),
        ("meh", -0.5),
    ];
    entries.iter().copied().collect()
});

const NEGATORS: &[&str] = &["not", "no", "never"];

const INTENSIFIERS: &[&str] = &["very", "extremely", "really"];

/// Deterministic sentiment classifier over the static valence dictionary
#[derive(Debug, Clone, Default)]
pub struct LexiconClassifier;

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Word(&'a str),
    Exclamation,
    Question,
}

impl LexiconClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Score a text; pure aside from the reported latency
    pub fn classify(&self, text: &str) -> SentimentVerdict {
        let started = Instant::now();
        let lowered = text.to_lowercase();
        let tokens = tokenize(&lowered);

        let mut sum = 0.0_f64;
        // content tokens only, most recent last, for negation lookback
        let mut recent_words: Vec<&str> = Vec::new();

        for token in &tokens {
            match token {
                // kept as tokenization boundaries; they carry no valence
                Token::Exclamation | Token::Question => {}
                Token::Word(word) => {
                    if let Some(&valence) = VALENCE.get(word) {
                        let mut score = valence;
                        let window = recent_words
                            .iter()
                            .rev()
                            .take(NEGATION_WINDOW)
                            .copied()
                            .collect::<Vec<_>>();
                        if window.iter().any(|w| is_negator(w)) {
                            score = -score;
                        }
                        if let Some(prev) = recent_words.last() {
                            if INTENSIFIERS.contains(prev) {
                                score *= AMPLIFIER_BOOST;
                            }
                        }
                        sum += score;
                    }
                    recent_words.push(*word);
                }
            }
        }

        let compound = normalize_score(sum);
        let (label, confidence) = label_for(compound, tokens.is_empty());

        SentimentVerdict {
            label,
            confidence,
            compound,
            model: LEXICON_MODEL_NAME.to_string(),
            source: VerdictSource::Fallback,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn is_negator(word: &str) -> bool {
    NEGATORS.contains(&word) || word.ends_with("n't")
}

/// Split on whitespace and punctuation boundaries, keeping `!` and `?`
/// as standalone tokens. Apostrophes stay inside words so contractions
/// like "can't" survive.
fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() || c == '\'' {
            if start.is_none() {
                start = Some(i);
            }
            continue;
        }
        if let Some(s) = start.take() {
            tokens.push(Token::Word(&text[s..i]));
        }
        match c {
            '!' => tokens.push(Token::Exclamation),
            '?' => tokens.push(Token::Question),
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push(Token::Word(&text[s..]));
    }
    tokens
}

/// Bound the raw sum into [-1, 1]
fn normalize_score(sum: f64) -> f64 {
    sum / (sum * sum + 15.0).sqrt()
}

fn label_for(compound: f64, empty: bool) -> (SentimentLabel, f64) {
    if empty {
        return (SentimentLabel::Neutral, 1.0);
    }
    if compound >= LABEL_THRESHOLD {
        (SentimentLabel::Positive, compound.abs())
    } else if compound <= -LABEL_THRESHOLD {
        (SentimentLabel::Negative, compound.abs())
    } else {
        let confidence = (1.0 - compound.abs() / LABEL_THRESHOLD).clamp(0.0, 1.0);
        (SentimentLabel::Neutral, confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> SentimentVerdict {
        LexiconClassifier::new().classify(text)
    }

    #[test]
    fn empty_input_is_confidently_neutral() {
        let v = classify("");
        assert_eq!(v.label, SentimentLabel::Neutral);
        assert_eq!(v.confidence, 1.0);
        assert_eq!(v.compound, 0.0);
        assert_eq!(v.model, "lexicon");
        assert_eq!(v.source, VerdictSource::Fallback);
    }

    #[test]
    fn positive_and_negative_texts_get_the_right_label() {
        assert_eq!(classify("this campus is amazing").label, SentimentLabel::Positive);
        assert_eq!(
            classify("I feel hopeless and worthless").label,
            SentimentLabel::Negative
        );
    }

    #[test]
    fn unknown_tokens_are_neutral() {
        let v = classify("the quadrangle contains several benches");
        assert_eq!(v.label, SentimentLabel::Neutral);
        assert_eq!(v.compound, 0.0);
    }

    #[test]
    fn negation_flips_polarity() {
        let plain = classify("the lecture was good");
        let negated = classify("the lecture was not good");
        assert_eq!(plain.label, SentimentLabel::Positive);
        assert_eq!(negated.label, SentimentLabel::Negative);
        assert!((plain.compound + negated.compound).abs() < 1e-9);
    }

    #[test]
    fn contraction_negators_count() {
        let v = classify("this isn't good at all");
        assert_eq!(v.label, SentimentLabel::Negative);
    }

    #[test]
    fn negation_window_is_three_content_tokens() {
        // four content tokens between negator and the scored word: no flip
        let v = classify("not a b c d good");
        assert_eq!(v.label, SentimentLabel::Positive);
        // within the window: flip
        let v = classify("not a b good");
        assert_eq!(v.label, SentimentLabel::Negative);
    }

    #[test]
    fn intensifier_amplifies_next_token() {
        let plain = classify("the food was good");
        let boosted = classify("the food was very good");
        assert!(boosted.compound > plain.compound);
    }

    #[test]
    fn terminal_punctuation_does_not_change_the_score() {
        let plain = classify("this class is great");
        let excited = classify("this class is great!");
        let asking = classify("this class is great?");
        assert_eq!(plain.compound.to_bits(), excited.compound.to_bits());
        assert_eq!(plain.compound.to_bits(), asking.compound.to_bits());
    }

    #[test]
    fn compound_is_bounded() {
        let v = classify("amazing amazing amazing awesome fantastic wonderful love love");
        assert!(v.compound < 1.0 && v.compound > 0.9);
    }

    #[test]
    fn identical_input_yields_identical_verdict() {
        let a = classify("finals week is extremely stressful and exhausting");
        let b = classify("finals week is extremely stressful and exhausting");
        assert_eq!(a.label, b.label);
        assert_eq!(a.compound.to_bits(), b.compound.to_bits());
        assert_eq!(a.confidence.to_bits(), b.confidence.to_bits());
    }

    #[test]
    fn neutral_confidence_shrinks_toward_thresholds() {
        // "okay" alone: small positive sum, below the positive threshold
        let v = classify("okay then");
        if v.label == SentimentLabel::Neutral {
            assert!(v.confidence < 1.0);
        }
    }
}
