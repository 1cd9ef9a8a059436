//! Alert evaluation for the Pulse platform
//!
//! Decides whether a classification warrants alerts and at what severity.
//! Matching is case-insensitive on word boundaries; multi-word phrases
//! match as token sequences. Several kinds may fire for one classification,
//! each producing its own alert. The rule table lives in exactly one place:
//! [`RuleSet::builtin`], replaceable wholesale from configuration.

use chrono::Utc;
use pulse_common::{Alert, AlertKind, AlertSeverity, AlertStatus, Classification, SentimentLabel};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// One risk category with its keyword set and floor severity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub kind: AlertKind,
    pub keywords: Vec<String>,
    pub min_severity: AlertSeverity,
}

/// The complete rule table evaluated against every classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<AlertRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self { rules }
    }

    /// The built-in rule table
    pub fn builtin() -> Self {
        Self::new(vec![
            AlertRule {
                kind: AlertKind::MentalHealth,
                keywords: words(&[
                    "suicide",
                    "suicidal",
                    "kill myself",
                    "end my life",
                    "self harm",
                    "worthless",
                    "hopeless",
                    "want to die",
                ]),
                min_severity: AlertSeverity::High,
            },
            AlertRule {
                kind: AlertKind::Stress,
                keywords: words(&[
                    "overwhelmed",
                    "breakdown",
                    "can't handle",
                    "burned out",
                    "burnout",
                    "panic attack",
                    "can't cope",
                ]),
                min_severity: AlertSeverity::Medium,
            },
            AlertRule {
                kind: AlertKind::Academic,
                keywords: words(&[
                    "failing",
                    "failed out",
                    "expelled",
                    "dropped out",
                    "academic probation",
                    "dismissed",
                ]),
                min_severity: AlertSeverity::Low,
            },
            AlertRule {
                kind: AlertKind::Harassment,
                keywords: words(&[
                    "harassed",
                    "harassing",
                    "threatened",
                    "threatening me",
                    "stalked",
                    "stalking",
                    "bullied",
                ]),
                min_severity: AlertSeverity::Medium,
            },
        ])
    }

    /// Evaluate a classification; returns one alert per matching kind
    pub fn evaluate(&self, c: &Classification) -> Vec<Alert> {
        let tokens = tokenize(&c.item.text);
        if tokens.is_empty() {
            return Vec::new();
        }
        let second_person = has_second_person(&tokens);

        let mut alerts = Vec::new();
        for rule in &self.rules {
            let mut matched: Vec<String> = rule
                .keywords
                .iter()
                .filter(|kw| matches_phrase(&tokens, kw))
                .cloned()
                .collect();
            if matched.is_empty() {
                continue;
            }
            matched.sort();
            matched.dedup();

            let severity = escalate(rule, &matched, &c.verdict.label, c.verdict.confidence, second_person);
            debug!(
                kind = rule.kind.as_str(),
                severity = severity.as_str(),
                matches = matched.len(),
                content_id = %c.item.raw.id,
                "alert rule fired"
            );

            alerts.push(Alert {
                id: Uuid::new_v4(),
                content_id: c.item.raw.id.clone(),
                kind: rule.kind,
                severity,
                keywords_matched: matched,
                created_at: Utc::now(),
                status: AlertStatus::Active,
            });
        }
        alerts
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn escalate(
    rule: &AlertRule,
    matched: &[String],
    label: &SentimentLabel,
    confidence: f64,
    second_person: bool,
) -> AlertSeverity {
    let negative = *label == SentimentLabel::Negative;
    let escalated = match rule.kind {
        // any match is already the top tier
        AlertKind::MentalHealth => AlertSeverity::High,
        AlertKind::Stress => {
            if matched.len() >= 2 || (negative && confidence >= 0.8) {
                AlertSeverity::High
            } else {
                rule.min_severity
            }
        }
        AlertKind::Academic => {
            if negative {
                AlertSeverity::Medium
            } else {
                rule.min_severity
            }
        }
        AlertKind::Harassment => {
            if second_person {
                AlertSeverity::High
            } else {
                rule.min_severity
            }
        }
    };
    escalated.max(rule.min_severity)
}

/// Lowercased word tokens; apostrophes stay inside words so "can't" is one token
fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in lowered.chars() {
        if c.is_alphanumeric() || c == '\'' {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// A keyword phrase matches when its tokens appear consecutively
fn matches_phrase(tokens: &[String], phrase: &str) -> bool {
    let needle = tokenize(phrase);
    if needle.is_empty() || needle.len() > tokens.len() {
        return false;
    }
    tokens
        .windows(needle.len())
        .any(|w| w.iter().zip(&needle).all(|(a, b)| a == b))
}

fn has_second_person(tokens: &[String]) -> bool {
    tokens
        .iter()
        .any(|t| matches!(t.as_str(), "you" | "your" | "yours" | "you're" | "u"))
}
