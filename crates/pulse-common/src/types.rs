//! Core data model for the Pulse platform

use crate::normalize::TextHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tasks and pipelines
pub type TaskId = Uuid;

/// Kind of a scraped content item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Post,
    Comment,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Post => "post",
            ItemKind::Comment => "comment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "post" => Some(ItemKind::Post),
            "comment" => Some(ItemKind::Comment),
            _ => None,
        }
    }
}

/// A single item as produced by the content source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    pub kind: ItemKind,
    pub parent_id: Option<String>,
    pub author: Option<String>,
    pub subreddit: String,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub body: String,
    pub score: Option<i64>,
    pub upvote_ratio: Option<f64>,
}

/// A raw item with its normalized text and content hash attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedItem {
    #[serde(flatten)]
    pub raw: RawItem,
    pub text: String,
    pub text_hash: TextHash,
}

/// Sentiment polarity label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(SentimentLabel::Positive),
            "negative" => Some(SentimentLabel::Negative),
            "neutral" => Some(SentimentLabel::Neutral),
            _ => None,
        }
    }
}

/// Where a verdict came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Model,
    Fallback,
}

impl VerdictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictSource::Model => "model",
            VerdictSource::Fallback => "fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "model" => Some(VerdictSource::Model),
            "fallback" => Some(VerdictSource::Fallback),
            _ => None,
        }
    }
}

/// Result of classifying one piece of text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentVerdict {
    pub label: SentimentLabel,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Polarity summary in [-1, 1]
    pub compound: f64,
    /// Name of the model that produced the verdict ("lexicon" on the fallback path)
    pub model: String,
    pub source: VerdictSource,
    pub latency_ms: u64,
}

/// A classified item as persisted by the result store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub item: NormalizedItem,
    pub verdict: SentimentVerdict,
    pub stored_at: DateTime<Utc>,
}

/// Risk category of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MentalHealth,
    Stress,
    Academic,
    Harassment,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::MentalHealth => "mental_health",
            AlertKind::Stress => "stress",
            AlertKind::Academic => "academic",
            AlertKind::Harassment => "harassment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mental_health" => Some(AlertKind::MentalHealth),
            "stress" => Some(AlertKind::Stress),
            "academic" => Some(AlertKind::Academic),
            "harassment" => Some(AlertKind::Harassment),
            _ => None,
        }
    }
}

/// Severity tier of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(AlertSeverity::Low),
            "medium" => Some(AlertSeverity::Medium),
            "high" => Some(AlertSeverity::High),
            _ => None,
        }
    }
}

/// Review status of an alert; the only mutable alert field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Reviewed,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Reviewed => "reviewed",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AlertStatus::Active),
            "reviewed" => Some(AlertStatus::Reviewed),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

/// An alert raised for a classified item that matched a risk rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub content_id: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub keywords_matched: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub status: AlertStatus,
}

/// Kind of a task tracked by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Scrape,
    Process,
    Clean,
    Persist,
    Pipeline,
}

/// State of a task; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// A unit of tracked work; pipelines are tasks owning per-stage child tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Fraction of known work, 0-100
    pub progress: u8,
    pub parent_id: Option<TaskId>,
    pub error: Option<String>,
}

/// One stage of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Scrape,
    Process,
    Clean,
    Persist,
}

impl StageKind {
    /// The four stages in execution order
    pub const ALL: [StageKind; 4] = [
        StageKind::Scrape,
        StageKind::Process,
        StageKind::Clean,
        StageKind::Persist,
    ];
}

impl From<StageKind> for TaskKind {
    fn from(stage: StageKind) -> Self {
        match stage {
            StageKind::Scrape => TaskKind::Scrape,
            StageKind::Process => TaskKind::Process,
            StageKind::Clean => TaskKind::Clean,
            StageKind::Persist => TaskKind::Persist,
        }
    }
}

/// Post listing order requested from the content source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Hot,
    New,
    Top,
    Rising,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Hot => "hot",
            SortOrder::New => "new",
            SortOrder::Top => "top",
            SortOrder::Rising => "rising",
        }
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Hot
    }
}

/// Time window for time-bounded listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Day => "day",
            TimeWindow::Week => "week",
            TimeWindow::Month => "month",
            TimeWindow::Year => "year",
            TimeWindow::All => "all",
        }
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        TimeWindow::Week
    }
}

/// Parameters for a content source fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceParams {
    pub subreddit: String,
    #[serde(default = "default_post_limit")]
    pub post_limit: u32,
    #[serde(default = "default_comment_limit")]
    pub comment_limit_per_post: u32,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default)]
    pub time_window: TimeWindow,
    #[serde(default)]
    pub query: Option<String>,
}

fn default_post_limit() -> u32 {
    25
}

fn default_comment_limit() -> u32 {
    10
}

/// Request to run a pipeline, submitted over HTTP or by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineRequest {
    pub source_params: SourceParams,
    /// Ordered subset of stages to run; defaults to all four
    #[serde(default = "default_stages")]
    pub stages: Vec<StageKind>,
    #[serde(default = "default_enable_alerts")]
    pub enable_alerts: bool,
}

fn default_stages() -> Vec<StageKind> {
    StageKind::ALL.to_vec()
}

fn default_enable_alerts() -> bool {
    true
}

/// Phase of the failsafe circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitPhase::Closed => "closed",
            CircuitPhase::Open => "open",
            CircuitPhase::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of the failsafe dispatcher, readable without blocking predictions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailsafeSnapshot {
    pub phase: CircuitPhase,
    pub total_requests: u64,
    pub model_successes: u64,
    pub model_failures: u64,
    pub fallback_uses: u64,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_wire_forms_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&AlertKind::MentalHealth).unwrap(),
            "\"mental_health\""
        );
        assert_eq!(
            serde_json::to_string(&CircuitPhase::HalfOpen).unwrap(),
            "\"half_open\""
        );
        assert_eq!(
            serde_json::to_string(&VerdictSource::Fallback).unwrap(),
            "\"fallback\""
        );
    }

    #[test]
    fn severity_ordering_escalates() {
        assert!(AlertSeverity::High > AlertSeverity::Medium);
        assert!(AlertSeverity::Medium > AlertSeverity::Low);
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn pipeline_request_rejects_unknown_fields() {
        let body = r#"{"source_params":{"subreddit":"ucla"},"batch_size":9}"#;
        assert!(serde_json::from_str::<PipelineRequest>(body).is_err());
    }

    #[test]
    fn pipeline_request_defaults() {
        let body = r#"{"source_params":{"subreddit":"ucla"}}"#;
        let req: PipelineRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.stages, StageKind::ALL.to_vec());
        assert!(req.enable_alerts);
        assert_eq!(req.source_params.post_limit, 25);
        assert_eq!(req.source_params.sort, SortOrder::Hot);
    }
}
