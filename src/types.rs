//! Shared data-model types for the pipeline core.
//!
//! Everything here is pure data: serde-backed, schema-checked at the parse
//! boundary, and passed by value between components. Behavior lives in the
//! component modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, PipelineError};
use crate::stage::Stage;

/// Current schema version for persisted run state and queue items.
///
/// A mismatch on load forces a fresh run; there is no migration path.
pub const SCHEMA_VERSION: &str = "2";

/// Opaque identifier for a pipeline execution unit.
///
/// Assigned at enqueue. Serializes as the `<unix-ts>-<short-id>` stem used
/// for the run's workspace directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RunId {
    /// Unix timestamp (seconds) at enqueue.
    pub ts: i64,
    /// Short random hex discriminator.
    pub short: String,
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for RunId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_stem(&value).ok_or_else(|| format!("invalid run id: {value}"))
    }
}

impl RunId {
    /// Mint a fresh run id at the given wall-clock second.
    #[must_use]
    pub fn mint(now: DateTime<Utc>) -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let short: String = (0..8)
            .map(|_| char::from_digit(rng.random_range(0..16), 16).unwrap_or('0'))
            .collect();
        Self {
            ts: now.timestamp(),
            short,
        }
    }

    /// Parse a `<unix-ts>-<short-id>` directory stem back into a run id.
    #[must_use]
    pub fn from_stem(stem: &str) -> Option<Self> {
        let (ts, short) = stem.split_once('-')?;
        let ts = ts.parse().ok()?;
        if short.is_empty() {
            return None;
        }
        Some(Self {
            ts,
            short: short.to_string(),
        })
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ts, self.short)
    }
}

/// Framing style requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingStyle {
    /// Single centered crop.
    #[default]
    Default,
    /// Two-speaker split screen.
    Split,
    /// Picture-in-picture.
    Pip,
    /// Let the framing FSM decide per segment.
    Auto,
}

impl FramingStyle {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Split => "split",
            Self::Pip => "pip",
            Self::Auto => "auto",
        }
    }
}

impl std::str::FromStr for FramingStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "split" => Ok(Self::Split),
            "pip" => Ok(Self::Pip),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown framing style: {other}")),
        }
    }
}

/// A user-supplied cutaway clip reference, `URL@SECONDS` on the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutawaySpec {
    pub url: String,
    pub at_seconds: f64,
}

impl std::str::FromStr for CutawaySpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (url, secs) = s
            .rsplit_once('@')
            .ok_or_else(|| format!("expected URL@SECONDS, got: {s}"))?;
        let at_seconds: f64 = secs
            .parse()
            .map_err(|_| format!("invalid cutaway offset: {secs}"))?;
        if url.is_empty() || at_seconds < 0.0 {
            return Err(format!("invalid cutaway spec: {s}"));
        }
        Ok(Self {
            url: url.to_string(),
            at_seconds,
        })
    }
}

/// Optional knobs accepted alongside a run request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Target duration of the final reel in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_duration: Option<u32>,
    /// Requested framing style.
    #[serde(default)]
    pub style: FramingStyle,
    /// Number of distinct moments to extract.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moments: Option<u32>,
    /// Free-form creative instructions passed to the content stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// User-provided cutaway clips.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cutaways: Vec<CutawaySpec>,
    /// When set, the content stage must also produce publishing assets in
    /// this language, and QA enforces their presence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publishing_language: Option<String>,
    /// Pre-selected resume stage; earlier stages are skipped after their
    /// artifacts validate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<Stage>,
}

/// The payload of a work request: what to process and what the user wants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Source video URL.
    pub url: String,
    /// The user's brief textual intent.
    pub message: String,
    /// Optional knobs.
    #[serde(default)]
    pub options: RunOptions,
}

/// A pending work item in the queue.
///
/// `item_id` equals the external request id and is unique across the queue
/// lifetime; a duplicate enqueue is a no-op reported as deduplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub item_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub payload: RunRequest,
}

/// Verdict of one critic pass over a stage artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CritiqueDecision {
    Pass,
    Rework,
    Fail,
}

/// Severity of a critique blocker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerSeverity {
    Minor,
    Major,
    Critical,
}

/// A single blocking issue found by the critic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub severity: BlockerSeverity,
    pub description: String,
}

/// Structured result of one critic invocation.
///
/// Round-trips through schema validation on every parse; a malformed
/// critique is an execution error, never a silent `Fail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaCritique {
    pub decision: CritiqueDecision,
    /// Bounded quality score.
    pub score: u8,
    /// Critic self-confidence.
    pub confidence: f64,
    #[serde(default)]
    pub blockers: Vec<Blocker>,
    #[serde(default)]
    pub prescriptive_fixes: Vec<String>,
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
}

impl QaCritique {
    /// Parse and validate a critique from raw JSON.
    ///
    /// # Errors
    ///
    /// Returns a `ParseError`-classed error when the document does not
    /// deserialize or when a bounded field is out of range.
    pub fn from_json(raw: &serde_json::Value) -> Result<Self, PipelineError> {
        let critique: Self = serde_json::from_value(raw.clone()).map_err(|e| {
            crate::error::CapError::parse("critic", format!("critique does not parse: {e}"))
        })?;
        critique.validate()?;
        Ok(critique)
    }

    /// Enforce the bounded-range invariants.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.score > 100 {
            return Err(crate::error::CapError::parse(
                "critic",
                format!("score {} out of range 0..=100", self.score),
            )
            .into());
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(crate::error::CapError::parse(
                "critic",
                format!("confidence {} out of range 0.0..=1.0", self.confidence),
            )
            .into());
        }
        Ok(())
    }

    /// Count of blockers at or above the given severity.
    #[must_use]
    pub fn blockers_at_least(&self, severity: BlockerSeverity) -> usize {
        self.blockers.iter().filter(|b| b.severity >= severity).count()
    }
}

/// The six ladder levels of the recovery chain, in consultation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-invoke the same session.
    Retry,
    /// Derive a new session from the current one.
    ForkSession,
    /// Discard the session; start fresh with a progress summary.
    FreshSession,
    /// Switch to a different agent backend implementation.
    SwapBackend,
    /// Route the task to a different model via the dispatcher.
    DowngradeModel,
    /// Halt the stage and ask the human.
    Escalate,
}

impl RecoveryAction {
    /// One-based ladder level of this action.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Retry => 1,
            Self::ForkSession => 2,
            Self::FreshSession => 3,
            Self::SwapBackend => 4,
            Self::DowngradeModel => 5,
            Self::Escalate => 6,
        }
    }
}

/// Outcome of consulting the recovery chain for one error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    /// Whether the chain believes another attempt can succeed.
    pub resolved: bool,
    /// The action the runner must take next.
    pub action: RecoveryAction,
    /// Attempt counter to commit before retrying, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<u32>,
    /// Whether the run is now awaiting a human.
    pub escalated: bool,
    /// Journal note describing what was decided and why.
    pub note: String,
}

/// Kinds of lifecycle events observed on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StageEntered,
    StageCompleted,
    QaPassed,
    QaRework,
    QaBestOfThree,
    ErrorRecovered,
    Escalated,
    Delivered,
    HookFired,
    HookAwaited,
}

/// A single lifecycle event, totally ordered within a run by `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_id: u64,
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Escalation status carried in run state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum EscalationState {
    /// No escalation in flight.
    #[default]
    None,
    /// The messenger has been asked; the run is halted at `stage`.
    AwaitingHuman { stage: Stage, question: String },
    /// The human answered; the answer is recorded for the resume path.
    Resolved { answer: String },
}

/// What happened when the runner executed one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StageOutcome {
    /// QA passed; the run advances.
    Advanced,
    /// QA passed after `attempts` generator-critic rounds.
    Reworked { attempts: u32 },
    /// Max attempts exhausted; the best attempt cleared the floor.
    BestOfThreeAccepted,
    /// The recovery chain gave up; a human has been asked.
    Escalated,
    /// An error the chain could not resolve and did not escalate.
    Errored { class: ErrorClass, reason: String },
}
