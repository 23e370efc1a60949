//! Capability traits: the narrow interfaces through which the pipeline core
//! reaches its external collaborators.
//!
//! Implementations live in `adapters` (and in the test suite's stubs); the
//! core never touches a subprocess, socket, or SDK directly. Every method
//! returns [`CapError`] with its class fixed at construction, so the
//! recovery chain can pick a starting level without inspecting strings.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::artifact::{AssetPrompt, CutawayManifest, EncodingPlan};
use crate::error::CapError;
use crate::framing::StyleTransition;
use crate::stage::Stage;
use crate::types::{QaCritique, RunId};

/// Opaque token identifying a conversation with the agent backend.
///
/// Stored per (run, stage) and required for deterministic resume. There is
/// deliberately no continue-most-recent operation: in a daemon, "most
/// recent" is ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub String);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request assembled by the stage runner for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: RunId,
    pub stage: Stage,
    /// Merged prior artifacts, narrowed to the stage's declared inputs.
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// The user-facing intent plus any prescriptive fixes from reflection.
    pub instructions: String,
    /// Artifact names the backend must produce.
    pub expected_outputs: Vec<String>,
    pub model: String,
    pub timeout: Duration,
}

/// Result of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Session to store for deterministic resume of this (run, stage).
    pub session: SessionHandle,
    /// Raw output blob, kept for diagnostics.
    pub raw_output: String,
    /// Named outputs as raw JSON; typed parsing happens at the boundary.
    pub artifacts: BTreeMap<String, serde_json::Value>,
    /// Provider diagnostics (model used, token counts, timing).
    pub diagnostics: BTreeMap<String, serde_json::Value>,
}

/// An agent executor. Implementations must be idempotent for identical
/// `(request, session)` inputs; timeouts surface as `Transient`.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Stable backend name for journals and the swap handler.
    fn name(&self) -> &'static str;

    /// Start a fresh session and run the request.
    async fn run(&self, request: &AgentRequest) -> Result<AgentResult, CapError>;

    /// Resume an existing session deterministically.
    async fn resume(
        &self,
        session: &SessionHandle,
        request: &AgentRequest,
    ) -> Result<AgentResult, CapError>;

    /// Derive a new session from an existing one, carrying its context.
    async fn fork(&self, session: &SessionHandle) -> Result<SessionHandle, CapError>;
}

/// One generator attempt paired with its critique, as seen by the critic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaHistoryEntry {
    pub artifact: serde_json::Value,
    pub critique: QaCritique,
}

/// Routes QA and review tasks to critic models.
#[async_trait]
pub trait ModelDispatcher: Send + Sync {
    /// Judge an artifact against a stage's requirements, with the cumulative
    /// attempt history.
    async fn dispatch_qa(
        &self,
        artifact: &serde_json::Value,
        requirements: &str,
        history: &[QaHistoryEntry],
    ) -> Result<QaCritique, CapError>;

    /// Judge a diff against coding standards.
    async fn dispatch_review(&self, diff: &str, standards: &str) -> Result<QaCritique, CapError>;

    /// Ask several models and merge their verdicts.
    async fn consensus(&self, models: &[String], task: &str) -> Result<QaCritique, CapError>;
}

/// The user-facing channel: elicitation, notification, file delivery.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Ask the human and block until they reply.
    async fn ask(&self, question: &str) -> Result<String, CapError>;

    /// Fire-and-forget notification.
    async fn notify(&self, message: &str) -> Result<(), CapError>;

    /// Deliver a file inline with a caption.
    async fn send_file(&self, path: &Utf8Path, caption: &str) -> Result<(), CapError>;
}

/// Probed facts about a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub duration_seconds: f64,
    pub size_bytes: u64,
}

/// One encoded segment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFile {
    pub index: u32,
    pub path: Utf8PathBuf,
    pub duration_seconds: f64,
}

/// Executes declarative media plans. The plan is data; this capability owns
/// every codec decision.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    async fn probe(&self, path: &Utf8Path) -> Result<MediaInfo, CapError>;

    /// Produce one encoded file per planned segment.
    async fn execute_plan(
        &self,
        plan: &EncodingPlan,
        source: &Utf8Path,
        out_dir: &Utf8Path,
    ) -> Result<Vec<SegmentFile>, CapError>;

    /// Concatenate segments into the base reel, honoring transition effects.
    async fn assemble(
        &self,
        segments: &[SegmentFile],
        transitions: &[StyleTransition],
        out: &Utf8Path,
    ) -> Result<MediaInfo, CapError>;

    /// Apply the cutaway/overlay pass on top of the base reel.
    async fn overlay(
        &self,
        media: &Utf8Path,
        manifest: &CutawayManifest,
        out: &Utf8Path,
    ) -> Result<MediaInfo, CapError>;

    /// Re-encode a clip to the given dimensions.
    async fn rescale(
        &self,
        path: &Utf8Path,
        width: u32,
        height: u32,
        out: &Utf8Path,
    ) -> Result<MediaInfo, CapError>;
}

/// Fetches source media with retries.
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    async fn download(&self, url: &str, destination: &Utf8Path) -> Result<MediaInfo, CapError>;
}

/// Generates AI media clips from prompts; the long-running backend behind
/// the fire/await hook pair.
#[async_trait]
pub trait AssetGenerator: Send + Sync {
    async fn generate(&self, prompt: &AssetPrompt, destination: &Utf8Path)
    -> Result<MediaInfo, CapError>;
}

/// Result of an object-store upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub url: String,
    pub size_bytes: u64,
}

/// Stores deliverables too large for the messenger's inline limit.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, path: &Utf8Path, folder: &str) -> Result<UploadResult, CapError>;
}

/// Wall-clock and monotonic time, isolated for testability.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    /// Monotonic duration since an arbitrary fixed origin.
    fn monotonic(&self) -> Duration;
}

/// A point-in-time resource reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub available_memory_bytes: u64,
    pub cpu_percent: f32,
    pub thermal_celsius: Option<f32>,
}

/// Polled before heavy operations; over-envelope operations are deferred.
pub trait ResourceProbe: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// The capability context wired once at the composition root and passed
/// explicitly to every component. No global registries.
#[derive(Clone)]
pub struct Capabilities {
    pub agent: Arc<dyn AgentBackend>,
    pub fallback_agent: Arc<dyn AgentBackend>,
    pub dispatcher: Arc<dyn ModelDispatcher>,
    pub messenger: Arc<dyn Messenger>,
    pub media: Arc<dyn MediaProcessor>,
    pub downloader: Arc<dyn MediaDownloader>,
    pub generator: Arc<dyn AssetGenerator>,
    pub store: Arc<dyn ObjectStore>,
    pub clock: Arc<dyn Clock>,
    pub probe: Arc<dyn ResourceProbe>,
}
