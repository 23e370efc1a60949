//! Stage hooks and the background task scheduler.
//!
//! Hooks are side-effectful operations tied to stage boundaries. Each hook
//! self-selects through `should_run(stage, phase)`; the scheduler runs the
//! matching hooks in registration order. Hooks may own long-running
//! background tasks that span several stages; those tasks live in a
//! registry keyed by run id, are joined at the await gate with a bounded
//! deadline, and are cancelled when the owning run fails. An orphaned task
//! is a defect, not a tolerated state.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::artifact::{
    AssetPrompt, ClipSource, CutawayClip, CutawayManifest, StageArtifact, TARGET_HEIGHT,
    TARGET_WIDTH,
};
use crate::caps::Capabilities;
use crate::config::Config;
use crate::error::{CapError, ErrorClass, PipelineError};
use crate::stage::Stage;
use crate::types::{RunId, RunRequest};
use crate::workspace::Workspace;

/// Default duration for user cutaways, which arrive without one.
const DEFAULT_CUTAWAY_SECS: f64 = 4.0;

/// Available-memory floor below which heavy operations are deferred.
const LOW_MEMORY_FLOOR_BYTES: u64 = 256 * 1024 * 1024;

/// Errors raised by hook execution and the task registry.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("hook {hook} failed to spawn task: {reason}")]
    SpawnFailed { hook: &'static str, reason: String },

    #[error("await gate deadline expired with {outstanding} tasks outstanding")]
    AwaitDeadline { outstanding: usize },

    #[error("background task for {prompt_id} panicked")]
    TaskPanicked { prompt_id: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HookError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AwaitDeadline { .. } => ErrorClass::Transient,
            Self::Io(_) => ErrorClass::Fatal,
            _ => ErrorClass::Tool(crate::error::ToolKind::CapabilityUnavailable),
        }
    }
}

/// Whether a hook fires before or after its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    PreStage,
    PostStage,
}

/// Everything a hook may touch while running.
pub struct HookContext<'a> {
    pub run_id: &'a RunId,
    pub request: &'a RunRequest,
    pub workspace: &'a Workspace,
    pub caps: &'a Capabilities,
    pub config: &'a Config,
    pub registry: &'a TaskRegistry,
}

/// A stage-boundary hook.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &'static str;

    /// Self-selection: whether this hook fires at the given boundary.
    fn should_run(&self, stage: Stage, phase: HookPhase) -> bool;

    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), PipelineError>;
}

/// One generated clip recorded by the await gate for the manifest builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedClip {
    pub prompt_id: String,
    pub path: Utf8PathBuf,
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
}

type AssetTaskResult = Result<GeneratedClip, CapError>;

struct AssetTask {
    prompt_id: String,
    handle: JoinHandle<AssetTaskResult>,
}

/// Background tasks owned by runs. Every spawned task is registered here;
/// the await gate drains them and run failure aborts them.
#[derive(Default)]
pub struct TaskRegistry {
    inner: Mutex<HashMap<RunId, Vec<AssetTask>>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, run_id: &RunId, task: AssetTask) {
        self.inner
            .lock()
            .expect("task registry poisoned")
            .entry(run_id.clone())
            .or_default()
            .push(task);
    }

    fn drain(&self, run_id: &RunId) -> Vec<AssetTask> {
        self.inner
            .lock()
            .expect("task registry poisoned")
            .remove(run_id)
            .unwrap_or_default()
    }

    /// Number of outstanding tasks for a run.
    #[must_use]
    pub fn outstanding(&self, run_id: &RunId) -> usize {
        self.inner
            .lock()
            .expect("task registry poisoned")
            .get(run_id)
            .map_or(0, Vec::len)
    }

    /// Abort every task owned by the run. Mandatory on run failure.
    pub fn cancel_run(&self, run_id: &RunId) {
        for task in self.drain(run_id) {
            task.handle.abort();
        }
    }
}

/// The scheduler: a fixed hook set plus the task registry.
pub struct HookScheduler {
    hooks: Vec<Box<dyn Hook>>,
    registry: Arc<TaskRegistry>,
}

impl HookScheduler {
    /// Build the scheduler with the canonical hook set. Registration order
    /// matters within a phase: the await gate runs before the manifest
    /// builder.
    #[must_use]
    pub fn with_canonical_hooks() -> Self {
        Self {
            hooks: vec![
                Box::new(FetchSourceMedia),
                Box::new(FireAsyncAssetGen),
                Box::new(AwaitAsyncAssetGen),
                Box::new(BuildCutawayManifest),
                Box::new(ExecuteEncodingPlan),
            ],
            registry: Arc::new(TaskRegistry::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    /// Run every hook that selects this boundary, in registration order.
    /// Returns the names of the hooks that fired.
    pub async fn run_phase(
        &self,
        stage: Stage,
        phase: HookPhase,
        ctx: &HookContext<'_>,
    ) -> Result<Vec<&'static str>, PipelineError> {
        let mut fired = Vec::new();
        for hook in &self.hooks {
            if !hook.should_run(stage, phase) {
                continue;
            }
            tracing::debug!(hook = hook.name(), %stage, ?phase, "running hook");
            hook.run(ctx).await?;
            fired.push(hook.name());
        }
        Ok(fired)
    }
}

/// Poll the resource probe and defer with the configured back-off while the
/// host is over its envelope.
async fn wait_for_headroom(ctx: &HookContext<'_>, operation: &str) -> Result<(), PipelineError> {
    let mut backoff = ctx.config.assets.backoff_secs.iter();
    loop {
        let snapshot = ctx.caps.probe.snapshot();
        let over = snapshot.available_memory_bytes < LOW_MEMORY_FLOOR_BYTES
            || snapshot.cpu_percent > ctx.config.resources.max_cpu_percent;
        if !over {
            return Ok(());
        }
        match backoff.next() {
            Some(secs) => {
                tracing::info!(
                    operation,
                    available_mb = snapshot.available_memory_bytes / (1024 * 1024),
                    cpu = snapshot.cpu_percent,
                    defer_secs = secs,
                    "over resource envelope; deferring"
                );
                tokio::time::sleep(Duration::from_secs(*secs)).await;
            }
            None => {
                return Err(CapError::resource(
                    "probe",
                    format!("{operation} deferred past the back-off budget"),
                )
                .into());
            }
        }
    }
}

/// Pre-transcript: fetch the source media into the workspace if absent.
pub struct FetchSourceMedia;

#[async_trait]
impl Hook for FetchSourceMedia {
    fn name(&self) -> &'static str {
        "fetch_source_media"
    }

    fn should_run(&self, stage: Stage, phase: HookPhase) -> bool {
        stage == Stage::Transcript && phase == HookPhase::PreStage
    }

    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), PipelineError> {
        let dest = ctx.workspace.source_media_file();
        if dest.exists() {
            return Ok(());
        }
        wait_for_headroom(ctx, "source download").await?;
        let info = ctx.caps.downloader.download(&ctx.request.url, &dest).await?;
        tracing::info!(
            url = %ctx.request.url,
            duration = info.duration_seconds,
            size = info.size_bytes,
            "source media fetched"
        );
        Ok(())
    }
}

/// Post-content: fire one background generation task per requested clip.
///
/// Submission is staggered by the inter-job delay; each task retries on
/// resource-exhaustion signals with the exponential back-off schedule.
/// Returns immediately; stage progression is not blocked.
pub struct FireAsyncAssetGen;

#[async_trait]
impl Hook for FireAsyncAssetGen {
    fn name(&self) -> &'static str {
        "fire_async_asset_gen"
    }

    fn should_run(&self, stage: Stage, phase: HookPhase) -> bool {
        stage == Stage::Content && phase == HookPhase::PostStage
    }

    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), PipelineError> {
        // Idempotent: a retried stage sequence must not double-fire.
        if ctx.registry.outstanding(ctx.run_id) > 0 {
            return Ok(());
        }
        let StageArtifact::ContentPlan(plan) = ctx.workspace.read_artifact("content-output.json")?
        else {
            return Ok(());
        };
        let delay = Duration::from_secs(ctx.config.assets.inter_job_delay_secs);
        let backoff: Vec<u64> = ctx.config.assets.backoff_secs.clone();

        for (i, prompt) in plan.asset_prompts.iter().enumerate() {
            let prompt = prompt.clone();
            let prompt_id = prompt.id.clone();
            let generator = ctx.caps.generator.clone();
            let dest = ctx.workspace.veo3_dir().join(format!("{}.mp4", prompt.id));
            let stagger = delay * i as u32;
            let schedule = backoff.clone();

            let handle = tokio::spawn(async move {
                tokio::time::sleep(stagger).await;
                generate_with_backoff(&*generator, &prompt, &dest, &schedule).await
            });

            ctx.registry.register(
                ctx.run_id,
                AssetTask {
                    prompt_id,
                    handle,
                },
            );
        }
        tracing::info!(count = plan.asset_prompts.len(), "asset generation fired");
        Ok(())
    }
}

/// Generate one clip, backing off on resource-exhaustion signals.
async fn generate_with_backoff(
    generator: &dyn crate::caps::AssetGenerator,
    prompt: &AssetPrompt,
    dest: &Utf8PathBuf,
    backoff_secs: &[u64],
) -> AssetTaskResult {
    let mut backoff = backoff_secs.iter();
    loop {
        match generator.generate(prompt, dest).await {
            Ok(info) => {
                return Ok(GeneratedClip {
                    prompt_id: prompt.id.clone(),
                    path: dest.clone(),
                    duration_seconds: info.duration_seconds,
                    width: info.width,
                    height: info.height,
                });
            }
            Err(e) if e.class == ErrorClass::Resource => match backoff.next() {
                Some(secs) => {
                    tracing::warn!(prompt = %prompt.id, defer_secs = secs, "generator exhausted; backing off");
                    tokio::time::sleep(Duration::from_secs(*secs)).await;
                }
                None => return Err(e),
            },
            // Transient failures are retried at the await gate, not here.
            Err(e) => return Err(e),
        }
    }
}

/// Pre-assembly: join all background generation tasks under a bounded
/// deadline, retry transient failures, validate dimensions, clamp durations.
///
/// Best-effort: failed clips are logged and dropped; the run proceeds with
/// whatever arrived.
pub struct AwaitAsyncAssetGen;

#[async_trait]
impl Hook for AwaitAsyncAssetGen {
    fn name(&self) -> &'static str {
        "await_async_asset_gen"
    }

    fn should_run(&self, stage: Stage, phase: HookPhase) -> bool {
        stage == Stage::Assembly && phase == HookPhase::PreStage
    }

    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), PipelineError> {
        let tasks = ctx.registry.drain(ctx.run_id);
        if tasks.is_empty() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + ctx.config.await_deadline();
        let mut clips: Vec<GeneratedClip> = Vec::new();
        let mut failures: Vec<(String, String)> = Vec::new();

        for task in tasks {
            let prompt_id = task.prompt_id.clone();
            let joined = tokio::time::timeout_at(deadline, task.handle).await;
            let result = match joined {
                Err(_) => {
                    failures.push((prompt_id, "await deadline expired".to_string()));
                    continue;
                }
                Ok(Err(join_err)) => {
                    if join_err.is_cancelled() {
                        failures.push((prompt_id, "cancelled".to_string()));
                        continue;
                    }
                    return Err(HookError::TaskPanicked { prompt_id }.into());
                }
                Ok(Ok(result)) => result,
            };

            match result {
                Ok(clip) => clips.push(clip),
                Err(e) if e.class == ErrorClass::Transient => {
                    match self.retry_inline(ctx, &prompt_id, deadline).await {
                        Some(clip) => clips.push(clip),
                        None => failures.push((prompt_id, e.reason)),
                    }
                }
                Err(e) => failures.push((prompt_id, e.reason)),
            }
        }

        let mut validated = Vec::with_capacity(clips.len());
        for clip in clips {
            validated.push(self.normalize(ctx, clip).await?);
        }

        for (prompt_id, reason) in &failures {
            tracing::warn!(prompt = %prompt_id, reason, "asset generation lost; degrading manifest");
        }

        crate::atomic_write::write_json_atomic(
            &ctx.workspace.veo3_dir().join("generated-clips.json"),
            &validated,
        )
        .map_err(|e| HookError::Io(std::io::Error::other(e)))?;
        Ok(())
    }
}

impl AwaitAsyncAssetGen {
    /// Re-run a transiently failed generation inline, within the deadline
    /// and the configured retry cap.
    async fn retry_inline(
        &self,
        ctx: &HookContext<'_>,
        prompt_id: &str,
        deadline: tokio::time::Instant,
    ) -> Option<GeneratedClip> {
        let plan = match ctx.workspace.read_artifact("content-output.json") {
            Ok(StageArtifact::ContentPlan(plan)) => plan,
            _ => return None,
        };
        let prompt = plan.asset_prompts.iter().find(|p| p.id == prompt_id)?.clone();
        let dest = ctx.workspace.veo3_dir().join(format!("{}.mp4", prompt.id));

        for _ in 0..ctx.config.assets.max_transient_retries {
            let attempt = tokio::time::timeout_at(
                deadline,
                ctx.caps.generator.generate(&prompt, &dest),
            )
            .await;
            match attempt {
                Ok(Ok(info)) => {
                    return Some(GeneratedClip {
                        prompt_id: prompt.id.clone(),
                        path: dest,
                        duration_seconds: info.duration_seconds,
                        width: info.width,
                        height: info.height,
                    });
                }
                Ok(Err(e)) if e.class == ErrorClass::Transient => continue,
                _ => return None,
            }
        }
        None
    }

    /// Validate a clip's dimensions, rescale when off-target, and clamp its
    /// duration into the configured window.
    async fn normalize(
        &self,
        ctx: &HookContext<'_>,
        mut clip: GeneratedClip,
    ) -> Result<GeneratedClip, PipelineError> {
        if clip.width != TARGET_WIDTH || clip.height != TARGET_HEIGHT {
            let rescaled = clip.path.with_extension("scaled.mp4");
            let info = ctx
                .caps
                .media
                .rescale(&clip.path, TARGET_WIDTH, TARGET_HEIGHT, &rescaled)
                .await?;
            clip.path = rescaled;
            clip.width = info.width;
            clip.height = info.height;
        }
        clip.duration_seconds = clip
            .duration_seconds
            .clamp(ctx.config.assets.min_clip_secs, ctx.config.assets.max_clip_secs);
        Ok(clip)
    }
}

/// Pre-assembly: merge user-provided, AI-generated, and content-suggested
/// clips into one manifest, resolving overlaps by source priority and then
/// by descending confidence.
pub struct BuildCutawayManifest;

#[async_trait]
impl Hook for BuildCutawayManifest {
    fn name(&self) -> &'static str {
        "build_cutaway_manifest"
    }

    fn should_run(&self, stage: Stage, phase: HookPhase) -> bool {
        stage == Stage::Assembly && phase == HookPhase::PreStage
    }

    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), PipelineError> {
        let plan = match ctx.workspace.read_artifact("content-output.json") {
            Ok(StageArtifact::ContentPlan(plan)) => Some(plan),
            _ => None,
        };

        // User-provided clips, downloaded best-effort.
        let mut user = Vec::new();
        for (i, spec) in ctx.request.options.cutaways.iter().enumerate() {
            let dest = ctx.workspace.assets_dir().join(format!("cutaway-{i:02}.mp4"));
            match ctx.caps.downloader.download(&spec.url, &dest).await {
                Ok(info) => user.push(CutawayClip {
                    at_seconds: spec.at_seconds,
                    duration_seconds: info.duration_seconds.min(DEFAULT_CUTAWAY_SECS),
                    path: dest.to_string(),
                    source: ClipSource::UserProvided,
                    confidence: 1.0,
                }),
                Err(e) => {
                    tracing::warn!(url = %spec.url, error = %e, "user cutaway lost");
                }
            }
        }

        // AI-generated clips recorded by the await gate, placed where the
        // content plan suggested them.
        let generated: Vec<GeneratedClip> = crate::atomic_write::read_json(
            &ctx.workspace.veo3_dir().join("generated-clips.json"),
        )
        .unwrap_or_default();
        let mut ai = Vec::new();
        let mut suggested = Vec::new();
        if let Some(plan) = &plan {
            for suggestion in &plan.suggested_cutaways {
                if let Some(clip) = generated.iter().find(|c| c.prompt_id == suggestion.source) {
                    ai.push(CutawayClip {
                        at_seconds: suggestion.at_seconds,
                        duration_seconds: clip.duration_seconds,
                        path: clip.path.to_string(),
                        source: ClipSource::AiGenerated,
                        confidence: suggestion.confidence,
                    });
                } else if suggestion.source.starts_with("http") {
                    let dest = ctx
                        .workspace
                        .assets_dir()
                        .join(format!("suggested-{:02}.mp4", suggested.len()));
                    if let Ok(info) = ctx.caps.downloader.download(&suggestion.source, &dest).await
                    {
                        suggested.push(CutawayClip {
                            at_seconds: suggestion.at_seconds,
                            duration_seconds: info
                                .duration_seconds
                                .min(suggestion.duration_seconds),
                            path: dest.to_string(),
                            source: ClipSource::ContentSuggested,
                            confidence: suggestion.confidence,
                        });
                    }
                }
            }
        }

        let manifest = merge_cutaways(user, ai, suggested);
        crate::atomic_write::write_json_atomic(&ctx.workspace.cutaway_manifest_file(), &manifest)
            .map_err(|e| HookError::Io(std::io::Error::other(e)))?;
        Ok(())
    }
}

/// Merge the three clip sources, resolving time-range overlaps by priority
/// `user_provided > ai_generated > content_suggested`, and within a source
/// by descending confidence. Pure; never suspends.
#[must_use]
pub fn merge_cutaways(
    user: Vec<CutawayClip>,
    ai: Vec<CutawayClip>,
    suggested: Vec<CutawayClip>,
) -> CutawayManifest {
    let mut candidates: Vec<CutawayClip> = Vec::new();
    candidates.extend(user);
    candidates.extend(ai);
    candidates.extend(suggested);
    // Priority first (ClipSource orders user < ai < suggested, so ascending
    // source is descending priority), then confidence descending.
    candidates.sort_by(|a, b| {
        a.source
            .cmp(&b.source)
            .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    });

    let mut kept: Vec<CutawayClip> = Vec::new();
    let mut dropped: Vec<CutawayClip> = Vec::new();
    for clip in candidates {
        if kept.iter().any(|k| k.overlaps(&clip)) {
            dropped.push(clip);
        } else {
            kept.push(clip);
        }
    }
    kept.sort_by(|a, b| {
        a.at_seconds
            .partial_cmp(&b.at_seconds)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    CutawayManifest { clips: kept, dropped }
}

/// Post-encode-planning: drive the media processor over the plan to produce
/// the concrete segment files.
pub struct ExecuteEncodingPlan;

#[async_trait]
impl Hook for ExecuteEncodingPlan {
    fn name(&self) -> &'static str {
        "execute_encoding_plan"
    }

    fn should_run(&self, stage: Stage, phase: HookPhase) -> bool {
        stage == Stage::FfmpegEngineer && phase == HookPhase::PostStage
    }

    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), PipelineError> {
        let StageArtifact::EncodingPlan(plan) = ctx.workspace.read_artifact("encoding-plan.json")?
        else {
            return Err(CapError::parse("media", "encoding plan artifact has wrong shape").into());
        };

        wait_for_headroom(ctx, "segment encoding").await?;

        let segments = ctx
            .caps
            .media
            .execute_plan(&plan, &ctx.workspace.source_media_file(), ctx.workspace.root())
            .await?;

        // Aggregate per-segment problems; a single missing segment is a
        // recoverable error for the chain, not a fatal one.
        let mut missing: Vec<u32> = Vec::new();
        for planned in &plan.segments {
            let produced = segments.iter().any(|s| s.index == planned.index && s.path.exists());
            if !produced {
                missing.push(planned.index);
            }
        }
        if !missing.is_empty() {
            return Err(CapError::transient(
                "media",
                format!("segments failed to encode: {missing:?}"),
            )
            .into());
        }

        tracing::info!(count = segments.len(), "encoding plan executed");
        Ok(())
    }
}

/// Names of hooks whose background work may still be outstanding, for the
/// run-state `pending_hooks` field.
#[must_use]
pub fn pending_hook_names(registry: &TaskRegistry, run_id: &RunId) -> Vec<String> {
    if registry.outstanding(run_id) > 0 {
        vec!["await_async_asset_gen".to_string()]
    } else {
        Vec::new()
    }
}

/// Map of hook name to the stages it fires around; used by status output.
#[must_use]
pub fn hook_schedule() -> BTreeMap<&'static str, (Stage, HookPhase)> {
    BTreeMap::from([
        ("fetch_source_media", (Stage::Transcript, HookPhase::PreStage)),
        ("fire_async_asset_gen", (Stage::Content, HookPhase::PostStage)),
        ("await_async_asset_gen", (Stage::Assembly, HookPhase::PreStage)),
        ("build_cutaway_manifest", (Stage::Assembly, HookPhase::PreStage)),
        ("execute_encoding_plan", (Stage::FfmpegEngineer, HookPhase::PostStage)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(source: ClipSource, at: f64, dur: f64, confidence: f64) -> CutawayClip {
        CutawayClip {
            at_seconds: at,
            duration_seconds: dur,
            path: format!("{source:?}-{at}.mp4"),
            source,
            confidence,
        }
    }

    #[test]
    fn user_clips_win_overlaps_against_both_other_sources() {
        let manifest = merge_cutaways(
            vec![clip(ClipSource::UserProvided, 10.0, 4.0, 0.5)],
            vec![clip(ClipSource::AiGenerated, 11.0, 4.0, 0.99)],
            vec![clip(ClipSource::ContentSuggested, 9.0, 4.0, 0.99)],
        );
        assert_eq!(manifest.clips.len(), 1);
        assert_eq!(manifest.clips[0].source, ClipSource::UserProvided);
        assert_eq!(manifest.dropped.len(), 2);
    }

    #[test]
    fn ai_beats_suggested_and_confidence_orders_within_a_source() {
        let manifest = merge_cutaways(
            vec![],
            vec![
                clip(ClipSource::AiGenerated, 5.0, 4.0, 0.4),
                clip(ClipSource::AiGenerated, 6.0, 4.0, 0.9),
            ],
            vec![clip(ClipSource::ContentSuggested, 5.5, 4.0, 1.0)],
        );
        // The higher-confidence AI clip survives; the lower-confidence one
        // and the suggested clip overlap it and drop.
        assert_eq!(manifest.clips.len(), 1);
        assert_eq!(manifest.clips[0].confidence, 0.9);
        assert_eq!(manifest.dropped.len(), 2);
    }

    #[test]
    fn non_overlapping_clips_all_survive_in_timeline_order() {
        let manifest = merge_cutaways(
            vec![clip(ClipSource::UserProvided, 30.0, 3.0, 1.0)],
            vec![clip(ClipSource::AiGenerated, 10.0, 3.0, 0.8)],
            vec![clip(ClipSource::ContentSuggested, 20.0, 3.0, 0.6)],
        );
        assert_eq!(manifest.dropped.len(), 0);
        let ats: Vec<f64> = manifest.clips.iter().map(|c| c.at_seconds).collect();
        assert_eq!(ats, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn adjacent_clips_do_not_count_as_overlapping() {
        let a = clip(ClipSource::AiGenerated, 10.0, 4.0, 0.9);
        let b = clip(ClipSource::AiGenerated, 14.0, 4.0, 0.9);
        assert!(!a.overlaps(&b));
        let manifest = merge_cutaways(vec![], vec![a, b], vec![]);
        assert_eq!(manifest.clips.len(), 2);
    }

    #[tokio::test]
    async fn registry_cancel_aborts_outstanding_tasks() {
        let registry = TaskRegistry::new();
        let run_id = RunId {
            ts: 1,
            short: "cafe0001".to_string(),
        };
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(CapError::transient("generator", "unreachable"))
        });
        registry.register(
            &run_id,
            AssetTask {
                prompt_id: "clip-1".to_string(),
                handle,
            },
        );
        assert_eq!(registry.outstanding(&run_id), 1);
        registry.cancel_run(&run_id);
        assert_eq!(registry.outstanding(&run_id), 0);
    }

    #[test]
    fn canonical_hooks_self_select_at_their_boundaries() {
        let scheduler = HookScheduler::with_canonical_hooks();
        let selections: Vec<(&str, bool)> = scheduler
            .hooks
            .iter()
            .map(|h| {
                let (stage, phase) = hook_schedule()[h.name()];
                (h.name(), h.should_run(stage, phase))
            })
            .collect();
        assert!(selections.iter().all(|(_, selected)| *selected), "{selections:?}");

        // And nothing fires at an unrelated boundary.
        for hook in &scheduler.hooks {
            assert!(!hook.should_run(Stage::Router, HookPhase::PreStage));
        }
    }

    #[test]
    fn await_gate_is_registered_before_manifest_builder() {
        let scheduler = HookScheduler::with_canonical_hooks();
        let names: Vec<&str> = scheduler.hooks.iter().map(|h| h.name()).collect();
        let await_pos = names.iter().position(|n| *n == "await_async_asset_gen").unwrap();
        let build_pos = names.iter().position(|n| *n == "build_cutaway_manifest").unwrap();
        assert!(await_pos < build_pos);
    }
}
