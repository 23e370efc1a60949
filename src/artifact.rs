//! Typed artifacts: the tagged sum of every structured document a stage can
//! produce, validated once at the parse boundary.
//!
//! Free-form JSON never travels past this module. Each artifact file name
//! maps to exactly one variant; parse failures are tool errors classified
//! `ParseError` and routed to the recovery chain, not silently coerced.

use serde::{Deserialize, Serialize};

use crate::error::{CapError, PipelineError};
use crate::framing::{FramingState, StyleTransition};
use crate::stage::{PUBLISHING_ASSETS, Stage};
use crate::types::FramingStyle;

/// Target deliverable dimensions.
pub const TARGET_WIDTH: u32 = 1080;
pub const TARGET_HEIGHT: u32 = 1920;

/// Upscale factor above which a proposed crop is unacceptable unless the
/// planner widens it or QA records a blocker.
pub const UNACCEPTABLE_UPSCALE: f64 = 2.0;

/// The four kinds of artifact a workspace holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Schema-validated document describing a decision.
    Structured,
    /// Video segments, final deliverable, intermediate audio.
    BinaryMedia,
    /// Append-only event log.
    Journal,
    /// State snapshot with frontmatter header.
    Checkpoint,
}

/// Hex BLAKE3 digest of raw bytes; artifacts are content-addressed with it.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// A crop window in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Predicted upscale factor when this crop is scaled to the target
    /// vertical frame. Pure; never suspends.
    #[must_use]
    pub fn predicted_upscale(&self) -> f64 {
        if self.width == 0 || self.height == 0 {
            return f64::INFINITY;
        }
        let wx = f64::from(TARGET_WIDTH) / f64::from(self.width);
        let hx = f64::from(TARGET_HEIGHT) / f64::from(self.height);
        wx.max(hx)
    }

    /// Widen the crop in place so the predicted upscale drops to `limit`,
    /// clamped to the source frame.
    pub fn widen_to_limit(&mut self, limit: f64, source_w: u32, source_h: u32) {
        let need_w = (f64::from(TARGET_WIDTH) / limit).ceil() as u32;
        let need_h = (f64::from(TARGET_HEIGHT) / limit).ceil() as u32;
        self.width = self.width.max(need_w).min(source_w);
        self.height = self.height.max(need_h).min(source_h);
        self.x = self.x.min(source_w - self.width);
        self.y = self.y.min(source_h - self.height);
    }
}

/// Router output: how the pipeline should treat this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterDecision {
    /// Normalized statement of the user's intent.
    pub intent: String,
    /// How many distinct moments to extract.
    pub moments_requested: u32,
    /// Framing style the router settled on (user option wins).
    pub framing_style: FramingStyle,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Research output: grounding context for the content stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchNotes {
    pub summary: String,
    #[serde(default)]
    pub key_claims: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// One timed utterance in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub text: String,
}

/// Transcript output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptDoc {
    pub language: String,
    pub segments: Vec<TranscriptSegment>,
}

/// A selected moment in the source video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moment {
    pub title: String,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub rationale: String,
}

/// A clip the content stage suggests cutting away to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedCutaway {
    /// Where in the reel timeline the cutaway lands, in seconds.
    pub at_seconds: f64,
    pub duration_seconds: f64,
    /// Either a source URL or a generation prompt id.
    pub source: String,
    pub confidence: f64,
}

/// A prompt for one AI-generated media clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetPrompt {
    pub id: String,
    pub prompt: String,
    pub duration_seconds: f64,
}

/// Content output: the selected moments and narrative plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPlan {
    pub hook_text: String,
    pub moments: Vec<Moment>,
    #[serde(default)]
    pub suggested_cutaways: Vec<SuggestedCutaway>,
    /// Requested AI-generated clips; fired as background tasks post-stage.
    #[serde(default)]
    pub asset_prompts: Vec<AssetPrompt>,
}

/// Publishing assets, produced iff a publishing language was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishingAssets {
    pub language: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
}

/// Layout analysis for one segment of the selected moments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSegment {
    pub start: f64,
    pub end: f64,
    pub face_count: u8,
    pub screen_share: bool,
    /// True when this segment begins a new moment.
    #[serde(default)]
    pub moment_boundary: bool,
    pub crop: CropRect,
    pub confidence: f64,
}

/// Layout-detective output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutAnalysis {
    pub source_width: u32,
    pub source_height: u32,
    pub segments: Vec<LayoutSegment>,
}

/// Encoder parameters for every segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeParams {
    pub codec: String,
    pub crf: u8,
    pub preset: String,
    pub audio_bitrate: String,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            crf: 21,
            preset: "veryfast".to_string(),
            audio_bitrate: "128k".to_string(),
        }
    }
}

/// One planned segment encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPlan {
    pub index: u32,
    pub start: f64,
    pub end: f64,
    pub crop: CropRect,
    pub style: FramingState,
    #[serde(default)]
    pub filters: Vec<String>,
}

/// FFmpeg-engineer output: the declarative encoding plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingPlan {
    pub target_width: u32,
    pub target_height: u32,
    pub encode: EncodeParams,
    pub segments: Vec<SegmentPlan>,
    pub style_transitions: Vec<StyleTransition>,
}

impl EncodingPlan {
    /// Indices of segments whose crop predicts an unacceptable upscale.
    /// The planner must widen these or QA must record a blocker.
    #[must_use]
    pub fn over_upscaled_segments(&self, threshold: f64) -> Vec<u32> {
        self.segments
            .iter()
            .filter(|s| s.crop.predicted_upscale() > threshold)
            .map(|s| s.index)
            .collect()
    }
}

/// Post-assembly quality checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityChecks {
    pub duration_within_tolerance: bool,
    pub width: u32,
    pub height: u32,
}

/// Assembly output: what was built and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyReport {
    pub quality_checks: QualityChecks,
    /// Whether the overlay pass was applied; false means the base reel was
    /// accepted after a pass-2 failure.
    pub overlays_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation_note: Option<String>,
    pub final_media: String,
    pub final_media_blake3: String,
    pub duration_seconds: f64,
}

/// Delivery output: where the deliverable went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// "inline" when sent through the messenger, "object_store" when the
    /// deliverable exceeded the inline limit and was uploaded.
    pub delivered_via: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub size_bytes: u64,
    pub caption: String,
}

/// Where a cutaway clip came from; also its merge priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipSource {
    UserProvided,
    AiGenerated,
    ContentSuggested,
}

/// One resolved cutaway clip in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutawayClip {
    /// Where in the reel timeline the clip lands, in seconds.
    pub at_seconds: f64,
    pub duration_seconds: f64,
    /// Local path of the clip file.
    pub path: String,
    pub source: ClipSource,
    pub confidence: f64,
}

impl CutawayClip {
    /// Whether two clips contest the same stretch of timeline.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.at_seconds < other.at_seconds + other.duration_seconds
            && other.at_seconds < self.at_seconds + self.duration_seconds
    }
}

/// Merged cutaway manifest consumed by the assembly overlay pass.
///
/// Overlaps are resolved by source priority (`user_provided` >
/// `ai_generated` > `content_suggested`), then by descending confidence
/// within a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CutawayManifest {
    pub clips: Vec<CutawayClip>,
    /// Clips dropped during overlap resolution, kept for the report.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<CutawayClip>,
}

/// The tagged sum of every structured stage artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "artifact", content = "body")]
pub enum StageArtifact {
    RouterDecision(RouterDecision),
    ResearchNotes(ResearchNotes),
    Transcript(TranscriptDoc),
    ContentPlan(ContentPlan),
    PublishingAssets(PublishingAssets),
    LayoutAnalysis(LayoutAnalysis),
    EncodingPlan(EncodingPlan),
    AssemblyReport(AssemblyReport),
    DeliveryReceipt(DeliveryReceipt),
}

impl StageArtifact {
    /// Parse and validate the artifact stored under `name`.
    ///
    /// # Errors
    ///
    /// `ParseError`-classed error when `name` is not a known artifact or the
    /// body does not match its schema.
    pub fn parse_named(name: &str, raw: &serde_json::Value) -> Result<Self, PipelineError> {
        let parse = |e: serde_json::Error| {
            PipelineError::from(CapError::parse("agent", format!("{name}: {e}")))
        };
        let value = raw.clone();
        match name {
            "router-output.json" => Ok(Self::RouterDecision(
                serde_json::from_value(value).map_err(parse)?,
            )),
            "research-output.json" => Ok(Self::ResearchNotes(
                serde_json::from_value(value).map_err(parse)?,
            )),
            "transcript-output.json" => {
                Ok(Self::Transcript(serde_json::from_value(value).map_err(parse)?))
            }
            "content-output.json" => {
                Ok(Self::ContentPlan(serde_json::from_value(value).map_err(parse)?))
            }
            PUBLISHING_ASSETS => Ok(Self::PublishingAssets(
                serde_json::from_value(value).map_err(parse)?,
            )),
            "layout-detective-output.json" => Ok(Self::LayoutAnalysis(
                serde_json::from_value(value).map_err(parse)?,
            )),
            "encoding-plan.json" => {
                Ok(Self::EncodingPlan(serde_json::from_value(value).map_err(parse)?))
            }
            "assembly-report.json" => Ok(Self::AssemblyReport(
                serde_json::from_value(value).map_err(parse)?,
            )),
            "delivery-output.json" => Ok(Self::DeliveryReceipt(
                serde_json::from_value(value).map_err(parse)?,
            )),
            other => Err(CapError::parse("agent", format!("unknown artifact name: {other}")).into()),
        }
    }

    /// The artifact file name this variant persists under.
    #[must_use]
    pub const fn file_name(&self) -> &'static str {
        match self {
            Self::RouterDecision(_) => "router-output.json",
            Self::ResearchNotes(_) => "research-output.json",
            Self::Transcript(_) => "transcript-output.json",
            Self::ContentPlan(_) => "content-output.json",
            Self::PublishingAssets(_) => PUBLISHING_ASSETS,
            Self::LayoutAnalysis(_) => "layout-detective-output.json",
            Self::EncodingPlan(_) => "encoding-plan.json",
            Self::AssemblyReport(_) => "assembly-report.json",
            Self::DeliveryReceipt(_) => "delivery-output.json",
        }
    }

    /// The stage that produces this artifact.
    #[must_use]
    pub const fn produced_by(&self) -> Stage {
        match self {
            Self::RouterDecision(_) => Stage::Router,
            Self::ResearchNotes(_) => Stage::Research,
            Self::Transcript(_) => Stage::Transcript,
            Self::ContentPlan(_) | Self::PublishingAssets(_) => Stage::Content,
            Self::LayoutAnalysis(_) => Stage::LayoutDetective,
            Self::EncodingPlan(_) => Stage::FfmpegEngineer,
            Self::AssemblyReport(_) => Stage::Assembly,
            Self::DeliveryReceipt(_) => Stage::Delivery,
        }
    }

    /// Serialize the inner document (without the tag envelope) for storage.
    #[must_use]
    pub fn body_json(&self) -> serde_json::Value {
        match self {
            Self::RouterDecision(d) => serde_json::to_value(d),
            Self::ResearchNotes(d) => serde_json::to_value(d),
            Self::Transcript(d) => serde_json::to_value(d),
            Self::ContentPlan(d) => serde_json::to_value(d),
            Self::PublishingAssets(d) => serde_json::to_value(d),
            Self::LayoutAnalysis(d) => serde_json::to_value(d),
            Self::EncodingPlan(d) => serde_json::to_value(d),
            Self::AssemblyReport(d) => serde_json::to_value(d),
            Self::DeliveryReceipt(d) => serde_json::to_value(d),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}
