//! The ordered stage sequence and its immutable descriptors.
//!
//! Stages are pure data. Each descriptor names the artifacts a stage
//! consumes and produces, its QA criterion, and its timeout; all behavior
//! lives in the runner. The descriptor table is the single source of truth
//! for prerequisite checking and resume validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-stage timeout in seconds.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 300;

/// One member of the ordered pipeline sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Interprets the user message and decides the pipeline path.
    Router,
    /// Gathers topic context around the source video.
    Research,
    /// Produces a timed transcript of the source media.
    Transcript,
    /// Selects moments and writes the narrative content plan.
    Content,
    /// Analyzes camera layout per segment and proposes crops.
    LayoutDetective,
    /// Plans the encode: segments, filters, style transitions.
    FfmpegEngineer,
    /// Assembles the final reel from encoded segments plus overlays.
    Assembly,
    /// Delivers the reel and textual assets back to the requester.
    Delivery,
}

impl Stage {
    /// The full pipeline order.
    #[must_use]
    pub const fn sequence() -> [Self; 8] {
        [
            Self::Router,
            Self::Research,
            Self::Transcript,
            Self::Content,
            Self::LayoutDetective,
            Self::FfmpegEngineer,
            Self::Assembly,
            Self::Delivery,
        ]
    }

    /// Zero-based position in the sequence.
    #[must_use]
    pub fn index(self) -> usize {
        Self::sequence().iter().position(|s| *s == self).unwrap_or(0)
    }

    /// The following stage, or `None` after `Delivery`.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::sequence().get(self.index() + 1).copied()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Research => "research",
            Self::Transcript => "transcript",
            Self::Content => "content",
            Self::LayoutDetective => "layout-detective",
            Self::FfmpegEngineer => "ffmpeg-engineer",
            Self::Assembly => "assembly",
            Self::Delivery => "delivery",
        }
    }

    /// The immutable descriptor for this stage.
    #[must_use]
    pub fn descriptor(self) -> &'static StageDescriptor {
        &DESCRIPTORS[self.index()]
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::sequence()
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// Immutable description of one stage: what it reads, what it writes,
/// how it is judged, and how long it may run.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub stage: Stage,
    /// Artifact file names that must exist and validate before entry.
    pub inputs: &'static [&'static str],
    /// Artifact file names the stage is expected to produce.
    pub outputs: &'static [&'static str],
    /// Identifier of the QA criterion the critic judges against, if any.
    pub qa_criterion: Option<&'static str>,
    /// Wall-clock budget for the agent invocation.
    pub timeout: Duration,
    /// Whether a run may resume at this stage. All stages are resumable.
    pub resumable: bool,
}

/// The descriptor table, in pipeline order.
static DESCRIPTORS: [StageDescriptor; 8] = [
    StageDescriptor {
        stage: Stage::Router,
        inputs: &[],
        outputs: &["router-output.json"],
        qa_criterion: None,
        timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
        resumable: true,
    },
    StageDescriptor {
        stage: Stage::Research,
        inputs: &["router-output.json"],
        outputs: &["research-output.json"],
        qa_criterion: Some("research_grounding"),
        timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
        resumable: true,
    },
    StageDescriptor {
        stage: Stage::Transcript,
        inputs: &["router-output.json", "research-output.json"],
        outputs: &["transcript-output.json"],
        qa_criterion: Some("transcript_fidelity"),
        timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
        resumable: true,
    },
    StageDescriptor {
        stage: Stage::Content,
        inputs: &["research-output.json", "transcript-output.json"],
        outputs: &["content-output.json"],
        qa_criterion: Some("content_quality"),
        timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
        resumable: true,
    },
    StageDescriptor {
        stage: Stage::LayoutDetective,
        inputs: &["content-output.json"],
        outputs: &["layout-detective-output.json"],
        qa_criterion: Some("layout_confidence"),
        timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
        resumable: true,
    },
    StageDescriptor {
        stage: Stage::FfmpegEngineer,
        inputs: &["content-output.json", "layout-detective-output.json"],
        outputs: &["encoding-plan.json"],
        qa_criterion: Some("plan_soundness"),
        timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
        resumable: true,
    },
    StageDescriptor {
        stage: Stage::Assembly,
        inputs: &["encoding-plan.json", "cutaway-manifest.json"],
        outputs: &["assembly-report.json"],
        qa_criterion: Some("assembly_quality"),
        timeout: Duration::from_secs(600),
        resumable: true,
    },
    StageDescriptor {
        stage: Stage::Delivery,
        inputs: &["assembly-report.json"],
        outputs: &["delivery-output.json"],
        qa_criterion: None,
        timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
        resumable: true,
    },
];

/// The conditional publishing-assets artifact produced by the content stage
/// when a publishing language is requested.
pub const PUBLISHING_ASSETS: &str = "publishing-assets.json";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_eight_stages_in_order() {
        let seq = Stage::sequence();
        assert_eq!(seq.len(), 8);
        assert_eq!(seq[0], Stage::Router);
        assert_eq!(seq[7], Stage::Delivery);
        for (i, stage) in seq.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn next_walks_the_sequence_and_terminates() {
        let mut stage = Stage::Router;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, Stage::sequence().to_vec());
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in Stage::sequence() {
            let parsed: Stage = stage.as_str().parse().unwrap();
            assert_eq!(parsed, stage);
        }
        assert!("upload".parse::<Stage>().is_err());
    }

    #[test]
    fn every_declared_input_is_produced_by_an_earlier_stage() {
        for stage in Stage::sequence() {
            for input in stage.descriptor().inputs {
                // cutaway-manifest.json is produced by a pre-assembly hook,
                // not by a stage.
                if *input == "cutaway-manifest.json" {
                    continue;
                }
                let produced_earlier = Stage::sequence()
                    .iter()
                    .take(stage.index())
                    .any(|s| s.descriptor().outputs.contains(input));
                assert!(
                    produced_earlier,
                    "{input} consumed by {stage} has no earlier producer"
                );
            }
        }
    }

    #[test]
    fn all_stages_are_resumable() {
        assert!(Stage::sequence().iter().all(|s| s.descriptor().resumable));
    }
}
