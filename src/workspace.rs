//! Per-run workspace: an isolated directory with typed path accessors.
//!
//! Components never build workspace paths from strings; every file the
//! pipeline reads or writes has an accessor here. All writes go through the
//! atomic helper. Workspaces are deleted only on explicit request -
//! retention is the operator's concern.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use thiserror::Error;

use crate::artifact::StageArtifact;
use crate::error::PipelineError;
use crate::stage::Stage;
use crate::types::RunId;

/// Sub-directories created for every run.
const SUBDIRS: [&str; 5] = ["assets", "segments", "veo3", "previews", "checkpoints"];

/// Errors raised by workspace management.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("failed to create workspace at {path}: {source}")]
    CreateFailed {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("not a workspace directory: {path}")]
    NotAWorkspace { path: Utf8PathBuf },

    #[error("invalid artifact name: {name}")]
    InvalidArtifactName { name: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to one run's directory tree.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: Utf8PathBuf,
    run_id: RunId,
}

impl Workspace {
    /// Create a fresh workspace `<runs>/<ts>-<short-id>/` with all
    /// sub-directories.
    pub fn create(runs_root: &Utf8Path, run_id: RunId) -> Result<Self, WorkspaceError> {
        let root = runs_root.join(run_id.to_string());
        for sub in SUBDIRS {
            let dir = root.join(sub);
            fs::create_dir_all(dir.as_std_path()).map_err(|source| WorkspaceError::CreateFailed {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self { root, run_id })
    }

    /// Open an existing workspace, recovering the run id from the directory
    /// stem.
    pub fn open(root: &Utf8Path) -> Result<Self, WorkspaceError> {
        let stem = root.file_name().unwrap_or_default();
        let run_id = RunId::from_stem(stem).ok_or_else(|| WorkspaceError::NotAWorkspace {
            path: root.to_owned(),
        })?;
        if !root.join("run.md").exists() {
            return Err(WorkspaceError::NotAWorkspace {
                path: root.to_owned(),
            });
        }
        Ok(Self {
            root: root.to_owned(),
            run_id,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    #[must_use]
    pub const fn run_id(&self) -> &RunId {
        &self.run_id
    }

    #[must_use]
    pub fn assets_dir(&self) -> Utf8PathBuf {
        self.root.join("assets")
    }

    #[must_use]
    pub fn segments_dir(&self) -> Utf8PathBuf {
        self.root.join("segments")
    }

    #[must_use]
    pub fn veo3_dir(&self) -> Utf8PathBuf {
        self.root.join("veo3")
    }

    #[must_use]
    pub fn previews_dir(&self) -> Utf8PathBuf {
        self.root.join("previews")
    }

    #[must_use]
    pub fn checkpoints_dir(&self) -> Utf8PathBuf {
        self.root.join("checkpoints")
    }

    #[must_use]
    pub fn journal_file(&self) -> Utf8PathBuf {
        self.root.join("journal.jsonl")
    }

    #[must_use]
    pub fn command_history_file(&self) -> Utf8PathBuf {
        self.root.join("command-history.json")
    }

    #[must_use]
    pub fn elicitation_file(&self) -> Utf8PathBuf {
        self.root.join("elicitation-context.json")
    }

    #[must_use]
    pub fn cutaway_manifest_file(&self) -> Utf8PathBuf {
        self.root.join("cutaway-manifest.json")
    }

    #[must_use]
    pub fn source_media_file(&self) -> Utf8PathBuf {
        self.assets_dir().join("source.mp4")
    }

    /// Stage-6 segment outputs, `segment-<NNN>.mp4` at the workspace root.
    #[must_use]
    pub fn segment_file(&self, index: u32) -> Utf8PathBuf {
        self.root.join(format!("segment-{index:03}.mp4"))
    }

    #[must_use]
    pub fn final_reel_file(&self) -> Utf8PathBuf {
        self.root.join("final-reel.mp4")
    }

    /// Path of a named structured artifact. Names are bare file names;
    /// anything that looks like a path is rejected.
    pub fn artifact_path(&self, name: &str) -> Result<Utf8PathBuf, WorkspaceError> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(WorkspaceError::InvalidArtifactName {
                name: name.to_string(),
            });
        }
        Ok(self.root.join(name))
    }

    #[must_use]
    pub fn has_artifact(&self, name: &str) -> bool {
        self.artifact_path(name).is_ok_and(|p| p.exists())
    }

    /// Atomically persist a structured artifact under its canonical name.
    pub fn write_artifact(&self, artifact: &StageArtifact) -> Result<Utf8PathBuf, PipelineError> {
        let path = self.artifact_path(artifact.file_name())?;
        crate::atomic_write::write_json_atomic(&path, &artifact.body_json())
            .map_err(|e| PipelineError::Workspace(WorkspaceError::Io(std::io::Error::other(e))))?;
        Ok(path)
    }

    /// Read and validate the named structured artifact.
    pub fn read_artifact(&self, name: &str) -> Result<StageArtifact, PipelineError> {
        let path = self.artifact_path(name)?;
        let raw: serde_json::Value = crate::atomic_write::read_json(&path)
            .map_err(|e| PipelineError::Workspace(WorkspaceError::Io(std::io::Error::other(e))))?;
        StageArtifact::parse_named(name, &raw)
    }

    /// Read the merged cutaway manifest written by the pre-assembly hook.
    pub fn read_cutaway_manifest(&self) -> Result<crate::artifact::CutawayManifest, PipelineError> {
        crate::atomic_write::read_json(&self.cutaway_manifest_file())
            .map_err(|e| PipelineError::Workspace(WorkspaceError::Io(std::io::Error::other(e))))
    }

    /// Check that every input the stage declares exists and validates.
    /// Used by the entry guard and by resume validation.
    pub fn validate_stage_inputs(&self, stage: Stage) -> Result<(), PipelineError> {
        for input in stage.descriptor().inputs {
            if !self.has_artifact(input) {
                return Err(PipelineError::validation(
                    format!("{}/{input}", self.root),
                    format!("missing input artifact for stage {stage}"),
                ));
            }
            // The cutaway manifest is hook-produced, not a stage artifact.
            if *input == "cutaway-manifest.json" {
                self.read_cutaway_manifest()?;
            } else {
                self.read_artifact(input)?;
            }
        }
        Ok(())
    }

    /// Remove the workspace tree. Only ever called on explicit request.
    pub fn delete(self) -> Result<(), WorkspaceError> {
        fs::remove_dir_all(self.root.as_std_path())?;
        Ok(())
    }
}
