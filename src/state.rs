//! Run-state persistence: frontmatter-annotated `run.md` plus the per-stage
//! session file.
//!
//! Every save is atomic, so loading after any crash yields either the last
//! committed state or the one before it, never a torn document. A
//! `schema_version` mismatch on load forces a fresh run; there is no
//! migration path.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use thiserror::Error;

use crate::atomic_write::write_text_atomic;
use crate::caps::SessionHandle;
use crate::error::ErrorClass;
use crate::stage::Stage;
use crate::types::{EscalationState, RunId, SCHEMA_VERSION};

const FRONTMATTER_DELIMITER: &str = "---";

/// Where the pipeline cursor points: the next stage to execute, or a
/// terminal sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Stage(Stage),
    Sentinel(Terminal),
}

/// Terminal cursor values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Done,
    Failed,
    Escalated,
}

impl Cursor {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sentinel(_))
    }

    #[must_use]
    pub fn stage(self) -> Option<Stage> {
        match self {
            Self::Stage(stage) => Some(stage),
            Self::Sentinel(_) => None,
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage(stage) => f.write_str(stage.as_str()),
            Self::Sentinel(Terminal::Done) => f.write_str("done"),
            Self::Sentinel(Terminal::Failed) => f.write_str("failed"),
            Self::Sentinel(Terminal::Escalated) => f.write_str("escalated"),
        }
    }
}

/// The typed snapshot persisted to `run.md`.
///
/// Field order here is the frontmatter key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub schema_version: String,
    pub current_stage: Cursor,
    /// Attempt counter at the current stage, 1-based once executing.
    pub attempt: u32,
    pub completed_stages: Vec<Stage>,
    pub last_event_id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pending_hooks: Vec<String>,
    #[serde(default)]
    pub escalation_state: EscalationState,
}

impl RunState {
    /// A fresh state positioned at the first stage.
    #[must_use]
    pub fn new(run_id: RunId, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            schema_version: SCHEMA_VERSION.to_string(),
            current_stage: Cursor::Stage(Stage::Router),
            attempt: 0,
            completed_stages: Vec::new(),
            last_event_id: 0,
            created_at: now,
            updated_at: now,
            pending_hooks: Vec::new(),
            escalation_state: EscalationState::None,
        }
    }

    /// Enforce the structural invariants: `completed_stages` is a strictly
    /// increasing prefix of the sequence, and the cursor is consistent
    /// with it.
    pub fn check_invariants(&self) -> Result<(), StateError> {
        let sequence = Stage::sequence();
        if self.completed_stages.len() > sequence.len() {
            return Err(StateError::InvariantViolated {
                reason: "more completed stages than the sequence holds".to_string(),
            });
        }
        for (i, stage) in self.completed_stages.iter().enumerate() {
            if *stage != sequence[i] {
                return Err(StateError::InvariantViolated {
                    reason: format!(
                        "completed_stages[{i}] is {stage}, expected {}",
                        sequence[i]
                    ),
                });
            }
        }
        if let Cursor::Stage(current) = self.current_stage {
            if current.index() != self.completed_stages.len() {
                return Err(StateError::InvariantViolated {
                    reason: format!(
                        "current stage {current} does not follow {} completed stages",
                        self.completed_stages.len()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Mark the current stage complete and advance the cursor.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<(), StateError> {
        let Cursor::Stage(stage) = self.current_stage else {
            return Err(StateError::InvariantViolated {
                reason: "cannot advance a terminal run".to_string(),
            });
        };
        self.completed_stages.push(stage);
        self.current_stage = match stage.next() {
            Some(next) => Cursor::Stage(next),
            None => Cursor::Sentinel(Terminal::Done),
        };
        self.attempt = 0;
        self.updated_at = now;
        self.check_invariants()
    }
}

/// Errors raised by the state store.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state file not found: {path}")]
    NotFound { path: Utf8PathBuf },

    #[error("state file has no frontmatter header: {path}")]
    MissingFrontmatter { path: Utf8PathBuf },

    #[error("state does not parse: {reason}")]
    Parse { reason: String },

    #[error("schema version mismatch: found {found}, expected {expected}; a fresh run is required")]
    SchemaMismatch { found: String, expected: String },

    #[error("state invariant violated: {reason}")]
    InvariantViolated { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SchemaMismatch { .. } | Self::NotFound { .. } => ErrorClass::Validation,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Persists `RunState` and session handles inside one workspace.
pub struct StateStore {
    run_path: Utf8PathBuf,
    sessions_path: Utf8PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(workspace_dir: &Utf8Path) -> Self {
        Self {
            run_path: workspace_dir.join("run.md"),
            sessions_path: workspace_dir.join("sessions.json"),
        }
    }

    /// Load the committed state, verifying schema version and invariants.
    pub fn load(&self) -> Result<RunState, StateError> {
        if !self.run_path.exists() {
            return Err(StateError::NotFound {
                path: self.run_path.clone(),
            });
        }
        let content = fs::read_to_string(self.run_path.as_std_path())?;
        let (frontmatter, _body) = split_frontmatter(&content).ok_or_else(|| {
            StateError::MissingFrontmatter {
                path: self.run_path.clone(),
            }
        })?;
        let state: RunState = serde_yaml::from_str(frontmatter).map_err(|e| StateError::Parse {
            reason: e.to_string(),
        })?;
        if state.schema_version != SCHEMA_VERSION {
            return Err(StateError::SchemaMismatch {
                found: state.schema_version,
                expected: SCHEMA_VERSION.to_string(),
            });
        }
        state.check_invariants()?;
        Ok(state)
    }

    /// Commit a new state atomically, preserving the existing log body.
    pub fn save_atomic(&self, state: &RunState) -> Result<(), StateError> {
        state.check_invariants()?;
        let body = self.read_body().unwrap_or_default();
        self.write_document(state, &body)
    }

    /// Append one line to the human-readable log body.
    pub fn append_log(&self, state: &RunState, line: &str) -> Result<(), StateError> {
        let mut body = self.read_body().unwrap_or_default();
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(line);
        body.push('\n');
        self.write_document(state, &body)
    }

    fn read_body(&self) -> Option<String> {
        let content = fs::read_to_string(self.run_path.as_std_path()).ok()?;
        split_frontmatter(&content).map(|(_, body)| body.to_string())
    }

    fn write_document(&self, state: &RunState, body: &str) -> Result<(), StateError> {
        let frontmatter = serde_yaml::to_string(state).map_err(|e| StateError::Parse {
            reason: e.to_string(),
        })?;
        let document = format!("{FRONTMATTER_DELIMITER}\n{frontmatter}{FRONTMATTER_DELIMITER}\n{body}");
        write_text_atomic(&self.run_path, &document).map_err(|e| StateError::Parse {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Load the per-stage session map, empty when the file does not exist.
    pub fn load_sessions(&self) -> Result<BTreeMap<String, SessionHandle>, StateError> {
        if !self.sessions_path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(self.sessions_path.as_std_path())?;
        serde_json::from_str(&content).map_err(|e| StateError::Parse {
            reason: e.to_string(),
        })
    }

    /// Record the session handle for one stage, atomically.
    pub fn save_session(&self, stage: Stage, handle: &SessionHandle) -> Result<(), StateError> {
        let mut sessions = self.load_sessions()?;
        sessions.insert(stage.as_str().to_string(), handle.clone());
        crate::atomic_write::write_json_atomic(&self.sessions_path, &sessions).map_err(|e| {
            StateError::Parse {
                reason: e.to_string(),
            }
        })
    }

    /// Drop the stored session for one stage (fresh-session recovery).
    pub fn clear_session(&self, stage: Stage) -> Result<(), StateError> {
        let mut sessions = self.load_sessions()?;
        if sessions.remove(stage.as_str()).is_some() {
            crate::atomic_write::write_json_atomic(&self.sessions_path, &sessions).map_err(|e| {
                StateError::Parse {
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(())
    }
}

/// Split a document into `(frontmatter, body)`; `None` when the header is
/// missing or unterminated.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---\n")?;
    let end = rest.find("\n---\n")?;
    Some((&rest[..end], &rest[end + 5..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StateStore {
        StateStore::new(Utf8Path::from_path(dir.path()).unwrap())
    }

    fn sample_state() -> RunState {
        let now = "2026-08-01T12:00:00Z".parse().unwrap();
        RunState::new(
            RunId {
                ts: 1_722_470_400,
                short: "a1b2c3d4".to_string(),
            },
            now,
        )
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let state = sample_state();
        store.save_atomic(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn frontmatter_keys_lead_with_run_identity() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_atomic(&sample_state()).unwrap();
        let content = fs::read_to_string(dir.path().join("run.md")).unwrap();
        assert!(content.starts_with("---\nrun_id:"));
        let schema_pos = content.find("schema_version:").unwrap();
        let stage_pos = content.find("current_stage:").unwrap();
        assert!(schema_pos < stage_pos);
    }

    #[test]
    fn append_log_preserves_state_and_accumulates_body() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let state = sample_state();
        store.save_atomic(&state).unwrap();
        store.append_log(&state, "router entered").unwrap();
        store.append_log(&state, "router completed").unwrap();

        let content = fs::read_to_string(dir.path().join("run.md")).unwrap();
        assert!(content.contains("router entered\nrouter completed\n"));
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn schema_mismatch_forces_fresh_run() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut state = sample_state();
        state.schema_version = "1".to_string();
        // Bypass save_atomic's invariant check path by writing directly.
        let frontmatter = serde_yaml::to_string(&state).unwrap();
        fs::write(
            dir.path().join("run.md"),
            format!("---\n{frontmatter}---\n"),
        )
        .unwrap();

        match store.load() {
            Err(StateError::SchemaMismatch { found, .. }) => assert_eq!(found, "1"),
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    #[test]
    fn advance_walks_to_done() {
        let mut state = sample_state();
        let now = state.created_at;
        for _ in Stage::sequence() {
            state.advance(now).unwrap();
        }
        assert_eq!(state.current_stage, Cursor::Sentinel(Terminal::Done));
        assert_eq!(state.completed_stages, Stage::sequence().to_vec());
        assert!(state.advance(now).is_err());
    }

    #[test]
    fn invariants_reject_out_of_order_completion() {
        let mut state = sample_state();
        state.completed_stages = vec![Stage::Research];
        assert!(state.check_invariants().is_err());

        let mut state = sample_state();
        state.completed_stages = vec![Stage::Router];
        state.current_stage = Cursor::Stage(Stage::Content);
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn sessions_round_trip_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let handle = SessionHandle("sess-01".to_string());
        store.save_session(Stage::Content, &handle).unwrap();
        let sessions = store.load_sessions().unwrap();
        assert_eq!(sessions.get("content"), Some(&handle));

        store.clear_session(Stage::Content).unwrap();
        assert!(store.load_sessions().unwrap().is_empty());
    }
}
