//! Error taxonomy for the pipeline core.
//!
//! Every error that crosses a layer boundary is typed and carries its class.
//! Classes are assigned at construction, because the class decides where the
//! recovery chain starts (see `recovery`): `Transient` begins at retry,
//! `Tool` at the level its kind names, `Resource` and `Fatal` jump straight
//! to escalation. Capability implementations translate whatever their
//! underlying transport raises into [`CapError`] before returning.

use std::io;
use thiserror::Error;

/// Classification of a pipeline error.
///
/// Drives the entry level of the recovery chain and the user-visible
/// failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Ill-formed input or schema-invalid artifact. Never retried.
    Validation,
    /// Timeout, rate limit, or network hiccup. Recovery level 1.
    Transient,
    /// A subprocess or capability failed deterministically.
    Tool(ToolKind),
    /// Artifact produced but rejected by QA and reflection cannot progress.
    Content,
    /// Insufficient memory, disk, or thermal headroom. Escalates immediately.
    Resource,
    /// Source unreachable, workspace unwritable, state corruption. Escalates.
    Fatal,
}

/// Finer-grained classification of deterministic tool failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Output produced but not parseable against the stage schema.
    ParseError,
    /// The capability repeatedly failed to initialize or execute.
    CapabilityUnavailable,
    /// The provider refused on cost or quota grounds.
    QuotaExceeded,
}

/// Error returned across a capability boundary.
///
/// The class is fixed at construction; the capability name and reason are
/// carried for the journal and for escalation messages.
#[derive(Error, Debug, Clone)]
#[error("{capability}: {reason}")]
pub struct CapError {
    /// Which capability failed (e.g. "agent", "media", "downloader").
    pub capability: &'static str,
    /// Classification assigned by the adapter that observed the failure.
    pub class: ErrorClass,
    /// Human-readable reason, already redacted of secrets.
    pub reason: String,
}

impl CapError {
    /// A timeout, rate limit, or network failure.
    #[must_use]
    pub fn transient(capability: &'static str, reason: impl Into<String>) -> Self {
        Self {
            capability,
            class: ErrorClass::Transient,
            reason: reason.into(),
        }
    }

    /// A deterministic tool failure of the given kind.
    #[must_use]
    pub fn tool(capability: &'static str, kind: ToolKind, reason: impl Into<String>) -> Self {
        Self {
            capability,
            class: ErrorClass::Tool(kind),
            reason: reason.into(),
        }
    }

    /// Output that failed schema validation at the parse boundary.
    #[must_use]
    pub fn parse(capability: &'static str, reason: impl Into<String>) -> Self {
        Self::tool(capability, ToolKind::ParseError, reason)
    }

    /// Memory, disk, or thermal headroom exhausted.
    #[must_use]
    pub fn resource(capability: &'static str, reason: impl Into<String>) -> Self {
        Self {
            capability,
            class: ErrorClass::Resource,
            reason: reason.into(),
        }
    }

    /// Unrecoverable failure: source unreachable, workspace gone.
    #[must_use]
    pub fn fatal(capability: &'static str, reason: impl Into<String>) -> Self {
        Self {
            capability,
            class: ErrorClass::Fatal,
            reason: reason.into(),
        }
    }
}

/// Top-level error for pipeline operations.
///
/// Layer-specific errors (`QueueError`, `StateError`, ...) live next to the
/// code that raises them and convert into this type at the stage boundary,
/// where the runner consults the recovery chain exactly once.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("validation error at {pointer}: {reason}")]
    Validation { pointer: String, reason: String },

    #[error(transparent)]
    Capability(#[from] CapError),

    #[error("queue error: {0}")]
    Queue(#[from] crate::queue::QueueError),

    #[error("state store error: {0}")]
    State(#[from] crate::state::StateError),

    #[error("workspace error: {0}")]
    Workspace(#[from] crate::workspace::WorkspaceError),

    #[error("hook error: {0}")]
    Hook(#[from] crate::hooks::HookError),

    #[error("quality gate rejected {stage} output: {reason}")]
    Content { stage: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Build a validation error with a pointer to the offending field.
    #[must_use]
    pub fn validation(pointer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            pointer: pointer.into(),
            reason: reason.into(),
        }
    }

    /// The class assigned when the error was constructed.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } => ErrorClass::Validation,
            Self::Capability(e) => e.class,
            Self::Queue(e) => e.class(),
            Self::State(e) => e.class(),
            Self::Workspace(_) | Self::Io(_) => ErrorClass::Fatal,
            Self::Hook(e) => e.class(),
            Self::Content { .. } => ErrorClass::Content,
        }
    }
}

/// Process exit codes for the CLI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Validation = 1,
    Escalated = 2,
    FatalResource = 3,
    UserAbort = 4,
}

impl ExitCode {
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<&PipelineError> for ExitCode {
    fn from(err: &PipelineError) -> Self {
        match err.class() {
            ErrorClass::Validation => Self::Validation,
            ErrorClass::Resource | ErrorClass::Fatal => Self::FatalResource,
            _ => Self::Escalated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_error_class_is_fixed_at_construction() {
        let e = CapError::transient("agent", "request timed out after 300s");
        assert_eq!(e.class, ErrorClass::Transient);

        let e = CapError::tool("agent", ToolKind::QuotaExceeded, "monthly budget spent");
        assert_eq!(e.class, ErrorClass::Tool(ToolKind::QuotaExceeded));

        let e = CapError::fatal("downloader", "video removed by uploader");
        assert_eq!(e.class, ErrorClass::Fatal);
    }

    #[test]
    fn pipeline_error_delegates_class() {
        let e = PipelineError::from(CapError::resource("media", "thermal throttling"));
        assert_eq!(e.class(), ErrorClass::Resource);

        let e = PipelineError::validation("options.moments", "must be >= 1");
        assert_eq!(e.class(), ErrorClass::Validation);
    }

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(ExitCode::Success.as_i32(), 0);
        assert_eq!(ExitCode::Validation.as_i32(), 1);
        assert_eq!(ExitCode::Escalated.as_i32(), 2);
        assert_eq!(ExitCode::FatalResource.as_i32(), 3);
        assert_eq!(ExitCode::UserAbort.as_i32(), 4);
    }
}
