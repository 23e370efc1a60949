//! The recovery chain: six ordered handlers consulted when a stage errors.
//!
//! The chain is a value-returning chain of responsibility. The error's
//! class, fixed at construction, picks the floor level; per-stage state
//! remembers which rungs are spent so a persistent error climbs the ladder
//! instead of looping. Within one consultation the levels visited are
//! strictly increasing, and `Resource`/`Fatal` jump straight to escalation.

use crate::config::RecoveryConfig;
use crate::error::{ErrorClass, ToolKind};
use crate::types::{RecoveryAction, RecoveryDecision};

/// Per-stage ladder state; reset when a stage completes.
#[derive(Debug, Clone, Default)]
pub struct RecoveryState {
    /// Minimum ladder level for the next consultation.
    next_level: u8,
    /// Level-1 retries consumed at this stage.
    retries_used: u32,
    /// Every action handed out, in order, for the escalation summary.
    pub attempted: Vec<RecoveryAction>,
}

impl RecoveryState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_level: 1,
            retries_used: 0,
            attempted: Vec::new(),
        }
    }

    /// Human-readable summary of what was tried, for escalation messages.
    #[must_use]
    pub fn attempted_summary(&self) -> String {
        if self.attempted.is_empty() {
            return "nothing attempted".to_string();
        }
        self.attempted
            .iter()
            .map(|a| format!("{a:?}"))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// The ordered chain itself. Stateless apart from configuration; ladder
/// position lives in [`RecoveryState`].
pub struct RecoveryChain {
    config: RecoveryConfig,
}

impl RecoveryChain {
    #[must_use]
    pub const fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// The lowest ladder level that can address an error of this class.
    #[must_use]
    fn floor_for(class: ErrorClass) -> u8 {
        match class {
            ErrorClass::Transient | ErrorClass::Tool(ToolKind::CapabilityUnavailable) => 1,
            ErrorClass::Tool(ToolKind::ParseError) => 2,
            ErrorClass::Tool(ToolKind::QuotaExceeded) => 5,
            ErrorClass::Resource | ErrorClass::Fatal => 6,
            // Validation and Content never belong to the chain; if asked
            // anyway, the only safe answer is a human.
            ErrorClass::Validation | ErrorClass::Content => 6,
        }
    }

    /// Consult the chain for one error at the given stage attempt.
    ///
    /// Levels are visited in strictly increasing order within this call;
    /// single-shot rungs (fork, fresh, swap, downgrade) advance the state's
    /// floor so the next consultation starts above them.
    pub fn decide(
        &self,
        class: ErrorClass,
        attempt: u32,
        state: &mut RecoveryState,
    ) -> RecoveryDecision {
        let start = Self::floor_for(class).max(state.next_level);

        for level in start..=6 {
            match level {
                1 => {
                    if state.retries_used < self.config.max_retries {
                        state.retries_used += 1;
                        state.attempted.push(RecoveryAction::Retry);
                        return RecoveryDecision {
                            resolved: true,
                            action: RecoveryAction::Retry,
                            next_attempt: Some(attempt + 1),
                            escalated: false,
                            note: format!(
                                "retry {}/{} on same session",
                                state.retries_used, self.config.max_retries
                            ),
                        };
                    }
                    // Retries exhausted; fall through to fork.
                }
                2 => {
                    state.next_level = 3;
                    state.attempted.push(RecoveryAction::ForkSession);
                    return RecoveryDecision {
                        resolved: true,
                        action: RecoveryAction::ForkSession,
                        next_attempt: Some(attempt + 1),
                        escalated: false,
                        note: "forking session; suspected context corruption".to_string(),
                    };
                }
                3 => {
                    state.next_level = 4;
                    state.attempted.push(RecoveryAction::FreshSession);
                    return RecoveryDecision {
                        resolved: true,
                        action: RecoveryAction::FreshSession,
                        next_attempt: Some(attempt + 1),
                        escalated: false,
                        note: "starting fresh session with progress summary".to_string(),
                    };
                }
                4 => {
                    state.next_level = 5;
                    state.attempted.push(RecoveryAction::SwapBackend);
                    return RecoveryDecision {
                        resolved: true,
                        action: RecoveryAction::SwapBackend,
                        next_attempt: Some(attempt + 1),
                        escalated: false,
                        note: "swapping agent backend".to_string(),
                    };
                }
                5 => {
                    // Downgrade only answers cost/availability errors from
                    // the primary model.
                    if class == ErrorClass::Tool(ToolKind::QuotaExceeded) {
                        state.next_level = 6;
                        state.attempted.push(RecoveryAction::DowngradeModel);
                        return RecoveryDecision {
                            resolved: true,
                            action: RecoveryAction::DowngradeModel,
                            next_attempt: Some(attempt + 1),
                            escalated: false,
                            note: "routing task to downgrade model".to_string(),
                        };
                    }
                }
                _ => break,
            }
        }

        state.next_level = 6;
        state.attempted.push(RecoveryAction::Escalate);
        RecoveryDecision {
            resolved: false,
            action: RecoveryAction::Escalate,
            next_attempt: None,
            escalated: true,
            note: format!("chain exhausted: {}", state.attempted_summary()),
        }
    }
}
