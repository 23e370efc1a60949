//! The generator-critic reflection loop: the quality gate every judged
//! stage passes through before the run advances.
//!
//! History is cumulative: each critique sees every earlier (artifact,
//! critique) pair, so a fix for one issue cannot silently reintroduce an
//! earlier one. When the attempt budget is spent, the best attempt by
//! `(score desc, blocker count asc)` is accepted iff it clears the floor
//! and carries no critical blocker; otherwise the failure surfaces to the
//! state machine, which routes to escalation.

use std::cmp::Reverse;

use crate::caps::{ModelDispatcher, QaHistoryEntry};
use crate::config::ReflectionConfig;
use crate::error::PipelineError;
use crate::types::{BlockerSeverity, CritiqueDecision, QaCritique};

/// How the loop concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The critic passed an attempt outright.
    Passed {
        artifact: serde_json::Value,
        critique: QaCritique,
    },
    /// Attempts exhausted; the best attempt cleared the floor.
    BestOfThree {
        artifact: serde_json::Value,
        critique: QaCritique,
    },
    /// Attempts exhausted and no attempt was acceptable.
    Failed { reason: String },
}

/// Result of one reflection run.
#[derive(Debug, Clone, PartialEq)]
pub struct Reflected {
    pub verdict: Verdict,
    /// Generator-critic rounds consumed.
    pub attempts: u32,
    /// The cumulative history, including the final critique.
    pub history: Vec<QaHistoryEntry>,
}

impl Reflected {
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self.verdict, Verdict::Passed { .. })
    }

    #[must_use]
    pub const fn best_of_three(&self) -> bool {
        matches!(self.verdict, Verdict::BestOfThree { .. })
    }
}

/// The bounded generator-critic loop.
pub struct ReflectionLoop<'a> {
    dispatcher: &'a dyn ModelDispatcher,
    config: &'a ReflectionConfig,
}

impl<'a> ReflectionLoop<'a> {
    #[must_use]
    pub const fn new(dispatcher: &'a dyn ModelDispatcher, config: &'a ReflectionConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Run the loop over `initial`, regenerating with `regenerate` after
    /// each rework critique.
    ///
    /// `regenerate` receives the critic's prescriptive fixes and the full
    /// history and must produce the next candidate artifact.
    ///
    /// # Errors
    ///
    /// A schema-invalid critique or a failed regeneration is an execution
    /// error for the recovery chain, never a QA failure.
    pub async fn run<G, Fut>(
        &self,
        initial: serde_json::Value,
        requirements: &str,
        mut regenerate: G,
    ) -> Result<Reflected, PipelineError>
    where
        G: FnMut(Vec<String>, Vec<QaHistoryEntry>) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, PipelineError>>,
    {
        let mut history: Vec<QaHistoryEntry> = Vec::new();
        let mut artifact = initial;

        for attempt in 1..=self.config.max_attempts {
            let critique = self
                .dispatcher
                .dispatch_qa(&artifact, requirements, &history)
                .await?;
            // Re-validate at the boundary; a dispatcher must not be able to
            // smuggle an out-of-range critique past the gate.
            critique.validate()?;

            history.push(QaHistoryEntry {
                artifact: artifact.clone(),
                critique: critique.clone(),
            });

            match critique.decision {
                CritiqueDecision::Pass => {
                    return Ok(Reflected {
                        verdict: Verdict::Passed { artifact, critique },
                        attempts: attempt,
                        history,
                    });
                }
                CritiqueDecision::Rework | CritiqueDecision::Fail => {
                    if attempt == self.config.max_attempts {
                        break;
                    }
                    tracing::debug!(
                        attempt,
                        score = critique.score,
                        fixes = critique.prescriptive_fixes.len(),
                        "rework requested"
                    );
                    artifact = regenerate(
                        critique.prescriptive_fixes.clone(),
                        history.clone(),
                    )
                    .await?;
                }
            }
        }

        Ok(self.select_best(history))
    }

    /// Best-of-three selection over the exhausted history.
    fn select_best(&self, history: Vec<QaHistoryEntry>) -> Reflected {
        let attempts = history.len() as u32;
        let best = history
            .iter()
            .max_by_key(|e| (e.critique.score, Reverse(e.critique.blockers.len())))
            .cloned();

        let Some(best) = best else {
            return Reflected {
                verdict: Verdict::Failed {
                    reason: "no attempts were made".to_string(),
                },
                attempts,
                history,
            };
        };

        let critical = best.critique.blockers_at_least(BlockerSeverity::Critical);
        if best.critique.score >= self.config.floor && critical == 0 {
            Reflected {
                verdict: Verdict::BestOfThree {
                    artifact: best.artifact,
                    critique: best.critique,
                },
                attempts,
                history,
            }
        } else {
            Reflected {
                verdict: Verdict::Failed {
                    reason: format!(
                        "best attempt scored {} (floor {}, {} critical blockers)",
                        best.critique.score, self.config.floor, critical
                    ),
                },
                attempts,
                history,
            }
        }
    }
}
