//! The pipeline state machine: a deterministic automaton over the stage
//! sequence plus the QA sub-states around each stage.
//!
//! The transition table is pure data and transition evaluation never
//! suspends; guards are pure predicates supplied by the driver, and every
//! side effect (agent calls, QA, state commits) belongs to the stage
//! runner. The driver must commit a new `RunState` atomically after each
//! accepted transition before offering the next event.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stage::Stage;

/// Sub-state within one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Entering,
    Executing,
    QAing,
    ReworkDecision,
}

/// A node of the automaton: inside a stage, or terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "node")]
pub enum Node {
    AtStage { stage: Stage, phase: Phase },
    Completed,
    Failed,
    Escalated { stage: Stage },
}

impl Node {
    #[must_use]
    pub const fn start() -> Self {
        Self::AtStage {
            stage: Stage::Router,
            phase: Phase::Entering,
        }
    }

    #[must_use]
    pub fn entering(stage: Stage) -> Self {
        Self::AtStage {
            stage,
            phase: Phase::Entering,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Escalated { .. })
    }
}

/// Events offered to the automaton by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Enter the stage; guarded on prerequisite artifacts.
    Enter,
    /// The agent produced outputs; guarded on schema validity.
    AgentSucceeded,
    /// The agent failed and the recovery chain resolved a retry.
    RecoveryResolved,
    /// The agent failed and the recovery chain gave up.
    RecoveryExhausted,
    QaPass,
    /// Rework requested with attempts remaining.
    QaReworkBelowMax,
    /// Rework requested on the final attempt.
    QaReworkAtMax,
    QaFail,
    /// The exhausted history's best attempt cleared the floor.
    BestOfThreeAccepted,
    BestOfThreeRejected,
    /// A human answered an escalation; re-enter the stage.
    HumanResumed,
}

/// Guard identifiers referenced by the table. The driver supplies their
/// truth values; evaluation here stays pure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    /// Input artifacts declared by the stage exist and validate.
    PrerequisitesExist,
    /// Output artifacts produced by the agent validate against schema.
    OutputsValid,
    /// Unconditional.
    Always,
}

/// Where a table row lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Phase(Phase),
    NextStage,
    Escalate,
}

/// The transition table: pure data, no embedded I/O.
static TABLE: &[(Phase, Event, Guard, Target)] = &[
    (Phase::Entering, Event::Enter, Guard::PrerequisitesExist, Target::Phase(Phase::Executing)),
    (Phase::Executing, Event::AgentSucceeded, Guard::OutputsValid, Target::Phase(Phase::QAing)),
    (Phase::Executing, Event::RecoveryResolved, Guard::Always, Target::Phase(Phase::Executing)),
    (Phase::Executing, Event::RecoveryExhausted, Guard::Always, Target::Escalate),
    (Phase::QAing, Event::QaPass, Guard::Always, Target::NextStage),
    (Phase::QAing, Event::QaReworkBelowMax, Guard::Always, Target::Phase(Phase::Executing)),
    (Phase::QAing, Event::QaReworkAtMax, Guard::Always, Target::Phase(Phase::ReworkDecision)),
    (Phase::QAing, Event::QaFail, Guard::Always, Target::Phase(Phase::ReworkDecision)),
    (Phase::ReworkDecision, Event::BestOfThreeAccepted, Guard::Always, Target::NextStage),
    (Phase::ReworkDecision, Event::BestOfThreeRejected, Guard::Always, Target::Escalate),
];

/// Errors from transition evaluation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("no transition from {node:?} on {event:?}")]
    NoTransition { node: Node, event: Event },

    #[error("guard {guard:?} rejected {event:?} at {node:?}")]
    GuardRejected {
        node: Node,
        event: Event,
        guard: Guard,
    },
}

/// Evaluate one event against the automaton. Deterministic and pure:
/// applying the same event to the same node with the same guard answers
/// always yields the same next node.
///
/// Forward jumps that skip stages are impossible here by construction;
/// resume-with-skip is a driver concern validated against prior artifacts.
pub fn apply(
    node: Node,
    event: Event,
    guard_holds: &dyn Fn(Guard) -> bool,
) -> Result<Node, TransitionError> {
    // The only event a terminal node accepts is a human resume on an
    // escalated run.
    if let Node::Escalated { stage } = node
        && event == Event::HumanResumed
    {
        return Ok(Node::entering(stage));
    }
    let Node::AtStage { stage, phase } = node else {
        return Err(TransitionError::NoTransition { node, event });
    };

    let row = TABLE
        .iter()
        .find(|(p, e, _, _)| *p == phase && *e == event)
        .ok_or(TransitionError::NoTransition { node, event })?;

    let (_, _, guard, target) = row;
    if !guard_holds(*guard) {
        return Err(TransitionError::GuardRejected {
            node,
            event,
            guard: *guard,
        });
    }

    Ok(match target {
        Target::Phase(next_phase) => Node::AtStage {
            stage,
            phase: *next_phase,
        },
        Target::NextStage => match stage.next() {
            Some(next) => Node::entering(next),
            None => Node::Completed,
        },
        Target::Escalate => Node::Escalated { stage },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_true(_: Guard) -> bool {
        true
    }

    #[test]
    fn happy_path_walks_every_stage_to_completed() {
        let mut node = Node::start();
        for expected_stage in Stage::sequence() {
            assert_eq!(
                node,
                Node::AtStage {
                    stage: expected_stage,
                    phase: Phase::Entering
                }
            );
            node = apply(node, Event::Enter, &all_true).unwrap();
            node = apply(node, Event::AgentSucceeded, &all_true).unwrap();
            node = apply(node, Event::QaPass, &all_true).unwrap();
        }
        assert_eq!(node, Node::Completed);
    }

    #[test]
    fn entering_guard_blocks_without_prerequisites() {
        let node = Node::start();
        let err = apply(node, Event::Enter, &|g| g != Guard::PrerequisitesExist);
        assert_eq!(
            err,
            Err(TransitionError::GuardRejected {
                node,
                event: Event::Enter,
                guard: Guard::PrerequisitesExist,
            })
        );
    }

    #[test]
    fn rework_below_max_returns_to_executing() {
        let node = Node::AtStage {
            stage: Stage::Content,
            phase: Phase::QAing,
        };
        let next = apply(node, Event::QaReworkBelowMax, &all_true).unwrap();
        assert_eq!(
            next,
            Node::AtStage {
                stage: Stage::Content,
                phase: Phase::Executing
            }
        );
    }

    #[test]
    fn rework_at_max_reaches_the_decision_node() {
        let node = Node::AtStage {
            stage: Stage::Content,
            phase: Phase::QAing,
        };
        let decision = apply(node, Event::QaReworkAtMax, &all_true).unwrap();
        assert_eq!(
            decision,
            Node::AtStage {
                stage: Stage::Content,
                phase: Phase::ReworkDecision
            }
        );
        let accepted = apply(decision, Event::BestOfThreeAccepted, &all_true).unwrap();
        assert_eq!(accepted, Node::entering(Stage::LayoutDetective));
        let rejected = apply(decision, Event::BestOfThreeRejected, &all_true).unwrap();
        assert_eq!(rejected, Node::Escalated { stage: Stage::Content });
    }

    #[test]
    fn recovery_exhaustion_escalates_from_executing() {
        let node = Node::AtStage {
            stage: Stage::Research,
            phase: Phase::Executing,
        };
        let next = apply(node, Event::RecoveryExhausted, &all_true).unwrap();
        assert_eq!(next, Node::Escalated { stage: Stage::Research });
    }

    #[test]
    fn human_resume_re_enters_the_escalated_stage() {
        let node = Node::Escalated {
            stage: Stage::Research,
        };
        let next = apply(node, Event::HumanResumed, &all_true).unwrap();
        assert_eq!(next, Node::entering(Stage::Research));
        // Nothing else moves an escalated run.
        assert!(apply(node, Event::QaPass, &all_true).is_err());
    }

    #[test]
    fn terminal_nodes_accept_no_events() {
        for node in [Node::Completed, Node::Failed] {
            for event in [Event::Enter, Event::QaPass, Event::HumanResumed] {
                assert!(apply(node, event, &all_true).is_err());
            }
        }
    }

    #[test]
    fn transition_is_deterministic() {
        let node = Node::AtStage {
            stage: Stage::Assembly,
            phase: Phase::QAing,
        };
        let a = apply(node, Event::QaPass, &all_true).unwrap();
        let b = apply(node, Event::QaPass, &all_true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn no_row_permits_skipping_a_stage() {
        // From any stage's QAing, QaPass lands exactly one stage ahead.
        for stage in Stage::sequence() {
            let node = Node::AtStage {
                stage,
                phase: Phase::QAing,
            };
            let next = apply(node, Event::QaPass, &all_true).unwrap();
            match next {
                Node::AtStage { stage: next_stage, phase } => {
                    assert_eq!(next_stage.index(), stage.index() + 1);
                    assert_eq!(phase, Phase::Entering);
                }
                Node::Completed => assert_eq!(stage, Stage::Delivery),
                other => panic!("unexpected node {other:?}"),
            }
        }
    }
}
