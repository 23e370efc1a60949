//! The stage runner and pipeline driver.
//!
//! The driver walks the state machine across the stage sequence; the runner
//! executes one stage end-to-end: assemble the agent request, run or resume
//! the session, parse typed outputs, pass the quality gate, fire hooks, and
//! commit state. Errors are caught exactly once per stage boundary, the
//! recovery chain is consulted, and either a retry is committed (new
//! attempt counter) or the run escalates: never both.
//!
//! Two stages are mechanical rather than agent-driven: assembly (two-pass
//! media build) and delivery (messenger or object-store hand-off). The
//! encode itself happens between the planning and assembly stages, inside
//! the `execute_encoding_plan` hook.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::Instrument;

use crate::artifact::{
    AssemblyReport, ContentPlan, CutawayManifest, DeliveryReceipt, QualityChecks, StageArtifact,
    TARGET_HEIGHT, TARGET_WIDTH, content_hash,
};
use crate::caps::{AgentBackend, AgentRequest, Capabilities, SegmentFile};
use crate::config::Config;
use crate::error::{CapError, ErrorClass, PipelineError};
use crate::events::{CheckpointTracker, EventBus, JournalWriter, UserNotifier};
use crate::hooks::{HookContext, HookPhase, HookScheduler, pending_hook_names};
use crate::machine::{self, Event, Guard, Node, Phase};
use crate::recovery::{RecoveryChain, RecoveryState};
use crate::reflection::{Reflected, ReflectionLoop, Verdict};
use crate::stage::{PUBLISHING_ASSETS, Stage};
use crate::state::{Cursor, RunState, StateStore, Terminal};
use crate::types::{
    EscalationState, EventKind, QueueItem, RecoveryAction, RunRequest, StageOutcome,
};
use crate::workspace::Workspace;

/// Drives complete runs. One driver serves the whole daemon; per-run state
/// lives on the stack of [`PipelineDriver::execute_run`].
pub struct PipelineDriver {
    caps: Capabilities,
    config: Config,
    scheduler: HookScheduler,
    notify_tx: tokio::sync::mpsc::UnboundedSender<String>,
    cancel: Arc<AtomicBool>,
    /// Stop after this many stages have completed (CLI `--stages`).
    stage_limit: Option<usize>,
    /// Override every stage's timeout (CLI `--timeout`).
    timeout_override: Option<std::time::Duration>,
}

impl PipelineDriver {
    #[must_use]
    pub fn new(
        caps: Capabilities,
        config: Config,
        scheduler: HookScheduler,
        notify_tx: tokio::sync::mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            caps,
            config,
            scheduler,
            notify_tx,
            cancel: Arc::new(AtomicBool::new(false)),
            stage_limit: None,
            timeout_override: None,
        }
    }

    /// Stop the pipeline once this many stages have completed.
    #[must_use]
    pub fn with_stage_limit(mut self, limit: Option<usize>) -> Self {
        self.stage_limit = limit;
        self
    }

    /// Replace every stage's timeout.
    #[must_use]
    pub fn with_timeout_override(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.timeout_override = timeout;
        self
    }

    /// Cooperative cancellation flag; applied at the next stage boundary.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Execute a claimed queue item in a fresh workspace.
    pub async fn execute_item(
        &self,
        item: &QueueItem,
        workspace: Workspace,
    ) -> Result<Terminal, PipelineError> {
        let now = self.caps.clock.now();
        let state = RunState::new(workspace.run_id().clone(), now);
        let store = StateStore::new(workspace.root());
        store.save_atomic(&state)?;
        self.record_command_history(&workspace, item)?;
        self.run_pipeline(&workspace, &store, state, &item.payload, Node::start())
            .await
    }

    /// Resume an interrupted run from its persisted state, optionally
    /// skipping forward to `start_stage` after validating every prior
    /// stage's artifacts.
    pub async fn resume_run(
        &self,
        workspace: Workspace,
        request: &RunRequest,
        start_stage: Option<Stage>,
    ) -> Result<Terminal, PipelineError> {
        let store = StateStore::new(workspace.root());
        let mut state = store.load()?;

        let stage = match (start_stage, state.current_stage) {
            (Some(requested), _) => {
                validate_resume(&workspace, requested)?;
                state.current_stage = Cursor::Stage(requested);
                state.completed_stages =
                    Stage::sequence()[..requested.index()].to_vec();
                state.attempt = 0;
                state.updated_at = self.caps.clock.now();
                store.save_atomic(&state)?;
                requested
            }
            (None, Cursor::Stage(stage)) => {
                validate_resume(&workspace, stage)?;
                // Crash window: a stage may have committed its artifacts but
                // died before the state commit. Fast-forward past any stage
                // whose declared outputs already exist and validate, so
                // resuming never re-produces artifacts a later state already
                // owns.
                let mut stage = stage;
                loop {
                    let complete = stage
                        .descriptor()
                        .outputs
                        .iter()
                        .all(|name| workspace.read_artifact(name).is_ok());
                    if !complete {
                        break;
                    }
                    tracing::info!(%stage, "outputs already present; fast-forwarding");
                    state.advance(self.caps.clock.now())?;
                    store.save_atomic(&state)?;
                    match state.current_stage {
                        Cursor::Stage(next) => stage = next,
                        Cursor::Sentinel(terminal) => return Ok(terminal),
                    }
                }
                stage
            }
            (None, Cursor::Sentinel(terminal)) => return Ok(terminal),
        };

        self.run_pipeline(&workspace, &store, state, request, Node::entering(stage))
            .await
    }

    fn record_command_history(
        &self,
        workspace: &Workspace,
        item: &QueueItem,
    ) -> Result<(), PipelineError> {
        let entry = serde_json::json!({
            "item_id": item.item_id,
            "enqueued_at": item.enqueued_at,
            "url": item.payload.url,
            "message": item.payload.message,
            "options": item.payload.options,
        });
        crate::atomic_write::write_json_atomic(&workspace.command_history_file(), &vec![entry])
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
        Ok(())
    }

    /// The main loop: offer machine events, run stages, commit state after
    /// every accepted transition.
    async fn run_pipeline(
        &self,
        workspace: &Workspace,
        store: &StateStore,
        mut state: RunState,
        request: &RunRequest,
        start_node: Node,
    ) -> Result<Terminal, PipelineError> {
        let last_event_id = Arc::new(AtomicU64::new(state.last_event_id));
        let mut bus = EventBus::new(state.run_id.clone(), state.last_event_id + 1);
        bus.subscribe(Box::new(JournalWriter::new(workspace.journal_file())));
        bus.subscribe(Box::new(CheckpointTracker::new(last_event_id.clone())));
        bus.subscribe(Box::new(UserNotifier::new(self.notify_tx.clone())));

        let mut node = start_node;
        let registry = self.scheduler.registry();
        let mut runner = StageRunner {
            driver: self,
            workspace,
            store,
            request,
            bus: &mut bus,
            last_event_id,
            registry,
        };

        while let Node::AtStage { stage, phase } = node {
            debug_assert_eq!(phase, Phase::Entering);
            if runner.driver.cancel.load(Ordering::SeqCst) {
                state.current_stage = Cursor::Sentinel(Terminal::Failed);
                state.updated_at = runner.driver.caps.clock.now();
                store.save_atomic(&state)?;
                store.append_log(&state, "run cancelled at stage boundary")?;
                runner.driver.scheduler.registry().cancel_run(&state.run_id);
                return Ok(Terminal::Failed);
            }

            let span = crate::logging::stage_span(&state.run_id, stage, state.attempt);
            let outcome = runner.execute_stage(stage, &mut state).instrument(span).await;

            node = match outcome {
                Ok(StageOutcome::Advanced | StageOutcome::Reworked { .. }) => {
                    machine::apply(
                        Node::AtStage { stage, phase: Phase::QAing },
                        Event::QaPass,
                        &|_| true,
                    )
                    .map_err(|e| PipelineError::validation("machine", e.to_string()))?
                }
                Ok(StageOutcome::BestOfThreeAccepted) => {
                    let decision = machine::apply(
                        Node::AtStage { stage, phase: Phase::QAing },
                        Event::QaReworkAtMax,
                        &|_| true,
                    )
                    .map_err(|e| PipelineError::validation("machine", e.to_string()))?;
                    machine::apply(decision, Event::BestOfThreeAccepted, &|_| true)
                        .map_err(|e| PipelineError::validation("machine", e.to_string()))?
                }
                Ok(StageOutcome::Escalated) => Node::Escalated { stage },
                Ok(StageOutcome::Errored { class, reason }) => {
                    state.current_stage = Cursor::Sentinel(Terminal::Failed);
                    state.updated_at = runner.driver.caps.clock.now();
                    store.save_atomic(&state)?;
                    store.append_log(&state, &format!("fatal {class:?}: {reason}"))?;
                    runner.driver.scheduler.registry().cancel_run(&state.run_id);
                    runner
                        .driver
                        .caps
                        .messenger
                        .notify(&format!(
                            "pipeline halted - inspect workspace at {}",
                            workspace.root()
                        ))
                        .await
                        .ok();
                    return Ok(Terminal::Failed);
                }
                Err(e) => {
                    // No orphaned background tasks, even on hard errors.
                    runner.driver.scheduler.registry().cancel_run(&state.run_id);
                    return Err(e);
                }
            };

            if let Node::AtStage { .. } = node {
                state.advance(runner.driver.caps.clock.now())?;
                state.last_event_id = runner.last_event_id.load(Ordering::SeqCst);
                state.pending_hooks =
                    pending_hook_names(&runner.driver.scheduler.registry(), &state.run_id);
                store.save_atomic(&state)?;

                if let Some(limit) = self.stage_limit
                    && state.completed_stages.len() >= limit
                {
                    store.append_log(&state, &format!("stopping after {limit} stages as requested"))?;
                    state.current_stage = Cursor::Sentinel(Terminal::Done);
                    state.updated_at = self.caps.clock.now();
                    store.save_atomic(&state)?;
                    return Ok(Terminal::Done);
                }
            }
        }

        let terminal = match node {
            Node::Completed => {
                state.advance(self.caps.clock.now())?;
                Terminal::Done
            }
            Node::Escalated { .. } => Terminal::Escalated,
            Node::Failed => Terminal::Failed,
            Node::AtStage { .. } => unreachable!("loop exits only on terminals"),
        };

        state.current_stage = Cursor::Sentinel(terminal);
        state.last_event_id = runner.last_event_id.load(Ordering::SeqCst);
        state.updated_at = self.caps.clock.now();
        store.save_atomic(&state)?;

        if terminal != Terminal::Done {
            self.scheduler.registry().cancel_run(&state.run_id);
        }
        Ok(terminal)
    }
}

/// Adjustments a recovery decision applies to the next attempt.
#[derive(Debug, Clone, Default)]
struct Tweaks {
    extra_instructions: Option<String>,
    swap_backend: bool,
    downgrade_model: bool,
}

/// Per-run execution context for single stages.
struct StageRunner<'a> {
    driver: &'a PipelineDriver,
    workspace: &'a Workspace,
    store: &'a StateStore,
    request: &'a RunRequest,
    bus: &'a mut EventBus,
    last_event_id: Arc<AtomicU64>,
    registry: Arc<crate::hooks::TaskRegistry>,
}

impl StageRunner<'_> {
    fn hook_ctx<'b>(&'b self, run_id: &'b crate::types::RunId) -> HookContext<'b> {
        HookContext {
            run_id,
            request: self.request,
            workspace: self.workspace,
            caps: &self.driver.caps,
            config: &self.driver.config,
            registry: self.registry.as_ref(),
        }
    }

    /// Execute one stage end-to-end, catching errors once at this boundary.
    ///
    /// The whole sequence (pre-hooks, entry guard, body, post-hooks) is the
    /// unit of retry: hooks are idempotent, so a recovery decision re-runs
    /// the sequence with its tweaks applied. Either a retry is committed
    /// (new attempt counter) or the run escalates, never both.
    async fn execute_stage(
        &mut self,
        stage: Stage,
        state: &mut RunState,
    ) -> Result<StageOutcome, PipelineError> {
        state.attempt = state.attempt.max(1);
        self.store.save_atomic(state)?;
        self.publish(Some(stage), EventKind::StageEntered, serde_json::Value::Null);
        self.store
            .append_log(state, &format!("{stage} entered (attempt {})", state.attempt))?;

        let chain = RecoveryChain::new(self.driver.config.recovery.clone());
        let mut recovery = RecoveryState::new();
        let mut tweaks = Tweaks::default();
        let mut human_retry_used = false;

        loop {
            let error = match self.run_stage_sequence(stage, state, tweaks.clone()).await {
                Ok(outcome) => {
                    if !recovery.attempted.is_empty() {
                        self.publish(
                            Some(stage),
                            EventKind::ErrorRecovered,
                            serde_json::json!({"recoveries": recovery.attempted}),
                        );
                    }
                    if matches!(
                        outcome,
                        StageOutcome::Advanced
                            | StageOutcome::Reworked { .. }
                            | StageOutcome::BestOfThreeAccepted
                    ) {
                        self.publish(
                            Some(stage),
                            EventKind::StageCompleted,
                            serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null),
                        );
                        self.store.append_log(state, &format!("{stage} completed"))?;
                    }
                    return Ok(outcome);
                }
                Err(e) => e,
            };

            let class = error.class();
            if class == ErrorClass::Validation {
                return Ok(StageOutcome::Errored {
                    class,
                    reason: error.to_string(),
                });
            }

            let decision = chain.decide(class, state.attempt, &mut recovery);
            self.store.append_log(state, &decision.note)?;
            if decision.escalated {
                let answer = self.escalate(stage, state, &error, &recovery).await?;
                // One human-granted re-entry per stage execution; anything
                // else leaves the run escalated for an explicit resume.
                if answer.as_deref() == Some("retry") && !human_retry_used {
                    human_retry_used = true;
                    recovery = RecoveryState::new();
                    tweaks = Tweaks::default();
                    state.escalation_state = EscalationState::Resolved {
                        answer: "retry".to_string(),
                    };
                    self.store.save_atomic(state)?;
                    self.store.append_log(state, "human requested a retry; re-entering stage")?;
                    continue;
                }
                return Ok(StageOutcome::Escalated);
            }

            state.attempt = decision.next_attempt.unwrap_or(state.attempt + 1);
            state.updated_at = self.driver.caps.clock.now();
            self.store.save_atomic(state)?;

            // Apply the decided action's side effects before re-running.
            match decision.action {
                RecoveryAction::Retry => {}
                RecoveryAction::ForkSession => {
                    if let Err(e) = self.fork_session(stage).await {
                        // Fork itself failed; feed that to the next rung.
                        self.store.append_log(state, &format!("fork failed: {e}"))?;
                        continue;
                    }
                }
                RecoveryAction::FreshSession => {
                    self.store.clear_session(stage)?;
                    tweaks.extra_instructions = Some(self.progress_summary(state));
                }
                RecoveryAction::SwapBackend => tweaks.swap_backend = true,
                RecoveryAction::DowngradeModel => tweaks.downgrade_model = true,
                RecoveryAction::Escalate => unreachable!("handled above"),
            }
        }
    }

    /// One pass through the stage: pre-hooks, entry guard, body, post-hooks.
    async fn run_stage_sequence(
        &mut self,
        stage: Stage,
        state: &mut RunState,
        tweaks: Tweaks,
    ) -> Result<StageOutcome, PipelineError> {
        // Pre-stage hooks run before the guard: they provide inputs the
        // guard checks (source media, the cutaway manifest).
        let ctx_run_id = state.run_id.clone();
        let fired = {
            let ctx = self.hook_ctx(&ctx_run_id);
            self.driver
                .scheduler
                .run_phase(stage, HookPhase::PreStage, &ctx)
                .await?
        };
        for name in fired {
            let kind = if name == "await_async_asset_gen" {
                EventKind::HookAwaited
            } else {
                EventKind::HookFired
            };
            self.publish(Some(stage), kind, serde_json::json!({"hook": name}));
        }

        // Entry guard: declared inputs exist and validate.
        let entered = machine::apply(Node::entering(stage), Event::Enter, &|guard| match guard {
            Guard::PrerequisitesExist => self.workspace.validate_stage_inputs(stage).is_ok(),
            _ => true,
        });
        if entered.is_err() {
            return Ok(StageOutcome::Errored {
                class: ErrorClass::Validation,
                reason: format!("prerequisite artifacts for {stage} missing or invalid"),
            });
        }

        let outcome = match stage {
            Stage::Assembly => self.run_assembly().await?,
            Stage::Delivery => self.run_delivery().await?,
            _ => self.run_agent_stage_with(stage, state, tweaks).await?,
        };

        if matches!(
            outcome,
            StageOutcome::Advanced | StageOutcome::Reworked { .. } | StageOutcome::BestOfThreeAccepted
        ) {
            let fired = {
                let ctx = self.hook_ctx(&ctx_run_id);
                self.driver
                    .scheduler
                    .run_phase(stage, HookPhase::PostStage, &ctx)
                    .await?
            };
            for name in fired {
                self.publish(Some(stage), EventKind::HookFired, serde_json::json!({"hook": name}));
            }
        }
        Ok(outcome)
    }

    async fn fork_session(&self, stage: Stage) -> Result<(), PipelineError> {
        let sessions = self.store.load_sessions()?;
        let Some(session) = sessions.get(stage.as_str()) else {
            return Err(CapError::tool(
                "agent",
                crate::error::ToolKind::CapabilityUnavailable,
                "no session to fork",
            )
            .into());
        };
        let forked = self.driver.caps.agent.fork(session).await?;
        self.store.save_session(stage, &forked)?;
        Ok(())
    }

    fn progress_summary(&self, state: &RunState) -> String {
        let done: Vec<&str> = state.completed_stages.iter().map(|s| s.as_str()).collect();
        format!(
            "Prior progress: stages [{}] are complete; their artifacts are provided as inputs.",
            done.join(", ")
        )
    }

    /// Escalate: structured notification, then the elicitation ask. Returns
    /// the human's answer when one arrives; the caller decides whether it
    /// grants a re-entry.
    async fn escalate(
        &mut self,
        stage: Stage,
        state: &mut RunState,
        error: &PipelineError,
        recovery: &RecoveryState,
    ) -> Result<Option<String>, PipelineError> {
        let question = format!(
            "Stage {stage} failed: {error}. Tried: {}. Reply 'retry' to re-run the stage or 'abandon' to stop.",
            recovery.attempted_summary()
        );

        self.driver.caps.messenger.notify(&question).await.ok();
        self.publish(
            Some(stage),
            EventKind::Escalated,
            serde_json::json!({"error": error.to_string(), "attempted": recovery.attempted}),
        );

        state.escalation_state = EscalationState::AwaitingHuman {
            stage,
            question: question.clone(),
        };
        state.updated_at = self.driver.caps.clock.now();
        self.store.save_atomic(state)?;

        let answer = self.driver.caps.messenger.ask(&question).await.ok();
        crate::atomic_write::write_json_atomic(
            &self.workspace.elicitation_file(),
            &serde_json::json!({
                "stage": stage,
                "question": question,
                "options": ["retry", "abandon"],
                "attempted": recovery.attempted,
                "answer": answer,
            }),
        )
        .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;

        Ok(answer.map(|a| a.trim().to_lowercase()))
    }

    /// Execute an agent-driven stage: request assembly, session management,
    /// typed output parsing, and the reflection gate.
    async fn run_agent_stage_with(
        &mut self,
        stage: Stage,
        state: &mut RunState,
        tweaks: Tweaks,
    ) -> Result<StageOutcome, PipelineError> {
        let backend: &Arc<dyn AgentBackend> = if tweaks.swap_backend {
            &self.driver.caps.fallback_agent
        } else {
            &self.driver.caps.agent
        };

        let mut request = self.build_request(stage, state, tweaks.extra_instructions)?;
        if tweaks.downgrade_model {
            request.model = self.driver.config.agent.downgrade_model.clone();
        }
        let result = self.invoke(backend, stage, &request).await?;
        self.store.save_session(stage, &result.session)?;

        let expected = self.expected_outputs(stage);
        let artifacts = self.parse_and_persist(&expected, &result.artifacts)?;
        let primary = artifacts
            .first()
            .map(StageArtifact::body_json)
            .unwrap_or(serde_json::Value::Null);

        let Some(criterion) = stage.descriptor().qa_criterion else {
            return Ok(StageOutcome::Advanced);
        };
        let requirements = self.requirements_text(stage, criterion);

        // The regeneration closure resumes the same session with the
        // critic's prescriptive fixes and re-persists the outputs.
        let backend_for_regen = backend.clone();
        let session = result.session.clone();
        let base_request = request.clone();
        let workspace = self.workspace.clone();
        let expected_for_regen = expected.clone();

        let gate = ReflectionLoop::new(
            self.driver.caps.dispatcher.as_ref(),
            &self.driver.config.reflection,
        );
        let reflected = gate
            .run(primary, &requirements, move |fixes, _history| {
                let backend = backend_for_regen.clone();
                let session = session.clone();
                let mut request = base_request.clone();
                let workspace = workspace.clone();
                let expected = expected_for_regen.clone();
                async move {
                    request.instructions = format!(
                        "{}\n\nApply these fixes:\n- {}",
                        request.instructions,
                        fixes.join("\n- ")
                    );
                    let result = backend.resume(&session, &request).await?;
                    let mut primary = serde_json::Value::Null;
                    for (i, name) in expected.iter().enumerate() {
                        let raw = result.artifacts.get(name).ok_or_else(|| {
                            CapError::parse("agent", format!("missing declared output: {name}"))
                        })?;
                        let artifact = StageArtifact::parse_named(name, raw)?;
                        workspace.write_artifact(&artifact)?;
                        if i == 0 {
                            primary = artifact.body_json();
                        }
                    }
                    Ok(primary)
                }
            })
            .await?;

        self.publish_reflection_events(stage, &reflected);
        match reflected.verdict {
            Verdict::Passed { .. } => {
                if reflected.attempts == 1 {
                    Ok(StageOutcome::Advanced)
                } else {
                    Ok(StageOutcome::Reworked {
                        attempts: reflected.attempts,
                    })
                }
            }
            Verdict::BestOfThree { artifact, .. } => {
                // Re-persist the winning attempt; later reworks may have
                // overwritten it.
                if let Some(name) = expected.first() {
                    let winner = StageArtifact::parse_named(name, &artifact)?;
                    self.workspace.write_artifact(&winner)?;
                }
                Ok(StageOutcome::BestOfThreeAccepted)
            }
            Verdict::Failed { reason } => Err(PipelineError::Content {
                stage: stage.as_str().to_string(),
                reason,
            }),
        }
    }

    fn publish_reflection_events(&mut self, stage: Stage, reflected: &Reflected) {
        for entry in &reflected.history {
            if entry.critique.decision != crate::types::CritiqueDecision::Pass {
                self.publish(
                    Some(stage),
                    EventKind::QaRework,
                    serde_json::json!({"score": entry.critique.score}),
                );
            }
        }
        match &reflected.verdict {
            Verdict::Passed { critique, .. } => {
                self.publish(
                    Some(stage),
                    EventKind::QaPassed,
                    serde_json::json!({"score": critique.score, "attempts": reflected.attempts}),
                );
            }
            Verdict::BestOfThree { critique, .. } => {
                self.publish(
                    Some(stage),
                    EventKind::QaBestOfThree,
                    serde_json::json!({"score": critique.score, "attempts": reflected.attempts}),
                );
            }
            Verdict::Failed { .. } => {}
        }
    }

    /// Assemble the agent request: prior artifacts narrowed to the declared
    /// inputs, the user intent, and the stage timeout.
    fn build_request(
        &self,
        stage: Stage,
        state: &RunState,
        extra_instructions: Option<String>,
    ) -> Result<AgentRequest, PipelineError> {
        let mut inputs = BTreeMap::new();
        for name in stage.descriptor().inputs {
            let artifact = self.workspace.read_artifact(name)?;
            inputs.insert((*name).to_string(), artifact.body_json());
        }

        let mut instructions = self.request.message.clone();
        if let Some(extra) = &self.request.options.instructions {
            instructions.push_str("\n\nCreative directives: ");
            instructions.push_str(extra);
        }
        if let Some(lang) = &self.request.options.publishing_language {
            instructions.push_str(&format!("\n\nProduce publishing assets in {lang}."));
        }
        if let Some(extra) = extra_instructions {
            instructions.push_str("\n\n");
            instructions.push_str(&extra);
        }

        Ok(AgentRequest {
            run_id: state.run_id.clone(),
            stage,
            inputs,
            instructions,
            expected_outputs: self.expected_outputs(stage),
            model: self.driver.config.agent.primary_model.clone(),
            timeout: self
                .driver
                .timeout_override
                .unwrap_or(stage.descriptor().timeout),
        })
    }

    /// Declared outputs plus the conditional publishing-assets artifact.
    fn expected_outputs(&self, stage: Stage) -> Vec<String> {
        let mut outputs: Vec<String> = stage
            .descriptor()
            .outputs
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        if stage == Stage::Content && self.request.options.publishing_language.is_some() {
            outputs.push(PUBLISHING_ASSETS.to_string());
        }
        outputs
    }

    fn requirements_text(&self, stage: Stage, criterion: &str) -> String {
        let mut text = format!("criterion: {criterion}; stage: {stage}");
        if stage == Stage::Content {
            match &self.request.options.publishing_language {
                Some(lang) => text.push_str(&format!(
                    "; publishing assets in {lang} are required and their absence is a blocker"
                )),
                None => text.push_str("; publishing assets must NOT be produced"),
            }
        }
        text
    }

    /// Run or resume the session for this stage, translating timeout into a
    /// transient error.
    async fn invoke(
        &self,
        backend: &Arc<dyn AgentBackend>,
        stage: Stage,
        request: &AgentRequest,
    ) -> Result<crate::caps::AgentResult, PipelineError> {
        let sessions = self.store.load_sessions()?;
        let existing = sessions.get(stage.as_str()).cloned();
        let invocation = async {
            match &existing {
                Some(session) => backend.resume(session, request).await,
                None => backend.run(request).await,
            }
        };
        match tokio::time::timeout(request.timeout, invocation).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CapError::transient(
                "agent",
                format!("stage {stage} timed out after {:?}", request.timeout),
            )
            .into()),
        }
    }

    /// Parse every declared output against its schema and persist it.
    /// The unrequested publishing artifact is dropped rather than stored.
    fn parse_and_persist(
        &self,
        expected: &[String],
        raw: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Vec<StageArtifact>, PipelineError> {
        let mut artifacts = Vec::with_capacity(expected.len());
        for name in expected {
            let value = raw.get(name).ok_or_else(|| {
                CapError::parse("agent", format!("missing declared output: {name}"))
            })?;
            let artifact = StageArtifact::parse_named(name, value)?;
            self.workspace.write_artifact(&artifact)?;
            artifacts.push(artifact);
        }
        Ok(artifacts)
    }

    /// Stage 7: two-pass assembly. Pass one concatenates the encoded
    /// segments into the base reel; pass two applies the cutaway overlay.
    /// A pass-two failure accepts the base reel and records the downgrade.
    async fn run_assembly(&mut self) -> Result<StageOutcome, PipelineError> {
        let StageArtifact::EncodingPlan(plan) =
            self.workspace.read_artifact("encoding-plan.json")?
        else {
            return Err(CapError::parse("media", "encoding plan has wrong shape").into());
        };

        let segments: Vec<SegmentFile> = plan
            .segments
            .iter()
            .map(|s| SegmentFile {
                index: s.index,
                path: self.workspace.segment_file(s.index),
                duration_seconds: (s.end - s.start).max(0.0),
            })
            .collect();
        for segment in &segments {
            if !segment.path.exists() {
                return Err(CapError::transient(
                    "media",
                    format!("segment file missing: {}", segment.path),
                )
                .into());
            }
        }

        let base = self.workspace.previews_dir().join("base-reel.mp4");
        let final_path = self.workspace.final_reel_file();
        let base_info = self
            .driver
            .caps
            .media
            .assemble(&segments, &plan.style_transitions, &base)
            .await?;

        let manifest: CutawayManifest = self
            .workspace
            .read_cutaway_manifest()
            .unwrap_or_default();

        let (info, overlays_applied, degradation_note) = if manifest.clips.is_empty() {
            std::fs::copy(base.as_std_path(), final_path.as_std_path())
                .map_err(PipelineError::Io)?;
            (base_info, false, None)
        } else {
            match self
                .driver
                .caps
                .media
                .overlay(&base, &manifest, &final_path)
                .await
            {
                Ok(info) => (info, true, None),
                Err(e) => {
                    // Accept the base reel; no partial overlays.
                    std::fs::copy(base.as_std_path(), final_path.as_std_path())
                        .map_err(PipelineError::Io)?;
                    (
                        base_info,
                        false,
                        Some(format!("overlay pass failed, base reel accepted: {e}")),
                    )
                }
            }
        };

        let target_duration = self
            .request
            .options
            .target_duration
            .map(f64::from)
            .unwrap_or_else(|| segments.iter().map(|s| s.duration_seconds).sum());
        let tolerance = target_duration * 0.1;
        let bytes = std::fs::read(final_path.as_std_path()).map_err(PipelineError::Io)?;

        let report = AssemblyReport {
            quality_checks: QualityChecks {
                duration_within_tolerance: (info.duration_seconds - target_duration).abs()
                    <= tolerance.max(1.0),
                width: info.width,
                height: info.height,
            },
            overlays_applied,
            degradation_note,
            final_media: final_path.to_string(),
            final_media_blake3: content_hash(&bytes),
            duration_seconds: info.duration_seconds,
        };
        if info.width != TARGET_WIDTH || info.height != TARGET_HEIGHT {
            return Err(CapError::parse(
                "media",
                format!("assembled reel is {}x{}, not {TARGET_WIDTH}x{TARGET_HEIGHT}", info.width, info.height),
            )
            .into());
        }
        self.workspace
            .write_artifact(&StageArtifact::AssemblyReport(report.clone()))?;

        // The report still faces the quality gate like any artifact.
        let Some(criterion) = Stage::Assembly.descriptor().qa_criterion else {
            return Ok(StageOutcome::Advanced);
        };
        let gate = ReflectionLoop::new(
            self.driver.caps.dispatcher.as_ref(),
            &self.driver.config.reflection,
        );
        let requirements = self.requirements_text(Stage::Assembly, criterion);
        let report_json = serde_json::to_value(&report)
            .map_err(|e| CapError::parse("media", e.to_string()))?;
        // Assembly is mechanical: rework regenerates nothing, it re-submits
        // the same report, so only pass or best-of-three can accept it.
        let reflected = gate
            .run(report_json.clone(), &requirements, move |_fixes, _history| {
                let report = report_json.clone();
                async move { Ok(report) }
            })
            .await?;
        self.publish_reflection_events(Stage::Assembly, &reflected);
        match reflected.verdict {
            Verdict::Passed { .. } if reflected.attempts == 1 => Ok(StageOutcome::Advanced),
            Verdict::Passed { .. } => Ok(StageOutcome::Reworked {
                attempts: reflected.attempts,
            }),
            Verdict::BestOfThree { .. } => Ok(StageOutcome::BestOfThreeAccepted),
            Verdict::Failed { reason } => Err(PipelineError::Content {
                stage: Stage::Assembly.as_str().to_string(),
                reason,
            }),
        }
    }

    /// Stage 8: deliver the reel inline or through the object store, plus
    /// the textual assets.
    async fn run_delivery(&mut self) -> Result<StageOutcome, PipelineError> {
        let StageArtifact::AssemblyReport(report) =
            self.workspace.read_artifact("assembly-report.json")?
        else {
            return Err(CapError::parse("media", "assembly report has wrong shape").into());
        };

        let caption = match self.workspace.read_artifact("content-output.json") {
            Ok(StageArtifact::ContentPlan(ContentPlan { hook_text, .. })) => hook_text,
            _ => self.request.message.clone(),
        };

        let final_path = self.workspace.final_reel_file();
        let size_bytes = std::fs::metadata(final_path.as_std_path())
            .map_err(PipelineError::Io)?
            .len();

        let receipt = if size_bytes > self.driver.config.delivery.inline_limit_bytes {
            let upload = self.driver.caps.store.upload(&final_path, "reels").await?;
            self.driver
                .caps
                .messenger
                .notify(&format!("{caption}\n{}", upload.url))
                .await?;
            DeliveryReceipt {
                delivered_via: "object_store".to_string(),
                url: Some(upload.url),
                size_bytes: upload.size_bytes,
                caption,
            }
        } else {
            self.driver
                .caps
                .messenger
                .send_file(&final_path, &caption)
                .await?;
            DeliveryReceipt {
                delivered_via: "inline".to_string(),
                url: None,
                size_bytes,
                caption,
            }
        };

        self.workspace
            .write_artifact(&StageArtifact::DeliveryReceipt(receipt))?;
        self.publish(
            Some(Stage::Delivery),
            EventKind::Delivered,
            serde_json::json!({"duration": report.duration_seconds, "size_bytes": size_bytes}),
        );
        Ok(StageOutcome::Advanced)
    }

    fn publish(&mut self, stage: Option<Stage>, kind: EventKind, payload: serde_json::Value) {
        let at = self.driver.caps.clock.now();
        self.bus.publish(stage, kind, payload, at);
    }
}

/// Validate that every stage before `start` has produced its declared
/// outputs and that they still parse. Required before any forward jump.
pub fn validate_resume(workspace: &Workspace, start: Stage) -> Result<(), PipelineError> {
    for stage in Stage::sequence().iter().take(start.index()) {
        for output in stage.descriptor().outputs {
            if !workspace.has_artifact(output) {
                return Err(PipelineError::validation(
                    format!("{}/{output}", workspace.root()),
                    format!("cannot skip to {start}: {stage} output missing"),
                ));
            }
            workspace.read_artifact(output)?;
        }
    }
    Ok(())
}
