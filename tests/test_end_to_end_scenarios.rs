//! End-to-end pipeline scenarios over scriptable stub capabilities.

mod test_support;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use reelsmith::artifact::StageArtifact;
use reelsmith::error::{CapError, ToolKind};
use reelsmith::stage::Stage;
use reelsmith::state::{StateStore, Terminal};
use reelsmith::types::{EventKind, PipelineEvent, RunId, RunOptions};
use reelsmith::workspace::Workspace;

use test_support::{Harness, StubCritic};

fn runs_root(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

fn read_journal(workspace: &Workspace) -> Vec<PipelineEvent> {
    let content = std::fs::read_to_string(workspace.journal_file().as_std_path()).unwrap();
    content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

async fn fresh_workspace(harness: &Harness) -> Workspace {
    let run_id = RunId::mint(harness.caps.clock.now());
    Workspace::create(&harness.config.paths.runs_root, run_id).unwrap()
}

#[tokio::test]
async fn s1_cold_happy_path_completes_all_stages() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(&runs_root(&dir));
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();

    let terminal = harness
        .driver()
        .execute_item(&harness.item("req-s1"), workspace)
        .await
        .unwrap();
    assert_eq!(terminal, Terminal::Done);

    let workspace = Workspace::open(&root).unwrap();
    let state = StateStore::new(workspace.root()).load().unwrap();
    assert_eq!(state.completed_stages, Stage::sequence().to_vec());
    assert_eq!(state.current_stage.to_string(), "done");

    // Deliverable and report.
    assert!(workspace.final_reel_file().exists());
    let StageArtifact::AssemblyReport(report) =
        workspace.read_artifact("assembly-report.json").unwrap()
    else {
        panic!("assembly report missing");
    };
    assert!(report.quality_checks.duration_within_tolerance);
    assert_eq!(report.quality_checks.width, 1080);
    assert_eq!(report.quality_checks.height, 1920);
    assert!(report.overlays_applied == false && report.degradation_note.is_none());

    // Every judged stage passed QA outright.
    let events = read_journal(&workspace);
    let qa_passes = events.iter().filter(|e| e.kind == EventKind::QaPassed).count();
    assert_eq!(qa_passes, 6);
    assert!(events.iter().all(|e| e.kind != EventKind::QaRework));
    assert!(events.iter().any(|e| e.kind == EventKind::Delivered));

    // Event ids are strictly increasing.
    let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    // Delivery went inline and carried the hook text.
    let files = harness.messenger.files.lock().unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].1.contains("habit"));
}

#[tokio::test]
async fn s2_crash_between_stages_resumes_without_reproducing_artifacts() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(&runs_root(&dir));
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();
    let item = harness.item("req-s2");

    let terminal = harness
        .driver()
        .with_stage_limit(Some(5))
        .execute_item(&item, workspace)
        .await
        .unwrap();
    assert_eq!(terminal, Terminal::Done);

    // Simulate the crash window: stage 5 finished and its artifacts are on
    // disk, but the state commit never happened. Rewind the persisted state
    // to state_{k-1}.
    let workspace = Workspace::open(&root).unwrap();
    let store = StateStore::new(workspace.root());
    let mut state = store.load().unwrap();
    let run_id = state.run_id.clone();
    state.current_stage = reelsmith::state::Cursor::Stage(Stage::LayoutDetective);
    state.completed_stages = Stage::sequence()[..Stage::LayoutDetective.index()].to_vec();
    state.attempt = 1;
    store.save_atomic(&state).unwrap();

    let layout_before =
        std::fs::read(workspace.artifact_path("layout-detective-output.json").unwrap().as_std_path())
            .unwrap();

    // Restart: the run must fast-forward past stage 5 and complete.
    let terminal = harness
        .driver()
        .resume_run(Workspace::open(&root).unwrap(), &item.payload, None)
        .await
        .unwrap();
    assert_eq!(terminal, Terminal::Done);

    let workspace = Workspace::open(&root).unwrap();
    let state = StateStore::new(workspace.root()).load().unwrap();
    assert_eq!(state.run_id, run_id);
    assert_eq!(state.completed_stages, Stage::sequence().to_vec());

    // Stage-5 artifacts unchanged, exactly one set of stage-6 outputs.
    let layout_after =
        std::fs::read(workspace.artifact_path("layout-detective-output.json").unwrap().as_std_path())
            .unwrap();
    assert_eq!(layout_before, layout_after);
    assert!(workspace.segment_file(0).exists());
    assert!(workspace.segment_file(1).exists());
    assert!(!workspace.segment_file(2).exists());

    // The layout stage never re-ran after the restart.
    let calls = harness.agent.calls.lock().unwrap();
    let layout_calls = calls.iter().filter(|(s, _)| *s == Stage::LayoutDetective).count();
    assert_eq!(layout_calls, 1);
}

#[tokio::test]
async fn s3_rework_twice_then_pass_records_three_attempts() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(&runs_root(&dir));
    harness.critic.script(
        "content_quality",
        vec![
            StubCritic::rework(55),
            StubCritic::rework(62),
            StubCritic::pass(88),
        ],
    );
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();

    let terminal = harness
        .driver()
        .execute_item(&harness.item("req-s3"), workspace)
        .await
        .unwrap();
    assert_eq!(terminal, Terminal::Done);

    let workspace = Workspace::open(&root).unwrap();
    let events = read_journal(&workspace);
    let content_reworks = events
        .iter()
        .filter(|e| e.kind == EventKind::QaRework && e.stage == Some(Stage::Content))
        .count();
    assert_eq!(content_reworks, 2);
    let content_pass = events
        .iter()
        .find(|e| e.kind == EventKind::QaPassed && e.stage == Some(Stage::Content))
        .expect("content should pass");
    assert_eq!(content_pass.payload["attempts"], 3);
    assert!(events.iter().all(|e| e.kind != EventKind::QaBestOfThree));
}

#[tokio::test]
async fn s4_best_of_three_accepts_highest_scoring_attempt_above_floor() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(&runs_root(&dir));
    harness.critic.script(
        "content_quality",
        vec![
            StubCritic::rework(72),
            StubCritic::rework(80),
            StubCritic::rework(65),
        ],
    );
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();

    let terminal = harness
        .driver()
        .execute_item(&harness.item("req-s4"), workspace)
        .await
        .unwrap();
    // The floor (70) is met by the attempt-2 score of 80: no escalation.
    assert_eq!(terminal, Terminal::Done);

    let workspace = Workspace::open(&root).unwrap();
    let events = read_journal(&workspace);
    let best = events
        .iter()
        .find(|e| e.kind == EventKind::QaBestOfThree && e.stage == Some(Stage::Content))
        .expect("best-of-three expected");
    assert_eq!(best.payload["score"], 80);
    assert!(events.iter().all(|e| e.kind != EventKind::Escalated));
}

#[tokio::test]
async fn s5_duplicate_enqueue_yields_one_file_and_one_run() {
    use reelsmith::queue::{Ack, EnqueueOutcome, WorkQueue};

    let dir = TempDir::new().unwrap();
    let harness = Harness::new(&runs_root(&dir));
    let queue = WorkQueue::open(&harness.config.paths.queue_root, harness.config.queue.clone())
        .unwrap();

    let item = harness.item("req-s5");
    assert_eq!(queue.enqueue(&item).unwrap(), EnqueueOutcome::Enqueued);
    assert_eq!(queue.enqueue(&item).unwrap(), EnqueueOutcome::Deduplicated);

    let claimed = queue.claim_next().unwrap().unwrap();
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();
    let terminal = harness
        .driver()
        .execute_item(&claimed, workspace)
        .await
        .unwrap();
    assert_eq!(terminal, Terminal::Done);
    queue.acknowledge(&claimed.item_id, Ack::Completed).unwrap();

    // Exactly one file made it through the tree, one run was journaled.
    assert_eq!(queue.count("completed").unwrap(), 1);
    assert_eq!(queue.count("inbox").unwrap(), 0);
    assert!(queue.claim_next().unwrap().is_none());
    let events = read_journal(&Workspace::open(&root).unwrap());
    let delivered = events.iter().filter(|e| e.kind == EventKind::Delivered).count();
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn s6_persistent_capability_failure_climbs_ladder_then_escalates() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(&runs_root(&dir));
    harness.agent.fail_at(Stage::Research, 50, || {
        CapError::tool("agent", ToolKind::CapabilityUnavailable, "backend down")
    });
    harness.fallback_agent.fail_at(Stage::Research, 50, || {
        CapError::tool("agent", ToolKind::CapabilityUnavailable, "fallback down too")
    });
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();

    let terminal = harness
        .driver()
        .execute_item(&harness.item("req-s6"), workspace)
        .await
        .unwrap();
    assert_eq!(terminal, Terminal::Escalated);

    // The escalation notification lists the four attempted recoveries.
    let notifications = harness.messenger.notifications.lock().unwrap();
    let escalation = notifications
        .iter()
        .find(|n| n.contains("research"))
        .expect("escalation notification expected");
    for action in ["Retry", "ForkSession", "FreshSession", "SwapBackend"] {
        assert!(escalation.contains(action), "{escalation} missing {action}");
    }

    let workspace = Workspace::open(&root).unwrap();
    let events = read_journal(&workspace);
    assert!(events.iter().any(|e| e.kind == EventKind::Escalated));
    let state = StateStore::new(workspace.root()).load().unwrap();
    assert_eq!(state.current_stage.to_string(), "escalated");
    assert!(workspace.elicitation_file().exists());
}

#[tokio::test]
async fn human_retry_answer_re_enters_the_escalated_stage() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(&runs_root(&dir));
    // Five primary failures plus one fallback failure exhaust the ladder;
    // the human says retry, and the remaining script clears on re-entry.
    harness.agent.fail_at(Stage::Research, 5, || {
        CapError::tool("agent", ToolKind::CapabilityUnavailable, "backend down")
    });
    harness.fallback_agent.fail_at(Stage::Research, 1, || {
        CapError::tool("agent", ToolKind::CapabilityUnavailable, "fallback down")
    });
    *harness.messenger.answer.lock().unwrap() = "retry".to_string();
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();

    let terminal = harness
        .driver()
        .execute_item(&harness.item("req-human"), workspace)
        .await
        .unwrap();
    assert_eq!(terminal, Terminal::Done);

    let workspace = Workspace::open(&root).unwrap();
    let events = read_journal(&workspace);
    assert!(events.iter().any(|e| e.kind == EventKind::Escalated));
    assert!(events.iter().any(|e| e.kind == EventKind::Delivered));
}

#[tokio::test]
async fn transient_failures_recover_on_retry_without_escalating() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(&runs_root(&dir));
    harness
        .agent
        .fail_at(Stage::Transcript, 1, || CapError::transient("agent", "rate limited"));
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();

    let terminal = harness
        .driver()
        .execute_item(&harness.item("req-retry"), workspace)
        .await
        .unwrap();
    assert_eq!(terminal, Terminal::Done);

    let workspace = Workspace::open(&root).unwrap();
    let events = read_journal(&workspace);
    assert!(events.iter().any(|e| e.kind == EventKind::ErrorRecovered));
    assert!(events.iter().all(|e| e.kind != EventKind::Escalated));
}

#[tokio::test]
async fn publishing_assets_present_iff_language_requested() {
    let dir = TempDir::new().unwrap();

    // Without the option: absent.
    let harness = Harness::new(&runs_root(&dir));
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();
    harness
        .driver()
        .execute_item(&harness.item("req-nolang"), workspace)
        .await
        .unwrap();
    let workspace = Workspace::open(&root).unwrap();
    assert!(!workspace.has_artifact("publishing-assets.json"));

    // With the option: present and valid.
    let options = RunOptions {
        publishing_language: Some("pt-BR".to_string()),
        ..RunOptions::default()
    };
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();
    harness
        .driver()
        .execute_item(&harness.item_with_options("req-lang", options), workspace)
        .await
        .unwrap();
    let workspace = Workspace::open(&root).unwrap();
    let StageArtifact::PublishingAssets(assets) =
        workspace.read_artifact("publishing-assets.json").unwrap()
    else {
        panic!("publishing assets missing");
    };
    assert_eq!(assets.language, "pt-BR");
}

#[tokio::test]
async fn overlay_failure_degrades_to_base_reel_with_note() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(&runs_root(&dir));
    *harness.media.overlay_fails.lock().unwrap() = true;
    let options = RunOptions {
        cutaways: vec!["https://y.example/clip@8.0".parse().unwrap()],
        ..RunOptions::default()
    };
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();

    let terminal = harness
        .driver()
        .execute_item(&harness.item_with_options("req-degrade", options), workspace)
        .await
        .unwrap();
    assert_eq!(terminal, Terminal::Done);

    let workspace = Workspace::open(&root).unwrap();
    let StageArtifact::AssemblyReport(report) =
        workspace.read_artifact("assembly-report.json").unwrap()
    else {
        panic!("assembly report missing");
    };
    assert!(!report.overlays_applied);
    assert!(report.degradation_note.as_deref().unwrap().contains("base reel accepted"));
    // The final artifact equals the pass-1 output: no partial overlays.
    let final_bytes = std::fs::read(workspace.final_reel_file().as_std_path()).unwrap();
    assert_eq!(final_bytes, b"base reel");
}

#[tokio::test]
async fn oversized_deliverable_goes_through_the_object_store() {
    let dir = TempDir::new().unwrap();
    let mut harness = Harness::new(&runs_root(&dir));
    harness.config.delivery.inline_limit_bytes = 0;
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();

    harness
        .driver()
        .execute_item(&harness.item("req-big"), workspace)
        .await
        .unwrap();

    assert_eq!(harness.store.uploads.lock().unwrap().len(), 1);
    assert!(harness.messenger.files.lock().unwrap().is_empty());

    let workspace = Workspace::open(&root).unwrap();
    let StageArtifact::DeliveryReceipt(receipt) =
        workspace.read_artifact("delivery-output.json").unwrap()
    else {
        panic!("delivery receipt missing");
    };
    assert_eq!(receipt.delivered_via, "object_store");
    assert!(receipt.url.as_deref().unwrap().starts_with("https://store.example/"));
}

#[tokio::test]
async fn cancellation_applies_at_the_next_stage_boundary() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new(&runs_root(&dir));
    let workspace = fresh_workspace(&harness).await;
    let root = workspace.root().to_owned();

    let driver = harness.driver();
    driver
        .cancel_flag()
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let terminal = driver
        .execute_item(&harness.item("req-cancel"), workspace)
        .await
        .unwrap();
    assert_eq!(terminal, Terminal::Failed);

    // Nothing ran.
    assert!(harness.agent.calls.lock().unwrap().is_empty());
    let state = StateStore::new(Utf8Path::new(root.as_str())).load().unwrap();
    assert_eq!(state.current_stage.to_string(), "failed");
}
