//! Shared stubs and fixtures for the integration suite.
//!
//! Every capability has a scriptable stub; tests wire exactly the behavior
//! a scenario needs and assert on what the pipeline persisted.

#![allow(dead_code)]

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reelsmith::artifact::{AssetPrompt, CutawayManifest, EncodingPlan};
use reelsmith::caps::{
    AgentBackend, AgentRequest, AgentResult, AssetGenerator, Capabilities, Clock, MediaDownloader,
    MediaInfo, MediaProcessor, Messenger, ModelDispatcher, ObjectStore, QaHistoryEntry,
    ResourceProbe, ResourceSnapshot, SegmentFile, SessionHandle, UploadResult,
};
use reelsmith::config::Config;
use reelsmith::error::CapError;
use reelsmith::framing::StyleTransition;
use reelsmith::hooks::HookScheduler;
use reelsmith::runner::PipelineDriver;
use reelsmith::stage::Stage;
use reelsmith::types::{
    Blocker, BlockerSeverity, CritiqueDecision, QaCritique, QueueItem, RunOptions, RunRequest,
};

/// Deterministic clock: starts at a fixed instant, each `now()` advances
/// one second.
pub struct TickClock {
    base: DateTime<Utc>,
    ticks: AtomicI64,
}

impl TickClock {
    pub fn new() -> Self {
        Self {
            base: "2026-08-01T12:00:00Z".parse().unwrap(),
            ticks: AtomicI64::new(0),
        }
    }
}

impl Clock for TickClock {
    fn now(&self) -> DateTime<Utc> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        self.base + ChronoDuration::seconds(tick)
    }

    fn monotonic(&self) -> Duration {
        Duration::from_secs(self.ticks.load(Ordering::SeqCst).max(0) as u64)
    }
}

/// Probe with plenty of headroom.
pub struct RoomyProbe;

impl ResourceProbe for RoomyProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            available_memory_bytes: 2 * 1024 * 1024 * 1024,
            cpu_percent: 10.0,
            thermal_celsius: Some(45.0),
        }
    }
}

/// Plausible body for each artifact name the stub agent can produce.
pub fn sample_artifact(name: &str, request: &AgentRequest) -> serde_json::Value {
    match name {
        "router-output.json" => serde_json::json!({
            "intent": request.instructions.lines().next().unwrap_or("make a short"),
            "moments_requested": 1,
            "framing_style": "auto",
        }),
        "research-output.json" => serde_json::json!({
            "summary": "the creator argues that small daily reps compound",
            "key_claims": ["consistency beats intensity"],
            "sources": ["https://y.example/abc"],
        }),
        "transcript-output.json" => serde_json::json!({
            "language": "en",
            "segments": [
                {"start": 0.0, "end": 12.0, "speaker": "host", "text": "show up every day"},
                {"start": 12.0, "end": 30.0, "speaker": "host", "text": "small reps compound"},
            ],
        }),
        "content-output.json" => serde_json::json!({
            "hook_text": "the habit that quietly compounds",
            "moments": [
                {"title": "daily reps", "start_seconds": 4.0, "end_seconds": 34.0,
                 "rationale": "tightest articulation of the thesis"}
            ],
            "suggested_cutaways": [],
            "asset_prompts": [],
        }),
        "publishing-assets.json" => serde_json::json!({
            "language": "pt-BR",
            "title": "O habito que compoe",
            "description": "pequenas repeticoes diarias",
            "hashtags": ["#constancia"],
        }),
        "layout-detective-output.json" => serde_json::json!({
            "source_width": 1920,
            "source_height": 1080,
            "segments": [
                {"start": 4.0, "end": 20.0, "face_count": 1, "screen_share": false,
                 "moment_boundary": true,
                 "crop": {"x": 420, "y": 0, "width": 1080, "height": 1080},
                 "confidence": 0.92},
                {"start": 20.0, "end": 34.0, "face_count": 1, "screen_share": false,
                 "moment_boundary": false,
                 "crop": {"x": 400, "y": 0, "width": 1080, "height": 1080},
                 "confidence": 0.88},
            ],
        }),
        "encoding-plan.json" => serde_json::json!({
            "target_width": 1080,
            "target_height": 1920,
            "encode": {"codec": "libx264", "crf": 21, "preset": "veryfast", "audio_bitrate": "128k"},
            "segments": [
                {"index": 0, "start": 4.0, "end": 20.0,
                 "crop": {"x": 420, "y": 0, "width": 1080, "height": 1080},
                 "style": "solo", "filters": []},
                {"index": 1, "start": 20.0, "end": 34.0,
                 "crop": {"x": 400, "y": 0, "width": 1080, "height": 1080},
                 "style": "solo", "filters": []},
            ],
            "style_transitions": [],
        }),
        other => serde_json::json!({"unexpected": other}),
    }
}

/// Scriptable agent backend: optional per-stage error scripts, then
/// deterministic sample artifacts for every expected output.
pub struct StubAgent {
    name: &'static str,
    sessions: AtomicU32,
    /// Errors to hand out (front first) before succeeding, per stage.
    errors: Mutex<HashMap<Stage, VecDeque<CapError>>>,
    /// Calls observed, per stage.
    pub calls: Mutex<Vec<(Stage, bool)>>,
}

impl StubAgent {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            sessions: AtomicU32::new(0),
            errors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Script `count` consecutive failures at `stage` built by `make`.
    pub fn fail_at(&self, stage: Stage, count: usize, make: impl Fn() -> CapError) {
        let mut errors = self.errors.lock().unwrap();
        let queue = errors.entry(stage).or_default();
        for _ in 0..count {
            queue.push_back(make());
        }
    }

    fn next_error(&self, stage: Stage) -> Option<CapError> {
        self.errors.lock().unwrap().get_mut(&stage).and_then(VecDeque::pop_front)
    }

    fn respond(&self, request: &AgentRequest, resumed: bool) -> Result<AgentResult, CapError> {
        self.calls.lock().unwrap().push((request.stage, resumed));
        if let Some(error) = self.next_error(request.stage) {
            return Err(error);
        }
        let mut artifacts = BTreeMap::new();
        for name in &request.expected_outputs {
            artifacts.insert(name.clone(), sample_artifact(name, request));
        }
        let session = if resumed {
            SessionHandle(format!("{}-resumed", self.name))
        } else {
            SessionHandle(format!(
                "{}-{}",
                self.name,
                self.sessions.fetch_add(1, Ordering::SeqCst)
            ))
        };
        Ok(AgentResult {
            session,
            raw_output: String::new(),
            artifacts,
            diagnostics: BTreeMap::new(),
        })
    }
}

#[async_trait]
impl AgentBackend for StubAgent {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, request: &AgentRequest) -> Result<AgentResult, CapError> {
        self.respond(request, false)
    }

    async fn resume(
        &self,
        _session: &SessionHandle,
        request: &AgentRequest,
    ) -> Result<AgentResult, CapError> {
        self.respond(request, true)
    }

    async fn fork(&self, session: &SessionHandle) -> Result<SessionHandle, CapError> {
        // Forking inherits the error script: if the backend is down, the
        // fork call is down too.
        if let Some(error) = self
            .errors
            .lock()
            .unwrap()
            .values_mut()
            .find(|q| !q.is_empty())
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(SessionHandle(format!("{}-fork", session.0)))
    }
}

/// Scriptable critic: per-criterion critique scripts, defaulting to Pass.
pub struct StubCritic {
    scripts: Mutex<HashMap<String, VecDeque<QaCritique>>>,
    pub dispatched: Mutex<Vec<String>>,
}

impl StubCritic {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            dispatched: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, criterion: &str, critiques: Vec<QaCritique>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(criterion.to_string(), critiques.into());
    }

    pub fn pass(score: u8) -> QaCritique {
        QaCritique {
            decision: CritiqueDecision::Pass,
            score,
            confidence: 0.95,
            blockers: vec![],
            prescriptive_fixes: vec![],
            model_used: "critic-stub".to_string(),
            timestamp: "2026-08-01T12:00:00Z".parse().unwrap(),
        }
    }

    pub fn rework(score: u8) -> QaCritique {
        QaCritique {
            decision: CritiqueDecision::Rework,
            score,
            confidence: 0.9,
            blockers: vec![Blocker {
                severity: BlockerSeverity::Major,
                description: "hook lands too late".to_string(),
            }],
            prescriptive_fixes: vec!["move the strongest claim to the open".to_string()],
            model_used: "critic-stub".to_string(),
            timestamp: "2026-08-01T12:00:00Z".parse().unwrap(),
        }
    }
}

#[async_trait]
impl ModelDispatcher for StubCritic {
    async fn dispatch_qa(
        &self,
        _artifact: &serde_json::Value,
        requirements: &str,
        _history: &[QaHistoryEntry],
    ) -> Result<QaCritique, CapError> {
        self.dispatched.lock().unwrap().push(requirements.to_string());
        let criterion = requirements
            .strip_prefix("criterion: ")
            .and_then(|r| r.split(';').next())
            .unwrap_or(requirements)
            .to_string();
        let mut scripts = self.scripts.lock().unwrap();
        if let Some(queue) = scripts.get_mut(&criterion)
            && let Some(critique) = queue.pop_front()
        {
            return Ok(critique);
        }
        Ok(Self::pass(90))
    }

    async fn dispatch_review(&self, _diff: &str, _standards: &str) -> Result<QaCritique, CapError> {
        Ok(Self::pass(90))
    }

    async fn consensus(&self, _models: &[String], _task: &str) -> Result<QaCritique, CapError> {
        Ok(Self::pass(90))
    }
}

/// Messenger that records everything.
#[derive(Default)]
pub struct RecordingMessenger {
    pub notifications: Mutex<Vec<String>>,
    pub files: Mutex<Vec<(Utf8PathBuf, String)>>,
    pub answer: Mutex<String>,
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn ask(&self, _question: &str) -> Result<String, CapError> {
        Ok(self.answer.lock().unwrap().clone())
    }

    async fn notify(&self, message: &str) -> Result<(), CapError> {
        self.notifications.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn send_file(&self, path: &Utf8Path, caption: &str) -> Result<(), CapError> {
        self.files
            .lock()
            .unwrap()
            .push((path.to_owned(), caption.to_string()));
        Ok(())
    }
}

/// Media processor that fabricates files and reports target-shaped info.
pub struct StubMedia {
    /// When set, the overlay pass fails (two-pass degradation scenarios).
    pub overlay_fails: Mutex<bool>,
}

impl StubMedia {
    pub fn new() -> Self {
        Self {
            overlay_fails: Mutex::new(false),
        }
    }

    fn write(path: &Utf8Path, tag: &str) -> Result<(), CapError> {
        std::fs::create_dir_all(path.parent().unwrap().as_std_path())
            .and_then(|()| std::fs::write(path.as_std_path(), tag))
            .map_err(|e| CapError::transient("media", e.to_string()))
    }
}

#[async_trait]
impl MediaProcessor for StubMedia {
    async fn probe(&self, path: &Utf8Path) -> Result<MediaInfo, CapError> {
        let size = std::fs::metadata(path.as_std_path())
            .map_err(|e| CapError::transient("media", e.to_string()))?
            .len();
        Ok(MediaInfo {
            width: 1080,
            height: 1920,
            duration_seconds: 30.0,
            size_bytes: size,
        })
    }

    async fn execute_plan(
        &self,
        plan: &EncodingPlan,
        _source: &Utf8Path,
        out_dir: &Utf8Path,
    ) -> Result<Vec<SegmentFile>, CapError> {
        let mut files = Vec::new();
        for segment in &plan.segments {
            let path = out_dir.join(format!("segment-{:03}.mp4", segment.index));
            Self::write(&path, &format!("segment {}", segment.index))?;
            files.push(SegmentFile {
                index: segment.index,
                path,
                duration_seconds: (segment.end - segment.start).max(0.0),
            });
        }
        Ok(files)
    }

    async fn assemble(
        &self,
        segments: &[SegmentFile],
        _transitions: &[StyleTransition],
        out: &Utf8Path,
    ) -> Result<MediaInfo, CapError> {
        Self::write(out, "base reel")?;
        Ok(MediaInfo {
            width: 1080,
            height: 1920,
            duration_seconds: segments.iter().map(|s| s.duration_seconds).sum(),
            size_bytes: 9,
        })
    }

    async fn overlay(
        &self,
        _media: &Utf8Path,
        manifest: &CutawayManifest,
        out: &Utf8Path,
    ) -> Result<MediaInfo, CapError> {
        if *self.overlay_fails.lock().unwrap() {
            return Err(CapError::transient("media", "overlay filter graph failed"));
        }
        Self::write(out, "overlaid reel")?;
        Ok(MediaInfo {
            width: 1080,
            height: 1920,
            duration_seconds: 30.0,
            size_bytes: 13 + manifest.clips.len() as u64,
        })
    }

    async fn rescale(
        &self,
        _path: &Utf8Path,
        width: u32,
        height: u32,
        out: &Utf8Path,
    ) -> Result<MediaInfo, CapError> {
        Self::write(out, "rescaled clip")?;
        Ok(MediaInfo {
            width,
            height,
            duration_seconds: 4.0,
            size_bytes: 13,
        })
    }
}

/// Downloader that writes a marker file.
pub struct StubDownloader;

#[async_trait]
impl MediaDownloader for StubDownloader {
    async fn download(&self, url: &str, destination: &Utf8Path) -> Result<MediaInfo, CapError> {
        StubMedia::write(destination, &format!("downloaded {url}"))?;
        Ok(MediaInfo {
            width: 1920,
            height: 1080,
            duration_seconds: 180.0,
            size_bytes: 11,
        })
    }
}

/// Generator that writes a target-shaped clip immediately.
pub struct StubGenerator;

#[async_trait]
impl AssetGenerator for StubGenerator {
    async fn generate(
        &self,
        prompt: &AssetPrompt,
        destination: &Utf8Path,
    ) -> Result<MediaInfo, CapError> {
        StubMedia::write(destination, &format!("generated {}", prompt.id))?;
        Ok(MediaInfo {
            width: 1080,
            height: 1920,
            duration_seconds: prompt.duration_seconds,
            size_bytes: 9,
        })
    }
}

/// Object store that records uploads.
#[derive(Default)]
pub struct RecordingStore {
    pub uploads: Mutex<Vec<Utf8PathBuf>>,
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn upload(&self, path: &Utf8Path, folder: &str) -> Result<UploadResult, CapError> {
        self.uploads.lock().unwrap().push(path.to_owned());
        Ok(UploadResult {
            url: format!("https://store.example/{folder}/reel"),
            size_bytes: std::fs::metadata(path.as_std_path()).map(|m| m.len()).unwrap_or(0),
        })
    }
}

/// The full stub harness: capabilities plus handles to every stub.
pub struct Harness {
    pub caps: Capabilities,
    pub agent: Arc<StubAgent>,
    pub fallback_agent: Arc<StubAgent>,
    pub critic: Arc<StubCritic>,
    pub messenger: Arc<RecordingMessenger>,
    pub media: Arc<StubMedia>,
    pub store: Arc<RecordingStore>,
    pub config: Config,
    pub notify_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    notify_tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl Harness {
    pub fn new(runs_root: &Utf8Path) -> Self {
        let agent = Arc::new(StubAgent::new("primary"));
        let fallback_agent = Arc::new(StubAgent::new("fallback"));
        let critic = Arc::new(StubCritic::new());
        let messenger = Arc::new(RecordingMessenger::default());
        let media = Arc::new(StubMedia::new());
        let store = Arc::new(RecordingStore::default());

        let caps = Capabilities {
            agent: agent.clone(),
            fallback_agent: fallback_agent.clone(),
            dispatcher: critic.clone(),
            messenger: messenger.clone(),
            media: media.clone(),
            downloader: Arc::new(StubDownloader),
            generator: Arc::new(StubGenerator),
            store: store.clone(),
            clock: Arc::new(TickClock::new()),
            probe: Arc::new(RoomyProbe),
        };

        let mut config = Config::default();
        config.paths.runs_root = runs_root.to_owned();
        config.paths.queue_root = runs_root.join("queue");

        let (notify_tx, notify_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            caps,
            agent,
            fallback_agent,
            critic,
            messenger,
            media,
            store,
            config,
            notify_rx,
            notify_tx,
        }
    }

    pub fn driver(&self) -> PipelineDriver {
        PipelineDriver::new(
            self.caps.clone(),
            self.config.clone(),
            HookScheduler::with_canonical_hooks(),
            self.notify_tx.clone(),
        )
    }

    pub fn item(&self, id: &str) -> QueueItem {
        self.item_with_options(id, RunOptions::default())
    }

    pub fn item_with_options(&self, id: &str, options: RunOptions) -> QueueItem {
        QueueItem {
            item_id: id.to_string(),
            enqueued_at: "2026-08-01T12:00:00Z".parse().unwrap(),
            payload: RunRequest {
                url: "https://y.example/abc".to_string(),
                message: "make a short about consistency".to_string(),
                options,
            },
        }
    }
}
