//! The daemon: claim one item at a time from the queue, run the pipeline,
//! acknowledge, repeat.
//!
//! Startup reaps stale leases, then the loop polls the inbox. While a run
//! is active a heartbeat task refreshes the consumer lease; user
//! notifications drain through a rate-limited forwarder so a chatty run
//! cannot flood the messenger. Ctrl-C requests cancellation, which the
//! driver applies at the next stage boundary.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::caps::Capabilities;
use crate::config::Config;
use crate::error::PipelineError;
use crate::hooks::HookScheduler;
use crate::queue::{Ack, EnqueueOutcome, WorkQueue};
use crate::runner::PipelineDriver;
use crate::state::Terminal;
use crate::types::QueueItem;
use crate::workspace::Workspace;

/// Inbox poll interval when idle.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing between messenger notifications.
const NOTIFY_INTERVAL: Duration = Duration::from_secs(2);

pub struct Daemon {
    queue: WorkQueue,
    driver: PipelineDriver,
    caps: Capabilities,
    config: Config,
    notify_rx: Option<tokio::sync::mpsc::UnboundedReceiver<String>>,
}

impl Daemon {
    /// Wire the daemon from configuration and a capability context.
    pub fn new(config: Config, caps: Capabilities) -> Result<Self> {
        let queue = WorkQueue::open(&config.paths.queue_root, config.queue.clone())
            .context("failed to open work queue")?;
        let (notify_tx, notify_rx) = tokio::sync::mpsc::unbounded_channel();
        let driver = PipelineDriver::new(
            caps.clone(),
            config.clone(),
            HookScheduler::with_canonical_hooks(),
            notify_tx,
        );
        Ok(Self {
            queue,
            driver,
            caps,
            config,
            notify_rx: Some(notify_rx),
        })
    }

    /// Enqueue a work item directly (the CLI path; daemon deployments have
    /// the messenger drop descriptors into the inbox).
    pub fn enqueue(&self, item: &QueueItem) -> Result<EnqueueOutcome, PipelineError> {
        Ok(self.queue.enqueue(item)?)
    }

    /// Run until Ctrl-C. Exactly one item is in flight at any moment.
    pub async fn run(mut self) -> Result<()> {
        let reaped = self.queue.reap_stale_leases()?;
        if !reaped.is_empty() {
            tracing::warn!(count = reaped.len(), items = ?reaped, "reaped stale leases back to inbox");
        }

        // Rate-limited notification forwarder.
        let messenger = self.caps.messenger.clone();
        let mut notify_rx = self.notify_rx.take().expect("daemon run started twice");
        let notifier = tokio::spawn(async move {
            while let Some(message) = notify_rx.recv().await {
                if let Err(e) = messenger.notify(&message).await {
                    tracing::debug!(error = %e, "notification dropped");
                }
                tokio::time::sleep(NOTIFY_INTERVAL).await;
            }
        });

        let cancel = self.driver.cancel_flag();
        tracing::info!(
            queue = %self.config.paths.queue_root,
            runs = %self.config.paths.runs_root,
            "daemon started"
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    cancel.store(true, Ordering::SeqCst);
                    break;
                }
                claimed = self.claim_or_wait() => {
                    match claimed {
                        Ok(Some(item)) => {
                            if let Err(e) = self.process(&item).await {
                                tracing::error!(item = %item.item_id, error = %e, "run failed hard");
                                self.queue.acknowledge(&item.item_id, Ack::Failed).ok();
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "queue claim failed");
                            tokio::time::sleep(POLL_INTERVAL).await;
                        }
                    }
                }
            }
            if cancel.load(Ordering::SeqCst) {
                break;
            }
        }

        notifier.abort();
        Ok(())
    }

    async fn claim_or_wait(&self) -> Result<Option<QueueItem>, PipelineError> {
        match self.queue.claim_next()? {
            Some(item) => Ok(Some(item)),
            None => {
                tokio::time::sleep(POLL_INTERVAL).await;
                Ok(None)
            }
        }
    }

    /// Execute one claimed item end-to-end and acknowledge it.
    async fn process(&self, item: &QueueItem) -> Result<(), PipelineError> {
        tracing::info!(item = %item.item_id, url = %item.payload.url, "claimed work item");

        let run_id = crate::types::RunId::mint(self.caps.clock.now());
        let workspace = Workspace::create(&self.config.paths.runs_root, run_id)?;

        // Lease heartbeat while the run is active.
        let heartbeat_queue =
            WorkQueue::open(&self.config.paths.queue_root, self.config.queue.clone())?;
        let heartbeat_secs = self.config.queue.heartbeat_secs;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(heartbeat_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = heartbeat_queue.heartbeat() {
                    tracing::warn!(error = %e, "heartbeat failed");
                }
            }
        });

        let terminal = self.driver.execute_item(item, workspace).await;
        heartbeat.abort();

        match terminal {
            Ok(Terminal::Done) => {
                self.queue.acknowledge(&item.item_id, Ack::Completed)?;
                tracing::info!(item = %item.item_id, "run completed");
            }
            Ok(terminal) => {
                self.queue.acknowledge(&item.item_id, Ack::Failed)?;
                tracing::warn!(item = %item.item_id, ?terminal, "run did not complete");
            }
            Err(e) => {
                self.queue.acknowledge(&item.item_id, Ack::Failed)?;
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Composition root: build the production capability context from
/// configuration. Every port is wired here, once; nothing downstream
/// constructs adapters.
#[must_use]
pub fn compose(config: &Config) -> Capabilities {
    use crate::adapters::{
        AgentCliBackend, AgentCliDispatcher, CommandGenerator, ConsoleMessenger, FfmpegProcessor,
        FolderStore, SysinfoProbe, SystemClock, YtDlpDownloader,
    };

    let media: Arc<dyn crate::caps::MediaProcessor> =
        Arc::new(FfmpegProcessor::new("ffmpeg", "ffprobe", 2));
    let generator_command = std::env::var("REELSMITH_GENERATOR_CMD").ok();

    Capabilities {
        agent: Arc::new(AgentCliBackend::new("agent", "agent-cli")),
        fallback_agent: Arc::new(AgentCliBackend::new("agent-alt", "agent-cli-alt")),
        dispatcher: Arc::new(AgentCliDispatcher::new(
            "agent",
            config.agent.downgrade_model.clone(),
        )),
        messenger: Arc::new(ConsoleMessenger),
        media: media.clone(),
        downloader: Arc::new(YtDlpDownloader::new("yt-dlp", media.clone(), 2)),
        generator: Arc::new(CommandGenerator::new(generator_command, media)),
        store: Arc::new(FolderStore::new(config.paths.runs_root.join(".store"))),
        clock: Arc::new(SystemClock::new()),
        probe: Arc::new(SysinfoProbe::new()),
    }
}
