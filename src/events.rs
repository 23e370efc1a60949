//! In-process event bus with failure isolation.
//!
//! Publication is synchronous and single-threaded: the publisher calls every
//! matching subscriber in registration order. A subscriber error or panic is
//! logged and swallowed; publisher progress is never blocked. Three core
//! subscribers are always installed for a run: the journal writer, the
//! checkpoint tracker, and the rate-limited user notifier.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::stage::Stage;
use crate::types::{EventKind, PipelineEvent, RunId};

/// A bus subscriber. Implementations must not block.
pub trait Subscriber: Send {
    fn name(&self) -> &'static str;

    /// `None` subscribes to every kind.
    fn filter(&self) -> Option<EventKind> {
        None
    }

    fn on_event(&mut self, event: &PipelineEvent) -> anyhow::Result<()>;
}

/// Per-run event bus. Event ids are monotonic within the bus, giving a total
/// order over the run's events.
pub struct EventBus {
    run_id: RunId,
    next_event_id: u64,
    subscribers: Vec<Box<dyn Subscriber>>,
}

impl EventBus {
    #[must_use]
    pub fn new(run_id: RunId, first_event_id: u64) -> Self {
        Self {
            run_id,
            next_event_id: first_event_id,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Publish one event, dispatching synchronously to every matching
    /// subscriber. Returns the assigned event id.
    pub fn publish(
        &mut self,
        stage: Option<Stage>,
        kind: EventKind,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> u64 {
        let event = PipelineEvent {
            event_id: self.next_event_id,
            run_id: self.run_id.clone(),
            stage,
            kind,
            payload,
            at,
        };
        self.next_event_id += 1;

        for subscriber in &mut self.subscribers {
            if let Some(filter) = subscriber.filter()
                && filter != kind
            {
                continue;
            }
            let name = subscriber.name();
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_event(&event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(subscriber = name, error = %e, "subscriber failed; continuing");
                }
                Err(_) => {
                    tracing::error!(subscriber = name, "subscriber panicked; continuing");
                }
            }
        }
        event.event_id
    }
}

/// Appends every event as one JSON line to the run's journal file.
pub struct JournalWriter {
    path: Utf8PathBuf,
}

impl JournalWriter {
    #[must_use]
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }
}

impl Subscriber for JournalWriter {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn on_event(&mut self, event: &PipelineEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_std_path())?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

/// Tracks the highest published event id for state checkpointing.
pub struct CheckpointTracker {
    last_event_id: Arc<AtomicU64>,
}

impl CheckpointTracker {
    #[must_use]
    pub fn new(last_event_id: Arc<AtomicU64>) -> Self {
        Self { last_event_id }
    }
}

impl Subscriber for CheckpointTracker {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn on_event(&mut self, event: &PipelineEvent) -> anyhow::Result<()> {
        self.last_event_id.store(event.event_id, Ordering::SeqCst);
        Ok(())
    }
}

/// Forwards user-relevant events into an async channel; a daemon task drains
/// it through the messenger with rate limiting. Best-effort: a full or
/// closed channel is not an error.
pub struct UserNotifier {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl UserNotifier {
    #[must_use]
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    fn render(event: &PipelineEvent) -> Option<String> {
        let stage = event.stage.map(|s| s.as_str()).unwrap_or("pipeline");
        match event.kind {
            EventKind::StageCompleted => Some(format!("[{}] {stage} done", event.run_id)),
            EventKind::QaBestOfThree => Some(format!(
                "[{}] {stage} accepted best attempt after max reworks",
                event.run_id
            )),
            EventKind::Escalated => Some(format!("[{}] {stage} needs your input", event.run_id)),
            EventKind::Delivered => Some(format!("[{}] reel delivered", event.run_id)),
            _ => None,
        }
    }
}

impl Subscriber for UserNotifier {
    fn name(&self) -> &'static str {
        "notifier"
    }

    fn on_event(&mut self, event: &PipelineEvent) -> anyhow::Result<()> {
        if let Some(message) = Self::render(event) {
            let _ = self.tx.send(message);
        }
        Ok(())
    }
}
