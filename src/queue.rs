//! Single-consumer FIFO work queue over a directory tree.
//!
//! Items are plain JSON files named `<unix-ts>-<item-id>.json`, moved
//! between `inbox/`, `processing/`, `completed/`, and `failed/`. Claims are
//! serialized by an advisory lock on `.consumer.lock`, whose body carries
//! the consumer's pid and a heartbeat timestamp refreshed while a run is
//! active. A crash mid-claim leaves the item in `processing/` with a stale
//! heartbeat; startup reaping moves it back to `inbox/` under its original
//! timestamp, preserving FIFO order.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Seek, Write};
use thiserror::Error;

use crate::config::QueueConfig;
use crate::error::ErrorClass;
use crate::types::QueueItem;

const LOCK_FILE: &str = ".consumer.lock";
const SUBDIRS: [&str; 4] = ["inbox", "processing", "completed", "failed"];

/// Errors raised by queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid item id: {id} (alphanumeric, '-' and '_' only)")]
    InvalidItemId { id: String },

    #[error("queue item is corrupt: {path}: {reason}")]
    Corrupt { path: Utf8PathBuf, reason: String },

    #[error("item not found in processing: {id}")]
    NotProcessing { id: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidItemId { .. } => ErrorClass::Validation,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The item id already exists somewhere in the tree; nothing was written.
    Deduplicated,
}

/// Terminal disposition of a claimed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Completed,
    Failed,
}

/// Consumer lease stored in the lock file body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerLease {
    pub pid: u32,
    /// Seconds since the UNIX epoch of the last heartbeat.
    pub heartbeat_ts: i64,
}

/// The file-backed work queue.
pub struct WorkQueue {
    root: Utf8PathBuf,
    config: QueueConfig,
}

impl WorkQueue {
    /// Open (or create) the queue tree at `root`.
    pub fn open(root: &Utf8Path, config: QueueConfig) -> Result<Self, QueueError> {
        for sub in SUBDIRS {
            fs::create_dir_all(root.join(sub).as_std_path())?;
        }
        Ok(Self {
            root: root.to_owned(),
            config,
        })
    }

    fn dir(&self, sub: &str) -> Utf8PathBuf {
        self.root.join(sub)
    }

    fn lock_path(&self) -> Utf8PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Run `f` while holding the exclusive advisory consumer lock.
    fn with_lock<T>(
        &self,
        f: impl FnOnce(&mut fs::File) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path().as_std_path())?;
        let mut lock = RwLock::new(file);
        let mut guard = lock.write().map_err(|e| QueueError::Io(e.into()))?;
        f(&mut guard)
    }

    fn validate_item_id(id: &str) -> Result<(), QueueError> {
        let ok = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if ok {
            Ok(())
        } else {
            Err(QueueError::InvalidItemId { id: id.to_string() })
        }
    }

    /// Find the file holding `item_id` anywhere in the tree.
    fn find_item(&self, item_id: &str) -> Result<Option<(Utf8PathBuf, &'static str)>, QueueError> {
        let suffix = format!("-{item_id}.json");
        for sub in SUBDIRS {
            for entry in fs::read_dir(self.dir(sub).as_std_path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(&suffix) {
                    return Ok(Some((self.dir(sub).join(name), sub)));
                }
            }
        }
        Ok(None)
    }

    /// Enqueue an item. Idempotent: a duplicate `item_id` anywhere in the
    /// tree is a no-op reported as [`EnqueueOutcome::Deduplicated`].
    pub fn enqueue(&self, item: &QueueItem) -> Result<EnqueueOutcome, QueueError> {
        Self::validate_item_id(&item.item_id)?;
        self.with_lock(|_| {
            if self.find_item(&item.item_id)?.is_some() {
                return Ok(EnqueueOutcome::Deduplicated);
            }
            let name = format!("{}-{}.json", item.enqueued_at.timestamp(), item.item_id);
            let path = self.dir("inbox").join(name);
            crate::atomic_write::write_json_atomic(&path, item)
                .map_err(|e| QueueError::Io(std::io::Error::other(e)))?;
            Ok(EnqueueOutcome::Enqueued)
        })
    }

    /// Claim the oldest pending item, moving it into `processing/` and
    /// stamping the consumer lease. Returns `None` when the inbox is empty.
    pub fn claim_next(&self) -> Result<Option<QueueItem>, QueueError> {
        self.with_lock(|lock_file| {
            let mut names: Vec<String> = fs::read_dir(self.dir("inbox").as_std_path())?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.ends_with(".json"))
                .collect();
            names.sort();
            let Some(name) = names.into_iter().next() else {
                return Ok(None);
            };

            let from = self.dir("inbox").join(&name);
            let to = self.dir("processing").join(&name);
            fs::rename(from.as_std_path(), to.as_std_path())?;

            write_lease(
                lock_file,
                &ConsumerLease {
                    pid: std::process::id(),
                    heartbeat_ts: Utc::now().timestamp(),
                },
            )?;

            let item: QueueItem =
                crate::atomic_write::read_json(&to).map_err(|e| QueueError::Corrupt {
                    path: to.clone(),
                    reason: e.to_string(),
                })?;
            Ok(Some(item))
        })
    }

    /// Refresh the lease heartbeat. Called periodically while a run is
    /// active.
    pub fn heartbeat(&self) -> Result<(), QueueError> {
        self.with_lock(|lock_file| {
            write_lease(
                lock_file,
                &ConsumerLease {
                    pid: std::process::id(),
                    heartbeat_ts: Utc::now().timestamp(),
                },
            )
        })
    }

    /// Move a processed item into `completed/` or `failed/`.
    pub fn acknowledge(&self, item_id: &str, ack: Ack) -> Result<(), QueueError> {
        Self::validate_item_id(item_id)?;
        self.with_lock(|_| {
            let Some((path, sub)) = self.find_item(item_id)? else {
                return Err(QueueError::NotProcessing {
                    id: item_id.to_string(),
                });
            };
            if sub != "processing" {
                return Err(QueueError::NotProcessing {
                    id: item_id.to_string(),
                });
            }
            let dest_dir = match ack {
                Ack::Completed => self.dir("completed"),
                Ack::Failed => self.dir("failed"),
            };
            let dest = dest_dir.join(path.file_name().unwrap_or_default());
            fs::rename(path.as_std_path(), dest.as_std_path())?;
            Ok(())
        })
    }

    /// Startup-only: return stale `processing/` entries to the inbox.
    ///
    /// An entry is stale when the consumer lease heartbeat is older than the
    /// configured age, or when no lease exists at all. Original file names
    /// are kept, so FIFO order is preserved.
    pub fn reap_stale_leases(&self) -> Result<Vec<String>, QueueError> {
        self.with_lock(|lock_file| {
            let lease = read_lease(lock_file);
            let stale = match lease {
                Some(lease) => {
                    let age = Utc::now().timestamp() - lease.heartbeat_ts;
                    age >= 0 && age as u64 > self.config.stale_lease_secs
                }
                None => true,
            };
            if !stale {
                return Ok(Vec::new());
            }

            let mut reaped = Vec::new();
            for entry in fs::read_dir(self.dir("processing").as_std_path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.ends_with(".json") {
                    continue;
                }
                let from = self.dir("processing").join(&name);
                let to = self.dir("inbox").join(&name);
                fs::rename(from.as_std_path(), to.as_std_path())?;
                reaped.push(name);
            }
            reaped.sort();
            Ok(reaped)
        })
    }

    /// Count of entries in one sub-directory; status reporting only.
    pub fn count(&self, sub: &str) -> Result<usize, QueueError> {
        Ok(fs::read_dir(self.dir(sub).as_std_path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
            .count())
    }
}

fn write_lease(file: &mut fs::File, lease: &ConsumerLease) -> Result<(), QueueError> {
    let json = serde_json::to_string(lease).map_err(std::io::Error::other)?;
    file.set_len(0)?;
    file.seek(std::io::SeekFrom::Start(0))?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_lease(file: &mut fs::File) -> Option<ConsumerLease> {
    let mut content = String::new();
    file.seek(std::io::SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    serde_json::from_str(&content).ok()
}
