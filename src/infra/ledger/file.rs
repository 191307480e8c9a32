//! File-backed idempotency ledger.
//!
//! Every claim, commit and release is appended to a JSON-lines event log
//! and replayed on open, so a restarted process keeps its completion records.
//! Pruning compacts the log to the surviving entries.
//!
//! Claims are atomic within one process only; share a database-backed ledger
//! between processes.

use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LedgerState, Slot, DEFAULT_CLAIM_LEASE};
use crate::core::{CoreError, IdempotencyLedger, IdempotencyRecord, SendSummary};
use crate::util::{duration_ms, Clock, SystemClock};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LedgerEvent {
    Claimed {
        key: String,
        #[serde(default)]
        owner: String,
        at: u128,
    },
    Committed {
        record: IdempotencyRecord,
    },
    Released {
        key: String,
        #[serde(default)]
        owner: String,
    },
}

fn backend<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::Backend(err.to_string())
}

/// Ledger persisted as an append-only JSON-lines file.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    stream: String,
    state: Mutex<LedgerState>,
    claim_lease: Duration,
    clock: Arc<dyn Clock>,
}

impl FileLedger {
    /// Open (or create) the ledger `<path>/<stream>_ledger.jsonl`.
    ///
    /// # Errors
    ///
    /// [`CoreError::Backend`] if the directory cannot be created or the log cannot be replayed.
    pub fn open(path: impl AsRef<Path>, stream: impl Into<String>) -> Result<Self, CoreError> {
        Self::open_with_clock(path, stream, Arc::new(SystemClock))
    }

    /// Open with an explicit clock.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_with_clock(
        path: impl AsRef<Path>,
        stream: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        create_dir_all(&path).map_err(backend)?;
        let ledger = Self {
            path,
            stream: stream.into(),
            state: Mutex::new(LedgerState::default()),
            claim_lease: DEFAULT_CLAIM_LEASE,
            clock,
        };
        ledger.load_from_disk()?;
        Ok(ledger)
    }

    /// Set the claim lease.
    #[must_use]
    pub const fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    /// Location of the event log.
    #[must_use]
    pub fn file_path(&self) -> PathBuf {
        self.path.join(format!("{}_ledger.jsonl", self.stream))
    }

    fn load_from_disk(&self) -> Result<(), CoreError> {
        let file_path = self.file_path();
        if !file_path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new().read(true).open(&file_path).map_err(backend)?;
        let mut state = self.state.lock();
        let mut replayed = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(backend)?;
            if line.trim().is_empty() {
                continue;
            }
            let event: LedgerEvent = serde_json::from_str(&line).map_err(backend)?;
            match event {
                LedgerEvent::Claimed { key, owner, at } => {
                    if !matches!(state.slots.get(&key), Some(Slot::Done(_))) {
                        state.slots.insert(key, Slot::Pending { owner, claimed_at: at });
                    }
                }
                LedgerEvent::Committed { record } => {
                    state
                        .slots
                        .entry(record.idempotency_key.clone())
                        .and_modify(|slot| {
                            if !matches!(slot, Slot::Done(_)) {
                                *slot = Slot::Done(record.clone());
                            }
                        })
                        .or_insert_with(|| Slot::Done(record.clone()));
                }
                LedgerEvent::Released { key, owner } => {
                    state.release(&key, &owner);
                }
            }
            replayed += 1;
        }
        drop(state);
        debug!(path = %file_path.display(), replayed, "ledger replayed");
        Ok(())
    }

    fn append_to_disk(&self, event: &LedgerEvent) -> Result<(), CoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())
            .map_err(backend)?;
        let line = serde_json::to_string(event).map_err(backend)?;
        writeln!(file, "{line}").map_err(backend)
    }

    fn rewrite_disk(&self, state: &LedgerState) -> Result<(), CoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.file_path())
            .map_err(backend)?;
        for (key, slot) in &state.slots {
            let event = match slot {
                Slot::Pending { owner, claimed_at } => LedgerEvent::Claimed {
                    key: key.clone(),
                    owner: owner.clone(),
                    at: *claimed_at,
                },
                Slot::Done(record) => LedgerEvent::Committed {
                    record: record.clone(),
                },
            };
            let line = serde_json::to_string(&event).map_err(backend)?;
            writeln!(file, "{line}").map_err(backend)?;
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLedger for FileLedger {
    async fn claim(&self, key: &str, owner: &str) -> Result<bool, CoreError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let previous = state.slots.get(key).cloned();
        if !state.try_claim(key, owner, now, duration_ms(self.claim_lease)) {
            return Ok(false);
        }
        if let Err(err) = self.append_to_disk(&LedgerEvent::Claimed {
            key: key.to_string(),
            owner: owner.to_string(),
            at: now,
        }) {
            match previous {
                Some(slot) => state.slots.insert(key.to_string(), slot),
                None => state.slots.remove(key),
            };
            return Err(err);
        }
        Ok(true)
    }

    async fn commit(&self, key: &str, summary: &SendSummary) -> Result<(), CoreError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let previous = state.slots.get(key).cloned();
        let Some(record) = state.commit(key, summary, now) else {
            return Ok(());
        };
        if let Err(err) = self.append_to_disk(&LedgerEvent::Committed { record }) {
            match previous {
                Some(slot) => state.slots.insert(key.to_string(), slot),
                None => state.slots.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if state.release(key, owner) {
            self.append_to_disk(&LedgerEvent::Released {
                key: key.to_string(),
                owner: owner.to_string(),
            })?;
        }
        Ok(())
    }

    async fn record(&self, key: &str) -> Result<Option<IdempotencyRecord>, CoreError> {
        Ok(self.state.lock().record(key))
    }

    async fn prune_completed_before(&self, cutoff_ms: u128) -> Result<usize, CoreError> {
        let mut state = self.state.lock();
        let removed = state.prune(cutoff_ms);
        if removed > 0 {
            self.rewrite_disk(&state)?;
        }
        Ok(removed)
    }
}
