//! Store change notifications
//!
//! Every committed save produces one `StoreEvent`. Events are broadcast to
//! live subscribers and kept in a bounded `ChangeJournal` so pollers can ask
//! "what changed since revision N".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;

pub const DEFAULT_JOURNAL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceSource {
    /// Pushed whole by a client
    Client,
    /// Pulled from the server into a local store
    Remote,
    /// Direct save-all call
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    PlacementAdded { machine: String, cell: String },
    PlacementRemoved { machine: String, cell: String },
    PlacementsReplaced,
    MachinesChanged,
    ToolTypesChanged,
    ToolTypeRenamed { from: String, to: String, placements: usize },
    ActivityAppended,
    SettingsChanged,
    SnapshotReplaced { source: ReplaceSource },
    /// Every collection reset to a fresh store
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub revision: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub change: ChangeKind,
}

/// Answer to a "changes since" poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesPage {
    pub changes: Vec<StoreEvent>,
    pub current_revision: u64,
    /// Older records were evicted, the caller should do a full pull
    pub truncated: bool,
}

#[derive(Debug)]
pub struct ChangeJournal {
    records: VecDeque<StoreEvent>,
    capacity: usize,
}

impl ChangeJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, event: StoreEvent) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(event);
    }

    pub fn since(&self, revision: u64, current_revision: u64) -> ChangesPage {
        let changes: Vec<StoreEvent> = self
            .records
            .iter()
            .filter(|e| e.revision > revision)
            .cloned()
            .collect();
        let oldest_kept = self.records.front().map(|e| e.revision);
        let truncated = revision < current_revision
            && oldest_kept.map_or(true, |oldest| oldest > revision + 1);
        ChangesPage {
            changes,
            current_revision,
            truncated,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outbound channel for change notifications (MQTT in production, a mock in tests)
pub trait ChangeSink: Send + Sync + 'static {
    fn publish(&self, topic: String, payload: Vec<u8>) -> impl Future<Output = anyhow::Result<()>> + Send;
}
