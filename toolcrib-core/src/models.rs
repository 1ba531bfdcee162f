//! Tool crib data model
//!
//! Wire format is camelCase JSON, shared by the persisted blob, the kernel
//! API and the agent's local store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Snapshot format version written into every blob
pub const SNAPSHOT_VERSION: &str = "1.0.0";

pub const DEFAULT_ACTIVITY_LOG_CAP: usize = 100;
/// Accepted values for `settings.activityLogCap`
pub const ACTIVITY_LOG_CAP_RANGE: std::ops::RangeInclusive<usize> = 50..=100;
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 3000;

/// Catalog seeded into a fresh store (all without fixed sizes)
pub const STANDARD_TOOL_TYPES: [&str; 10] = [
    "Face mill",
    "End mill",
    "Form mill",
    "Twist drill",
    "Countersink",
    "Reamer",
    "Thread mill",
    "Boring bar",
    "Hob",
    "Disc mill",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    #[default]
    Active,
    Maintenance,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub status: MachineStatus,
    /// Number of storage cells, numbered from 1
    pub cells: u32,
}

/// Admin input for a new machine
#[derive(Debug, Clone, Deserialize)]
pub struct NewMachine {
    pub name: String,
    pub cells: u32,
    #[serde(default)]
    pub status: MachineStatus,
}

/// Partial machine update, absent fields are left alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineUpdate {
    pub name: Option<String>,
    pub cells: Option<u32>,
    pub status: Option<MachineStatus>,
}

/// Tool type name -> allowed size labels (empty = free size)
pub type ToolTypes = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPlacement {
    #[serde(default = "new_placement_id")]
    pub id: String,
    pub machine: String,
    pub tool_type: String,
    #[serde(default)]
    pub tool_size: String,
    #[serde(deserialize_with = "cell_number_from_any")]
    pub cell_number: String,
    #[serde(default = "Utc::now")]
    pub date_added: DateTime<Utc>,
}

/// Placement request coming from a form or the API
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlacement {
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub tool_type: String,
    #[serde(default)]
    pub tool_size: String,
    #[serde(default, deserialize_with = "cell_number_from_any")]
    pub cell_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn now(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub auto_backup: bool,
    /// Client pull interval in milliseconds
    pub sync_interval: u64,
    pub activity_log_cap: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_backup: true,
            sync_interval: DEFAULT_SYNC_INTERVAL_MS,
            activity_log_cap: DEFAULT_ACTIVITY_LOG_CAP,
        }
    }
}

/// Full store state, exchanged whole between agent and kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub version: String,
    pub revision: u64,
    pub machines: Vec<Machine>,
    pub tool_types: ToolTypes,
    pub tools: Vec<ToolPlacement>,
    pub activity_log: Vec<ActivityEntry>,
    pub settings: Settings,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            revision: 0,
            machines: Vec::new(),
            tool_types: ToolTypes::new(),
            tools: Vec::new(),
            activity_log: Vec::new(),
            settings: Settings::default(),
        }
    }
}

impl Snapshot {
    /// Empty store with the standard tool type catalog
    pub fn with_standard_tool_types() -> Self {
        let mut snapshot = Self::default();
        snapshot.ensure_tool_types(STANDARD_TOOL_TYPES.iter().copied());
        snapshot
    }

    /// Adds any missing tool type with an empty size list, returns how many were added
    pub fn ensure_tool_types<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) -> usize {
        let mut added = 0;
        for name in names {
            if !self.tool_types.contains_key(name) {
                self.tool_types.insert(name.to_string(), Vec::new());
                added += 1;
            }
        }
        added
    }

    pub fn machine_by_name(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.name == name)
    }

    pub fn placement_at(&self, machine: &str, cell: &str) -> Option<&ToolPlacement> {
        let cell = normalize_cell(cell);
        self.tools
            .iter()
            .find(|t| t.machine == machine && normalize_cell(&t.cell_number) == cell)
    }

    pub fn next_machine_id(&self) -> u64 {
        self.machines.iter().map(|m| m.id).max().unwrap_or(0) + 1
    }
}

fn new_placement_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Canonical form of a cell label: numeric labels lose padding ("07" -> "7")
pub fn normalize_cell(cell: &str) -> String {
    let trimmed = cell.trim();
    match trimmed.parse::<u32>() {
        Ok(n) => n.to_string(),
        Err(_) => trimmed.to_string(),
    }
}

// Older clients send cellNumber as a JSON number
fn cell_number_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CellRepr {
        Text(String),
        Number(u64),
    }

    Ok(match CellRepr::deserialize(deserializer)? {
        CellRepr::Text(s) => s,
        CellRepr::Number(n) => n.to_string(),
    })
}
