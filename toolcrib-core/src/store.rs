//! Typed store over a single serialized snapshot
//!
//! Every mutation goes through `Store::commit`: the change is applied to a
//! copy of the snapshot, the revision is bumped, the blob is persisted and
//! only then is the copy swapped in. A failed write leaves memory untouched.
//! Each commit is recorded in the change journal and broadcast to
//! subscribers.

use crate::backend::{MemoryBackend, SnapshotBackend};
use crate::events::{ChangeJournal, ChangeKind, ChangesPage, ReplaceSource, StoreEvent, DEFAULT_JOURNAL_SIZE};
use crate::models::{
    normalize_cell, ActivityEntry, ACTIVITY_LOG_CAP_RANGE, Machine, MachineUpdate, NewMachine, NewPlacement, Settings, Snapshot,
    ToolPlacement, ToolTypes,
};
use crate::validation::{validate_tool_size, SizeError};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },
    #[error("Cell already occupied: {machine} cell {cell}")]
    CellOccupied { machine: String, cell: String },
    #[error("unknown machine '{0}'")]
    UnknownMachine(String),
    #[error("unknown tool type '{0}'")]
    UnknownToolType(String),
    #[error("cell '{cell}' is outside 1..={cells}")]
    InvalidCell { cell: String, cells: u32 },
    #[error(transparent)]
    InvalidSize(#[from] SizeError),
    #[error("size '{size}' is not one of the sizes allowed for '{tool_type}'")]
    SizeNotAllowed { tool_type: String, size: String },
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("{entity} '{name}' already exists")]
    Duplicate { entity: &'static str, name: String },
    #[error("{entity} '{name}' is used by {count} placement(s)")]
    InUse {
        entity: &'static str,
        name: String,
        count: usize,
    },
    #[error("machine '{machine}' still holds a tool in cell {cell}")]
    CellsInUse { machine: String, cell: String },
    #[error("revision conflict: expected {expected}, store is at {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("invalid value: {0}")]
    Invalid(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::CellOccupied { .. } => "cell_occupied",
            StoreError::UnknownMachine(_) => "unknown_machine",
            StoreError::UnknownToolType(_) => "unknown_tool_type",
            StoreError::InvalidCell { .. } => "invalid_cell",
            StoreError::InvalidSize(e) => e.code(),
            StoreError::SizeNotAllowed { .. } => "size_not_allowed",
            StoreError::MissingField(_) => "missing_field",
            StoreError::Duplicate { .. } => "duplicate",
            StoreError::InUse { .. } => "in_use",
            StoreError::CellsInUse { .. } => "cells_in_use",
            StoreError::Conflict { .. } => "conflict",
            StoreError::Invalid(_) => "invalid",
            StoreError::Serialization(_) => "serialization",
            StoreError::Io(_) => "io",
        }
    }
}

/// What to do with placements that reference a deleted machine or tool type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    #[default]
    Restrict,
    Cascade,
}

impl DeletePolicy {
    pub fn from_cascade_flag(cascade: bool) -> Self {
        if cascade {
            DeletePolicy::Cascade
        } else {
            DeletePolicy::Restrict
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Seed the standard tool types when no usable blob exists
    pub seed_tool_types: bool,
    pub journal_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            seed_tool_types: true,
            journal_size: DEFAULT_JOURNAL_SIZE,
        }
    }
}

/// Result of a successful placement add
#[derive(Debug, Clone)]
pub struct AddedPlacement {
    pub placement: ToolPlacement,
    /// Set when the size was rewritten by validation
    pub note: Option<String>,
}

struct Inner {
    snapshot: Snapshot,
    journal: ChangeJournal,
}

pub struct Store {
    inner: Mutex<Inner>,
    backend: Box<dyn SnapshotBackend>,
    events: broadcast::Sender<StoreEvent>,
    seed_tool_types: bool,
}

impl Store {
    pub fn open(backend: Box<dyn SnapshotBackend>, options: StoreOptions) -> Result<Self, StoreError> {
        let mut snapshot = match backend.read_blob()? {
            Some(blob) => match serde_json::from_str::<Snapshot>(&blob) {
                Ok(snapshot) => {
                    info!(
                        "[store] loaded {} (revision {}, {} machines, {} tools)",
                        backend.describe(),
                        snapshot.revision,
                        snapshot.machines.len(),
                        snapshot.tools.len()
                    );
                    snapshot
                }
                Err(e) => {
                    warn!("[store] corrupted blob in {}, starting fresh: {}", backend.describe(), e);
                    fresh_snapshot(&options)
                }
            },
            None => {
                info!("[store] no data in {}, starting fresh", backend.describe());
                fresh_snapshot(&options)
            }
        };

        // anciens blobs : "07" et 7 désignent la même cellule
        for tool in snapshot.tools.iter_mut() {
            tool.cell_number = normalize_cell(&tool.cell_number);
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Mutex::new(Inner {
                snapshot,
                journal: ChangeJournal::new(options.journal_size),
            }),
            backend,
            events,
            seed_tool_types: options.seed_tool_types,
        })
    }

    pub fn in_memory() -> Self {
        Self::open(Box::new(MemoryBackend::new()), StoreOptions::default())
            .unwrap_or_else(|_| unreachable!("memory backend never fails to read"))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn backend_description(&self) -> String {
        self.backend.describe()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().snapshot.revision
    }

    pub fn changes_since(&self, revision: u64) -> ChangesPage {
        let inner = self.inner.lock();
        inner.journal.since(revision, inner.snapshot.revision)
    }

    fn commit<T>(
        &self,
        apply: impl FnOnce(&mut Snapshot) -> Result<(T, ChangeKind), StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.lock();
        let mut next = inner.snapshot.clone();
        let (out, change) = apply(&mut next)?;
        next.revision = inner.snapshot.revision + 1;
        cap_activity_log(&mut next);

        let blob = serde_json::to_string(&next)?;
        self.backend.write_blob(&blob)?;

        let event = StoreEvent {
            revision: next.revision,
            at: Utc::now(),
            change,
        };
        inner.snapshot = next;
        inner.journal.record(event.clone());
        drop(inner);

        debug!("[store] committed revision {}", event.revision);
        // pas d'abonné = pas d'erreur
        let _ = self.events.send(event);
        Ok(out)
    }

    // ---- snapshot entier ----

    pub fn get_all(&self) -> Snapshot {
        self.inner.lock().snapshot.clone()
    }

    /// Replaces every collection, returns the new revision
    pub fn save_all(&self, snapshot: Snapshot) -> Result<u64, StoreError> {
        self.replace(snapshot, ReplaceSource::Local, None)
    }

    /// Replaces every collection if the store is still at `expected` (push from a client)
    pub fn save_all_if(&self, snapshot: Snapshot, expected: Option<u64>) -> Result<u64, StoreError> {
        self.replace(snapshot, ReplaceSource::Client, expected)
    }

    /// Adopts a snapshot pulled from the server
    pub fn replace_from_remote(&self, snapshot: Snapshot) -> Result<u64, StoreError> {
        self.replace(snapshot, ReplaceSource::Remote, None)
    }

    fn replace(&self, incoming: Snapshot, source: ReplaceSource, expected: Option<u64>) -> Result<u64, StoreError> {
        self.commit(|snapshot| {
            if let Some(expected) = expected {
                if expected != snapshot.revision {
                    return Err(StoreError::Conflict {
                        expected,
                        actual: snapshot.revision,
                    });
                }
            }
            let revision = snapshot.revision;
            *snapshot = incoming;
            // la révision reste celle du store, jamais celle reçue
            snapshot.revision = revision;
            validate_settings(&snapshot.settings)?;
            check_placements(snapshot)?;
            Ok((revision + 1, ChangeKind::SnapshotReplaced { source }))
        })
    }

    /// Resets every collection to a fresh store in one revision
    pub fn clear(&self) -> Result<u64, StoreError> {
        let seed = self.seed_tool_types;
        let revision = self.commit(|snapshot| {
            let revision = snapshot.revision;
            *snapshot = if seed {
                Snapshot::with_standard_tool_types()
            } else {
                Snapshot::default()
            };
            snapshot.revision = revision;
            snapshot.activity_log.push(ActivityEntry::now("Cleared all data"));
            Ok((revision + 1, ChangeKind::Cleared))
        })?;
        warn!("[store] all data cleared (revision {revision})");
        Ok(revision)
    }

    // ---- collections ----

    pub fn machines(&self) -> Vec<Machine> {
        self.inner.lock().snapshot.machines.clone()
    }

    pub fn save_machines(&self, machines: Vec<Machine>) -> Result<(), StoreError> {
        self.commit(|s| {
            s.machines = machines;
            check_placements(s)?;
            Ok(((), ChangeKind::MachinesChanged))
        })
    }

    pub fn tool_types(&self) -> ToolTypes {
        self.inner.lock().snapshot.tool_types.clone()
    }

    pub fn save_tool_types(&self, tool_types: ToolTypes) -> Result<(), StoreError> {
        self.commit(|s| {
            s.tool_types = tool_types;
            Ok(((), ChangeKind::ToolTypesChanged))
        })
    }

    pub fn tools(&self) -> Vec<ToolPlacement> {
        self.inner.lock().snapshot.tools.clone()
    }

    pub fn save_tools(&self, tools: Vec<ToolPlacement>) -> Result<(), StoreError> {
        self.commit(|s| {
            s.tools = tools;
            check_placements(s)?;
            Ok(((), ChangeKind::PlacementsReplaced))
        })
    }

    pub fn activity_log(&self) -> Vec<ActivityEntry> {
        self.inner.lock().snapshot.activity_log.clone()
    }

    pub fn save_activity_log(&self, entries: Vec<ActivityEntry>) -> Result<(), StoreError> {
        self.commit(|s| {
            s.activity_log = entries;
            Ok(((), ChangeKind::ActivityAppended))
        })
    }

    pub fn settings(&self) -> Settings {
        self.inner.lock().snapshot.settings.clone()
    }

    pub fn save_settings(&self, settings: Settings) -> Result<(), StoreError> {
        validate_settings(&settings)?;
        self.commit(|s| {
            s.settings = settings;
            Ok(((), ChangeKind::SettingsChanged))
        })
    }

    pub fn add_activity(&self, action: &str) -> Result<ActivityEntry, StoreError> {
        let action = action.trim();
        if action.is_empty() {
            return Err(StoreError::MissingField("action"));
        }
        self.commit(|s| {
            let entry = ActivityEntry::now(action);
            s.activity_log.push(entry.clone());
            Ok((entry, ChangeKind::ActivityAppended))
        })
    }

    // ---- placements ----

    pub fn add_placement(&self, request: NewPlacement) -> Result<AddedPlacement, StoreError> {
        let machine = request.machine.trim().to_string();
        let tool_type = request.tool_type.trim().to_string();
        let cell = normalize_cell(&request.cell_number);
        if machine.is_empty() {
            return Err(StoreError::MissingField("machine"));
        }
        if tool_type.is_empty() {
            return Err(StoreError::MissingField("toolType"));
        }
        if cell.is_empty() {
            return Err(StoreError::MissingField("cellNumber"));
        }
        let size = validate_tool_size(&tool_type, &request.tool_size)?;

        let added = self.commit(|s| {
            let cells = s
                .machine_by_name(&machine)
                .map(|m| m.cells)
                .ok_or_else(|| StoreError::UnknownMachine(machine.clone()))?;
            let allowed = s
                .tool_types
                .get(&tool_type)
                .ok_or_else(|| StoreError::UnknownToolType(tool_type.clone()))?;
            if !allowed.is_empty() && !allowed.iter().any(|a| a == &size.value) {
                return Err(StoreError::SizeNotAllowed {
                    tool_type: tool_type.clone(),
                    size: size.value.clone(),
                });
            }
            match cell.parse::<u32>() {
                Ok(n) if (1..=cells).contains(&n) => {}
                _ => {
                    return Err(StoreError::InvalidCell {
                        cell: cell.clone(),
                        cells,
                    })
                }
            }
            if s.placement_at(&machine, &cell).is_some() {
                return Err(StoreError::CellOccupied {
                    machine: machine.clone(),
                    cell: cell.clone(),
                });
            }

            let placement = ToolPlacement {
                id: uuid::Uuid::new_v4().to_string(),
                machine: machine.clone(),
                tool_type: tool_type.clone(),
                tool_size: size.value.clone(),
                cell_number: cell.clone(),
                date_added: Utc::now(),
            };
            s.tools.push(placement.clone());
            let change = ChangeKind::PlacementAdded {
                machine: machine.clone(),
                cell: cell.clone(),
            };
            Ok((placement, change))
        })?;

        info!("[store] placed {} {} in {} cell {}", added.tool_type, added.tool_size, added.machine, added.cell_number);
        Ok(AddedPlacement {
            placement: added,
            note: size.note,
        })
    }

    pub fn delete_placement(&self, machine: &str, cell: &str) -> Result<ToolPlacement, StoreError> {
        let cell = normalize_cell(cell);
        let removed = self.commit(|s| {
            let index = s
                .tools
                .iter()
                .position(|t| t.machine == machine && normalize_cell(&t.cell_number) == cell)
                .ok_or_else(|| StoreError::NotFound {
                    entity: "placement",
                    key: format!("{machine}/{cell}"),
                })?;
            let removed = s.tools.remove(index);
            let change = ChangeKind::PlacementRemoved {
                machine: machine.to_string(),
                cell: cell.clone(),
            };
            Ok((removed, change))
        })?;
        info!("[store] removed tool from {} cell {}", removed.machine, removed.cell_number);
        Ok(removed)
    }

    // ---- admin: machines ----

    pub fn add_machine(&self, request: NewMachine) -> Result<Machine, StoreError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::MissingField("name"));
        }
        if request.cells == 0 {
            return Err(StoreError::Invalid("cells must be at least 1".into()));
        }
        self.commit(|s| {
            if s.machine_by_name(&name).is_some() {
                return Err(StoreError::Duplicate {
                    entity: "machine",
                    name: name.clone(),
                });
            }
            let machine = Machine {
                id: s.next_machine_id(),
                name: name.clone(),
                status: request.status,
                cells: request.cells,
            };
            s.machines.push(machine.clone());
            s.activity_log.push(ActivityEntry::now(format!("Added machine: {name}")));
            Ok((machine, ChangeKind::MachinesChanged))
        })
    }

    pub fn update_machine(&self, id: u64, update: MachineUpdate) -> Result<Machine, StoreError> {
        if update.cells == Some(0) {
            return Err(StoreError::Invalid("cells must be at least 1".into()));
        }
        self.commit(|s| {
            let index = s
                .machines
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| StoreError::NotFound {
                    entity: "machine",
                    key: id.to_string(),
                })?;
            let old_name = s.machines[index].name.clone();

            let new_name = match update.name.as_deref().map(str::trim) {
                Some("") => return Err(StoreError::MissingField("name")),
                Some(name) if name != old_name => {
                    if s.machine_by_name(name).is_some() {
                        return Err(StoreError::Duplicate {
                            entity: "machine",
                            name: name.to_string(),
                        });
                    }
                    Some(name.to_string())
                }
                _ => None,
            };

            if let Some(cells) = update.cells {
                let beyond = s
                    .tools
                    .iter()
                    .filter(|t| t.machine == old_name)
                    .find(|t| t.cell_number.parse::<u32>().map_or(false, |n| n > cells));
                if let Some(t) = beyond {
                    return Err(StoreError::CellsInUse {
                        machine: old_name.clone(),
                        cell: t.cell_number.clone(),
                    });
                }
            }

            if let Some(name) = &new_name {
                for tool in s.tools.iter_mut().filter(|t| t.machine == old_name) {
                    tool.machine = name.clone();
                }
            }

            let machine = &mut s.machines[index];
            if let Some(name) = new_name {
                machine.name = name;
            }
            if let Some(cells) = update.cells {
                machine.cells = cells;
            }
            if let Some(status) = update.status {
                machine.status = status;
            }
            let updated = machine.clone();
            s.activity_log
                .push(ActivityEntry::now(format!("Updated machine: {}", updated.name)));
            Ok((updated, ChangeKind::MachinesChanged))
        })
    }

    /// Returns the deleted machine and how many placements went with it
    pub fn delete_machine(&self, id: u64, policy: DeletePolicy) -> Result<(Machine, usize), StoreError> {
        self.commit(|s| {
            let index = s
                .machines
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| StoreError::NotFound {
                    entity: "machine",
                    key: id.to_string(),
                })?;
            let name = s.machines[index].name.clone();
            let count = s.tools.iter().filter(|t| t.machine == name).count();
            if count > 0 && policy == DeletePolicy::Restrict {
                return Err(StoreError::InUse {
                    entity: "machine",
                    name,
                    count,
                });
            }
            s.tools.retain(|t| t.machine != name);
            let machine = s.machines.remove(index);
            s.activity_log
                .push(ActivityEntry::now(format!("Deleted machine: {}", machine.name)));
            Ok(((machine, count), ChangeKind::MachinesChanged))
        })
    }

    // ---- admin: types d'outils ----

    /// Creates or replaces a tool type's size list, returns true when created
    pub fn put_tool_type(&self, name: &str, sizes: Vec<String>) -> Result<bool, StoreError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::MissingField("name"));
        }
        let mut cleaned: Vec<String> = Vec::with_capacity(sizes.len());
        for size in sizes {
            let size = size.trim();
            if !size.is_empty() && !cleaned.iter().any(|c| c == size) {
                cleaned.push(size.to_string());
            }
        }
        self.commit(|s| {
            let created = s.tool_types.insert(name.clone(), cleaned).is_none();
            let verb = if created { "Added" } else { "Updated" };
            s.activity_log
                .push(ActivityEntry::now(format!("{verb} tool type: {name}")));
            Ok((created, ChangeKind::ToolTypesChanged))
        })
    }

    /// Renames a tool type and every placement using it, returns the number of placements touched
    pub fn rename_tool_type(&self, from: &str, to: &str) -> Result<usize, StoreError> {
        let to = to.trim().to_string();
        if to.is_empty() {
            return Err(StoreError::MissingField("name"));
        }
        self.commit(|s| {
            if !s.tool_types.contains_key(from) {
                return Err(StoreError::NotFound {
                    entity: "tool type",
                    key: from.to_string(),
                });
            }
            if from != to && s.tool_types.contains_key(&to) {
                return Err(StoreError::Duplicate {
                    entity: "tool type",
                    name: to.clone(),
                });
            }
            if let Some(sizes) = s.tool_types.remove(from) {
                s.tool_types.insert(to.clone(), sizes);
            }
            let mut placements = 0;
            for tool in s.tools.iter_mut().filter(|t| t.tool_type == from) {
                tool.tool_type = to.clone();
                placements += 1;
            }
            s.activity_log
                .push(ActivityEntry::now(format!("Renamed tool type: {from} -> {to}")));
            let change = ChangeKind::ToolTypeRenamed {
                from: from.to_string(),
                to: to.clone(),
                placements,
            };
            Ok((placements, change))
        })
    }

    /// Returns how many placements were removed with the type
    pub fn delete_tool_type(&self, name: &str, policy: DeletePolicy) -> Result<usize, StoreError> {
        self.commit(|s| {
            if !s.tool_types.contains_key(name) {
                return Err(StoreError::NotFound {
                    entity: "tool type",
                    key: name.to_string(),
                });
            }
            let count = s.tools.iter().filter(|t| t.tool_type == name).count();
            if count > 0 && policy == DeletePolicy::Restrict {
                return Err(StoreError::InUse {
                    entity: "tool type",
                    name: name.to_string(),
                    count,
                });
            }
            s.tools.retain(|t| t.tool_type != name);
            s.tool_types.remove(name);
            s.activity_log
                .push(ActivityEntry::now(format!("Deleted tool type: {name}")));
            Ok((count, ChangeKind::ToolTypesChanged))
        })
    }
}

fn fresh_snapshot(options: &StoreOptions) -> Snapshot {
    if options.seed_tool_types {
        Snapshot::with_standard_tool_types()
    } else {
        Snapshot::default()
    }
}

fn validate_settings(settings: &Settings) -> Result<(), StoreError> {
    if settings.sync_interval == 0 {
        return Err(StoreError::Invalid("syncInterval must be positive".into()));
    }
    if !ACTIVITY_LOG_CAP_RANGE.contains(&settings.activity_log_cap) {
        return Err(StoreError::Invalid(format!(
            "activityLogCap must be between {} and {}",
            ACTIVITY_LOG_CAP_RANGE.start(),
            ACTIVITY_LOG_CAP_RANGE.end()
        )));
    }
    Ok(())
}

/// Normalizes cell labels, then checks every placement against its machine.
/// At most one placement per machine cell.
fn check_placements(snapshot: &mut Snapshot) -> Result<(), StoreError> {
    let mut taken: HashSet<(String, String)> = HashSet::with_capacity(snapshot.tools.len());
    for tool in snapshot.tools.iter_mut() {
        tool.cell_number = normalize_cell(&tool.cell_number);
        let cells = snapshot
            .machines
            .iter()
            .find(|m| m.name == tool.machine)
            .map(|m| m.cells)
            .ok_or_else(|| StoreError::UnknownMachine(tool.machine.clone()))?;
        match tool.cell_number.parse::<u32>() {
            Ok(n) if (1..=cells).contains(&n) => {}
            _ => {
                return Err(StoreError::InvalidCell {
                    cell: tool.cell_number.clone(),
                    cells,
                })
            }
        }
        if !taken.insert((tool.machine.clone(), tool.cell_number.clone())) {
            return Err(StoreError::CellOccupied {
                machine: tool.machine.clone(),
                cell: tool.cell_number.clone(),
            });
        }
    }
    Ok(())
}

fn cap_activity_log(snapshot: &mut Snapshot) {
    let cap = snapshot.settings.activity_log_cap;
    let len = snapshot.activity_log.len();
    if len > cap {
        snapshot.activity_log.drain(..len - cap);
    }
}
