/*!
Fixtures de données

`SnapshotBuilder` construit un snapshot réaliste en quelques lignes ;
`seeded_store` en fait un store en mémoire prêt à l'emploi.
*/

use chrono::{DateTime, Utc};
use toolcrib_core::models::STANDARD_TOOL_TYPES;
use toolcrib_core::{
    ActivityEntry, Machine, MachineStatus, MemoryBackend, Snapshot, Store, StoreOptions, ToolPlacement,
};

pub struct SnapshotBuilder {
    snapshot: Snapshot,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBuilder {
    /// Snapshot vide avec le catalogue standard
    pub fn new() -> Self {
        Self {
            snapshot: Snapshot::with_standard_tool_types(),
        }
    }

    pub fn empty() -> Self {
        Self {
            snapshot: Snapshot::default(),
        }
    }

    pub fn revision(mut self, revision: u64) -> Self {
        self.snapshot.revision = revision;
        self
    }

    pub fn machine(self, name: &str, cells: u32) -> Self {
        self.machine_with_status(name, cells, MachineStatus::Active)
    }

    pub fn machine_with_status(mut self, name: &str, cells: u32, status: MachineStatus) -> Self {
        let id = self.snapshot.next_machine_id();
        self.snapshot.machines.push(Machine {
            id,
            name: name.to_string(),
            status,
            cells,
        });
        self
    }

    pub fn tool_type(mut self, name: &str, sizes: &[&str]) -> Self {
        self.snapshot
            .tool_types
            .insert(name.to_string(), sizes.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn tool(self, machine: &str, tool_type: &str, size: &str, cell: &str) -> Self {
        self.tool_added_at(machine, tool_type, size, cell, Utc::now())
    }

    pub fn tool_added_at(
        mut self,
        machine: &str,
        tool_type: &str,
        size: &str,
        cell: &str,
        date_added: DateTime<Utc>,
    ) -> Self {
        self.snapshot.tools.push(ToolPlacement {
            id: format!("fixture-{}-{}", machine, cell),
            machine: machine.to_string(),
            tool_type: tool_type.to_string(),
            tool_size: size.to_string(),
            cell_number: cell.to_string(),
            date_added,
        });
        self
    }

    pub fn activity(mut self, action: &str) -> Self {
        self.snapshot.activity_log.push(ActivityEntry::now(action));
        self
    }

    pub fn build(self) -> Snapshot {
        self.snapshot
    }
}

/// Store en mémoire chargé avec `snapshot` (révision comprise)
pub fn seeded_store(snapshot: &Snapshot) -> anyhow::Result<Store> {
    let blob = serde_json::to_string(snapshot)?;
    let store = Store::open(Box::new(MemoryBackend::with_blob(blob)), StoreOptions::default())?;
    log::debug!("seeded store at revision {}", store.revision());
    Ok(store)
}

/// Nombre de types standard, pratique pour les assertions
pub fn standard_tool_type_count() -> usize {
    STANDARD_TOOL_TYPES.len()
}
