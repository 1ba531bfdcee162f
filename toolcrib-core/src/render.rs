//! View projections
//!
//! Pure functions from store state (plus a filter selection) to what a
//! screen shows: cell pickers, the grouped tool table, option lists and the
//! admin dashboard figures.

use crate::models::{normalize_cell, ActivityEntry, Machine, MachineStatus, Snapshot, ToolPlacement, ToolTypes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub const RECENT_ACTIVITY_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellOption {
    pub number: u32,
    pub label: String,
    /// Occupied cells are shown but not selectable
    pub occupied: bool,
}

/// Cells holding a placement on `machine`, in canonical form
pub fn occupied_cells(tools: &[ToolPlacement], machine: &str) -> BTreeSet<String> {
    tools
        .iter()
        .filter(|t| t.machine == machine)
        .map(|t| normalize_cell(&t.cell_number))
        .collect()
}

/// Cell picker for a machine; unknown or empty selection gives no options
pub fn cell_options(machines: &[Machine], tools: &[ToolPlacement], machine: &str) -> Vec<CellOption> {
    let Some(found) = machines.iter().find(|m| m.name == machine) else {
        return Vec::new();
    };
    let occupied = occupied_cells(tools, machine);
    (1..=found.cells)
        .map(|number| {
            let taken = occupied.contains(&number.to_string());
            let label = if taken {
                format!("Cell {number} (occupied)")
            } else {
                format!("Cell {number}")
            };
            CellOption {
                number,
                label,
                occupied: taken,
            }
        })
        .collect()
}

/// Table filter, empty strings mean "all"
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementFilter {
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub tool_type: Option<String>,
}

impl PlacementFilter {
    fn matches(&self, tool: &ToolPlacement) -> bool {
        let wanted = |f: &Option<String>, v: &str| match f.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(f) => f == v,
        };
        wanted(&self.machine, &tool.machine) && wanted(&self.tool_type, &tool.tool_type)
    }
}

pub fn filter_placements(tools: &[ToolPlacement], filter: &PlacementFilter) -> Vec<ToolPlacement> {
    tools.iter().filter(|t| filter.matches(t)).cloned().collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRow {
    pub tool_type: String,
    /// "-" when the placement has no size
    pub tool_size: String,
    pub cell_number: String,
    pub age: String,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineGroup {
    pub machine: String,
    pub rows: Vec<PlacementRow>,
}

/// Groups placements by machine, in first-seen order
pub fn group_by_machine(tools: &[ToolPlacement], now: DateTime<Utc>) -> Vec<MachineGroup> {
    let mut groups: Vec<MachineGroup> = Vec::new();
    for tool in tools {
        let row = PlacementRow {
            tool_type: tool.tool_type.clone(),
            tool_size: if tool.tool_size.is_empty() {
                "-".to_string()
            } else {
                tool.tool_size.clone()
            },
            cell_number: tool.cell_number.clone(),
            age: format_age(tool.date_added, now),
            date_added: tool.date_added,
        };
        match groups.iter_mut().find(|g| g.machine == tool.machine) {
            Some(group) => group.rows.push(row),
            None => groups.push(MachineGroup {
                machine: tool.machine.clone(),
                rows: vec![row],
            }),
        }
    }
    groups
}

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Relative age counted in elapsed 24-hour periods, a partial period rounding
/// up: up to 24h is "Today", up to 48h "Yesterday", then "N days ago".
pub fn format_age(date_added: DateTime<Utc>, now: DateTime<Utc>) -> String {
    // dates dans le futur (horloge client en avance) = aujourd'hui
    let elapsed = (now - date_added).num_milliseconds().max(0);
    let days = ((elapsed + DAY_MS - 1) / DAY_MS - 1).max(0);
    match days {
        0 => "Today".to_string(),
        1 => "Yesterday".to_string(),
        n => format!("{n} days ago"),
    }
}

pub fn machine_options(machines: &[Machine]) -> Vec<String> {
    machines.iter().map(|m| m.name.clone()).collect()
}

pub fn tool_type_options(tool_types: &ToolTypes) -> Vec<String> {
    tool_types.keys().cloned().collect()
}

pub fn status_label(status: MachineStatus) -> &'static str {
    match status {
        MachineStatus::Active => "Active",
        MachineStatus::Maintenance => "Maintenance",
        MachineStatus::Inactive => "Inactive",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_tools: usize,
    /// Distinct (machine, cell) pairs holding a tool
    pub occupied_cells: usize,
    pub active_machines: usize,
    pub free_cells: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub stats: DashboardStats,
    pub recent_activity: Vec<ActivityEntry>,
}

pub fn dashboard_stats(snapshot: &Snapshot) -> DashboardStats {
    let occupied: HashSet<(&str, &str)> = snapshot
        .tools
        .iter()
        .map(|t| (t.machine.as_str(), t.cell_number.as_str()))
        .collect();
    let total_cells: u64 = snapshot.machines.iter().map(|m| u64::from(m.cells)).sum();
    DashboardStats {
        total_tools: snapshot.tools.len(),
        occupied_cells: occupied.len(),
        active_machines: snapshot
            .machines
            .iter()
            .filter(|m| m.status == MachineStatus::Active)
            .count(),
        free_cells: total_cells.saturating_sub(occupied.len() as u64),
    }
}

/// Newest first
pub fn recent_activity(log: &[ActivityEntry], limit: usize) -> Vec<ActivityEntry> {
    log.iter().rev().take(limit).cloned().collect()
}

pub fn dashboard(snapshot: &Snapshot) -> Dashboard {
    Dashboard {
        stats: dashboard_stats(snapshot),
        recent_activity: recent_activity(&snapshot.activity_log, RECENT_ACTIVITY_LEN),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub tools_by_machine: BTreeMap<String, usize>,
    pub tools_by_type: BTreeMap<String, usize>,
    pub generated_at: Option<DateTime<Utc>>,
}

pub fn usage_report(tools: &[ToolPlacement], now: DateTime<Utc>) -> UsageReport {
    let mut report = UsageReport {
        generated_at: Some(now),
        ..Default::default()
    };
    for tool in tools {
        *report.tools_by_machine.entry(tool.machine.clone()).or_default() += 1;
        *report.tools_by_type.entry(tool.tool_type.clone()).or_default() += 1;
    }
    report
}
