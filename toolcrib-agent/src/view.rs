//! Terminal rendering of the store projections

use chrono::{DateTime, Local, Utc};
use std::fmt::Write;
use toolcrib_core::render::{self, CellOption, MachineGroup};
use toolcrib_core::{size_hint, Machine, ToolTypes};

use crate::kv_store::SyncState;

pub fn render_table(groups: &[MachineGroup]) -> String {
    if groups.is_empty() {
        return "No tools placed.\n".to_string();
    }
    let mut out = String::new();
    for group in groups {
        let _ = writeln!(out, "== {} ==", group.machine);
        let _ = writeln!(out, "  {:<20} {:<10} {:>5}  {}", "Type", "Size", "Cell", "Added");
        for row in &group.rows {
            let _ = writeln!(
                out,
                "  {:<20} {:<10} {:>5}  {}",
                row.tool_type, row.tool_size, row.cell_number, row.age
            );
        }
    }
    out
}

pub fn render_cells(machine: &str, options: &[CellOption]) -> String {
    if options.is_empty() {
        return format!("Unknown machine '{machine}'.\n");
    }
    let free = options.iter().filter(|o| !o.occupied).count();
    let mut out = format!("{machine}: {free}/{} cells free\n", options.len());
    for option in options {
        let mark = if option.occupied { 'x' } else { ' ' };
        let _ = writeln!(out, "  [{mark}] {}", option.label);
    }
    out
}

pub fn render_machines(machines: &[Machine]) -> String {
    if machines.is_empty() {
        return "No machines.\n".to_string();
    }
    let mut out = String::new();
    for m in machines {
        let _ = writeln!(
            out,
            "  #{:<4} {:<20} {:>4} cells  {}",
            m.id,
            m.name,
            m.cells,
            render::status_label(m.status)
        );
    }
    out
}

pub fn render_tool_types(tool_types: &ToolTypes) -> String {
    let mut out = String::new();
    for (name, sizes) in tool_types {
        let sizes = if sizes.is_empty() {
            format!("free size ({})", size_hint(name))
        } else {
            sizes.join(", ")
        };
        let _ = writeln!(out, "  {:<24} {}", name, sizes);
    }
    out
}

fn local_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

pub fn render_status(server_url: &str, state: &SyncState, local_revision: u64) -> String {
    let base = state
        .base_revision
        .map(|r| r.to_string())
        .unwrap_or_else(|| "none".to_string());
    format!(
        "server:          {server_url}\n\
         server revision: {base}\n\
         local revision:  {local_revision}\n\
         pending changes: {}\n\
         last pull:       {}\n\
         last push:       {}\n",
        if state.dirty { "yes" } else { "no" },
        local_time(state.last_pull),
        local_time(state.last_push),
    )
}
