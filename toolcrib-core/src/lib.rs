//! Tool crib core: data model, typed store, size validation and view
//! projections shared by the kernel, the agent and the devkit.

pub mod backend;
pub mod events;
pub mod models;
pub mod render;
pub mod store;
pub mod validation;

pub use backend::{JsonFileBackend, MemoryBackend, SnapshotBackend};
pub use events::{ChangeJournal, ChangeKind, ChangeSink, ChangesPage, ReplaceSource, StoreEvent};
pub use models::{
    ActivityEntry, Machine, MachineStatus, MachineUpdate, NewMachine, NewPlacement, Settings, Snapshot,
    ToolPlacement, ToolTypes,
};
pub use store::{AddedPlacement, DeletePolicy, Store, StoreError, StoreOptions};
pub use validation::{size_hint, validate_tool_size, SizeCheck, SizeError};
