pub mod dict;
pub mod events;
pub mod factory;
pub mod launcher;
pub mod manager;
pub mod rerun;
pub mod service;
pub mod store;
pub mod testing;
pub mod tool;

pub use dict::ParamDict;
pub use events::{EventSink, Severity, ToolchainEvent};
pub use factory::Factory;
pub use launcher::{
    LaunchEvent, LaunchEventKind, LaunchSpec, Launcher, LauncherFactory, LauncherKind,
    ProcessLauncher, StandardLaunchers,
};
pub use manager::{Manager, ManagerBuilder, ManagerSettings};
pub use rerun::{RerunCounter, MAX_RERUNS};
pub use service::{ToolchainHandle, ToolchainService};
pub use store::{ToolConfig, ToolConfigStore};
pub use tool::{Tool, ToolClass, ToolId, ToolState};
