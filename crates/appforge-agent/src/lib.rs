//! Project orchestration core: registry, ports, container lifecycle, status
//! reconciliation and log streaming. The HTTP surface lives in
//! `appforge-control`.

pub mod command_runner;
pub mod config;
pub mod error;
pub mod logs_service;
pub mod port_alloc;
pub mod project_locks;
pub mod project_manager;
pub mod registry;
pub mod runtime;
pub mod status;
pub mod templates;

#[cfg(test)]
mod testing;

pub use command_runner::{CommandError, CommandOutput, CommandRunner, TokioCommandRunner};
pub use config::{AgentConfig, PortRange, RuntimeConfig};
pub use error::{ProjectError, RegistryError};
pub use logs_service::{LogEvent, LogFollower};
pub use project_locks::ProjectLocks;
pub use project_manager::{CreateProject, ProjectManager};
