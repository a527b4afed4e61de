use std::io;

use appforge_process::ProjectId;

use crate::command_runner::CommandError;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("persist registry at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("project not found: {0}")]
    NotFound(ProjectId),
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    #[error("invalid template {template_id}: {message}")]
    InvalidTemplate { template_id: String, message: String },
    #[error("project is not running: {0}")]
    NotRunning(ProjectId),
    #[error("no free port in range {start}-{end}")]
    NoCapacity { start: u16, end: u16 },
    #[error("invalid {field}: {message}")]
    InvalidParam {
        field: &'static str,
        message: String,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("upstream unavailable: {0}")]
    Upstream(String),
    #[error(transparent)]
    Persistence(#[from] RegistryError),
    #[error("workspace: {0:#}")]
    Workspace(anyhow::Error),
}

impl ProjectError {
    /// Stable machine-readable code carried in API error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "project_not_found",
            Self::TemplateNotFound(_) => "template_not_found",
            Self::InvalidTemplate { .. } => "invalid_template",
            Self::NotRunning(_) => "project_not_running",
            Self::NoCapacity { .. } => "no_port_capacity",
            Self::InvalidParam { .. } => "invalid_param",
            Self::Command(_) => "runtime_command_failed",
            Self::Upstream(_) => "upstream_unavailable",
            Self::Persistence(_) => "persistence_failed",
            Self::Workspace(_) => "workspace_failed",
        }
    }
}

pub type Result<T, E = ProjectError> = std::result::Result<T, E>;
