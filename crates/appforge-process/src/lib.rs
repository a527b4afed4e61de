use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};

/// Stable project identifier, generated once at creation.
///
/// NOTE: The id doubles as a path segment (workspace dir, preview path), so it
/// is always a UUID we generated ourselves, never caller input.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "project".to_string()
    } else {
        out
    }
}

/// Runtime handle for a project's container.
pub fn container_name(id: &ProjectId) -> String {
    format!("appforge-{}", sanitize_name(id.as_str()))
}

/// Public path the preview proxy serves a project under.
pub fn preview_path(id: &ProjectId) -> String {
    format!("/preview/{}/", id.as_str())
}

/// Coarse lifecycle state shown to clients. Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Starting,
    Running,
    Stopped,
}

/// Live status as observed by the status collector.
///
/// Health is only meaningful for a running process, so `healthy` can never be
/// true while `running` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct ProjectStatus {
    running: bool,
    healthy: bool,
}

impl ProjectStatus {
    pub fn new(running: bool, healthy: bool) -> Self {
        Self {
            running,
            healthy: running && healthy,
        }
    }

    pub fn stopped() -> Self {
        Self::default()
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    pub fn state(&self) -> ProjectState {
        match (self.running, self.healthy) {
            (false, _) => ProjectState::Stopped,
            (true, false) => ProjectState::Starting,
            (true, true) => ProjectState::Running,
        }
    }
}

/// Partial update merged into a record by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub status: Option<ProjectStatus>,
    pub preview_path: Option<String>,
}

impl ProjectPatch {
    pub fn status(status: ProjectStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub name: String,
    pub template_id: String,
    pub workspace_path: PathBuf,
    pub port: u16,
    pub container_name: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub preview_path: String,
    pub created_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(
        id: ProjectId,
        name: impl Into<String>,
        template_id: impl Into<String>,
        workspace_path: PathBuf,
        port: u16,
    ) -> Self {
        Self {
            container_name: container_name(&id),
            preview_path: preview_path(&id),
            id,
            name: name.into(),
            template_id: template_id.into(),
            workspace_path,
            port,
            running: false,
            healthy: false,
            created_at: Utc::now(),
        }
    }

    pub fn status(&self) -> ProjectStatus {
        ProjectStatus::new(self.running, self.healthy)
    }

    pub fn apply(&mut self, patch: &ProjectPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(status) = patch.status {
            self.running = status.running();
            self.healthy = status.healthy();
        }
        if let Some(path) = &patch.preview_path {
            self.preview_path = path.clone();
        }
    }

    pub fn view(&self) -> ProjectView {
        ProjectView {
            record: self.clone(),
            state: self.status().state(),
        }
    }
}

/// Record enriched with derived fields, as returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProjectView {
    #[serde(flatten)]
    pub record: ProjectRecord,
    pub state: ProjectState,
}
