use std::{path::PathBuf, sync::Arc};

use appforge_process::{
    ProjectId, ProjectPatch, ProjectRecord, ProjectStatus, ProjectView, preview_path,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::command_runner::{CommandError, CommandRunner};
use crate::config::AgentConfig;
use crate::error::{ProjectError, Result};
use crate::logs_service::LogFollower;
use crate::port_alloc;
use crate::project_locks::ProjectLocks;
use crate::registry::Registry;
use crate::runtime::{ContainerRuntime, LaunchSpec};
use crate::status::{self, StatusCollector, StatusPoller};
use crate::templates::{self, TemplateStore};

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct CreateProject {
    pub template: String,
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
}

struct Inner {
    config: AgentConfig,
    registry: Registry,
    runtime: ContainerRuntime,
    templates: TemplateStore,
    collector: StatusCollector,
    locks: ProjectLocks,
    // port allocation and registration happen as one step
    create_lock: Mutex<()>,
}

/// Lifecycle controller: owns the registry and drives the container runtime.
#[derive(Clone)]
pub struct ProjectManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectManager")
            .field("data_root", &self.inner.config.data_root)
            .field("runtime", &self.inner.runtime)
            .finish_non_exhaustive()
    }
}

impl ProjectManager {
    pub fn new(
        config: AgentConfig,
        registry: Registry,
        runtime: ContainerRuntime,
        collector: StatusCollector,
    ) -> Self {
        let templates = TemplateStore::new(config.templates_dir.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                runtime,
                templates,
                collector,
                locks: ProjectLocks::default(),
                create_lock: Mutex::new(()),
            }),
        }
    }

    /// Load the registry from the configured data root and wire up the runtime.
    pub async fn open(config: AgentConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let registry = Registry::open(config.state_path()).await;
        let runtime = ContainerRuntime::new(runner, config.runtime.clone());
        let collector = StatusCollector::new(config.upstream_host.clone(), config.health_timeout);
        Self::new(config, registry, runtime, collector)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn runtime(&self) -> &ContainerRuntime {
        &self.inner.runtime
    }

    pub async fn list_templates(&self) -> Vec<String> {
        self.inner.templates.list().await
    }

    /// The record for `id`, read under the project's lock. The lock is only
    /// taken once the id is known to exist.
    async fn require_locked(
        &self,
        id: &ProjectId,
    ) -> Result<(OwnedMutexGuard<()>, ProjectRecord)> {
        self.require(id).await?;
        let guard = self.inner.locks.acquire(id).await;
        let record = self.require(id).await?;
        Ok((guard, record))
    }

    async fn require(&self, id: &ProjectId) -> Result<ProjectRecord> {
        self.inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| ProjectError::NotFound(id.clone()))
    }

    async fn persist_status(&self, id: &ProjectId, status: ProjectStatus) -> Result<ProjectView> {
        let patch = ProjectPatch {
            status: Some(status),
            preview_path: Some(preview_path(id)),
            ..ProjectPatch::default()
        };
        let updated = self
            .inner
            .registry
            .update(id, &patch)
            .await?
            .ok_or_else(|| ProjectError::NotFound(id.clone()))?;
        Ok(updated.view())
    }

    /// Copy a template into a fresh workspace and register the project.
    pub async fn create(&self, req: CreateProject) -> Result<ProjectView> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(ProjectError::InvalidParam {
                field: "name",
                message: "must be non-empty".to_string(),
            });
        }
        if req.port == Some(0) {
            return Err(ProjectError::InvalidParam {
                field: "port",
                message: "must be in 1..=65535".to_string(),
            });
        }

        let template_dir = self
            .inner
            .templates
            .resolve(&req.template)
            .await
            .ok_or_else(|| ProjectError::TemplateNotFound(req.template.clone()))?;

        let id = ProjectId::new();
        let dest = self.inner.config.workspaces_dir().join(id.as_str());
        self.inner
            .templates
            .materialize(&template_dir, &dest)
            .await
            .map_err(ProjectError::Workspace)?;

        match self.register(&id, name, &req, dest.clone()).await {
            Ok(view) => {
                tracing::info!(
                    project_id = %id,
                    template_id = %req.template,
                    port = view.record.port,
                    "project created"
                );
                Ok(view)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dest).await {
                    tracing::warn!(
                        project_id = %id,
                        path = %dest.display(),
                        error = %cleanup,
                        "failed to remove workspace of rejected project"
                    );
                }
                Err(e)
            }
        }
    }

    async fn register(
        &self,
        id: &ProjectId,
        name: &str,
        req: &CreateProject,
        dest: PathBuf,
    ) -> Result<ProjectView> {
        let workspace = tokio::fs::canonicalize(&dest)
            .await
            .map_err(|e| ProjectError::Workspace(anyhow::anyhow!("resolve {}: {e}", dest.display())))?;

        let _guard = self.inner.create_lock.lock().await;
        let port = match req.port {
            Some(p) => p,
            None => {
                port_alloc::allocate(
                    &self.inner.registry,
                    &self.inner.runtime,
                    self.inner.config.port_range,
                )
                .await?
            }
        };

        let record = ProjectRecord::new(id.clone(), name, req.template.clone(), workspace, port);
        self.inner.registry.put(record.clone()).await?;
        Ok(record.view())
    }

    /// Launch the project's container unless it is already running.
    pub async fn start(&self, id: &ProjectId) -> Result<ProjectView> {
        let (_guard, record) = self.require_locked(id).await?;
        let runtime = &self.inner.runtime;

        if runtime.is_running(&record.container_name).await? {
            tracing::debug!(project_id = %id, "container already running, skipping launch");
        } else {
            self.launch(&record).await?;
        }

        let status = self.inner.collector.collect(runtime, &record).await?;
        self.persist_status(id, status).await
    }

    async fn launch(&self, record: &ProjectRecord) -> Result<()> {
        let runtime = &self.inner.runtime;
        let manifest = templates::read_manifest(&record.workspace_path)
            .await
            .map_err(|e| ProjectError::InvalidTemplate {
                template_id: record.template_id.clone(),
                message: format!("{e:#}"),
            })?;

        // A stopped container with the same name would make `run` conflict.
        if let Err(e) = runtime.remove(&record.container_name).await {
            tracing::debug!(project_id = %record.id, error = %e, "pre-launch cleanup failed");
        }

        let defaults = runtime.config();
        let spec = LaunchSpec {
            project_id: record.id.as_str(),
            container_name: &record.container_name,
            host_port: record.port,
            workspace: &record.workspace_path,
            image: manifest.image.as_deref().unwrap_or(&defaults.image),
            command: manifest
                .command
                .as_deref()
                .unwrap_or(&defaults.container_command),
            container_port: manifest.container_port.unwrap_or(defaults.container_port),
        };
        let container_id = runtime.run(&spec).await?;
        tracing::info!(
            project_id = %record.id,
            container = %record.container_name,
            container_id = %container_id,
            port = record.port,
            image = spec.image,
            "container launched"
        );
        Ok(())
    }

    /// Remove the project's container. Stopping a stopped project is a no-op.
    pub async fn stop(&self, id: &ProjectId) -> Result<ProjectView> {
        let (_guard, record) = self.require_locked(id).await?;
        let removed = self.inner.runtime.remove(&record.container_name).await?;
        if removed {
            tracing::info!(project_id = %id, container = %record.container_name, "container removed");
        }
        self.persist_status(id, ProjectStatus::stopped()).await
    }

    /// Fresh status for one project, persisted.
    pub async fn status(&self, id: &ProjectId) -> Result<ProjectView> {
        let (_guard, record) = self.require_locked(id).await?;
        let status = self
            .inner
            .collector
            .collect(&self.inner.runtime, &record)
            .await?;
        self.persist_status(id, status).await
    }

    pub async fn reconcile_all(&self) -> Result<Vec<ProjectRecord>> {
        let updated = status::reconcile_all(
            &self.inner.registry,
            &self.inner.runtime,
            &self.inner.collector,
            &self.inner.locks,
        )
        .await?;
        Ok(updated)
    }

    /// Every project with freshly reconciled status.
    pub async fn list(&self) -> Result<Vec<ProjectView>> {
        let records = self.reconcile_all().await?;
        Ok(records.iter().map(ProjectRecord::view).collect())
    }

    /// The record for a project whose container is currently up.
    pub async fn resolve_running(&self, id: &ProjectId) -> Result<ProjectRecord> {
        let record = self.require(id).await?;
        if !self.inner.runtime.is_running(&record.container_name).await? {
            return Err(ProjectError::NotRunning(id.clone()));
        }
        Ok(record)
    }

    pub async fn tail_logs(&self, id: &ProjectId, tail: Option<usize>) -> Result<String> {
        let record = self.require(id).await?;
        let lines = self.inner.config.log_tail(tail);
        let text = self
            .inner
            .runtime
            .tail_logs(&record.container_name, lines)
            .await?;
        Ok(text)
    }

    /// Start a follow process for the project's container output.
    pub async fn follow_logs(&self, id: &ProjectId) -> Result<LogFollower> {
        let record = self.require(id).await?;
        let runtime = &self.inner.runtime;
        let args = runtime.follow_logs_args(&record.container_name);
        LogFollower::spawn(runtime.bin(), &args).map_err(|source| {
            ProjectError::Command(CommandError::Spawn {
                program: runtime.bin().to_string(),
                source,
            })
        })
    }

    /// Background reconciliation, if enabled in config.
    pub fn spawn_status_poller(&self) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.inner.config.status_poll_interval?;
        let poller = StatusPoller::new(
            self.inner.registry.clone(),
            self.inner.runtime.clone(),
            self.inner.collector.clone(),
            self.inner.locks.clone(),
            interval,
        );
        tracing::info!(interval_sec = interval.as_secs(), "status poller started");
        Some(poller.spawn())
    }
}
