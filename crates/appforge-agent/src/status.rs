use std::time::Duration;

use appforge_process::{ProjectPatch, ProjectRecord, ProjectStatus, preview_path};
use futures_util::future::join_all;

use crate::command_runner::CommandError;
use crate::error::RegistryError;
use crate::project_locks::ProjectLocks;
use crate::registry::Registry;
use crate::runtime::ContainerRuntime;

/// Any response in this range means the project's server is up, even if it
/// rejects the probe path.
pub fn is_healthy_status(code: u16) -> bool {
    (200..=499).contains(&code)
}

#[derive(Debug, Clone)]
pub struct StatusCollector {
    http: reqwest::Client,
    host: String,
}

impl StatusCollector {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to build probe client, using defaults");
                reqwest::Client::new()
            });
        Self {
            http,
            host: host.into(),
        }
    }

    /// One GET against the project's port. Errors are connection-level only.
    pub async fn probe(&self, port: u16) -> Result<u16, reqwest::Error> {
        let url = format!("http://{}:{port}/", self.host);
        let resp = self.http.get(url).send().await?;
        Ok(resp.status().as_u16())
    }

    /// Live status for `record`.
    ///
    /// A runtime query failure is returned to the caller. A probe failure only
    /// downgrades `healthy`.
    pub async fn collect(
        &self,
        runtime: &ContainerRuntime,
        record: &ProjectRecord,
    ) -> Result<ProjectStatus, CommandError> {
        let running = runtime.is_running(&record.container_name).await?;
        if !running {
            return Ok(ProjectStatus::stopped());
        }

        let healthy = match self.probe(record.port).await {
            Ok(code) => is_healthy_status(code),
            Err(e) => {
                tracing::debug!(project_id = %record.id, port = record.port, error = %e, "health probe failed");
                false
            }
        };
        Ok(ProjectStatus::new(true, healthy))
    }
}

/// Recompute status for every tracked project and persist once.
///
/// The pass holds every project's lock from the runtime query to the save, so
/// a start or stop never interleaves with it. A runtime failure for one
/// project marks it stopped and does not stop the pass; only the final save
/// can fail.
pub async fn reconcile_all(
    registry: &Registry,
    runtime: &ContainerRuntime,
    collector: &StatusCollector,
    locks: &ProjectLocks,
) -> Result<Vec<ProjectRecord>, RegistryError> {
    let listed = registry.list_all().await;
    let _guards = locks.acquire_all(listed.iter().map(|r| &r.id)).await;
    // Re-read under the locks. Projects created after the listing wait for
    // the next pass.
    let records: Vec<ProjectRecord> = {
        let mut out = Vec::with_capacity(listed.len());
        for rec in &listed {
            if let Some(current) = registry.get(&rec.id).await {
                out.push(current);
            }
        }
        out
    };

    let statuses = join_all(records.iter().map(|rec| async move {
        match collector.collect(runtime, rec).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(project_id = %rec.id, error = %e, "status query failed during reconcile");
                ProjectStatus::stopped()
            }
        }
    }))
    .await;

    let patches: Vec<_> = records
        .iter()
        .zip(statuses)
        .map(|(rec, status)| {
            let patch = ProjectPatch {
                status: Some(status),
                preview_path: Some(preview_path(&rec.id)),
                ..ProjectPatch::default()
            };
            (rec.id.clone(), patch)
        })
        .collect();

    let updated = registry.update_many(&patches).await?;
    let running = updated.iter().filter(|r| r.running).count();
    tracing::info!(projects = updated.len(), running, "reconciled project status");
    Ok(updated)
}

#[derive(Clone)]
pub struct StatusPoller {
    registry: Registry,
    runtime: ContainerRuntime,
    collector: StatusCollector,
    locks: ProjectLocks,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(
        registry: Registry,
        runtime: ContainerRuntime,
        collector: StatusCollector,
        locks: ProjectLocks,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            runtime,
            collector,
            locks,
            interval,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.tick().await;
            }
        })
    }

    async fn tick(&self) {
        let pass = reconcile_all(&self.registry, &self.runtime, &self.collector, &self.locks);
        if let Err(e) = pass.await {
            tracing::warn!(error = %e, "periodic reconcile failed to persist");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc};

    use appforge_process::ProjectId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::testing::{FakeDocker, temp_dir_for};

    fn collector() -> StatusCollector {
        StatusCollector::new("127.0.0.1", Duration::from_secs(2))
    }

    /// A port nothing listens on.
    fn refused_port() -> u16 {
        let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    /// Minimal HTTP server answering every request with `status`.
    async fn serve_status(status: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = sock.read(&mut buf).await;
                    let resp = format!(
                        "HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                });
            }
        });
        port
    }

    fn record(id: &str, port: u16) -> ProjectRecord {
        ProjectRecord::new(ProjectId::from(id), "n", "t", PathBuf::from("/w"), port)
    }

    #[test]
    fn healthy_range_is_2xx_to_4xx() {
        assert!(is_healthy_status(200));
        assert!(is_healthy_status(302));
        assert!(is_healthy_status(404));
        assert!(!is_healthy_status(199));
        assert!(!is_healthy_status(500));
        assert!(!is_healthy_status(503));
    }

    #[tokio::test]
    async fn running_with_refused_probe_is_unhealthy() {
        let fake = Arc::new(FakeDocker::default());
        let rt = ContainerRuntime::new(fake.clone(), RuntimeConfig::default());
        let rec = record("a", refused_port());
        fake.set_running(&rec.container_name, rec.port);

        let st = collector().collect(&rt, &rec).await.unwrap();
        assert!(st.running());
        assert!(!st.healthy());
    }

    #[tokio::test]
    async fn running_with_answering_server_is_healthy() {
        let fake = Arc::new(FakeDocker::default());
        let rt = ContainerRuntime::new(fake.clone(), RuntimeConfig::default());
        let rec = record("a", serve_status("404 Not Found").await);
        fake.set_running(&rec.container_name, rec.port);

        let st = collector().collect(&rt, &rec).await.unwrap();
        assert!(st.running() && st.healthy());
    }

    #[tokio::test]
    async fn server_error_is_unhealthy() {
        let fake = Arc::new(FakeDocker::default());
        let rt = ContainerRuntime::new(fake.clone(), RuntimeConfig::default());
        let rec = record("a", serve_status("502 Bad Gateway").await);
        fake.set_running(&rec.container_name, rec.port);

        let st = collector().collect(&rt, &rec).await.unwrap();
        assert!(st.running());
        assert!(!st.healthy());
    }

    #[tokio::test]
    async fn not_running_never_probes_and_is_unhealthy() {
        let fake = Arc::new(FakeDocker::default());
        let rt = ContainerRuntime::new(fake.clone(), RuntimeConfig::default());
        let mut rec = record("a", serve_status("200 OK").await);
        rec.running = true;
        rec.healthy = true;

        let st = collector().collect(&rt, &rec).await.unwrap();
        assert_eq!(st, ProjectStatus::stopped());
    }

    #[tokio::test]
    async fn reconcile_converges_after_out_of_band_kill() {
        let root = temp_dir_for("reconcile");
        let reg = Registry::open(root.join("projects.json")).await;
        let fake = Arc::new(FakeDocker::default());
        let rt = ContainerRuntime::new(fake.clone(), RuntimeConfig::default());

        let a = record("a", refused_port());
        let b = record("b", refused_port());
        for r in [&a, &b] {
            fake.set_running(&r.container_name, r.port);
            reg.put(r.clone()).await.unwrap();
            reg.update(&r.id, &ProjectPatch::status(ProjectStatus::new(true, true)))
                .await
                .unwrap();
        }

        fake.kill(&a.container_name);
        let updated = reconcile_all(&reg, &rt, &collector(), &ProjectLocks::default())
            .await
            .unwrap();
        assert_eq!(updated.len(), 2);

        let on_disk = crate::registry::load(reg.path()).await;
        let a_disk = &on_disk[&a.id];
        assert!(!a_disk.running && !a_disk.healthy);
        let b_disk = &on_disk[&b.id];
        assert!(b_disk.running);
        assert_eq!(b_disk.port, b.port);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn reconcile_survives_runtime_outage() {
        let root = temp_dir_for("reconcile-outage");
        let reg = Registry::open(root.join("projects.json")).await;
        let fake = Arc::new(FakeDocker::default());
        let rt = ContainerRuntime::new(fake.clone(), RuntimeConfig::default());

        let mut a = record("a", 4300);
        a.preview_path = String::new();
        reg.put(a.clone()).await.unwrap();
        reg.update(&a.id, &ProjectPatch::status(ProjectStatus::new(true, true)))
            .await
            .unwrap();

        fake.set_unreachable(true);
        let updated = reconcile_all(&reg, &rt, &collector(), &ProjectLocks::default())
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert!(!updated[0].running && !updated[0].healthy);
        assert_eq!(updated[0].preview_path, "/preview/a/");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn reconcile_waits_for_a_held_project_lock() {
        let root = temp_dir_for("reconcile-locked");
        let reg = Registry::open(root.join("projects.json")).await;
        let fake = Arc::new(FakeDocker::default());
        let rt = ContainerRuntime::new(fake.clone(), RuntimeConfig::default());
        let locks = ProjectLocks::default();

        let a = record("a", refused_port());
        fake.set_running(&a.container_name, a.port);
        reg.put(a.clone()).await.unwrap();

        // Stand in for a stop that is mid-flight.
        let held = locks.acquire(&a.id).await;
        let pass = {
            let (reg, rt, locks) = (reg.clone(), rt.clone(), locks.clone());
            tokio::spawn(async move { reconcile_all(&reg, &rt, &collector(), &locks).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pass.is_finished());

        fake.kill(&a.container_name);
        reg.update(&a.id, &ProjectPatch::status(ProjectStatus::stopped()))
            .await
            .unwrap();
        drop(held);

        let updated = tokio::time::timeout(Duration::from_secs(10), pass)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!updated[0].running);
        assert!(!reg.get(&a.id).await.unwrap().running);

        let _ = std::fs::remove_dir_all(&root);
    }
}
