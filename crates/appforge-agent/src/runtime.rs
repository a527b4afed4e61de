//! Container runtime integration, driven through its command-line interface.
//!
//! Every call goes through a [`CommandRunner`]; nothing here talks to the
//! runtime daemon directly.

use std::{collections::BTreeSet, path::Path, sync::Arc};

use crate::command_runner::{CommandError, CommandRunner};
use crate::config::RuntimeConfig;

const MANAGED_BY_LABEL: &str = "appforge.managed_by=appforge-agent";

/// Everything needed to launch one project container.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub project_id: &'a str,
    pub container_name: &'a str,
    pub host_port: u16,
    pub workspace: &'a Path,
    pub image: &'a str,
    pub command: &'a str,
    pub container_port: u16,
}

fn is_missing_container(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("no such container") || s.contains("no such object")
}

pub(crate) fn build_run_args(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut out = Vec::<String>::new();

    out.push("run".to_string());
    out.push("--detach".to_string());
    out.push("--name".to_string());
    out.push(spec.container_name.to_string());

    out.push("--label".to_string());
    out.push(format!("appforge.project_id={}", spec.project_id));
    out.push("--label".to_string());
    out.push(MANAGED_BY_LABEL.to_string());

    out.push("--publish".to_string());
    out.push(format!("{}:{}", spec.host_port, spec.container_port));
    out.push("--env".to_string());
    out.push(format!("PORT={}", spec.container_port));

    out.push("--mount".to_string());
    out.push(format!(
        "type=bind,source={},target=/workspace",
        spec.workspace.display()
    ));
    out.push("--workdir".to_string());
    out.push("/workspace".to_string());

    out.push(spec.image.to_string());
    out.push("sh".to_string());
    out.push("-c".to_string());
    out.push(spec.command.to_string());

    out
}

fn args(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[derive(Clone)]
pub struct ContainerRuntime {
    runner: Arc<dyn CommandRunner>,
    config: RuntimeConfig,
}

impl std::fmt::Debug for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContainerRuntime {
    pub fn new(runner: Arc<dyn CommandRunner>, config: RuntimeConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bin(&self) -> &str {
        &self.config.bin
    }

    /// Whether the named container exists and is running.
    pub async fn is_running(&self, name: &str) -> Result<bool, CommandError> {
        let argv = args(&["inspect", "--format", "{{.State.Running}}", name]);
        match self.runner.run(self.bin(), &argv).await {
            Ok(out) => Ok(out.trim() == "true"),
            Err(e) if is_missing_container(e.stderr()) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Launch a detached container. Returns the runtime's container id.
    pub async fn run(&self, spec: &LaunchSpec<'_>) -> Result<String, CommandError> {
        let argv = build_run_args(spec);
        self.runner.run(self.bin(), &argv).await
    }

    /// Force-remove a container. `Ok(false)` if there was nothing to remove.
    pub async fn remove(&self, name: &str) -> Result<bool, CommandError> {
        let argv = args(&["rm", "--force", name]);
        match self.runner.run(self.bin(), &argv).await {
            // Newer CLIs exit 0 without output when the container is absent.
            Ok(out) => Ok(!out.is_empty()),
            Err(e) if is_missing_container(e.stderr()) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Host ports currently published by any container on this runtime.
    pub async fn published_ports(&self) -> Result<BTreeSet<u16>, CommandError> {
        let argv = args(&["ps", "--format", "{{json .}}"]);
        let out = self.runner.run(self.bin(), &argv).await?;
        Ok(parse_published_ports(&out))
    }

    /// Last `lines` lines of a container's combined output.
    pub async fn tail_logs(&self, name: &str, lines: usize) -> Result<String, CommandError> {
        let lines = lines.to_string();
        let argv = args(&["logs", "--tail", &lines, name]);
        let out = self.runner.output(self.bin(), &argv).await?;
        if out.stderr.is_empty() {
            return Ok(out.stdout);
        }
        if out.stdout.is_empty() {
            return Ok(out.stderr);
        }
        Ok(format!("{}{}", out.stdout, out.stderr))
    }

    /// Arguments for a follow process that emits only new output.
    pub fn follow_logs_args(&self, name: &str) -> Vec<String> {
        args(&["logs", "--follow", "--tail", "0", name])
    }
}

/// Extract host ports from runtime port listings.
///
/// Accepts line-oriented text (`0.0.0.0:4300->3000/tcp, :::4300->3000/tcp`),
/// one JSON object per line with a `Ports` string, or a JSON array of objects
/// whose `Ports` is either such a string or a list of `{host_port, range}`
/// mappings. Anything unrecognized contributes nothing.
pub fn parse_published_ports(raw: &str) -> BTreeSet<u16> {
    let mut out = BTreeSet::new();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return out;
    }

    if trimmed.starts_with('[')
        && let Ok(serde_json::Value::Array(items)) = serde_json::from_str(trimmed)
    {
        for item in &items {
            ports_from_json(item, &mut out);
        }
        return out;
    }

    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('{')
            && let Ok(v) = serde_json::from_str::<serde_json::Value>(line)
        {
            ports_from_json(&v, &mut out);
            continue;
        }
        ports_from_text(line, &mut out);
    }
    out
}

fn ports_from_json(item: &serde_json::Value, out: &mut BTreeSet<u16>) {
    let Some(ports) = item.get("Ports").or_else(|| item.get("ports")) else {
        return;
    };
    match ports {
        serde_json::Value::String(s) => ports_from_text(s, out),
        serde_json::Value::Array(mappings) => {
            for m in mappings {
                let Some(host) = m
                    .get("host_port")
                    .and_then(|v| v.as_u64())
                    .and_then(|v| u16::try_from(v).ok())
                else {
                    continue;
                };
                if host == 0 {
                    continue;
                }
                let range = m.get("range").and_then(|v| v.as_u64()).unwrap_or(1).max(1);
                let last = u64::from(host)
                    .saturating_add(range - 1)
                    .min(u64::from(u16::MAX));
                out.extend((u64::from(host)..=last).filter_map(|p| u16::try_from(p).ok()));
            }
        }
        _ => {}
    }
}

fn ports_from_text(text: &str, out: &mut BTreeSet<u16>) {
    for entry in text.split(',') {
        let Some((host, _internal)) = entry.trim().split_once("->") else {
            continue;
        };
        let Some((_addr, port)) = host.rsplit_once(':') else {
            continue;
        };
        match port.split_once('-') {
            Some((lo, hi)) => {
                let (Ok(lo), Ok(hi)) = (lo.parse::<u16>(), hi.parse::<u16>()) else {
                    continue;
                };
                if lo <= hi {
                    out.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(p) = port.parse::<u16>() {
                    out.insert(p);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::testing::FakeDocker;

    fn runtime(fake: &Arc<FakeDocker>) -> ContainerRuntime {
        ContainerRuntime::new(fake.clone(), RuntimeConfig::default())
    }

    #[test]
    fn parses_line_oriented_ports() {
        let raw = "0.0.0.0:4300->3000/tcp, :::4300->3000/tcp\n\n127.0.0.1:4305->80/tcp\n3000/tcp\n";
        assert_eq!(parse_published_ports(raw), BTreeSet::from([4300, 4305]));
    }

    #[test]
    fn parses_json_lines() {
        let raw = r#"{"Names":"appforge-a","Ports":"0.0.0.0:4301->3000/tcp, [::]:4301->3000/tcp"}
{"Names":"other","Ports":""}"#;
        assert_eq!(parse_published_ports(raw), BTreeSet::from([4301]));
    }

    #[test]
    fn parses_json_array_with_structured_mappings() {
        let raw = r#"[{"Names":["x"],"Ports":[{"host_ip":"","container_port":3000,"host_port":4310,"range":2,"protocol":"tcp"}]},
{"Names":["y"],"Ports":null}]"#;
        assert_eq!(parse_published_ports(raw), BTreeSet::from([4310, 4311]));
    }

    #[test]
    fn oversized_json_range_stops_at_last_port() {
        let raw = r#"[{"Ports":[{"host_port":65534,"range":18446744073709551615}]}]"#;
        assert_eq!(parse_published_ports(raw), BTreeSet::from([65534, 65535]));
    }

    #[test]
    fn parses_port_ranges_in_text() {
        let raw = "0.0.0.0:4320-4322->3000-3002/tcp";
        assert_eq!(parse_published_ports(raw), BTreeSet::from([4320, 4321, 4322]));
    }

    #[test]
    fn garbage_yields_empty_set() {
        assert!(parse_published_ports("").is_empty());
        assert!(parse_published_ports("CONTAINER ID   IMAGE").is_empty());
        assert!(parse_published_ports("{broken json").is_empty());
        assert!(parse_published_ports("[1, 2").is_empty());
    }

    #[test]
    fn run_args_bind_port_and_workspace() {
        let ws = PathBuf::from("/data/workspaces/p1");
        let argv = build_run_args(&LaunchSpec {
            project_id: "p1",
            container_name: "appforge-p1",
            host_port: 4300,
            workspace: &ws,
            image: "node:20-alpine",
            command: "npm start",
            container_port: 3000,
        });
        assert_eq!(argv[0], "run");
        assert!(argv.windows(2).any(|w| w[0] == "--name" && w[1] == "appforge-p1"));
        assert!(argv.windows(2).any(|w| w[0] == "--publish" && w[1] == "4300:3000"));
        assert!(argv.iter().any(|a| a == "type=bind,source=/data/workspaces/p1,target=/workspace"));
        assert_eq!(&argv[argv.len() - 4..], ["node:20-alpine", "sh", "-c", "npm start"]);
    }

    #[tokio::test]
    async fn missing_container_is_not_running() {
        let fake = Arc::new(FakeDocker::default());
        let rt = runtime(&fake);
        assert!(!rt.is_running("appforge-nope").await.unwrap());

        fake.set_running("appforge-a", 4300);
        assert!(rt.is_running("appforge-a").await.unwrap());
    }

    #[tokio::test]
    async fn daemon_errors_are_not_swallowed() {
        let fake = Arc::new(FakeDocker::default());
        fake.set_unreachable(true);
        let rt = runtime(&fake);
        let err = rt.is_running("appforge-a").await.unwrap_err();
        assert!(err.stderr().contains("Cannot connect"));
        assert!(rt.published_ports().await.is_err());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let fake = Arc::new(FakeDocker::default());
        fake.set_running("appforge-a", 4300);
        let rt = runtime(&fake);
        assert!(rt.remove("appforge-a").await.unwrap());
        assert!(!rt.remove("appforge-a").await.unwrap());
    }

    #[tokio::test]
    async fn published_ports_reads_runtime_listing() {
        let fake = Arc::new(FakeDocker::default());
        fake.set_running("appforge-a", 4300);
        fake.publish_foreign("0.0.0.0:4302->8080/tcp");
        let rt = runtime(&fake);
        assert_eq!(
            rt.published_ports().await.unwrap(),
            BTreeSet::from([4300, 4302])
        );
    }

    #[tokio::test]
    async fn tail_merges_both_streams() {
        let fake = Arc::new(FakeDocker::default());
        fake.set_logs("out line\n", "err line\n");
        let rt = runtime(&fake);
        let text = rt.tail_logs("appforge-a", 10).await.unwrap();
        assert_eq!(text, "out line\nerr line\n");
        assert!(
            fake.calls()
                .iter()
                .any(|c| c == &["logs", "--tail", "10", "appforge-a"])
        );
    }
}
