use std::{path::PathBuf, time::Duration};

const DEFAULT_DATA_ROOT: &str = "./data";
const DEFAULT_PORT_RANGE_START: u16 = 4300;
const DEFAULT_PORT_RANGE_END: u16 = 4399;
const DEFAULT_RUNTIME_BIN: &str = "docker";
const DEFAULT_RUNTIME_IMAGE: &str = "node:20-alpine";
const DEFAULT_CONTAINER_PORT: u16 = 3000;
const DEFAULT_CONTAINER_COMMAND: &str = "npm install && npm run dev";
const DEFAULT_UPSTREAM_HOST: &str = "127.0.0.1";
const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 2000;
const DEFAULT_STATUS_POLL_INTERVAL_SEC: u64 = 15;
const DEFAULT_LOG_TAIL: usize = 200;
const MAX_LOG_TAIL: usize = 5000;

/// Inclusive range of host ports handed out to projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Option<Self> {
        if start == 0 || start > end {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_RANGE_START,
            end: DEFAULT_PORT_RANGE_END,
        }
    }
}

/// How project containers are launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub bin: String,
    pub image: String,
    pub container_port: u16,
    pub container_command: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bin: DEFAULT_RUNTIME_BIN.to_string(),
            image: DEFAULT_RUNTIME_IMAGE.to_string(),
            container_port: DEFAULT_CONTAINER_PORT,
            container_command: DEFAULT_CONTAINER_COMMAND.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub templates_dir: PathBuf,
    pub port_range: PortRange,
    pub runtime: RuntimeConfig,
    /// Host used to reach published project ports (health probe + preview).
    pub upstream_host: String,
    pub health_timeout: Duration,
    /// `None` disables the periodic reconciliation pass.
    pub status_poll_interval: Option<Duration>,
    pub log_tail_default: usize,
}

impl AgentConfig {
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            templates_dir: data_root.join("templates"),
            data_root,
            port_range: PortRange::default(),
            runtime: RuntimeConfig::default(),
            upstream_host: DEFAULT_UPSTREAM_HOST.to_string(),
            health_timeout: Duration::from_millis(DEFAULT_HEALTH_TIMEOUT_MS),
            status_poll_interval: Some(Duration::from_secs(DEFAULT_STATUS_POLL_INTERVAL_SEC)),
            log_tail_default: DEFAULT_LOG_TAIL,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let num = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());

        let data_root = var("APPFORGE_DATA_ROOT").unwrap_or_else(|| DEFAULT_DATA_ROOT.to_string());
        let mut cfg = Self::with_data_root(data_root);

        if let Some(dir) = var("APPFORGE_TEMPLATES_DIR") {
            cfg.templates_dir = PathBuf::from(dir);
        }

        let start = num("APPFORGE_PORT_RANGE_START")
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(DEFAULT_PORT_RANGE_START);
        let end = num("APPFORGE_PORT_RANGE_END")
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(DEFAULT_PORT_RANGE_END);
        cfg.port_range = PortRange::new(start, end).unwrap_or_else(|| {
            tracing::warn!(start, end, "invalid port range, using defaults");
            PortRange::default()
        });

        if let Some(bin) = var("APPFORGE_RUNTIME_BIN") {
            cfg.runtime.bin = bin;
        }
        if let Some(image) = var("APPFORGE_RUNTIME_IMAGE") {
            cfg.runtime.image = image;
        }
        if let Some(port) = num("APPFORGE_CONTAINER_PORT").and_then(|v| u16::try_from(v).ok())
            && port != 0
        {
            cfg.runtime.container_port = port;
        }
        if let Some(cmd) = var("APPFORGE_CONTAINER_COMMAND") {
            cfg.runtime.container_command = cmd;
        }
        if let Some(host) = var("APPFORGE_UPSTREAM_HOST") {
            cfg.upstream_host = host;
        }

        cfg.health_timeout = Duration::from_millis(
            num("APPFORGE_HEALTH_TIMEOUT_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(DEFAULT_HEALTH_TIMEOUT_MS),
        );

        cfg.status_poll_interval = match num("APPFORGE_STATUS_POLL_INTERVAL_SEC") {
            Some(0) => None,
            Some(v) => Some(Duration::from_secs(v.clamp(1, 24 * 60 * 60))),
            None => Some(Duration::from_secs(DEFAULT_STATUS_POLL_INTERVAL_SEC)),
        };

        cfg.log_tail_default = num("APPFORGE_LOG_TAIL_DEFAULT")
            .map(|v| (v as usize).clamp(1, MAX_LOG_TAIL))
            .unwrap_or(DEFAULT_LOG_TAIL);

        cfg
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_root.join("state").join("projects.json")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_root.join("workspaces")
    }

    /// Clamp a caller-supplied tail length.
    pub fn log_tail(&self, requested: Option<usize>) -> usize {
        match requested {
            None | Some(0) => self.log_tail_default,
            Some(n) => n.min(MAX_LOG_TAIL),
        }
    }
}
