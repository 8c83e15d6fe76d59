use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "TRANSCRIBE_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    /// Host engine driven through requests and notifications.
    Native,
    /// Recognition pipeline running on a background context in this process.
    InProcess,
}

impl BackendKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "native" | "host" => Some(Self::Native),
            "web" | "in-process" | "inprocess" => Some(Self::InProcess),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Native => Self::InProcess,
            Self::InProcess => Self::Native,
        }
    }
}

/// Timing knobs shared by both adapters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdapterSettings {
    /// Abandon an attempt after this long without any engine activity.
    pub stall_timeout: Option<Duration>,
    /// How often background loops wake up to check for shutdown.
    pub poll_interval: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            stall_timeout: Some(Duration::from_secs(300)),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub backend: BackendKind,
    pub adapter: AdapterSettings,
    pub state_path: PathBuf,
    pub model_cache_dir: PathBuf,
    /// Executable speaking the host-engine line protocol.
    pub host_engine_path: Option<PathBuf>,
    pub host_engine_args: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Native,
            adapter: AdapterSettings::default(),
            state_path: crate::store::default_state_path(),
            model_cache_dir: crate::web::default_model_cache_dir(),
            host_engine_path: None,
            host_engine_args: Vec::new(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides(ENV_PREFIX);
        config
    }

    fn apply_env_overrides(&mut self, prefix: &str) {
        let parse_env = |suffix: &str| std::env::var(format!("{prefix}{suffix}")).ok();

        if let Some(backend) = parse_env("BACKEND") {
            match BackendKind::parse(&backend) {
                Some(kind) => self.backend = kind,
                None => log::warn!("Ignoring unknown {prefix}BACKEND value {backend:?}"),
            }
        }
        if let Some(secs) = parse_env("STALL_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()) {
            self.adapter.stall_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_env("REQUEST_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok())
        {
            self.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(path) = parse_env("STATE_PATH").filter(|p| !p.trim().is_empty()) {
            self.state_path = PathBuf::from(path);
        }
        if let Some(path) = parse_env("MODEL_CACHE").filter(|p| !p.trim().is_empty()) {
            self.model_cache_dir = PathBuf::from(path);
        }
        if let Some(path) = parse_env("HOST_ENGINE").filter(|p| !p.trim().is_empty()) {
            self.host_engine_path = Some(PathBuf::from(path));
        }
        if let Some(args) = parse_env("HOST_ENGINE_ARGS") {
            self.host_engine_args = args.split_whitespace().map(str::to_string).collect();
        }
    }
}
