use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tone_bus::{Admission, PipelineSettings};

const DEFAULT_CONFIG_PATH: &str = "tubetone.toml";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TubeConfig {
    pub listen: String,
    /// Pipelines allowed to run at the same time.
    pub max_concurrent_sessions: usize,
    /// How long a request may queue for a free slot before 503.
    pub admission_wait_ms: u64,
    pub pipeline: PipelineSettings,
}

impl Default for TubeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_sessions: 4,
            admission_wait_ms: 2000,
            pipeline: PipelineSettings::default(),
        }
    }
}

impl TubeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Defaults when the file does not exist, error when it is malformed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) =>
            {
                log::info!("config {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Supported variables:
    /// - TUBETONE_LISTEN → listen
    /// - TUBETONE_MAX_SESSIONS → max_concurrent_sessions
    /// - TUBETONE_YTDLP → pipeline.source.program
    /// - TUBETONE_FFMPEG → pipeline.transcoder.program
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(listen) = var("TUBETONE_LISTEN") {
            self.listen = listen;
        }
        if let Some(max) = var("TUBETONE_MAX_SESSIONS") {
            match max.trim().parse() {
                Ok(max) => self.max_concurrent_sessions = max,
                Err(_) => log::warn!("ignoring TUBETONE_MAX_SESSIONS={:?}", max),
            }
        }
        if let Some(program) = var("TUBETONE_YTDLP") {
            self.pipeline.source.program = program;
        }
        if let Some(program) = var("TUBETONE_FFMPEG") {
            self.pipeline.transcoder.program = program;
        }
        self
    }

    pub fn admission(&self) -> Admission {
        Admission::new(
            self.max_concurrent_sessions,
            Duration::from_millis(self.admission_wait_ms),
        )
    }
}

static CONFIG: OnceLock<TubeConfig> = OnceLock::new();

fn config_path() -> PathBuf {
    std::env::var_os("TUBETONE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn init_config() -> anyhow::Result<&'static TubeConfig> {
    let config = TubeConfig::load_or_default(&config_path())?.with_env_overrides();
    CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("config already initialized"))?;
    Ok(self::config())
}

pub fn config() -> &'static TubeConfig {
    CONFIG.get_or_init(TubeConfig::default)
}
