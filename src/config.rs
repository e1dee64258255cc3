use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;

use crate::tables::{AssetPaths, ScreenRole};
use crate::worker::WorkerConfig;

// ---------------------------------------------------------------------------
// ConfigFile: deserialized from TOML (all fields optional)
// ---------------------------------------------------------------------------

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub role: Option<ScreenRole>,
    #[serde(default)]
    pub cache: CacheConfigFile,
    #[serde(default)]
    pub assets: AssetsConfigFile,
    #[serde(default)]
    pub host: HostConfigFile,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct CacheConfigFile {
    pub max_cache: Option<usize>,
    pub preload_radius: Option<usize>,
    pub idle_sleep_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub segment_prefix: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct AssetsConfigFile {
    pub missing_image: Option<PathBuf>,
    pub logo: Option<PathBuf>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct HostConfigFile {
    pub max_restarts: Option<u32>,
    pub shutdown_timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Config: resolved (all fields concrete)
// ---------------------------------------------------------------------------

pub struct Config {
    pub worker: WorkerConfig,
    pub assets: AssetsConfig,
    pub host: HostConfig,
}

/// Asset overrides; unset paths fall back to files in the tables directory.
pub struct AssetsConfig {
    pub missing_image: Option<PathBuf>,
    pub logo: Option<PathBuf>,
}

pub struct HostConfig {
    pub poll_interval: Duration,
    pub max_restarts: u32,
    pub shutdown_timeout: Duration,
}

impl AssetsConfig {
    /// Resolve against the tables directory: `missing.png` and `logo.png`.
    pub fn resolve(&self, tables_root: &Path) -> AssetPaths {
        AssetPaths {
            missing_image: self
                .missing_image
                .clone()
                .unwrap_or_else(|| tables_root.join("missing.png")),
            logo: self
                .logo
                .clone()
                .unwrap_or_else(|| tables_root.join("logo.png")),
        }
    }
}

impl ConfigFile {
    /// Merge CLI values (overwrites non-None fields).
    pub fn merge_cli(
        &mut self,
        role: Option<ScreenRole>,
        max_cache: Option<usize>,
        preload_radius: Option<usize>,
    ) {
        if let Some(v) = role {
            debug!("config: CLI override role={v}");
            self.role = role;
        }
        if let Some(v) = max_cache {
            debug!("config: CLI override max_cache={v}");
            self.cache.max_cache = max_cache;
        }
        if let Some(v) = preload_radius {
            debug!("config: CLI override preload_radius={v}");
            self.cache.preload_radius = preload_radius;
        }
    }

    /// Resolve to a Config by applying defaults to missing fields.
    pub fn resolve(self) -> Config {
        let max_size = match (self.cache.max_width, self.cache.max_height) {
            (Some(w), Some(h)) => Some((w, h)),
            (Some(w), None) => Some((w, u32::MAX)),
            (None, Some(h)) => Some((u32::MAX, h)),
            (None, None) => None,
        };
        let config = Config {
            worker: WorkerConfig {
                max_cache: self.cache.max_cache.unwrap_or(10).max(1),
                preload_radius: self.cache.preload_radius.unwrap_or(4),
                idle_sleep: Duration::from_millis(self.cache.idle_sleep_ms.unwrap_or(5)),
                role: self.role.unwrap_or_default(),
                max_size,
                segment_prefix: self.cache.segment_prefix.unwrap_or_else(|| "ccache".into()),
            },
            assets: AssetsConfig {
                missing_image: self.assets.missing_image,
                logo: self.assets.logo,
            },
            host: HostConfig {
                poll_interval: Duration::from_millis(self.cache.poll_interval_ms.unwrap_or(16)),
                max_restarts: self.host.max_restarts.unwrap_or(1),
                shutdown_timeout: Duration::from_millis(
                    self.host.shutdown_timeout_ms.unwrap_or(1000),
                ),
            },
        };
        info!(
            "config: resolved role={}, max_cache={}, preload_radius={}, \
             idle_sleep={}ms, poll_interval={}ms, max_size={:?}, prefix={}, \
             max_restarts={}, shutdown_timeout={}ms",
            config.worker.role,
            config.worker.max_cache,
            config.worker.preload_radius,
            config.worker.idle_sleep.as_millis(),
            config.host.poll_interval.as_millis(),
            config.worker.max_size,
            config.worker.segment_prefix,
            config.host.max_restarts,
            config.host.shutdown_timeout.as_millis(),
        );
        config
    }
}

/// Resolve the XDG config path for carousel-cache.
fn config_path() -> Option<PathBuf> {
    let config_dir = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config"))
        })?;
    Some(config_dir.join("carousel-cache").join("config.toml"))
}

/// Load config file. Returns `ConfigFile::default()` if no file exists.
/// Returns an error if the file exists but cannot be parsed.
pub fn load_config() -> anyhow::Result<ConfigFile> {
    let path = match config_path() {
        Some(p) => p,
        None => {
            info!("config: no HOME or XDG_CONFIG_HOME set, using defaults");
            return Ok(ConfigFile::default());
        }
    };
    load_config_from(&path)
}

/// Load a specific config file; a missing file yields defaults.
pub fn load_config_from(path: &Path) -> anyhow::Result<ConfigFile> {
    debug!("config: looking for {}", path.display());
    match std::fs::read_to_string(path) {
        Ok(text) => {
            info!("config: loaded from {}", path.display());
            let cfg: ConfigFile = toml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("config: {} not found, using defaults", path.display());
            Ok(ConfigFile::default())
        }
        Err(e) => Err(anyhow::anyhow!("failed to read {}: {e}", path.display())),
    }
}
