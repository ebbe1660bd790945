//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Node configuration. File: ~/.config/peershare/config.toml or /etc/peershare/config.toml.
/// Env overrides: PEERSHARE_LISTEN, PEERSHARE_PEERS (comma separated), PEERSHARE_REQUEST_TIMEOUT,
/// PEERSHARE_AVAILABLE_TTL, PEERSHARE_DOWNLOAD_DIR.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen address (default 0.0.0.0:47100).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Peers to dial at startup and keep reconnecting to (host:port).
    #[serde(default)]
    pub peers: Vec<String>,
    /// Seconds to wait for a transfer response (default 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Largest transfer frame in MiB (default 64).
    #[serde(default = "default_max_frame_mib")]
    pub max_frame_mib: u32,
    /// Forget announced files this many seconds after they arrived. Unset keeps them.
    #[serde(default)]
    pub available_ttl_secs: Option<u64>,
    /// Forget a peer's announced files when it disconnects.
    #[serde(default)]
    pub forget_on_disconnect: bool,
    /// Where the node keeps its secret key. Unset means a fresh identity each run.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Default destination for fetched files.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_listen() -> String {
    "0.0.0.0:47100".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_frame_mib() -> u32 {
    64
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            peers: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
            max_frame_mib: default_max_frame_mib(),
            available_ttl_secs: None,
            forget_on_disconnect: false,
            identity_file: None,
            download_dir: default_download_dir(),
        }
    }
}

impl Config {
    /// Settings for the file-sharing core.
    pub fn core(&self) -> peershare_core::Config {
        let max_frame_len = self
            .max_frame_mib
            .clamp(1, 4095)
            .saturating_mul(1024 * 1024);
        peershare_core::Config {
            max_frame_len,
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            available_ttl: self.available_ttl_secs.map(Duration::from_secs),
            forget_on_disconnect: self.forget_on_disconnect,
            ..peershare_core::Config::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

/// Load an explicitly named config file. Unlike `load`, a missing or invalid file is an error.
pub fn load_from(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut c: Config =
        toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))?;
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("PEERSHARE_LISTEN") {
        c.listen = s;
    }
    if let Some(s) = var("PEERSHARE_PEERS") {
        c.peers = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(s) = var("PEERSHARE_REQUEST_TIMEOUT") {
        if let Ok(n) = s.parse::<u64>() {
            c.request_timeout_secs = n;
        }
    }
    if let Some(s) = var("PEERSHARE_AVAILABLE_TTL") {
        if let Ok(n) = s.parse::<u64>() {
            c.available_ttl_secs = Some(n);
        }
    }
    if let Some(s) = var("PEERSHARE_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peershare/config.toml"));
    }
    out.push(PathBuf::from("/etc/peershare/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
