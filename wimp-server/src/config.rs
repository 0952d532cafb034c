//! Load server config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local server configuration. File: ~/.config/wimp/config.toml or /etc/wimp/config.toml.
/// Env overrides: WIMP_DOMAIN, WIMP_PORT, WIMP_ACCEPT_TIMEOUT_MS, WIMP_CONNECT_TIMEOUT_MS,
/// WIMP_LISTEN_TIMEOUT_MS, WIMP_MAX_FRAME_LEN, WIMP_MAX_QUEUE_LEN.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen domain (default 127.0.0.1).
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Listen port; 0 picks an unused one (default 0).
    #[serde(default)]
    pub port: u16,
    /// Handshake deadline for accepted connections and `accept_processes` (default 5000 ms).
    #[serde(default = "default_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// How long a receiver keeps dialing its peer (default 5000 ms).
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for `check_process_listening` (default 5000 ms).
    #[serde(default = "default_timeout_ms")]
    pub listen_timeout_ms: u64,
    /// Largest accepted frame in bytes (default 16 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Incoming queue bound; absent means unbounded.
    #[serde(default)]
    pub max_queue_len: Option<usize>,
}

fn default_domain() -> String {
    "127.0.0.1".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_max_frame_len() -> u32 {
    wimp_core::MAX_FRAME_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            port: 0,
            accept_timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_timeout_ms(),
            listen_timeout_ms: default_timeout_ms(),
            max_frame_len: default_max_frame_len(),
            max_queue_len: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    /// Apply WIMP_* variables through `lookup`. Unparsable values are ignored.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("WIMP_DOMAIN") {
            if !s.is_empty() {
                self.domain = s;
            }
        }
        if let Some(p) = lookup("WIMP_PORT").and_then(|s| s.parse().ok()) {
            self.port = p;
        }
        if let Some(ms) = lookup("WIMP_ACCEPT_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.accept_timeout_ms = ms;
        }
        if let Some(ms) = lookup("WIMP_CONNECT_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = lookup("WIMP_LISTEN_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.listen_timeout_ms = ms;
        }
        if let Some(n) = lookup("WIMP_MAX_FRAME_LEN").and_then(|s| s.parse().ok()) {
            self.max_frame_len = n;
        }
        if let Some(n) = lookup("WIMP_MAX_QUEUE_LEN").and_then(|s| s.parse().ok()) {
            self.max_queue_len = Some(n);
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

/// Load from an explicit path, then apply env vars. Falls back to defaults if the file is unreadable.
pub fn load_from(path: &Path) -> Config {
    let mut c = read_file(path).unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/wimp/config.toml"));
    }
    out.push(PathBuf::from("/etc/wimp/config.toml"));
    out
}

fn read_file(path: &Path) -> Option<Config> {
    let s = std::fs::read_to_string(path).ok()?;
    match Config::from_toml_str(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!("ignoring config {}: {}", path.display(), e);
            None
        }
    }
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            return read_file(&p);
        }
    }
    None
}
