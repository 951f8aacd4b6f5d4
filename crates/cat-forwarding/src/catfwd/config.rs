use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::catfwd::tunnel::{forward::DEFAULT_BUFFER_SIZE, protocol::DEFAULT_HANDSHAKE_TIMEOUT};

pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:7000";
const CONFIG_CANDIDATES: [&str; 3] = [
    "cat-forwarding.toml",
    "cat-forwarding.yaml",
    "cat-forwarding.yml",
];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    /// `--config` or `CATFWD_CONFIG`.
    Flag,
    Cwd,
    User,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::User => write!(f, "user"),
        }
    }
}

/// Finds the config file to load, if any.
///
/// An explicitly named file must exist. Otherwise the working directory and
/// then the per-user config dir are searched; finding nothing is fine and
/// means built-in defaults.
pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<Option<ResolvedConfigPath>> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        let meta = fs::metadata(&p).with_context(|| format!("config: stat {}", p.display()))?;
        let path = if meta.is_dir() {
            discover_config_path(&p)?
        } else {
            p
        };
        return Ok(Some(ResolvedConfigPath {
            path,
            source: ConfigPathSource::Flag,
        }));
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        }));
    }

    if let Some(proj) = ProjectDirs::from("com", "catforwarding", "cat-forwarding") {
        if let Ok(p) = discover_config_path(proj.config_dir()) {
            return Ok(Some(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::User,
            }));
        }
    }

    Ok(None)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in CONFIG_CANDIDATES {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no cat-forwarding.* found in {}", dir.display())
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .toml or .yaml/.yml)", ext),
    };

    Config::from_file_config(fc)
}

/// Settings for one run, built once at startup and handed to the session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay address, `host:port`.
    pub server_addr: String,
    /// Client version tag embedded in the handshake.
    pub version: String,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub local_host: String,
    pub buffer_size: usize,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.into(),
            version: env!("CARGO_PKG_VERSION").into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            local_host: "localhost".into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    server_addr: Option<String>,
    version: Option<String>,
    handshake_timeout_ms: Option<i64>,
    connect_timeout_ms: Option<i64>,
    local_host: Option<String>,
    #[serde(default)]
    buffer_size: i64,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn millis_or(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => default,
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config::default();

        if let Some(addr) = non_empty(&fc.server_addr) {
            cfg.server_addr = addr;
        }
        if let Some(v) = non_empty(&fc.version) {
            cfg.version = v;
        }
        if let Some(h) = non_empty(&fc.local_host) {
            cfg.local_host = h;
        }
        cfg.handshake_timeout = millis_or(fc.handshake_timeout_ms, cfg.handshake_timeout);
        cfg.connect_timeout = millis_or(fc.connect_timeout_ms, cfg.connect_timeout);
        if fc.buffer_size > 0 {
            cfg.buffer_size = fc.buffer_size as usize;
        }

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(&l.level) {
                cfg.logging.level = level;
            }
            if let Some(fmt) = non_empty(&l.format) {
                cfg.logging.format = fmt;
            }
            if let Some(out) = non_empty(&l.output) {
                cfg.logging.output = out;
            }
            cfg.logging.add_source = l.add_source;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `--server` / `CATFWD_SERVER`, which win over the file.
    pub fn with_server_addr(mut self, addr: Option<String>) -> anyhow::Result<Self> {
        if let Some(a) = addr {
            self.server_addr = a.trim().to_string();
            self.validate()?;
        }
        Ok(self)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let Some((host, port)) = self.server_addr.rsplit_once(':') else {
            anyhow::bail!("config: server_addr {:?} must be host:port", self.server_addr);
        };
        if host.trim().is_empty() {
            anyhow::bail!("config: server_addr {:?} is missing a host", self.server_addr);
        }
        match port.parse::<u16>() {
            Ok(p) if p != 0 => {}
            _ => anyhow::bail!("config: server_addr {:?} has an invalid port", self.server_addr),
        }
        if self.version.chars().any(|c| c.is_whitespace()) {
            anyhow::bail!("config: version must not contain whitespace");
        }
        Ok(())
    }
}
