use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::tunmux::tunnel::transport::{MIN_STREAM_WINDOW, parse_transport};

pub const CONFIG_ENV: &str = "TUNMUX_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Resolution order: `--config`, then `TUNMUX_CONFIG`, then `./tunmux.{toml,yaml,yml}`,
/// then the OS default location.
pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    resolve_config_path_in(
        explicit_flag_path,
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        Path::new("."),
    )
}

fn resolve_config_path_in(
    explicit_flag_path: Option<PathBuf>,
    env_path: Option<PathBuf>,
    cwd: &Path,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = env_path.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(cwd) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join("tunmux.toml")));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["tunmux.toml", "tunmux.yaml", "tunmux.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/tunmux/tunmux.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("", "", "tunmux").context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("tunmux.toml"))
    }
}

/// Writes the default template if `path` does not exist yet. Returns whether a
/// file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension_of(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {other:?}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub client: Option<ClientConfig>,
    pub server: Option<ServerConfig>,
    pub mux: MuxConfig,
    pub relay: RelayConfig,
    pub kcp: KcpConfig,
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
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub listen_addr: String,
    pub remote_addr: String,
    pub transport: String,
    pub conn: usize,
    /// `None` keeps sessions until they die.
    pub auto_expire: Option<Duration>,
    /// `None` never force-closes a retired session.
    pub scavenge_ttl: Option<Duration>,
    pub dial_timeout: Duration,
    pub retry_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub target_addr: String,
    pub transport: String,
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub keepalive: Option<Duration>,
    pub max_stream_window: u32,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub buffer_size: usize,
    pub pool_capacity: usize,
    pub close_wait: Duration,
    pub quiet: bool,
}

#[derive(Debug, Clone)]
pub struct KcpConfig {
    pub mode: String,
    pub mtu: usize,
    pub sndwnd: u16,
    pub rcvwnd: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    client: Option<FileClient>,
    server: Option<FileServer>,
    mux: Option<FileMux>,
    relay: Option<FileRelay>,
    kcp: Option<FileKcp>,
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

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    #[serde(default)]
    listen_addr: String,
    #[serde(default)]
    remote_addr: String,
    transport: Option<String>,
    conn: Option<i64>,
    auto_expire_secs: Option<i64>,
    scavenge_ttl_secs: Option<i64>,
    dial_timeout_ms: Option<i64>,
    retry_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    #[serde(default)]
    listen_addr: String,
    #[serde(default)]
    target_addr: String,
    transport: Option<String>,
    dial_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMux {
    keepalive_secs: Option<i64>,
    max_stream_window: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    buffer_size: Option<i64>,
    pool_capacity: Option<i64>,
    close_wait_secs: Option<i64>,
    #[serde(default)]
    quiet: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileKcp {
    mode: Option<String>,
    mtu: Option<i64>,
    sndwnd: Option<i64>,
    rcvwnd: Option<i64>,
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default),
    }
}

fn window(v: Option<i64>, default: u16, name: &str) -> anyhow::Result<u16> {
    match v {
        None => Ok(default),
        Some(n) if (1..=u16::MAX as i64).contains(&n) => Ok(n as u16),
        Some(n) => anyhow::bail!("config: kcp.{name} out of range: {n}"),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig::default();
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(&l.level) {
                logging.level = level;
            }
            if let Some(fmt) = non_empty(&l.format) {
                logging.format = fmt;
            }
            if let Some(out) = non_empty(&l.output) {
                logging.output = out;
            }
            logging.add_source = l.add_source;
        }

        let client = match &fc.client {
            None => None,
            Some(c) => {
                let listen_addr = c.listen_addr.trim().to_string();
                let remote_addr = c.remote_addr.trim().to_string();
                if listen_addr.is_empty() {
                    anyhow::bail!("config: client.listen_addr is required");
                }
                if remote_addr.is_empty() {
                    anyhow::bail!("config: client.remote_addr is required");
                }
                let transport = parse_transport(c.transport.as_deref().unwrap_or(""))
                    .context("config: client.transport")?;
                let conn = match c.conn {
                    None | Some(0) => 1,
                    Some(n) if n > 0 && n <= u16::MAX as i64 => n as usize,
                    Some(n) => anyhow::bail!("config: client.conn out of range: {n}"),
                };
                Some(ClientConfig {
                    listen_addr,
                    remote_addr,
                    transport,
                    conn,
                    auto_expire: match c.auto_expire_secs {
                        Some(s) if s > 0 => Some(Duration::from_secs(s as u64)),
                        _ => None,
                    },
                    scavenge_ttl: match c.scavenge_ttl_secs.unwrap_or(600) {
                        s if s < 0 => None,
                        s => Some(Duration::from_secs(s as u64)),
                    },
                    dial_timeout: millis(c.dial_timeout_ms, 5000),
                    retry_interval: millis(c.retry_interval_ms, 1000),
                })
            }
        };

        let server = match &fc.server {
            None => None,
            Some(s) => {
                let listen_addr = s.listen_addr.trim().to_string();
                let target_addr = s.target_addr.trim().to_string();
                if listen_addr.is_empty() {
                    anyhow::bail!("config: server.listen_addr is required");
                }
                if target_addr.is_empty() {
                    anyhow::bail!("config: server.target_addr is required");
                }
                Some(ServerConfig {
                    listen_addr,
                    target_addr,
                    transport: parse_transport(s.transport.as_deref().unwrap_or(""))
                        .context("config: server.transport")?,
                    dial_timeout: millis(s.dial_timeout_ms, 5000),
                })
            }
        };

        if client.is_none() && server.is_none() {
            anyhow::bail!("config: nothing to run (set [client] and/or [server])");
        }

        let fm = fc.mux.as_ref();
        let min_window = i64::from(MIN_STREAM_WINDOW);
        let max_stream_window = match fm.and_then(|m| m.max_stream_window) {
            None => min_window,
            Some(n) if (min_window..=i64::from(u32::MAX)).contains(&n) => n,
            Some(n) => anyhow::bail!(
                "config: mux.max_stream_window must be between {MIN_STREAM_WINDOW} and {}, got {n}",
                u32::MAX
            ),
        };
        let mux = MuxConfig {
            keepalive: match fm.and_then(|m| m.keepalive_secs).unwrap_or(10) {
                s if s <= 0 => None,
                s => Some(Duration::from_secs(s as u64)),
            },
            max_stream_window: max_stream_window as u32,
        };

        let fr = fc.relay.as_ref();
        let relay = RelayConfig {
            buffer_size: match fr.and_then(|r| r.buffer_size) {
                None | Some(0) => 32 * 1024,
                Some(n) if n >= 512 => n as usize,
                Some(n) => anyhow::bail!("config: relay.buffer_size too small: {n}"),
            },
            pool_capacity: fr
                .and_then(|r| r.pool_capacity)
                .filter(|n| *n > 0)
                .unwrap_or(1024) as usize,
            close_wait: Duration::from_secs(
                fr.and_then(|r| r.close_wait_secs).unwrap_or(0).max(0) as u64,
            ),
            quiet: fr.map(|r| r.quiet).unwrap_or(false),
        };

        let fk = fc.kcp.as_ref();
        let mode = fk
            .and_then(|k| non_empty(&k.mode))
            .unwrap_or_else(|| "fast".into())
            .to_ascii_lowercase();
        if !matches!(mode.as_str(), "normal" | "fast" | "fast2" | "fast3") {
            anyhow::bail!("config: kcp.mode must be normal|fast|fast2|fast3, got {mode:?}");
        }
        let kcp = KcpConfig {
            mode,
            mtu: match fk.and_then(|k| k.mtu) {
                None => 1350,
                Some(n) if (576..=1500).contains(&n) => n as usize,
                Some(n) => anyhow::bail!("config: kcp.mtu out of range: {n}"),
            },
            sndwnd: window(fk.and_then(|k| k.sndwnd), 1024, "sndwnd")?,
            rcvwnd: window(fk.and_then(|k| k.rcvwnd), 1024, "rcvwnd")?,
        };

        Ok(Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            client,
            server,
            mux,
            relay,
            kcp,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# tunmux configuration (auto-generated)
#
# This file was created because tunmux could not find a configuration file at
# the resolved config path. It runs a tunnel server that forwards every stream
# to a local service. Add a [client] section (or run a second instance with
# one) to dial it.

admin_addr = ":8080"

[server]
listen_addr = ":29900"
target_addr = "127.0.0.1:12948" # host:port or a unix socket path
transport = "tcp"               # tcp | kcp
dial_timeout_ms = 5000

# [client]
# listen_addr = ":12948"
# remote_addr = "127.0.0.1:29900"
# transport = "tcp"
# conn = 1
# auto_expire_secs = 0
# scavenge_ttl_secs = 600
# dial_timeout_ms = 5000
# retry_interval_ms = 1000

[mux]
keepalive_secs = 10
max_stream_window = 262144

[relay]
buffer_size = 32768
pool_capacity = 1024
close_wait_secs = 0
quiet = false

[kcp]
mode = "fast" # normal | fast | fast2 | fast3
mtu = 1350
sndwnd = 1024
rcvwnd = 1024

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# tunmux configuration (auto-generated)
#
# This file was created because tunmux could not find a configuration file at
# the resolved config path. It runs a tunnel server that forwards every stream
# to a local service. Add a client section (or run a second instance with one)
# to dial it.

admin_addr: ":8080"

server:
  listen_addr: ":29900"
  target_addr: "127.0.0.1:12948" # host:port or a unix socket path
  transport: "tcp"               # tcp | kcp
  dial_timeout_ms: 5000

# client:
#   listen_addr: ":12948"
#   remote_addr: "127.0.0.1:29900"
#   transport: "tcp"
#   conn: 1

mux:
  keepalive_secs: 10
  max_stream_window: 262144

relay:
  buffer_size: 32768
  pool_capacity: 1024
  close_wait_secs: 0
  quiet: false

kcp:
  mode: "fast"
  mtu: 1350
  sndwnd: 1024
  rcvwnd: 1024

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
