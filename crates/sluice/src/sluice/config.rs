use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::sluice::tunnel::{
    client::ClientOptions,
    protocol::Secret,
    server::ServerOptions,
    spec::TunnelSpec,
    transport::ServerUrl,
};

pub const CONFIG_ENV: &str = "SLUICE_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
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

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps SLUICE_CONFIG into the flag already; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
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
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("sluice.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["sluice.toml", "sluice.yaml", "sluice.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no sluice.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/sluice/sluice.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "sluice", "sluice")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("sluice.toml"))
    }
}

/// Writes the default template when `path` does not exist. Returns whether it did.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
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

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {other:?}"),
    };

    Config::from_file_config(fc, path)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Empty disables the admin server.
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub reload: ReloadConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// `None` runs in open mode.
    pub users_file: Option<PathBuf>,
    pub proxy_upstream: Option<String>,
    pub static_dir: Option<PathBuf>,
    pub tunnel: ServerOptions,
    pub tls: Option<ServerTlsConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    pub cert: CertSource,
    /// Require client certificates issued by these CAs (file or directory).
    pub client_ca_file: Option<PathBuf>,
    /// Also terminate TLS on reverse tunnel listeners.
    pub terminate_reverse: bool,
}

#[derive(Debug, Clone)]
pub enum CertSource {
    Files { cert_file: PathBuf, key_file: PathBuf },
    SelfSigned,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: ServerUrl,
    pub tunnel: ClientOptions,
    pub headers: BTreeMap<String, String>,
    pub tls: ClientTlsConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    pub ca_file: Option<PathBuf>,
    pub server_name: Option<String>,
    pub skip_verify: bool,
    /// Presented when the server asks for a client certificate.
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    reload: Option<FileReload>,
    server: Option<FileServer>,
    client: Option<FileClient>,
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
struct FileReload {
    #[serde(default)]
    enabled: bool,
    poll_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    users_file: Option<String>,
    allow_reverse: Option<bool>,
    proxy_upstream: Option<String>,
    static_dir: Option<String>,
    keepalive_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    max_streams: Option<i64>,
    tls: Option<FileServerTls>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServerTls {
    cert_file: Option<String>,
    key_file: Option<String>,
    #[serde(default)]
    self_signed: bool,
    client_ca_file: Option<String>,
    #[serde(default)]
    terminate_reverse: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_url: String,
    auth: Option<String>,
    #[serde(default)]
    specs: Vec<String>,
    keepalive_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    max_retry_count: Option<i64>,
    min_retry_interval_ms: Option<i64>,
    max_retry_interval_ms: Option<i64>,
    stable_after_ms: Option<i64>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    tls: Option<FileClientTls>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClientTls {
    ca_file: Option<String>,
    server_name: Option<String>,
    #[serde(default)]
    skip_verify: bool,
    cert_file: Option<String>,
    key_file: Option<String>,
}

fn millis(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => default,
    }
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Relative paths in the file are relative to the file's directory.
fn resolve_path(base: &Path, s: &Option<String>) -> Option<PathBuf> {
    let p = PathBuf::from(non_empty(s)?);
    if p.is_absolute() {
        return Some(p);
    }
    Some(base.join(p))
}

impl Config {
    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let base = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            reload: ReloadConfig {
                enabled: fc.reload.as_ref().map(|r| r.enabled).unwrap_or(true),
                poll_interval: millis(
                    fc.reload.as_ref().and_then(|r| r.poll_interval_ms),
                    Duration::from_millis(1000),
                ),
            },
            server: None,
            client: None,
        };

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

        // --- Server ---
        if let Some(s) = &fc.server {
            let defaults = ServerOptions::default();
            let tls = match &s.tls {
                None => None,
                Some(t) => {
                    let cert = resolve_path(&base, &t.cert_file);
                    let key = resolve_path(&base, &t.key_file);
                    let client_ca_file = resolve_path(&base, &t.client_ca_file);
                    let source = match (cert, key, t.self_signed) {
                        (Some(cert_file), Some(key_file), _) => Some(CertSource::Files {
                            cert_file,
                            key_file,
                        }),
                        (None, None, true) => Some(CertSource::SelfSigned),
                        (None, None, false) => None,
                        _ => anyhow::bail!(
                            "config: server.tls needs both cert_file and key_file"
                        ),
                    };
                    match source {
                        Some(cert) => Some(ServerTlsConfig {
                            cert,
                            client_ca_file,
                            terminate_reverse: t.terminate_reverse,
                        }),
                        None if client_ca_file.is_some() || t.terminate_reverse => anyhow::bail!(
                            "config: server.tls client_ca_file and terminate_reverse need a certificate"
                        ),
                        None => None,
                    }
                }
            };
            let max_streams = match s.max_streams {
                Some(n) if n > 0 => n as usize,
                Some(n) => anyhow::bail!("config: server.max_streams must be positive, got {n}"),
                None => defaults.max_streams,
            };
            let proxy_upstream = non_empty(&s.proxy_upstream);
            if let Some(u) = &proxy_upstream {
                reqwest::Url::parse(u)
                    .with_context(|| format!("config: invalid server.proxy_upstream {u:?}"))?;
            }

            cfg.server = Some(ServerConfig {
                listen_addr: non_empty(&s.listen_addr).unwrap_or_else(|| ":8080".into()),
                users_file: resolve_path(&base, &s.users_file),
                proxy_upstream,
                static_dir: resolve_path(&base, &s.static_dir),
                tunnel: ServerOptions {
                    keepalive: millis(s.keepalive_ms, defaults.keepalive),
                    handshake_timeout: millis(s.handshake_timeout_ms, defaults.handshake_timeout),
                    dial_timeout: millis(s.dial_timeout_ms, defaults.dial_timeout),
                    max_streams,
                    allow_reverse: s.allow_reverse.unwrap_or(true),
                },
                tls,
            });
        }

        // --- Client ---
        if let Some(c) = &fc.client {
            let server_url: ServerUrl = c
                .server_url
                .parse()
                .context("config: client.server_url")?;

            let specs: Vec<String> = c
                .specs
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            for (i, s) in specs.iter().enumerate() {
                s.parse::<TunnelSpec>()
                    .map_err(|e| anyhow::anyhow!("config: client.specs[{i}] {s:?}: {e}"))?;
            }

            // `user:secret`; the secret may itself contain ':'.
            let (user, secret) = match non_empty(&c.auth) {
                Some(a) => match a.split_once(':') {
                    Some((u, p)) => (u.to_string(), p.to_string()),
                    None => (a, String::new()),
                },
                None => (String::new(), String::new()),
            };

            let defaults = ClientOptions::default();
            let tunnel = ClientOptions {
                user,
                secret: Secret::new(secret),
                specs,
                keepalive: millis(c.keepalive_ms, defaults.keepalive),
                dial_timeout: millis(c.dial_timeout_ms, defaults.dial_timeout),
                handshake_timeout: millis(c.handshake_timeout_ms, defaults.handshake_timeout),
                max_streams: defaults.max_streams,
                max_retry_count: c.max_retry_count.unwrap_or(defaults.max_retry_count),
                min_retry_interval: millis(c.min_retry_interval_ms, defaults.min_retry_interval),
                max_retry_interval: millis(c.max_retry_interval_ms, defaults.max_retry_interval),
                stable_after: millis(c.stable_after_ms, defaults.stable_after),
            };
            if tunnel.min_retry_interval > tunnel.max_retry_interval {
                anyhow::bail!(
                    "config: client.min_retry_interval_ms exceeds client.max_retry_interval_ms"
                );
            }

            let tls = c
                .tls
                .as_ref()
                .map(|t| ClientTlsConfig {
                    ca_file: resolve_path(&base, &t.ca_file),
                    server_name: non_empty(&t.server_name),
                    skip_verify: t.skip_verify,
                    cert_file: resolve_path(&base, &t.cert_file),
                    key_file: resolve_path(&base, &t.key_file),
                })
                .unwrap_or_default();
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                anyhow::bail!("config: client.tls needs both cert_file and key_file");
            }

            cfg.client = Some(ClientConfig {
                server_url,
                tunnel,
                headers: c.headers.clone(),
                tls,
            });
        }

        if cfg.server.is_none() && cfg.client.is_none() {
            anyhow::bail!(
                "config: nothing to run in {} (configure [server] and/or [client])",
                config_path.display()
            );
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Sluice configuration (auto-generated)
#
# This file was created because Sluice could not find a configuration file at
# the resolved config path.
#
# The default runs a tunnel server on :8080 in open mode: any client may connect
# and register tunnels. Set server.users_file before exposing it anywhere.

admin_addr = "127.0.0.1:9090"

[server]
listen_addr = ":8080"
# users_file = "users.toml"
allow_reverse = true
# proxy_upstream = "http://127.0.0.1:3000"
# static_dir = "public"

# [server.tls]
# cert_file = "cert.pem"
# key_file = "key.pem"
# self_signed = false
# client_ca_file = "clients-ca.pem"
# terminate_reverse = false

# [client]
# server_url = "https://tunnel.example.com"
# auth = "user:secret"
# specs = ["R:2222:localhost:22"]

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[reload]
enabled = true
poll_interval_ms = 1000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Sluice configuration (auto-generated)
#
# This file was created because Sluice could not find a configuration file at
# the resolved config path.
#
# The default runs a tunnel server on :8080 in open mode: any client may connect
# and register tunnels. Set server.users_file before exposing it anywhere.

admin_addr: "127.0.0.1:9090"

server:
  listen_addr: ":8080"
  # users_file: "users.yaml"
  allow_reverse: true
  # tls:
  #   cert_file: "cert.pem"
  #   key_file: "key.pem"

# client:
#   server_url: "https://tunnel.example.com"
#   auth: "user:secret"
#   specs: ["R:2222:localhost:22"]

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

reload:
  enabled: true
  poll_interval_ms: 1000
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "sluice_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn server_and_client_sections_are_normalized() {
        let dir = temp_dir("full");
        let cfg_path = dir.join("sluice.toml");

        let toml = r#"
admin_addr = ":9090"

[server]
listen_addr = "0.0.0.0:443"
users_file = "users.toml"
allow_reverse = false
keepalive_ms = 10000
max_streams = 64

[server.tls]
cert_file = "/etc/ssl/cert.pem"
key_file = "key.pem"
client_ca_file = "ca"
terminate_reverse = true

[client]
server_url = "wss://tunnel.example.com:8443/t"
auth = "alice:pa:ss"
specs = ["R:2222:localhost:22", " 5432 "]
max_retry_count = 5
headers = { "x-tenant" = "blue" }

[client.tls]
server_name = "tunnel.internal"
skip_verify = true
cert_file = "client.pem"
key_file = "client.key"
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");

        let s = cfg.server.expect("server");
        assert_eq!(s.listen_addr, "0.0.0.0:443");
        assert_eq!(s.users_file, Some(dir.join("users.toml")));
        assert!(!s.tunnel.allow_reverse);
        assert_eq!(s.tunnel.keepalive, Duration::from_secs(10));
        assert_eq!(s.tunnel.max_streams, 64);
        let tls = s.tls.expect("server tls");
        match tls.cert {
            CertSource::Files { cert_file, key_file } => {
                assert_eq!(cert_file, PathBuf::from("/etc/ssl/cert.pem"));
                assert_eq!(key_file, dir.join("key.pem"));
            }
            other => panic!("unexpected tls {other:?}"),
        }
        assert_eq!(tls.client_ca_file, Some(dir.join("ca")));
        assert!(tls.terminate_reverse);

        let c = cfg.client.expect("client");
        assert!(c.server_url.tls);
        assert_eq!(c.server_url.addr.port, 8443);
        assert_eq!(c.tunnel.user, "alice");
        assert_eq!(c.tunnel.secret.expose(), "pa:ss");
        assert_eq!(c.tunnel.specs, vec!["R:2222:localhost:22", "5432"]);
        assert_eq!(c.tunnel.max_retry_count, 5);
        assert_eq!(c.tunnel.min_retry_interval, Duration::from_secs(1));
        assert_eq!(c.headers.get("x-tenant").map(String::as_str), Some("blue"));
        assert_eq!(c.tls.server_name.as_deref(), Some("tunnel.internal"));
        assert!(c.tls.skip_verify);
        assert_eq!(c.tls.cert_file, Some(dir.join("client.pem")));
        assert_eq!(c.tls.key_file, Some(dir.join("client.key")));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_client_only() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("sluice.yaml");
        let yaml = r#"
client:
  server_url: "http://127.0.0.1:8080"
  specs: ["3000"]
logging:
  level: debug
"#;
        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert!(cfg.server.is_none());
        assert_eq!(cfg.logging.level, "debug");
        let c = cfg.client.expect("client");
        assert!(!c.server_url.tls);
        assert_eq!(c.tunnel.max_retry_count, -1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn nothing_to_run_is_an_error() {
        let dir = temp_dir("empty");
        let cfg_path = dir.join("sluice.toml");
        std::fs::write(&cfg_path, "admin_addr = \":9090\"\n").expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("nothing to run"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_input_is_rejected() {
        let dir = temp_dir("invalid");
        let cfg_path = dir.join("sluice.toml");

        for bad in [
            "listeners = []\n[server]\n",
            "[client]\nserver_url = \"http://x\"\nspecs = [\"53/udp\"]\n",
            "[client]\nserver_url = \"ftp://x\"\n",
            "[server]\nmax_streams = 0\n",
            "[server.tls]\ncert_file = \"c.pem\"\n",
            "[server]\n[server.tls]\nclient_ca_file = \"ca.pem\"\n",
            "[client]\nserver_url = \"https://x\"\n[client.tls]\ncert_file = \"c.pem\"\n",
        ] {
            std::fs::write(&cfg_path, bad).expect("write");
            assert!(load_config(&cfg_path).is_err(), "accepted: {bad}");
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn generated_templates_load() {
        let dir = temp_dir("template");
        for name in ["sluice.toml", "sluice.yaml"] {
            let p = dir.join("nested").join(name);
            assert!(ensure_config_file(&p).expect("ensure"));
            assert!(!ensure_config_file(&p).expect("ensure again"));
            let cfg = load_config(&p).expect("load template");
            let s = cfg.server.expect("server");
            assert_eq!(s.listen_addr, ":8080");
            assert!(s.users_file.is_none());
            assert!(cfg.client.is_none());
        }
        assert!(ensure_config_file(&dir.join("sluice.ini")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_resolves_to_config_inside() {
        let dir = temp_dir("resolve");
        std::fs::write(dir.join("sluice.yml"), "server: {}\n").expect("write");
        let r = resolve_config_path(Some(dir.clone())).expect("resolve");
        assert_eq!(r.path, dir.join("sluice.yml"));
        assert!(matches!(r.source, ConfigPathSource::Flag));

        let r = resolve_config_path(Some(dir.join("other"))).expect("resolve");
        assert_eq!(r.path, dir.join("other.toml"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
