use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

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

    // clap normally folds PROXEE_CONFIG into the flag; this covers callers that bypass it.
    if let Some(p) = std::env::var_os("PROXEE_CONFIG") {
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
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("proxee.toml"));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["proxee.toml", "proxee.yaml", "proxee.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no proxee.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/proxee/proxee.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("io", "proxee", "proxee")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("proxee.toml"))
    }
}

/// Values from flags or their environment variables. Anything set here wins
/// over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub hostname: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub rendezvous_url: Option<String>,
    pub advertised_host: Option<String>,
    pub advertised_port: Option<u16>,
    pub debug_identity: bool,
    pub admin_addr: Option<String>,
}

/// Load `path` if it exists, then layer `overrides` on top and validate.
pub fn load_config(path: &Path, overrides: &Overrides) -> anyhow::Result<Config> {
    let fc = match fs::read(path) {
        Ok(data) => parse_file_config(path, &String::from_utf8_lossy(&data))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    Config::from_file_config(fc, overrides)
}

fn parse_file_config(path: &Path, s: &str) -> anyhow::Result<FileConfig> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "toml" => toml::from_str(s).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => {
            serde_yaml::from_str(s).with_context(|| format!("parse yaml {}", path.display()))
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hostname: String,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub proxy: ProxyConfig,
    pub rendezvous: Option<RendezvousConfig>,
    pub heartbeat: HeartbeatConfig,
    pub backoff: BackoffConfig,
    pub max_concurrent_streams: usize,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub transport: String,
    pub dial_timeout: Duration,
    pub register_timeout: Option<Duration>,
}

impl ProxyConfig {
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub base_url: String,
    pub advertised_host: String,
    pub advertised_port: u16,
    pub debug_identity: bool,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub max_failures: u32,
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub selector: String,
    pub local_addr: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    hostname: String,

    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,
    proxy: Option<FileProxy>,
    rendezvous: Option<FileRendezvous>,
    heartbeat: Option<FileHeartbeat>,
    backoff: Option<FileBackoff>,
    dispatch: Option<FileDispatch>,

    #[serde(default)]
    services: Vec<FileService>,
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
struct FileProxy {
    host: Option<String>,
    port: Option<i64>,
    transport: Option<String>,
    dial_timeout_ms: Option<i64>,
    register_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRendezvous {
    base_url: Option<String>,
    advertised_host: Option<String>,
    advertised_port: Option<i64>,
    #[serde(default)]
    debug_identity: bool,
    request_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHeartbeat {
    interval_ms: Option<i64>,
    timeout_ms: Option<i64>,
    max_failures: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBackoff {
    base_ms: Option<i64>,
    jitter_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileDispatch {
    max_concurrent_streams: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileService {
    selector: String,
    local_addr: String,
}

fn millis(v: i64) -> Duration {
    Duration::from_millis(v.max(0) as u64)
}

/// Zero or negative disables the timeout.
fn optional_millis(v: Option<i64>) -> Option<Duration> {
    v.filter(|ms| *ms > 0).map(millis)
}

fn port(field: &str, v: i64) -> anyhow::Result<u16> {
    match u16::try_from(v) {
        Ok(p) if p > 0 => Ok(p),
        _ => anyhow::bail!("config: {field} must be in 1..=65535 (got {v})"),
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    fn from_file_config(fc: FileConfig, ov: &Overrides) -> anyhow::Result<Config> {
        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: non_empty(l.level).unwrap_or_else(|| "info".into()),
                format: non_empty(l.format).unwrap_or_else(|| "json".into()),
                output: non_empty(l.output).unwrap_or_else(|| "stderr".into()),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let hostname = non_empty(ov.hostname.clone())
            .unwrap_or_else(|| fc.hostname.trim().to_string());
        if hostname.is_empty() {
            anyhow::bail!("config: hostname is required (set `hostname` or PROXY_HOSTNAME)");
        }
        if hostname.contains(['\n', '\r']) {
            anyhow::bail!("config: hostname must be a single line");
        }

        let fp = fc.proxy;
        let transport = non_empty(fp.as_ref().and_then(|p| p.transport.clone()))
            .unwrap_or_else(|| "tcp".into())
            .to_ascii_lowercase();
        let proxy = ProxyConfig {
            host: non_empty(ov.proxy_host.clone())
                .or_else(|| non_empty(fp.as_ref().and_then(|p| p.host.clone())))
                .unwrap_or_default(),
            port: match (ov.proxy_port, fp.as_ref().and_then(|p| p.port)) {
                (Some(p), _) => port("proxy.port", i64::from(p))?,
                (None, Some(p)) => port("proxy.port", p)?,
                (None, None) => 0,
            },
            transport,
            dial_timeout: millis(
                fp.as_ref()
                    .and_then(|p| p.dial_timeout_ms)
                    .filter(|ms| *ms > 0)
                    .unwrap_or(5000),
            ),
            register_timeout: optional_millis(fp.as_ref().and_then(|p| p.register_timeout_ms)),
        };

        let fr = fc.rendezvous;
        let base_url = non_empty(ov.rendezvous_url.clone())
            .or_else(|| non_empty(fr.as_ref().and_then(|r| r.base_url.clone())));
        // A complete proxy address wins: legacy deployments set the base URL alongside it.
        let direct = !proxy.host.is_empty() && proxy.port != 0;
        let rendezvous = match base_url {
            Some(base_url) if !direct => {
                let advertised_host = non_empty(ov.advertised_host.clone())
                    .or_else(|| non_empty(fr.as_ref().and_then(|r| r.advertised_host.clone())))
                    .context("config: rendezvous.advertised_host is required with a rendezvous base_url")?;
                let advertised_port = match (ov.advertised_port, fr.as_ref().and_then(|r| r.advertised_port)) {
                    (Some(p), _) => port("rendezvous.advertised_port", i64::from(p))?,
                    (None, Some(p)) => port("rendezvous.advertised_port", p)?,
                    (None, None) => anyhow::bail!(
                        "config: rendezvous.advertised_port is required with a rendezvous base_url"
                    ),
                };
                Some(RendezvousConfig {
                    base_url,
                    advertised_host,
                    advertised_port,
                    debug_identity: ov.debug_identity
                        || fr.as_ref().map(|r| r.debug_identity).unwrap_or(false),
                    request_timeout: millis(
                        fr.as_ref()
                            .and_then(|r| r.request_timeout_ms)
                            .filter(|ms| *ms > 0)
                            .unwrap_or(10_000),
                    ),
                })
            }
            _ => {
                if proxy.host.is_empty() {
                    anyhow::bail!(
                        "config: proxy.host is required (or set rendezvous.base_url)"
                    );
                }
                if proxy.port == 0 {
                    anyhow::bail!("config: proxy.port is required");
                }
                None
            }
        };

        let fh = fc.heartbeat;
        let heartbeat = HeartbeatConfig {
            interval: millis(
                fh.as_ref()
                    .and_then(|h| h.interval_ms)
                    .filter(|ms| *ms > 0)
                    .unwrap_or(30_000),
            ),
            timeout: optional_millis(fh.as_ref().and_then(|h| h.timeout_ms)),
            max_failures: fh.as_ref().and_then(|h| h.max_failures).unwrap_or(0),
        };

        let fb = fc.backoff;
        let backoff = BackoffConfig {
            base: millis(fb.as_ref().and_then(|b| b.base_ms).unwrap_or(10_000)),
            jitter: millis(fb.as_ref().and_then(|b| b.jitter_ms).unwrap_or(2_000)),
        };

        let max_concurrent_streams = fc
            .dispatch
            .and_then(|d| d.max_concurrent_streams)
            .unwrap_or(0)
            .max(0) as usize;

        let mut services = Vec::with_capacity(fc.services.len());
        for (i, s) in fc.services.into_iter().enumerate() {
            let selector = s.selector.trim().to_string();
            let local_addr = s.local_addr.trim().to_string();
            if selector.is_empty() {
                anyhow::bail!("config: services[{i}] missing selector");
            }
            if local_addr.is_empty() {
                anyhow::bail!("config: services[{i}] missing local_addr");
            }
            services.push(ServiceConfig {
                selector,
                local_addr,
            });
        }

        Ok(Config {
            hostname,
            admin_addr: non_empty(ov.admin_addr.clone())
                .unwrap_or_else(|| fc.admin_addr.trim().to_string()),
            logging,
            proxy,
            rendezvous,
            heartbeat,
            backoff,
            max_concurrent_streams,
            services,
        })
    }
}

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
            "proxee_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn full_toml_config() {
        let dir = temp_dir("full");
        let cfg_path = dir.join("proxee.toml");

        let toml = r#"
hostname = "svc.example.com"
admin_addr = "127.0.0.1:9090"

[proxy]
host = "proxy.example.com"
port = 7000
dial_timeout_ms = 2500
register_timeout_ms = 4000

[heartbeat]
interval_ms = 15000
timeout_ms = 5000
max_failures = 3

[backoff]
base_ms = 1000
jitter_ms = 500

[dispatch]
max_concurrent_streams = 64

[[services]]
selector = "/http/1.1"
local_addr = " 127.0.0.1:8080 "

[logging]
level = "debug"
format = "text"
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path, &Overrides::default()).expect("load_config");
        assert_eq!(cfg.hostname, "svc.example.com");
        assert_eq!(cfg.admin_addr, "127.0.0.1:9090");
        assert_eq!(cfg.proxy.addr(), "proxy.example.com:7000");
        assert_eq!(cfg.proxy.dial_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.proxy.register_timeout, Some(Duration::from_secs(4)));
        assert!(cfg.rendezvous.is_none());
        assert_eq!(cfg.heartbeat.interval, Duration::from_secs(15));
        assert_eq!(cfg.heartbeat.timeout, Some(Duration::from_secs(5)));
        assert_eq!(cfg.heartbeat.max_failures, 3);
        assert_eq!(cfg.backoff.base, Duration::from_secs(1));
        assert_eq!(cfg.max_concurrent_streams, 64);
        assert_eq!(cfg.services[0].local_addr, "127.0.0.1:8080");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.output, "stderr");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn defaults_leave_timeouts_off() {
        let dir = temp_dir("defaults");
        let cfg_path = dir.join("proxee.yaml");

        let yaml = "hostname: svc\nproxy:\n  host: 10.0.0.1\n  port: 7000\n";
        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path, &Overrides::default()).expect("load_config");
        assert_eq!(cfg.proxy.transport, "tcp");
        assert_eq!(cfg.proxy.dial_timeout, Duration::from_secs(5));
        assert_eq!(cfg.proxy.register_timeout, None);
        assert_eq!(cfg.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat.timeout, None);
        assert_eq!(cfg.heartbeat.max_failures, 0);
        assert_eq!(cfg.backoff.base, Duration::from_secs(10));
        assert_eq!(cfg.backoff.jitter, Duration::from_secs(2));
        assert_eq!(cfg.max_concurrent_streams, 0);
        assert_eq!(cfg.logging.format, "json");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_uses_overrides() {
        let dir = temp_dir("missing");
        let cfg_path = dir.join("proxee.toml");

        let ov = Overrides {
            hostname: Some("edge-1".into()),
            proxy_host: Some("::1".into()),
            proxy_port: Some(7000),
            ..Default::default()
        };
        let cfg = load_config(&cfg_path, &ov).expect("load_config");
        assert_eq!(cfg.hostname, "edge-1");
        assert_eq!(cfg.proxy.addr(), "[::1]:7000");

        let err = load_config(&cfg_path, &Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("hostname"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn overrides_win_over_file() {
        let dir = temp_dir("override");
        let cfg_path = dir.join("proxee.toml");

        let toml = r#"
hostname = "from-file"
[proxy]
host = "file.example.com"
port = 1
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let ov = Overrides {
            hostname: Some("from-env".into()),
            proxy_port: Some(7000),
            ..Default::default()
        };
        let cfg = load_config(&cfg_path, &ov).expect("load_config");
        assert_eq!(cfg.hostname, "from-env");
        assert_eq!(cfg.proxy.addr(), "file.example.com:7000");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn direct_mode_requires_proxy_address() {
        let dir = temp_dir("direct");
        let cfg_path = dir.join("proxee.toml");

        std::fs::write(&cfg_path, "hostname = \"svc\"\n[proxy]\nport = 7000\n").expect("write");
        let err = load_config(&cfg_path, &Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("proxy.host"));

        std::fs::write(&cfg_path, "hostname = \"svc\"\n[proxy]\nhost = \"p\"\nport = 70000\n")
            .expect("write");
        let err = load_config(&cfg_path, &Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("1..=65535"));

        std::fs::write(&cfg_path, "hostname = \"svc\"\n[proxy]\nhost = \"p\"\n").expect("write");
        let err = load_config(&cfg_path, &Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("proxy.port"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rendezvous_mode() {
        let dir = temp_dir("rendezvous");
        let cfg_path = dir.join("proxee.toml");

        let toml = r#"
hostname = "svc"
[rendezvous]
base_url = "http://rv.example.com"
advertised_host = "203.0.113.7"
advertised_port = 4001
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path, &Overrides::default()).expect("load_config");
        let rv = cfg.rendezvous.expect("rendezvous");
        assert_eq!(rv.base_url, "http://rv.example.com");
        assert_eq!(rv.advertised_port, 4001);
        assert!(!rv.debug_identity);
        assert_eq!(rv.request_timeout, Duration::from_secs(10));

        std::fs::write(
            &cfg_path,
            "hostname = \"svc\"\n[rendezvous]\nbase_url = \"http://rv\"\n",
        )
        .expect("write");
        let err = load_config(&cfg_path, &Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("advertised_host"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn legacy_environment_prefers_direct_dial() {
        let ov = Overrides {
            hostname: Some("svc".into()),
            proxy_host: Some("proxy.example.com".into()),
            proxy_port: Some(7000),
            rendezvous_url: Some("http://api.example.com".into()),
            ..Default::default()
        };
        let cfg = load_config(Path::new("/nonexistent/proxee.toml"), &ov).expect("load_config");
        assert!(cfg.rendezvous.is_none());
        assert_eq!(cfg.proxy.addr(), "proxy.example.com:7000");

        // Without a proxy port the base URL still selects rendezvous.
        let ov = Overrides {
            proxy_port: None,
            advertised_host: Some("203.0.113.7".into()),
            advertised_port: Some(4001),
            ..ov
        };
        let cfg = load_config(Path::new("/nonexistent/proxee.toml"), &ov).expect("load_config");
        assert_eq!(cfg.rendezvous.expect("rendezvous").base_url, "http://api.example.com");
    }

    #[test]
    fn reject_unknown_fields() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("proxee.toml");

        let toml = r#"
hostname = "svc"
[proxy]
host = "p"
port = 7000
retry_forever = true
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let err = load_config(&cfg_path, &Overrides::default()).unwrap_err();
        let msg = format!("{err:#}").to_ascii_lowercase();
        assert!(msg.contains("retry_forever"), "got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_multiline_hostname_and_empty_services() {
        let ov = Overrides {
            hostname: Some("a\nb".into()),
            proxy_host: Some("p".into()),
            proxy_port: Some(1),
            ..Default::default()
        };
        let err = Config::from_file_config(FileConfig::default(), &ov).unwrap_err();
        assert!(err.to_string().contains("single line"));

        let fc = FileConfig {
            hostname: "svc".into(),
            services: vec![FileService {
                selector: "/http".into(),
                local_addr: " ".into(),
            }],
            ..Default::default()
        };
        let ov = Overrides {
            proxy_host: Some("p".into()),
            proxy_port: Some(1),
            ..Default::default()
        };
        let err = Config::from_file_config(fc, &ov).unwrap_err();
        assert!(err.to_string().contains("services[0]"));
    }

    #[test]
    fn explicit_directory_discovers_config() {
        let dir = temp_dir("discover");
        std::fs::write(dir.join("proxee.yaml"), "hostname: svc\n").expect("write");
        let p = normalize_explicit_path(&dir).expect("normalize");
        assert_eq!(p, dir.join("proxee.yaml"));

        let p = normalize_explicit_path(&dir.join("custom")).expect("normalize");
        assert_eq!(p, dir.join("custom.toml"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
