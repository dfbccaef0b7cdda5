use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::hawser::net;

/// Which side of the tunnel accepts connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Local listener; remote side is dialed through the secure session.
    Forward,
    /// Remote listener bound through the secure session; local side is dialed.
    Reverse,
}

impl Orientation {
    pub fn parse(s: &str) -> anyhow::Result<Orientation> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" | "client" => Ok(Orientation::Forward),
            "reverse" | "server" => Ok(Orientation::Reverse),
            other => anyhow::bail!(
                "config: unknown orientation {other:?} (expected forward|reverse)"
            ),
        }
    }
}

impl std::fmt::Display for Orientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Orientation::Forward => write!(f, "forward"),
            Orientation::Reverse => write!(f, "reverse"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ssh: SshConfig,
    pub tunnel: TunnelConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl SshConfig {
    pub fn address(&self) -> String {
        net::join_host_port(&self.host, self.port)
    }
}

/// Immutable per-tunnel settings, fixed at startup.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub orientation: Orientation,
    /// Forward: the local listen address. Reverse: the local dial target.
    pub local_addr: String,
    /// Forward: the dial target reached through the session. Reverse: the
    /// remote listen address, resolved on the SSH server.
    pub remote_addr: String,
    /// Fixed delay before retrying a failed connect/listen/accept.
    pub backoff: Duration,
    /// Absolute bound on the lifetime of one proxied connection; zero
    /// disables it.
    pub idle_timeout: Duration,
    /// Bound on session connects and plain dials; zero disables it.
    pub dial_timeout: Duration,
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

/// CLI flag values layered over the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub local: Option<String>,
    pub remote: Option<String>,
    pub reverse: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Locate the config file, if any. An explicitly flagged path must exist;
/// discovered paths are optional because the CLI flags alone can describe a
/// complete tunnel.
pub fn resolve_config_path(
    explicit: Option<PathBuf>,
) -> anyhow::Result<Option<ResolvedConfigPath>> {
    if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        }));
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        }));
    }

    if let Some(p) = default_config_path() {
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(Some(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Default,
            }));
        }
    }

    Ok(None)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    for c in ["hawser.toml", "hawser.yaml", "hawser.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Some(p);
        }
    }
    None
}

fn default_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Some(PathBuf::from("/etc/hawser/hawser.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        ProjectDirs::from("io", "hawser", "hawser").map(|d| d.config_dir().join("hawser.toml"))
    }
}

pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "toml" => toml::from_str(&data).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => {
            serde_yaml::from_str(&data).with_context(|| format!("parse yaml {}", path.display()))
        }
        _ => anyhow::bail!(
            "config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    ssh: Option<FileSsh>,
    tunnel: Option<FileTunnel>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSsh {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    orientation: Option<String>,
    local: Option<String>,
    remote: Option<String>,
    backoff_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
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

impl Config {
    /// Layer defaults, the config file, and CLI overrides into the resolved
    /// runtime configuration.
    pub fn resolve(file: Option<FileConfig>, ov: Overrides) -> anyhow::Result<Config> {
        let file = file.unwrap_or_default();
        let fssh = file.ssh;
        let ftun = file.tunnel;

        let host = ov
            .host
            .or_else(|| fssh.as_ref().and_then(|s| s.host.clone()))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if host.is_empty() {
            anyhow::bail!("config: ssh host is required (--host or [ssh].host)");
        }

        let user = ov
            .user
            .or_else(|| fssh.as_ref().and_then(|s| s.user.clone()))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if user.is_empty() {
            anyhow::bail!("config: ssh user is required (--user or [ssh].user)");
        }

        let ssh = SshConfig {
            host,
            port: ov
                .port
                .or_else(|| fssh.as_ref().and_then(|s| s.port))
                .unwrap_or(22),
            user,
            password: ov
                .password
                .or_else(|| fssh.as_ref().and_then(|s| s.password.clone()))
                .unwrap_or_default(),
        };

        let orientation = if ov.reverse {
            Orientation::Reverse
        } else {
            match ftun.as_ref().and_then(|t| t.orientation.as_deref()) {
                Some(s) => Orientation::parse(s)?,
                None => Orientation::Forward,
            }
        };

        let local = ov
            .local
            .or_else(|| ftun.as_ref().and_then(|t| t.local.clone()))
            .map(|s| normalize_endpoint(&s))
            .unwrap_or_default();
        if local.is_empty() {
            anyhow::bail!("config: local endpoint is required (--local or [tunnel].local)");
        }

        let remote = ov
            .remote
            .or_else(|| ftun.as_ref().and_then(|t| t.remote.clone()))
            .map(|s| normalize_endpoint(&s))
            .unwrap_or_default();
        if remote.is_empty() {
            anyhow::bail!("config: remote endpoint is required (--remote or [tunnel].remote)");
        }

        let tunnel = TunnelConfig {
            orientation,
            local_addr: local,
            remote_addr: remote,
            backoff: duration_ms(ftun.as_ref().and_then(|t| t.backoff_ms), 3000),
            idle_timeout: duration_ms(ftun.as_ref().and_then(|t| t.idle_timeout_ms), 30_000),
            dial_timeout: duration_ms(ftun.as_ref().and_then(|t| t.dial_timeout_ms), 5000),
        };

        let logging = match file.logging {
            Some(l) => {
                let d = LoggingConfig::default();
                LoggingConfig {
                    level: l.level.unwrap_or(d.level),
                    format: l.format.unwrap_or(d.format),
                    output: l.output.unwrap_or(d.output),
                    add_source: l.add_source,
                }
            }
            None => LoggingConfig::default(),
        };

        Ok(Config {
            ssh,
            tunnel,
            logging,
        })
    }
}

fn duration_ms(v: Option<i64>, default_ms: i64) -> Duration {
    Duration::from_millis(v.unwrap_or(default_ms).max(0) as u64)
}

/// A bare port is shorthand for `localhost:PORT`, matching the common case of
/// tunneling between loopback services.
fn normalize_endpoint(s: &str) -> String {
    let s = s.trim();
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        format!("localhost:{s}")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_overrides() -> Overrides {
        Overrides {
            host: Some("ssh.example.net".into()),
            user: Some("deploy".into()),
            local: Some("8080".into()),
            remote: Some("80".into()),
            ..Overrides::default()
        }
    }

    #[test]
    fn resolve_from_flags_alone() {
        let cfg = Config::resolve(None, base_overrides()).unwrap();
        assert_eq!(cfg.ssh.host, "ssh.example.net");
        assert_eq!(cfg.ssh.port, 22);
        assert_eq!(cfg.tunnel.orientation, Orientation::Forward);
        assert_eq!(cfg.tunnel.local_addr, "localhost:8080");
        assert_eq!(cfg.tunnel.remote_addr, "localhost:80");
        assert_eq!(cfg.tunnel.backoff, Duration::from_secs(3));
        assert_eq!(cfg.tunnel.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn flags_override_file_values() {
        let file: FileConfig = toml::from_str(
            r#"
            [ssh]
            host = "file.example.net"
            port = 2222
            user = "fileuser"
            password = "hunter2"

            [tunnel]
            orientation = "reverse"
            local = "3000"
            remote = "0.0.0.0:9000"
            backoff_ms = 250
            idle_timeout_ms = 1000
            "#,
        )
        .unwrap();

        let cfg = Config::resolve(
            Some(file),
            Overrides {
                host: Some("cli.example.net".into()),
                ..Overrides::default()
            },
        )
        .unwrap();

        assert_eq!(cfg.ssh.host, "cli.example.net");
        assert_eq!(cfg.ssh.port, 2222);
        assert_eq!(cfg.ssh.user, "fileuser");
        assert_eq!(cfg.tunnel.orientation, Orientation::Reverse);
        assert_eq!(cfg.tunnel.local_addr, "localhost:3000");
        assert_eq!(cfg.tunnel.remote_addr, "0.0.0.0:9000");
        assert_eq!(cfg.tunnel.backoff, Duration::from_millis(250));
        assert_eq!(cfg.tunnel.idle_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn reverse_flag_overrides_file_orientation() {
        let file: FileConfig = toml::from_str(
            r#"
            [tunnel]
            orientation = "forward"
            "#,
        )
        .unwrap();

        let mut ov = base_overrides();
        ov.reverse = true;
        let cfg = Config::resolve(Some(file), ov).unwrap();
        assert_eq!(cfg.tunnel.orientation, Orientation::Reverse);
    }

    #[test]
    fn yaml_parses_like_toml() {
        let file: FileConfig = serde_yaml::from_str(
            r#"
            ssh:
              host: ssh.example.net
              user: deploy
            tunnel:
              local: "8080"
              remote: "80"
            logging:
              level: debug
              format: json
            "#,
        )
        .unwrap();

        let cfg = Config::resolve(Some(file), Overrides::default()).unwrap();
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.tunnel.local_addr, "localhost:8080");
    }

    #[test]
    fn missing_required_fields_are_reported() {
        let err = Config::resolve(None, Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("ssh host"));

        let mut ov = base_overrides();
        ov.local = None;
        let err = Config::resolve(None, ov).unwrap_err();
        assert!(err.to_string().contains("local endpoint"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let res: Result<FileConfig, _> = toml::from_str(
            r#"
            [tunnel]
            lokal = "8080"
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn orientation_accepts_legacy_names() {
        assert_eq!(Orientation::parse("server").unwrap(), Orientation::Reverse);
        assert_eq!(Orientation::parse("client").unwrap(), Orientation::Forward);
        assert!(Orientation::parse("sideways").is_err());
    }
}
