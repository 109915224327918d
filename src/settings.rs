use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_path() -> String {
    "/".to_string()
}

fn default_auth_cache_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_lapi_url() -> String {
    "http://127.0.0.1:8080/".to_string()
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("/etc/ingressguard/rules")
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7422";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
    #[serde(default)]
    pub listen_socket: Option<PathBuf>,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub routines: usize,
    #[serde(default)]
    pub appsec_config: Option<String>,
    #[serde(default)]
    pub appsec_config_path: Option<PathBuf>,
    #[serde(with = "humantime_serde", default = "default_auth_cache_duration")]
    pub auth_cache_duration: Duration,
    #[serde(default = "default_lapi_url")]
    pub lapi_url: String,
    #[serde(default)]
    pub engine_name: String,
    #[serde(default = "default_rules_dir")]
    pub rules_dir: PathBuf,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
    #[serde(default)]
    pub metrics_tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub metrics_tls_key: Option<PathBuf>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut settings: Settings = serde_yaml::from_str(&raw)
            .with_context(|| format!("cannot parse configuration {}", config_path.display()))?;
        settings.apply_base_dir(&config_path);
        settings.normalize();
        settings.validate()?;
        Ok(settings)
    }

    /// Fill in the defaults that depend on other fields. Idempotent; called by
    /// [`Settings::load`] and by embedders that construct a `Settings` directly.
    pub fn normalize(&mut self) {
        if self.listen_addr.is_none() && self.listen_socket.is_none() {
            self.listen_addr = Some(
                DEFAULT_LISTEN_ADDR
                    .parse()
                    .expect("default listen address parses"),
            );
        }

        if self.path.is_empty() {
            self.path = default_path();
        }
        if !self.path.starts_with('/') {
            self.path.insert(0, '/');
        }

        // always at least one runner
        if self.routines == 0 {
            self.routines = 1;
        }

        if self.engine_name.is_empty() {
            self.engine_name = match (&self.listen_socket, &self.listen_addr) {
                (Some(socket), None) => socket.display().to_string(),
                (_, Some(addr)) => format!("{}{}", addr, self.path),
                (None, None) => unreachable!("normalize sets a listen address first"),
            };
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.appsec_config.is_none() && self.appsec_config_path.is_none() {
            bail!("appsec_config or appsec_config_path must be set");
        }
        ensure!(
            !self.auth_cache_duration.is_zero(),
            "auth_cache_duration must be a positive duration"
        );
        ensure!(
            self.cert_file.is_some() == self.key_file.is_some(),
            "cert_file and key_file must both be set or both be absent"
        );
        ensure!(
            self.metrics_tls_cert.is_some() == self.metrics_tls_key.is_some(),
            "metrics_tls_cert and metrics_tls_key must both be set or both be absent"
        );
        if self.metrics_tls_cert.is_some() && self.metrics_listen.is_none() {
            bail!("metrics_tls_cert/metrics_tls_key provided but metrics_listen is not set");
        }
        ensure!(!self.lapi_url.is_empty(), "lapi_url must not be empty");
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.rules_dir = absolutize(&self.rules_dir, base_dir);
        if let Some(path) = self.appsec_config_path.clone() {
            self.appsec_config_path = Some(absolutize(&path, base_dir));
        }
        if let Some(cert) = self.cert_file.clone() {
            self.cert_file = Some(absolutize(&cert, base_dir));
        }
        if let Some(key) = self.key_file.clone() {
            self.key_file = Some(absolutize(&key, base_dir));
        }
        if let Some(cert) = self.metrics_tls_cert.clone() {
            self.metrics_tls_cert = Some(absolutize(&cert, base_dir));
        }
        if let Some(key) = self.metrics_tls_key.clone() {
            self.metrics_tls_key = Some(absolutize(&key, base_dir));
        }
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/ingressguard/ingressguard.yaml"),
        PathBuf::from("ingressguard.yaml"),
    ]
}
