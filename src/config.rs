//! Configuration for the provisioner
//!
//! Two layers: CLI arguments and environment variables via clap, and the
//! YAML provisioning policy loaded from `--config`.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{ProvisionerError, Result};

/// Lifecycle component announced by nodes in provisioning mode
pub const DEFAULT_LIFECYCLE_COMPONENT: &str = "provision_mode_server";

/// Certificate names that may never be issued to a provisioned node
pub const DEFAULT_CERT_DENY_LIST: &[&str] = &[
    "\\.privileged.mcollective$",
    "\\.privileged.choria$",
    "\\.mcollective$",
    "\\.choria$",
];

/// Choria Provisioner - bootstraps fleet nodes booted into provisioning mode
#[derive(Parser, Debug, Clone)]
#[command(name = "choria-provisioner")]
#[command(about = "Discovers and provisions nodes in provisioning mode")]
pub struct Args {
    /// Provisioner configuration file
    #[arg(
        long,
        env = "PROVISIONER_CONFIG",
        default_value = "/etc/choria-provisioner/choria-provisioner.yaml"
    )]
    pub config: PathBuf,

    /// Identity of this provisioner instance, used for elections and events
    #[arg(long, env = "PROVISIONER_IDENTITY", default_value = "choria-provisioner")]
    pub identity: String,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Write the process id to this file
    #[arg(long, env = "PROVISIONER_PID")]
    pub pid: Option<PathBuf>,
}

impl Args {
    /// Validate arguments that clap cannot check on its own
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.identity.trim().is_empty() {
            return Err("PROVISIONER_IDENTITY must not be empty".to_string());
        }

        if self.nats.nats_user.is_some() != self.nats.nats_password.is_some() {
            return Err("NATS_USER and NATS_PASSWORD must be set together".to_string());
        }

        Ok(())
    }
}

/// NATS connection arguments
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

/// Feature switches for the bootstrap sequence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub pki: bool,
    #[serde(default)]
    pub jwt: bool,
    #[serde(default)]
    pub ed25519: bool,
    #[serde(default, rename = "upgrades")]
    pub version_upgrades: bool,
}

/// Provisioning policy loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Concurrent provisioning workers, defaults to the CPU count
    #[serde(default)]
    pub workers: usize,
    /// Discovery interval, at least one minute
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Executable consulted for per-node configuration
    #[serde(default)]
    pub helper: String,
    /// Provisioning token presented to nodes
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_lifecycle_component")]
    pub lifecycle_component: String,
    /// Metric label for this deployment
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub cert_deny_list: Vec<String>,
    /// PEM file or hex Ed25519 key used to verify provisioning JWTs
    #[serde(default)]
    pub jwt_verify_cert: String,
    /// File holding the key that signs server JWTs
    #[serde(default)]
    pub jwt_signing_key: String,
    /// Optional chain-of-trust token, re-read on every issuance
    #[serde(default)]
    pub jwt_signing_token: String,
    #[serde(default = "default_server_jwt_validity")]
    pub server_jwt_validity: String,
    #[serde(default)]
    pub leader_election: bool,
    #[serde(default, rename = "upgrades_repository")]
    pub upgrades_repo: String,
    #[serde(default)]
    pub upgrades_optional: bool,
    #[serde(default)]
    pub features: Features,

    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: String,
    #[serde(default = "default_helper_timeout")]
    pub helper_timeout: String,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout: String,
    /// How long a successfully handled node stays registered
    #[serde(default = "default_finish_delay")]
    pub finish_delay: String,
    #[serde(default = "default_election_ttl")]
    pub election_ttl: String,

    #[serde(skip)]
    pub interval_duration: Duration,
    #[serde(skip)]
    pub server_jwt_validity_duration: Duration,
    #[serde(skip)]
    pub rpc_timeout_duration: Duration,
    #[serde(skip)]
    pub helper_timeout_duration: Duration,
    #[serde(skip)]
    pub discovery_timeout_duration: Duration,
    #[serde(skip)]
    pub finish_delay_duration: Duration,
    #[serde(skip)]
    pub election_ttl_duration: Duration,
    #[serde(skip)]
    pub file: PathBuf,
}

fn default_interval() -> String { "5m".to_string() }
fn default_lifecycle_component() -> String { DEFAULT_LIFECYCLE_COMPONENT.to_string() }
fn default_server_jwt_validity() -> String { "1y".to_string() }
fn default_rpc_timeout() -> String { "10s".to_string() }
fn default_helper_timeout() -> String { "10s".to_string() }
fn default_discovery_timeout() -> String { "2s".to_string() }
fn default_finish_delay() -> String { "60s".to_string() }
fn default_election_ttl() -> String { "30s".to_string() }

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            interval: default_interval(),
            helper: String::new(),
            token: String::new(),
            lifecycle_component: default_lifecycle_component(),
            site: String::new(),
            cert_deny_list: Vec::new(),
            jwt_verify_cert: String::new(),
            jwt_signing_key: String::new(),
            jwt_signing_token: String::new(),
            server_jwt_validity: default_server_jwt_validity(),
            leader_election: false,
            upgrades_repo: String::new(),
            upgrades_optional: false,
            features: Features::default(),
            rpc_timeout: default_rpc_timeout(),
            helper_timeout: default_helper_timeout(),
            discovery_timeout: default_discovery_timeout(),
            finish_delay: default_finish_delay(),
            election_ttl: default_election_ttl(),
            interval_duration: Duration::ZERO,
            server_jwt_validity_duration: Duration::ZERO,
            rpc_timeout_duration: Duration::ZERO,
            helper_timeout_duration: Duration::ZERO,
            discovery_timeout_duration: Duration::ZERO,
            finish_delay_duration: Duration::ZERO,
            election_ttl_duration: Duration::ZERO,
            file: PathBuf::new(),
        }
    }
}

impl ProvisionerConfig {
    /// Read, default and validate a YAML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ProvisionerError::Config(format!(
                "file {} not found",
                path.display()
            )));
        }

        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProvisionerError::Config(format!("config file could not be read: {}", e))
        })?;

        let mut config = Self::from_yaml(&raw).map_err(|e| {
            ProvisionerError::Config(format!(
                "could not parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.file = path.to_path_buf();

        Ok(config)
    }

    /// Parse YAML text and apply defaults and validation
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(raw)?;
        config.finalize()?;
        Ok(config)
    }

    /// Fill in defaults, compute durations and enforce cross-field rules
    pub fn finalize(&mut self) -> Result<()> {
        if self.lifecycle_component.is_empty() {
            self.lifecycle_component = DEFAULT_LIFECYCLE_COMPONENT.to_string();
        }

        if self.workers == 0 {
            self.workers = num_cpus::get();
        }

        if self
            .lifecycle_component
            .contains(|c| c == '.' || c == '>' || c == '*')
        {
            return Err(ProvisionerError::Config(format!(
                "invalid lifecycle component: {}",
                self.lifecycle_component
            )));
        }

        if self.cert_deny_list.is_empty() {
            self.cert_deny_list = DEFAULT_CERT_DENY_LIST.iter().map(|s| s.to_string()).collect();
        }

        if self.features.pki && self.features.ed25519 {
            return Err(ProvisionerError::Config(
                "can only enable one of pki or ed25519 features".to_string(),
            ));
        }

        if self.features.ed25519 {
            self.features.jwt = true;
        }

        if self.helper.is_empty() {
            return Err(ProvisionerError::Config("a helper is required".to_string()));
        }

        if self.features.version_upgrades && self.upgrades_repo.is_empty() {
            return Err(ProvisionerError::Config(
                "upgrades_repository is required when the upgrades feature is enabled".to_string(),
            ));
        }

        self.interval_duration = parse_duration(&self.interval)
            .map_err(|e| ProvisionerError::Config(format!("invalid duration: {}", e)))?;

        if self.server_jwt_validity.is_empty() {
            self.server_jwt_validity = default_server_jwt_validity();
        }
        self.server_jwt_validity_duration = parse_duration(&self.server_jwt_validity).map_err(|e| {
            ProvisionerError::Config(format!("invalid server jwt validity duration: {}", e))
        })?;

        if self.interval_duration < Duration::from_secs(60) {
            return Err(ProvisionerError::Config(
                "interval is too small, minmum is 1 minute.  Valid example values are 10m or 10h"
                    .to_string(),
            ));
        }

        self.rpc_timeout_duration = parse_named("rpc_timeout", &self.rpc_timeout)?;
        self.helper_timeout_duration = parse_named("helper_timeout", &self.helper_timeout)?;
        self.discovery_timeout_duration = parse_named("discovery_timeout", &self.discovery_timeout)?;
        self.finish_delay_duration = parse_named("finish_delay", &self.finish_delay)?;
        self.election_ttl_duration = parse_named("election_ttl", &self.election_ttl)?;

        Ok(())
    }
}

fn parse_named(name: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| ProvisionerError::Config(format!("invalid {} duration: {}", name, e)))
}

/// Parse durations such as `10s`, `1m30s`, `250ms`, `2h`, `7d`, `2w` or `1y`.
///
/// Day, week and year suffixes must stand alone with an integer or decimal
/// amount; the other units may be combined the way Go formats durations.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    for (suffix, secs) in [("d", 86_400.0), ("w", 604_800.0), ("y", 31_536_000.0)] {
        if let Some(amount) = s.strip_suffix(suffix) {
            if let Ok(n) = amount.parse::<f64>() {
                if n < 0.0 || !n.is_finite() {
                    return Err(format!("invalid duration {}", input));
                }
                return Ok(Duration::from_secs_f64(n * secs));
            }
        }
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {}", input))?;
        if split == 0 {
            return Err(format!("invalid duration {}", input));
        }
        let amount: f64 = rest[..split]
            .parse()
            .map_err(|_| format!("invalid duration {}", input))?;
        rest = &rest[split..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit {} in duration {}", unit, input)),
        };
        rest = &rest[unit_len..];
        total += Duration::from_secs_f64(amount * scale);
    }

    Ok(total)
}
