//! Configuration management for Tenant Authz

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Redis configuration; role resolution is uncached when absent
    pub redis: Option<RedisConfig>,
    /// Policy evaluator configuration
    pub evaluator: EvaluatorConfig,
    /// Access-check configuration
    pub access: AccessConfig,
    /// Logging configuration
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Which policy backend the process runs with. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorMode {
    Embedded,
    Remote,
}

impl std::str::FromStr for EvaluatorMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "embedded" | "wasm" => Ok(EvaluatorMode::Embedded),
            "remote" | "opa" => Ok(EvaluatorMode::Remote),
            other => bail!("Unknown POLICY_ENGINE_MODE: {}", other),
        }
    }
}

impl std::fmt::Display for EvaluatorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluatorMode::Embedded => write!(f, "embedded"),
            EvaluatorMode::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub mode: EvaluatorMode,
    /// Directory of built-in `*.rego` modules
    pub policy_dir: PathBuf,
    /// Remote policy service (used in remote mode)
    pub remote: RemoteEvaluatorConfig,
    /// Periodic reload interval; `None` disables background refresh
    pub refresh_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RemoteEvaluatorConfig {
    /// Base URL including the API version prefix (e.g., http://opa:8181/v1)
    pub url: String,
    /// Optional bearer token
    pub token: Option<String>,
    /// Timeout of one decision request
    pub timeout: Duration,
    /// Timeout of each policy or data upload during a load
    pub load_timeout: Duration,
}

impl Default for RemoteEvaluatorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8181/v1".to_string(),
            token: None,
            timeout: Duration::from_millis(300),
            load_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Upper bound on one access check, including every per-role evaluation
    pub check_timeout: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// "pretty" or "json"
    pub log_format: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let remote_url = var("OPA_URL", "http://localhost:8181/v1");
        url::Url::parse(&remote_url).context("Invalid OPA_URL")?;

        let refresh_secs: u64 = var("POLICY_REFRESH_INTERVAL_SECS", "0")
            .parse()
            .context("Invalid POLICY_REFRESH_INTERVAL_SECS")?;

        Ok(Self {
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").context("DATABASE_URL is required")?,
                max_connections: var("DATABASE_MAX_CONNECTIONS", "10").parse().unwrap_or(10),
                min_connections: var("DATABASE_MIN_CONNECTIONS", "2").parse().unwrap_or(2),
            },
            redis: lookup("REDIS_URL")
                .filter(|url| !url.trim().is_empty())
                .map(|url| RedisConfig { url }),
            evaluator: EvaluatorConfig {
                mode: var("POLICY_ENGINE_MODE", "embedded").parse()?,
                policy_dir: PathBuf::from(var("POLICY_DIR", "./policies")),
                remote: RemoteEvaluatorConfig {
                    url: remote_url.trim_end_matches('/').to_string(),
                    token: lookup("OPA_TOKEN").filter(|t| !t.is_empty()),
                    timeout: Duration::from_millis(
                        var("OPA_TIMEOUT_MS", "300")
                            .parse()
                            .context("Invalid OPA_TIMEOUT_MS")?,
                    ),
                    load_timeout: Duration::from_millis(
                        var("OPA_LOAD_TIMEOUT_MS", "10000")
                            .parse()
                            .context("Invalid OPA_LOAD_TIMEOUT_MS")?,
                    ),
                },
                refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
            },
            access: AccessConfig {
                check_timeout: Duration::from_millis(
                    var("AUTHZ_CHECK_TIMEOUT_MS", "1000")
                        .parse()
                        .context("Invalid AUTHZ_CHECK_TIMEOUT_MS")?,
                ),
            },
            telemetry: TelemetryConfig {
                log_format: var("LOG_FORMAT", "pretty").to_lowercase(),
            },
        })
    }
}
