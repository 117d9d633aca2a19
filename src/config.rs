//! Configuration types for etcdhosts-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::DnsError;
use crate::healthcheck::{CheckerConfig, UnhealthyPolicy};
use crate::storage::{StorageMode, DEFAULT_KEY};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// etcd connection and layout configuration.
    pub etcd: EtcdConfig,

    /// Health checking; absent means no probing and every entry is served.
    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Reject configurations that cannot be served. Called once at startup;
    /// failures are fatal.
    pub fn validate(&self) -> Result<(), DnsError> {
        if self.etcd.endpoints.is_empty() {
            return Err(DnsError::Config("etcd.endpoints is required".to_string()));
        }
        if self.etcd.username.is_some() != self.etcd.password.is_some() {
            return Err(DnsError::Config(
                "etcd credentials need both username and password".to_string(),
            ));
        }
        if self.dns.ttl == 0 || self.dns.ttl > 65_535 {
            return Err(DnsError::Config(format!(
                "dns.ttl {} out of range 1-65535",
                self.dns.ttl
            )));
        }
        if self.dns.origins.is_empty() {
            return Err(DnsError::Config("dns.origins is required".to_string()));
        }
        if let Some(hc) = &self.healthcheck {
            if hc.interval_secs == 0 {
                return Err(DnsError::Config("healthcheck.interval_secs must be positive".to_string()));
            }
            if hc.timeout_secs == 0 {
                return Err(DnsError::Config("healthcheck.timeout_secs must be positive".to_string()));
            }
            if hc.max_concurrent == 0 {
                return Err(DnsError::Config("healthcheck.max_concurrent must be positive".to_string()));
            }
        }
        Ok(())
    }
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for the DNS server to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,

    /// Zones this server is authoritative for.
    pub origins: Vec<String>,

    /// Zone default TTL in seconds for records without their own override.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Pass-through zones for unanswered queries. Absent disables the
    /// clause; an empty list applies it to every name.
    #[serde(default)]
    pub fallthrough: Option<Vec<String>>,
}

fn default_ttl() -> u32 {
    3600
}

/// etcd connection and data layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    /// Cluster endpoints (required).
    pub endpoints: Vec<String>,

    /// Username for authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// Mutual-TLS material; plaintext when absent.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Dial timeout in seconds.
    #[serde(default = "default_etcd_timeout")]
    pub timeout_secs: u64,

    /// How hosts data is laid out under the key.
    #[serde(default)]
    pub storage: StorageMode,

    /// Key (single mode) or key prefix (perhost mode).
    #[serde(default = "default_etcd_key")]
    pub key: String,
}

impl EtcdConfig {
    /// Dial timeout as a duration.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_etcd_timeout() -> u64 {
    5
}

fn default_etcd_key() -> String {
    DEFAULT_KEY.to_string()
}

/// Paths to TLS material for the etcd connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Client certificate (PEM). May also hold the key when `key` is absent.
    pub cert: String,

    /// Client key (PEM).
    #[serde(default)]
    pub key: Option<String>,

    /// CA certificate (PEM) to verify the cluster against.
    #[serde(default)]
    pub ca: Option<String>,
}

/// Health checking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Probe sweep interval in seconds.
    #[serde(default = "default_hc_interval")]
    pub interval_secs: u64,

    /// Per-probe timeout in seconds.
    #[serde(default = "default_hc_timeout")]
    pub timeout_secs: u64,

    /// Maximum concurrently running probes.
    #[serde(default = "default_hc_max_concurrent")]
    pub max_concurrent: usize,

    /// Consecutive failures before a target is marked down.
    #[serde(default = "default_hc_failures")]
    pub failures_before_down: u32,

    /// Consecutive successes before a target is marked up.
    #[serde(default = "default_hc_successes")]
    pub successes_before_up: u32,

    /// What to answer when every entry for a name is unhealthy.
    #[serde(default)]
    pub unhealthy_policy: UnhealthyPolicy,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_hc_interval(),
            timeout_secs: default_hc_timeout(),
            max_concurrent: default_hc_max_concurrent(),
            failures_before_down: default_hc_failures(),
            successes_before_up: default_hc_successes(),
            unhealthy_policy: UnhealthyPolicy::default(),
        }
    }
}

impl HealthcheckConfig {
    /// Lower into the checker's runtime configuration.
    pub fn checker_config(&self) -> CheckerConfig {
        let interval = Duration::from_secs(self.interval_secs);
        CheckerConfig {
            interval,
            timeout: Duration::from_secs(self.timeout_secs),
            max_concurrent: self.max_concurrent,
            cache_ttl: interval * 2,
            failures_before_down: self.failures_before_down,
            successes_before_up: self.successes_before_up,
            unhealthy_policy: self.unhealthy_policy,
        }
    }
}

fn default_hc_interval() -> u64 {
    10
}

fn default_hc_timeout() -> u64 {
    3
}

fn default_hc_max_concurrent() -> usize {
    10
}

fn default_hc_failures() -> u32 {
    3
}

fn default_hc_successes() -> u32 {
    1
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "etcdhosts_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
