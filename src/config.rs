// src/config.rs

//! Manages daemon configuration: loading, resolving dynamic values, and validation.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Cluster-membership policy and timing knobs, per §3/§4.7/§4.9/§4.10.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_announce_address")]
    pub announce_address: String,
    /// Duration beyond which a member with no recent heartbeat is offline (§3).
    #[serde(default = "default_offline_threshold", with = "humantime_serde")]
    pub offline_threshold: Duration,
    /// TTL stamped onto freshly issued join tokens (§3/§4.2).
    #[serde(default = "default_join_token_ttl", with = "humantime_serde")]
    pub join_token_ttl: Duration,
    /// Sleep before a promotion round to absorb transient disconnects (§4.7).
    #[serde(default = "default_rebalance_settle_delay", with = "humantime_serde")]
    pub rebalance_settle_delay: Duration,
    #[serde(default = "default_max_voters")]
    pub max_voters: usize,
    #[serde(default = "default_max_stand_by")]
    pub max_stand_by: usize,
}

fn default_announce_address() -> String {
    "127.0.0.1:8443".to_string()
}
fn default_offline_threshold() -> Duration {
    Duration::from_secs(30)
}
fn default_join_token_ttl() -> Duration {
    Duration::from_secs(3600)
}
fn default_rebalance_settle_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_max_voters() -> usize {
    3
}
fn default_max_stand_by() -> usize {
    2
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            announce_address: default_announce_address(),
            offline_threshold: default_offline_threshold(),
            join_token_ttl: default_join_token_ttl(),
            rebalance_settle_delay: default_rebalance_settle_delay(),
            max_voters: default_max_voters(),
            max_stand_by: default_max_stand_by(),
        }
    }
}

/// Concurrent shutdown orchestrator timing (§4.9).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ShutdownConfig {
    #[serde(default = "default_per_instance_timeout", with = "humantime_serde")]
    pub per_instance_timeout: Duration,
    #[serde(default = "default_daemon_deadline", with = "humantime_serde")]
    pub daemon_deadline: Duration,
}

fn default_per_instance_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_daemon_deadline() -> Duration {
    Duration::from_secs(300)
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            per_instance_timeout: default_per_instance_timeout(),
            daemon_deadline: default_daemon_deadline(),
        }
    }
}

/// Configuration for TLS encryption on the cluster bus and the HTTP API.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "clusterd.crt".to_string()
}
fn default_key_path() -> String {
    "clusterd.key".to_string()
}

/// Configuration for the Prometheus metrics endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    cluster: ClusterConfig,
    #[serde(default)]
    shutdown: ShutdownConfig,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub cluster: ClusterConfig,
    pub shutdown: ShutdownConfig,
    pub tls: TlsConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            cluster: ClusterConfig::default(),
            shutdown: ShutdownConfig::default(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw_config: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            host: raw_config.host,
            port: raw_config.port,
            log_level: raw_config.log_level,
            cluster: raw_config.cluster,
            shutdown: raw_config.shutdown,
            tls: raw_config.tls,
            metrics: raw_config.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }

        if self.cluster.enabled {
            if self.cluster.max_voters == 0 {
                return Err(anyhow!("cluster.max_voters cannot be 0 when clustering is enabled"));
            }
            if self.cluster.max_voters == 1 {
                warn!(
                    "cluster.max_voters is set to 1; this configuration cannot survive a single node loss"
                );
            }
            if self.cluster.offline_threshold.is_zero() {
                return Err(anyhow!("cluster.offline_threshold cannot be 0"));
            }
            if self.cluster.join_token_ttl.is_zero() {
                return Err(anyhow!("cluster.join_token_ttl cannot be 0"));
            }
        }

        if self.shutdown.per_instance_timeout.is_zero() {
            return Err(anyhow!("shutdown.per_instance_timeout cannot be 0"));
        }
        if self.shutdown.daemon_deadline.is_zero() {
            return Err(anyhow!("shutdown.daemon_deadline cannot be 0"));
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn from_file_parses_and_validates_a_real_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            host = "127.0.0.1"
            port = 9443

            [cluster]
            enabled = true
            announce_address = "10.0.0.5:9443"
            max_voters = 5
            "#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 9443);
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.announce_address, "10.0.0.5:9443");
        assert_eq!(config.cluster.max_voters, 5);
    }

    #[test]
    fn from_file_rejects_a_file_that_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 0").unwrap();
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_max_voters_when_clustering_enabled() {
        let mut config = Config::default();
        config.cluster.enabled = true;
        config.cluster.max_voters = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_matching_metrics_and_server_ports() {
        let mut config = Config::default();
        config.metrics.enabled = true;
        config.metrics.port = config.port;
        assert!(config.validate().is_err());
    }
}
