//! Controller configuration from environment variables.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Interval between two reconciliation ticks
    pub tick: Duration,
    /// Configs reconciled in parallel
    pub concurrency: usize,
    /// Optional YAML seed for the in-memory store
    pub seed_file: Option<PathBuf>,
    pub metrics_addr: SocketAddr,
    /// TCP port dialled by the reachability probe
    pub probe_port: u16,
    pub probe_timeout: Duration,
    /// Lease granted to a worker for one task
    pub lease: chrono::Duration,
    /// Re-read and recompute attempts after a dirty write
    pub max_dirty_retries: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            concurrency: 3,
            seed_file: None,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            probe_port: 22,
            probe_timeout: Duration::from_secs(3),
            lease: chrono::Duration::seconds(300),
            max_dirty_retries: 5,
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ControllerError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ControllerError::InvalidConfig(format!("{key}={value} is not valid"))),
    }
}

fn positive<T: PartialOrd + Default>(key: &str, value: T) -> Result<T, ControllerError> {
    if value <= T::default() {
        return Err(ControllerError::InvalidConfig(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = Self::default();
        let tick: u64 = positive("FLEET_TICK_SECONDS", parse("FLEET_TICK_SECONDS", lookup("FLEET_TICK_SECONDS"), 30)?)?;
        let concurrency = positive(
            "FLEET_CONCURRENCY",
            parse("FLEET_CONCURRENCY", lookup("FLEET_CONCURRENCY"), defaults.concurrency)?,
        )?;
        let probe_timeout: u64 = positive(
            "FLEET_PROBE_TIMEOUT_SECONDS",
            parse("FLEET_PROBE_TIMEOUT_SECONDS", lookup("FLEET_PROBE_TIMEOUT_SECONDS"), 3)?,
        )?;
        let lease: i64 = positive("FLEET_LEASE_SECONDS", parse("FLEET_LEASE_SECONDS", lookup("FLEET_LEASE_SECONDS"), 300)?)?;

        Ok(Self {
            tick: Duration::from_secs(tick),
            concurrency,
            seed_file: lookup("FLEET_SEED_FILE").filter(|p| !p.trim().is_empty()).map(PathBuf::from),
            metrics_addr: parse("FLEET_METRICS_ADDR", lookup("FLEET_METRICS_ADDR"), defaults.metrics_addr)?,
            probe_port: parse("FLEET_PROBE_PORT", lookup("FLEET_PROBE_PORT"), defaults.probe_port)?,
            probe_timeout: Duration::from_secs(probe_timeout),
            lease: chrono::Duration::seconds(lease),
            max_dirty_retries: positive(
                "FLEET_MAX_DIRTY_RETRIES",
                parse("FLEET_MAX_DIRTY_RETRIES", lookup("FLEET_MAX_DIRTY_RETRIES"), defaults.max_dirty_retries)?,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn load(vars: &[(&str, &str)]) -> Result<ControllerConfig, ControllerError> {
        let vars: BTreeMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ControllerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(load(&[]).unwrap(), ControllerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("FLEET_TICK_SECONDS", "5"),
            ("FLEET_CONCURRENCY", "8"),
            ("FLEET_SEED_FILE", "/etc/fleet/seed.yaml"),
            ("FLEET_METRICS_ADDR", "127.0.0.1:9191"),
            ("FLEET_PROBE_PORT", "6443"),
            ("FLEET_LEASE_SECONDS", "60"),
        ])
        .unwrap();
        assert_eq!(config.tick, Duration::from_secs(5));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.seed_file, Some(PathBuf::from("/etc/fleet/seed.yaml")));
        assert_eq!(config.metrics_addr.port(), 9191);
        assert_eq!(config.probe_port, 6443);
        assert_eq!(config.lease, chrono::Duration::seconds(60));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(load(&[("FLEET_CONCURRENCY", "many")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(load(&[("FLEET_TICK_SECONDS", "0")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(load(&[("FLEET_METRICS_ADDR", "nowhere")]), Err(ControllerError::InvalidConfig(_))));
    }
}
