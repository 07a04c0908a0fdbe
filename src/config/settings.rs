use std::env;
use std::path::PathBuf;

use crate::chain::retry::RetryPolicy;
use crate::config::networks::NetworkConfig;
use crate::error::{Result, SpiderError};
use crate::utils::constants::{
    DEFAULT_ARTIFACT_DB_PATH, DEFAULT_DEPLOYMENTS_DIR, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_RPC_CALL_TIMEOUT_MS, DEFAULT_RPC_RETRIES,
};

#[derive(Debug, Clone)]
pub struct SpiderSettings {
    pub network: &'static NetworkConfig,
    pub rpc_url: Option<String>,
    pub etherscan_api_key: Option<String>,
    pub artifact_db_path: PathBuf,
    pub deployments_dir: PathBuf,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

fn validate_http_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw.parse::<reqwest::Url>().map_err(|e| {
        SpiderError::InvalidConfig(format!("{name} must be a valid URL, got `{raw}`: {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(SpiderError::InvalidConfig(format!(
            "{name} must use http(s) scheme, got `{other}`"
        ))),
    }
}

fn bounded<T>(name: &str, raw: Option<String>, range: std::ops::RangeInclusive<T>, default: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let Some(raw) = raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(default);
    };
    let value = raw
        .parse::<T>()
        .map_err(|_| SpiderError::InvalidConfig(format!("{name} must be a number, got `{raw}`")))?;
    if !range.contains(&value) {
        return Err(SpiderError::InvalidConfig(format!(
            "{name} must be within {}..={}, got {value}",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

impl SpiderSettings {
    pub fn load(network: &str) -> Result<Self> {
        Self::from_lookup(network, |key| env::var(key).ok())
    }

    /// Resolve settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(network: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let network = NetworkConfig::get(network)?;
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let rpc_var = network.rpc_env_var();
        let rpc_url = non_empty(&rpc_var).or_else(|| non_empty("ETH_RPC_URL"));
        if let Some(url) = rpc_url.as_deref() {
            validate_http_url(&rpc_var, url)?;
        }

        let artifact_db_path = non_empty("SPIDER_ARTIFACT_DB")
            .unwrap_or_else(|| DEFAULT_ARTIFACT_DB_PATH.to_string())
            .into();
        let deployments_dir = non_empty("SPIDER_DEPLOYMENTS_DIR")
            .unwrap_or_else(|| DEFAULT_DEPLOYMENTS_DIR.to_string())
            .into();

        let max_in_flight = bounded(
            "SPIDER_MAX_IN_FLIGHT",
            lookup("SPIDER_MAX_IN_FLIGHT"),
            1..=64,
            DEFAULT_MAX_IN_FLIGHT,
        )?;
        let attempts = bounded(
            "SPIDER_RPC_RETRIES",
            lookup("SPIDER_RPC_RETRIES"),
            1..=10,
            DEFAULT_RPC_RETRIES,
        )?;
        let timeout_ms = bounded(
            "RPC_CALL_TIMEOUT_MS",
            lookup("RPC_CALL_TIMEOUT_MS"),
            250..=20_000,
            DEFAULT_RPC_CALL_TIMEOUT_MS,
        )?;

        Ok(Self {
            network,
            rpc_url,
            etherscan_api_key: non_empty("ETHERSCAN_API_KEY"),
            artifact_db_path,
            deployments_dir,
            max_in_flight,
            retry: RetryPolicy {
                attempts,
                timeout_ms,
            },
        })
    }

    pub fn require_rpc_url(&self) -> Result<&str> {
        self.rpc_url.as_deref().ok_or_else(|| {
            SpiderError::InvalidConfig(format!(
                "{} or ETH_RPC_URL must be set",
                self.network.rpc_env_var()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let settings = SpiderSettings::from_lookup("mainnet", lookup(&[])).expect("settings");
        assert_eq!(settings.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(settings.retry.attempts, DEFAULT_RPC_RETRIES);
        assert_eq!(settings.artifact_db_path, PathBuf::from(DEFAULT_ARTIFACT_DB_PATH));
        assert!(settings.rpc_url.is_none());
        assert!(settings.require_rpc_url().is_err());
    }

    #[test]
    fn test_network_rpc_var_beats_generic_one() {
        let settings = SpiderSettings::from_lookup(
            "base",
            lookup(&[
                ("BASE_RPC_URL", "https://base.example"),
                ("ETH_RPC_URL", "https://mainnet.example"),
            ]),
        )
        .expect("settings");
        assert_eq!(settings.require_rpc_url().ok(), Some("https://base.example"));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let err = SpiderSettings::from_lookup("mainnet", lookup(&[("SPIDER_MAX_IN_FLIGHT", "500")]))
            .err()
            .expect("out of range");
        assert!(matches!(err, SpiderError::InvalidConfig(_)));

        let err = SpiderSettings::from_lookup("mainnet", lookup(&[("ETH_RPC_URL", "ws://node")]))
            .err()
            .expect("bad scheme");
        assert!(matches!(err, SpiderError::InvalidConfig(_)));
    }
}
