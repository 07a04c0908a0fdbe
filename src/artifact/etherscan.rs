use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{ArtifactSource, BuildArtifact};
use crate::config::networks::NetworkConfig;
use crate::error::{Result, SpiderError};
use crate::utils::error::compact_error_message;

pub const ETHERSCAN_API_BASE: &str = "https://api.etherscan.io/v2/api";
const MAX_RETRIES: u32 = 3;
const UNVERIFIED_ABI_MARKER: &str = "Contract source code not verified";

#[derive(Deserialize)]
struct EtherscanResponse {
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SourceRecord {
    #[serde(rename = "ABI")]
    abi: String,
    contract_name: String,
    #[serde(default)]
    compiler_version: String,
    #[serde(default)]
    optimization_used: String,
    #[serde(default)]
    runs: String,
    #[serde(rename = "EVMVersion", default)]
    evm_version: String,
    #[serde(default)]
    proxy: String,
    #[serde(default)]
    implementation: String,
}

/// Etherscan-family verified-source lookup (multichain v2 API).
pub struct EtherscanSource {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl EtherscanSource {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base(ETHERSCAN_API_BASE, api_key)
    }

    pub fn with_base(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, chain_id: u64, query: &str) -> String {
        format!(
            "{}?chainid={}&{}&apikey={}",
            self.api_base, chain_id, query, self.api_key
        )
    }

    async fn etherscan_get(&self, url: &str) -> Result<EtherscanResponse> {
        let mut last_err = String::new();
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(1000 * 2u64.pow(attempt - 1))).await;
            }
            match self
                .client
                .get(url)
                .timeout(Duration::from_secs(15))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<EtherscanResponse>().await {
                        Ok(parsed) if is_rate_limited(&parsed) => {
                            last_err = "rate limited".to_string();
                        }
                        Ok(parsed) => {
                            if let Some(err) = api_key_error(&parsed) {
                                return Err(err);
                            }
                            return Ok(parsed);
                        }
                        Err(e) => last_err = e.to_string(),
                    }
                }
                Ok(resp) if is_retryable_status(resp.status()) => {
                    last_err = format!("HTTP {}", resp.status());
                }
                Ok(resp) => return Err(rejected_status(resp.status())),
                Err(e) => last_err = e.to_string(),
            }
            tracing::debug!(
                "[ARTIFACT] etherscan attempt {}/{} failed: {}",
                attempt + 1,
                MAX_RETRIES,
                last_err
            );
        }
        Err(SpiderError::TransientRpc(format!(
            "etherscan request failed after {MAX_RETRIES} attempt(s): {}",
            compact_error_message(&last_err, 200)
        )))
    }
}

/// Only throttling and server-side failures are worth another attempt.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn rejected_status(status: StatusCode) -> SpiderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SpiderError::InvalidConfig(format!(
            "etherscan rejected the request (HTTP {status}); check ETHERSCAN_API_KEY"
        )),
        _ => SpiderError::InvalidConfig(format!("etherscan rejected the request (HTTP {status})")),
    }
}

/// A missing or invalid key fails every lookup the same way, so it is a config error
/// rather than a per-contract miss.
fn api_key_error(resp: &EtherscanResponse) -> Option<SpiderError> {
    if resp.status.as_deref() != Some("0") {
        return None;
    }
    let text = resp
        .result
        .as_str()
        .or(resp.message.as_deref())
        .unwrap_or_default();
    let lowered = text.to_ascii_lowercase();
    (lowered.contains("api key") || lowered.contains("apikey")).then(|| {
        SpiderError::InvalidConfig(format!(
            "etherscan: {}; check ETHERSCAN_API_KEY",
            compact_error_message(text, 200)
        ))
    })
}

fn is_rate_limited(resp: &EtherscanResponse) -> bool {
    resp.status.as_deref() == Some("0")
        && resp
            .result
            .as_str()
            .map(|text| text.to_ascii_lowercase().contains("rate limit"))
            .unwrap_or(false)
}

/// Interpret a `getsourcecode` response. Separated from the HTTP layer so the
/// classification rules can be tested offline.
fn parse_source_response(
    network: &str,
    address: Address,
    resp: EtherscanResponse,
) -> Result<(String, JsonAbi, Value)> {
    let not_found = || SpiderError::ArtifactNotFound {
        network: network.to_string(),
        address,
    };
    if resp.status.as_deref() != Some("1") {
        let reason = resp
            .result
            .as_str()
            .map(str::to_string)
            .or(resp.message)
            .unwrap_or_default();
        tracing::debug!("[ARTIFACT] getsourcecode {:#x}: {}", address, reason);
        return Err(not_found());
    }

    let records: Vec<SourceRecord> = serde_json::from_value(resp.result)
        .map_err(|e| SpiderError::Decode(format!("getsourcecode {address:#x}: {e}")))?;
    let record = records.into_iter().next().ok_or_else(not_found)?;

    if record.abi.trim() == UNVERIFIED_ABI_MARKER || record.contract_name.trim().is_empty() {
        return Err(SpiderError::UnverifiedContract {
            network: network.to_string(),
            address,
            reason: UNVERIFIED_ABI_MARKER.to_string(),
        });
    }

    let abi: JsonAbi = serde_json::from_str(&record.abi)
        .map_err(|e| SpiderError::Decode(format!("abi of {address:#x}: {e}")))?;
    let metadata = serde_json::json!({
        "compilerVersion": record.compiler_version,
        "optimizationUsed": record.optimization_used == "1",
        "runs": record.runs.parse::<u64>().ok(),
        "evmVersion": record.evm_version,
        "proxy": record.proxy == "1",
        "implementation": record.implementation,
    });
    Ok((record.contract_name, abi, metadata))
}

fn parse_code_response(network: &str, address: Address, resp: EtherscanResponse) -> Result<Bytes> {
    let text = resp.result.as_str().unwrap_or_default();
    let raw = text.trim().trim_start_matches("0x");
    let code = hex::decode(raw)
        .map_err(|e| SpiderError::Decode(format!("eth_getCode {address:#x}: {e}")))?;
    if code.is_empty() {
        return Err(SpiderError::ArtifactNotFound {
            network: network.to_string(),
            address,
        });
    }
    Ok(Bytes::from(code))
}

#[async_trait]
impl ArtifactSource for EtherscanSource {
    async fn fetch_verified_contract(
        &self,
        network: &str,
        address: Address,
    ) -> Result<BuildArtifact> {
        let chain_id = NetworkConfig::get(network)?.chain_id;

        let source_url = self.url(
            chain_id,
            &format!("module=contract&action=getsourcecode&address={address:#x}"),
        );
        let (contract_name, abi, metadata) =
            parse_source_response(network, address, self.etherscan_get(&source_url).await?)?;

        let code_url = self.url(
            chain_id,
            &format!("module=proxy&action=eth_getCode&address={address:#x}&tag=latest"),
        );
        let bytecode = parse_code_response(network, address, self.etherscan_get(&code_url).await?)?;

        Ok(BuildArtifact {
            address,
            contract_name,
            abi: Arc::new(abi),
            bytecode,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> EtherscanResponse {
        serde_json::from_str(json).expect("response json")
    }

    #[test]
    fn test_unverified_marker_is_classified() {
        let resp = response(
            r#"{"status":"1","message":"OK","result":[{"SourceCode":"","ABI":"Contract source code not verified",
                "ContractName":"","CompilerVersion":"","OptimizationUsed":"","Runs":"","EVMVersion":"Default",
                "Proxy":"0","Implementation":""}]}"#,
        );
        let err = parse_source_response("mainnet", Address::ZERO, resp)
            .err()
            .expect("unverified");
        assert!(matches!(err, SpiderError::UnverifiedContract { .. }));
    }

    #[test]
    fn test_verified_record_yields_name_abi_and_metadata() {
        let resp = response(
            r#"{"status":"1","message":"OK","result":[{"SourceCode":"contract Comet {}",
                "ABI":"[{\"type\":\"function\",\"name\":\"baseToken\",\"stateMutability\":\"view\",\"inputs\":[],\"outputs\":[{\"name\":\"\",\"type\":\"address\"}]}]",
                "ContractName":"Comet","CompilerVersion":"v0.8.15+commit.e14f2714","OptimizationUsed":"1",
                "Runs":"1","EVMVersion":"Default","Proxy":"0","Implementation":""}]}"#,
        );
        let (name, abi, metadata) =
            parse_source_response("mainnet", Address::ZERO, resp).expect("verified");
        assert_eq!(name, "Comet");
        assert!(abi.function("baseToken").is_some());
        assert_eq!(metadata["optimizationUsed"], Value::Bool(true));
        assert_eq!(metadata["runs"], serde_json::json!(1));
    }

    #[test]
    fn test_error_status_and_empty_code_are_not_found() {
        let resp = response(r#"{"status":"0","message":"NOTOK","result":"Invalid Address format"}"#);
        assert!(matches!(
            parse_source_response("mainnet", Address::ZERO, resp),
            Err(SpiderError::ArtifactNotFound { .. })
        ));
        let code = response(r#"{"jsonrpc":"2.0","id":1,"result":"0x"}"#);
        assert!(matches!(
            parse_code_response("mainnet", Address::ZERO, code),
            Err(SpiderError::ArtifactNotFound { .. })
        ));
    }

    #[test]
    fn test_only_throttling_and_server_errors_are_retried() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(matches!(
            rejected_status(StatusCode::FORBIDDEN),
            SpiderError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_invalid_api_key_is_config_error() {
        let resp = response(r#"{"status":"0","message":"NOTOK","result":"Missing/Invalid API Key"}"#);
        assert!(matches!(api_key_error(&resp), Some(SpiderError::InvalidConfig(_))));
        let resp = response(r#"{"status":"0","message":"NOTOK","result":"Invalid Address format"}"#);
        assert!(api_key_error(&resp).is_none());
        let resp = response(r#"{"status":"1","message":"OK","result":[]}"#);
        assert!(api_key_error(&resp).is_none());
    }

    #[test]
    fn test_rate_limit_response_is_detected() {
        let resp = response(r#"{"status":"0","message":"NOTOK","result":"Max rate limit reached"}"#);
        assert!(is_rate_limited(&resp));
    }
}
