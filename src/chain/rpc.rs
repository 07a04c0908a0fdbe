use alloy::dyn_abi::DynSolValue;
use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use alloy::transports::http::Http;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::retry::{run_with_retry, RetryFailure, RetryPolicy};
use super::{decode_output, encode_call, find_function, ChainReader};
use crate::error::{Result, SpiderError};

pub type HttpProvider = RootProvider<Http<Client>>;

/// JSON-RPC backed reader. Every request holds a permit from a shared semaphore, which is
/// the crawl-wide cap on in-flight calls.
#[derive(Clone)]
pub struct RpcChainReader {
    provider: Arc<HttpProvider>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl RpcChainReader {
    pub fn connect(rpc_url: &str, max_in_flight: usize, policy: RetryPolicy) -> Result<Self> {
        let trimmed = rpc_url.trim();
        let url = trimmed.parse::<reqwest::Url>().map_err(|err| {
            SpiderError::InvalidConfig(format!("invalid rpc url `{trimmed}`: {err}"))
        })?;
        Ok(Self::new(
            ProviderBuilder::new().on_http(url),
            max_in_flight,
            policy,
        ))
    }

    pub fn new(provider: HttpProvider, max_in_flight: usize, policy: RetryPolicy) -> Self {
        Self {
            provider: Arc::new(provider),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            policy,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn eth_call(&self, address: Address, function: &str, calldata: Vec<u8>) -> Result<Bytes> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SpiderError::TransientRpc("rpc limiter closed".to_string()))?;
        let tx = TransactionRequest::default()
            .to(address)
            .input(TransactionInput::new(Bytes::from(calldata)));
        let context = format!("eth_call({address:#x}.{function})");
        run_with_retry(self.policy, &context, || {
            let provider = self.provider.clone();
            let tx = tx.clone();
            async move { provider.call(&tx).await.map_err(|err| err.to_string()) }
        })
        .await
        .map_err(|failure| match failure {
            RetryFailure::Rejected(reason) => SpiderError::CallFailed {
                address,
                function: function.to_string(),
                reason,
            },
            RetryFailure::Exhausted(reason) => SpiderError::TransientRpc(reason),
        })
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn call(
        &self,
        address: Address,
        abi: &JsonAbi,
        function: &str,
        args: &[DynSolValue],
    ) -> Result<Vec<DynSolValue>> {
        let Some(func) = find_function(abi, function, args.len()) else {
            return Err(SpiderError::MissingRelationFunction {
                contract: "<abi>".to_string(),
                address,
                function: function.to_string(),
            });
        };
        let calldata = encode_call(func, args)?;
        let raw = self.eth_call(address, function, calldata).await?;
        decode_output(func, &raw)
    }

    async fn read_storage_slot(&self, address: Address, slot: B256) -> Result<B256> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SpiderError::TransientRpc("rpc limiter closed".to_string()))?;
        let index = U256::from_be_bytes(slot.0);
        let context = format!("eth_getStorageAt({address:#x}, {slot})");
        let word = run_with_retry(self.policy, &context, || {
            let provider = self.provider.clone();
            async move {
                provider
                    .get_storage_at(address, index)
                    .await
                    .map_err(|err| err.to_string())
            }
        })
        .await
        .map_err(|failure| match failure {
            RetryFailure::Rejected(reason) => SpiderError::CallFailed {
                address,
                function: format!("storage[{slot}]"),
                reason,
            },
            RetryFailure::Exhausted(reason) => SpiderError::TransientRpc(reason),
        })?;
        Ok(B256::from(word.to_be_bytes::<32>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_malformed_url() {
        let err = RpcChainReader::connect("not a url", 4, RetryPolicy::default())
            .err()
            .expect("malformed url must fail");
        assert!(matches!(err, SpiderError::InvalidConfig(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_in_flight_cap_is_at_least_one() {
        let reader = RpcChainReader::connect("http://localhost:8545", 0, RetryPolicy::default())
            .expect("reader");
        assert_eq!(reader.available_permits(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_call_without_function_in_abi_is_config_error() {
        let reader = RpcChainReader::connect("http://localhost:8545", 2, RetryPolicy::default())
            .expect("reader");
        let err = reader
            .call(Address::ZERO, &JsonAbi::default(), "implementation", &[])
            .await
            .err()
            .expect("missing function");
        assert!(matches!(err, SpiderError::MissingRelationFunction { .. }));
    }
}
