use alloy::primitives::Address;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpiderError>;

#[derive(Debug, Error)]
pub enum SpiderError {
    /// The artifact source has no verified source for this address.
    #[error("contract {address:#x} on {network} is not verified: {reason}")]
    UnverifiedContract {
        network: String,
        address: Address,
        reason: String,
    },
    #[error("no artifact found for {address:#x} on {network}")]
    ArtifactNotFound { network: String, address: Address },
    /// A declared call/slot strategy does not match the live contract.
    #[error("{contract} at {address:#x} has no zero-argument function `{function}`")]
    MissingRelationFunction {
        contract: String,
        address: Address,
        function: String,
    },
    #[error("call `{function}` on {address:#x} failed: {reason}")]
    CallFailed {
        address: Address,
        function: String,
        reason: String,
    },
    #[error("transient rpc failure: {0}")]
    TransientRpc(String),
    #[error("deployment {network}/{deployment} has no alias `{alias}`")]
    CrossDeploymentAliasMissing {
        network: String,
        deployment: String,
        alias: String,
    },
    #[error("deployment {network}/{deployment} has not been built or loaded")]
    DeploymentUnavailable { network: String, deployment: String },
    #[error("slot {slot} of {address:#x} does not hold an address: {word}")]
    InvalidSlotWord {
        address: Address,
        slot: String,
        word: String,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SpiderError {
    /// Only transport-level failures are worth another attempt. Verification and
    /// configuration failures are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpiderError::TransientRpc(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SpiderError::UnverifiedContract { .. } => "unverified_contract",
            SpiderError::ArtifactNotFound { .. } => "artifact_not_found",
            SpiderError::MissingRelationFunction { .. } => "missing_relation_function",
            SpiderError::CallFailed { .. } => "call_failed",
            SpiderError::TransientRpc(_) => "transient_rpc",
            SpiderError::CrossDeploymentAliasMissing { .. } => "cross_deployment_alias_missing",
            SpiderError::DeploymentUnavailable { .. } => "deployment_unavailable",
            SpiderError::InvalidSlotWord { .. } => "invalid_slot_word",
            SpiderError::InvalidConfig(_) => "invalid_config",
            SpiderError::Decode(_) => "decode",
            SpiderError::Storage(_) => "storage",
            SpiderError::Io(_) => "io",
            SpiderError::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_rpc_is_retryable() {
        assert!(SpiderError::TransientRpc("connection reset".into()).is_retryable());
        assert!(!SpiderError::UnverifiedContract {
            network: "mainnet".into(),
            address: Address::ZERO,
            reason: "Contract source code not verified".into(),
        }
        .is_retryable());
        assert!(!SpiderError::MissingRelationFunction {
            contract: "Comet".into(),
            address: Address::ZERO,
            function: "baseToken".into(),
        }
        .is_retryable());
    }
}
