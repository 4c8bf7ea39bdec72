use thiserror::Error;
use utils::error::EvmClientError;

use super::gas::{ProbeFailure, GAS_CEILING};
use crate::{abi::AbiError, connection::ConnectionError};

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Abi(#[from] AbiError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Cannot estimate gas: {0}")]
    CannotEstimateGas(String),

    /// The caller's gas budget can't cover the minimum fee
    #[error("{0}")]
    FeeTooLow(String),

    #[error("Fee of {needed} wei per gas exceeds the cap of {cap}")]
    FeeCapExceeded { needed: u128, cap: u128 },

    #[error("{0}")]
    Reverted(String),

    #[error("Transaction not mined: {0}")]
    Timeout(String),

    #[error("Signer error: {0}")]
    Signing(EvmClientError),

    #[error(transparent)]
    Rpc(#[from] EvmClientError),
}

impl SubmissionError {
    /// The revert reason of return data, `"transaction failed"` when there is none
    pub fn reverted(return_data: &[u8]) -> Self {
        SubmissionError::Reverted(
            alloy_sol_types::decode_revert_reason(return_data)
                .unwrap_or_else(|| "transaction failed".to_string()),
        )
    }
}

impl From<ProbeFailure> for SubmissionError {
    fn from(failure: ProbeFailure) -> Self {
        SubmissionError::CannotEstimateGas(match failure {
            ProbeFailure::Ceiling => format!("call fails even with {GAS_CEILING} gas"),
            ProbeFailure::TooManyProbes => "gas search did not converge".to_string(),
        })
    }
}
