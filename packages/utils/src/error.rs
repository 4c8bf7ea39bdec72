use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvmClientError {
    #[error("HD index must be zero when using a private key (use mnemonic instead)")]
    DerivationWithPrivateKey,

    #[error("Unable to parse endpoint: {0}")]
    ParseEndpoint(String),

    #[error("Unable to get block height: {0}")]
    BlockHeight(anyhow::Error),

    #[error("Unable to get block {0}: {1}")]
    Block(u64, anyhow::Error),

    #[error("Unable to get logs: {0}")]
    Logs(anyhow::Error),

    #[error("Could not get contract code at {0}: {1:?}")]
    FailedGetCode(alloy_primitives::Address, anyhow::Error),

    #[error("Call reverted: {0}")]
    CallReverted(String),

    /// The call never got an answer from the EVM
    #[error("Unable to call: {0}")]
    Call(anyhow::Error),

    #[error("Unable to estimate gas: {0:#?}")]
    GasEstimation(anyhow::Error),

    #[error("Unable to get fee data: {0}")]
    FeeData(anyhow::Error),

    #[error("Unable to get nonce: {0}")]
    Nonce(anyhow::Error),

    #[error("Transaction underpriced: {0}")]
    Underpriced(String),

    #[error("Send Transaction Error: {0}")]
    SendTransaction(anyhow::Error),

    #[error("No Transaction Receipt: {0}")]
    TransactionReceipt(anyhow::Error),

    #[error("Unable to sign: {0:#?}")]
    Signing(anyhow::Error),

    #[error("Unable to get chain id: {0}")]
    ChainId(anyhow::Error),
}

impl EvmClientError {
    /// Nodes phrase "fee too low" differently, these cover geth, erigon, nethermind and besu
    pub fn is_underpriced_message(msg: &str) -> bool {
        let msg = msg.to_lowercase();
        msg.contains("underpriced")
            || msg.contains("fee too low")
            || msg.contains("max fee per gas less than block base fee")
            || msg.contains("feecap too low")
    }

    /// Classifies a failed `eth_sendRawTransaction`
    pub fn from_send_error(err: impl std::fmt::Display) -> Self {
        let msg = err.to_string();
        if Self::is_underpriced_message(&msg) {
            EvmClientError::Underpriced(msg)
        } else {
            EvmClientError::SendTransaction(anyhow::anyhow!(msg))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_send_errors() {
        assert!(matches!(
            EvmClientError::from_send_error("replacement transaction underpriced"),
            EvmClientError::Underpriced(_)
        ));
        assert!(matches!(
            EvmClientError::from_send_error("transaction fee too low"),
            EvmClientError::Underpriced(_)
        ));
        assert!(matches!(
            EvmClientError::from_send_error("insufficient funds for gas * price + value"),
            EvmClientError::SendTransaction(_)
        ));
    }
}
