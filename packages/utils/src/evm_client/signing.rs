use alloy_dyn_abi::TypedData;
use alloy_eips::eip2718::Encodable2718;
use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, Bytes};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_signer::{k256::SecretKey, Signer};
use alloy_signer_local::{coins_bip39::English, MnemonicBuilder, PrivateKeySigner};
use async_trait::async_trait;

use crate::error::EvmClientError;

/// Everything the connector needs from whoever holds the keys
///
/// In production this is the vault service, the connector itself never sees a private key.
#[async_trait]
pub trait RemoteSigner: Send + Sync + 'static {
    async fn address(&self) -> Result<Address, EvmClientError>;

    /// EIP-191 personal message signature, 65 bytes
    async fn sign_message(&self, message: &[u8]) -> Result<Bytes, EvmClientError>;

    /// Signs a fully populated request, returning the EIP-2718 encoded transaction
    async fn sign_transaction(&self, tx: TransactionRequest) -> Result<Bytes, EvmClientError>;

    /// EIP-712 signature over a JSON typed-data document
    async fn sign_typed_data(&self, typed_data: &serde_json::Value)
        -> Result<Bytes, EvmClientError>;
}

pub fn make_signer(
    credentials: &str,
    hd_index: Option<u32>,
) -> Result<PrivateKeySigner, EvmClientError> {
    let hd_index = hd_index.unwrap_or_default();

    match credentials.strip_prefix("0x") {
        // a raw private key, nothing to derive from
        Some(stripped) => {
            if hd_index > 0 {
                return Err(EvmClientError::DerivationWithPrivateKey);
            }
            let private_key =
                const_hex::decode(stripped).map_err(|e| EvmClientError::Signing(e.into()))?;
            let secret_key = SecretKey::from_slice(&private_key)
                .map_err(|e| EvmClientError::Signing(anyhow::anyhow!("{e}")))?;
            Ok(PrivateKeySigner::from_signing_key(secret_key.into()))
        }
        None => MnemonicBuilder::<English>::default()
            .phrase(credentials)
            .index(hd_index)
            .and_then(|builder| builder.build())
            .map_err(|e| EvmClientError::Signing(e.into())),
    }
}

/// Signs with a key held in memory, for local development and tests
#[derive(Clone)]
pub struct LocalSigner {
    signer: PrivateKeySigner,
    wallet: EthereumWallet,
}

impl LocalSigner {
    pub fn new(credentials: &str, hd_index: Option<u32>) -> Result<Self, EvmClientError> {
        Ok(Self::from_signer(make_signer(credentials, hd_index)?))
    }

    pub fn from_signer(signer: PrivateKeySigner) -> Self {
        Self {
            wallet: EthereumWallet::from(signer.clone()),
            signer,
        }
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.signer.address())
            .finish()
    }
}

#[async_trait]
impl RemoteSigner for LocalSigner {
    async fn address(&self) -> Result<Address, EvmClientError> {
        Ok(self.signer.address())
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes, EvmClientError> {
        let signature = self
            .signer
            .sign_message(message)
            .await
            .map_err(|e| EvmClientError::Signing(e.into()))?;

        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }

    async fn sign_transaction(&self, tx: TransactionRequest) -> Result<Bytes, EvmClientError> {
        let envelope = tx
            .build(&self.wallet)
            .await
            .map_err(|e| EvmClientError::Signing(e.into()))?;

        Ok(Bytes::from(envelope.encoded_2718()))
    }

    async fn sign_typed_data(
        &self,
        typed_data: &serde_json::Value,
    ) -> Result<Bytes, EvmClientError> {
        let typed_data: TypedData = serde_json::from_value(typed_data.clone())
            .map_err(|e| EvmClientError::Signing(e.into()))?;
        let hash = typed_data
            .eip712_signing_hash()
            .map_err(|e| EvmClientError::Signing(e.into()))?;
        let signature = self
            .signer
            .sign_hash(&hash)
            .await
            .map_err(|e| EvmClientError::Signing(e.into()))?;

        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // the well known first anvil/hardhat dev key
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_MNEMONIC: &str = "test test test test test test test test test test test junk";

    #[test]
    fn key_and_mnemonic_agree() {
        let from_key = make_signer(DEV_KEY, None).unwrap();
        let from_mnemonic = make_signer(DEV_MNEMONIC, None).unwrap();
        assert_eq!(from_key.address(), from_mnemonic.address());

        assert!(matches!(
            make_signer(DEV_KEY, Some(1)),
            Err(EvmClientError::DerivationWithPrivateKey)
        ));
    }

    #[tokio::test]
    async fn message_signature_recovers() {
        let signer = LocalSigner::new(DEV_KEY, None).unwrap();
        let raw = signer.sign_message(b"hello").await.unwrap();
        assert_eq!(raw.len(), 65);

        let signature = alloy_primitives::Signature::from_raw(&raw).unwrap();
        let recovered = signature.recover_address_from_msg(b"hello").unwrap();
        assert_eq!(recovered, signer.address().await.unwrap());
    }
}
