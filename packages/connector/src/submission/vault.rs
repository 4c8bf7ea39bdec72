use alloy_primitives::{Address, Bytes};
use alloy_rpc_types_eth::TransactionRequest;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use utils::{error::EvmClientError, evm_client::signing::RemoteSigner};

/// The external key holder, spoken to over JSON-RPC
pub struct VaultSigner {
    url: String,
    client: reqwest::Client,
    address: OnceCell<Address>,
}

#[derive(Debug, Serialize)]
struct VaultRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: &'static str,
}

#[derive(Debug, Deserialize)]
struct VaultResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<VaultError>,
}

#[derive(Debug, Deserialize)]
struct VaultError {
    #[serde(default)]
    code: Option<i64>,
    message: String,
}

impl VaultResponse {
    fn into_result<T: DeserializeOwned>(self, method: &str) -> Result<T, EvmClientError> {
        if let Some(error) = self.error {
            return Err(EvmClientError::Signing(anyhow::anyhow!(
                "{method} failed ({}): {}",
                error.code.unwrap_or_default(),
                error.message
            )));
        }

        let result = self.result.ok_or_else(|| {
            EvmClientError::Signing(anyhow::anyhow!("{method} returned no result"))
        })?;

        serde_json::from_value(result).map_err(|e| EvmClientError::Signing(e.into()))
    }
}

impl VaultSigner {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            address: OnceCell::new(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, EvmClientError> {
        let request = VaultRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: "1",
        };

        // error bodies still carry a JSON-RPC error worth surfacing
        let response: VaultResponse = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EvmClientError::Signing(e.into()))?
            .json()
            .await
            .map_err(|e| EvmClientError::Signing(e.into()))?;

        response.into_result(method)
    }
}

impl std::fmt::Debug for VaultSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSigner").field("url", &self.url).finish()
    }
}

#[async_trait]
impl RemoteSigner for VaultSigner {
    async fn address(&self) -> Result<Address, EvmClientError> {
        self.address
            .get_or_try_init(|| self.call("ethGetAddress", json!({})))
            .await
            .copied()
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Bytes, EvmClientError> {
        self.call(
            "ethSignMessage",
            json!({ "message": const_hex::encode_prefixed(message) }),
        )
        .await
    }

    async fn sign_transaction(&self, tx: TransactionRequest) -> Result<Bytes, EvmClientError> {
        self.call("ethSignTransaction", json!({ "transaction": tx }))
            .await
    }

    async fn sign_typed_data(&self, typed_data: &Value) -> Result<Bytes, EvmClientError> {
        self.call(
            "ethSignTypedData",
            json!({ "data": typed_data, "version": "V4" }),
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_shape() {
        let request = VaultRequest {
            jsonrpc: "2.0",
            method: "ethSignMessage",
            params: json!({"message": "0x01"}),
            id: "1",
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "jsonrpc": "2.0",
                "method": "ethSignMessage",
                "params": {"message": "0x01"},
                "id": "1"
            })
        );
    }

    #[test]
    fn response_results_and_errors() {
        let ok: VaultResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "1",
            "result": "0x000000000000000000000000000000000000dEaD"
        }))
        .unwrap();
        let address: Address = ok.into_result("ethGetAddress").unwrap();
        assert_eq!(address, Address::left_padding_from(&[0xde, 0xad]));

        let failed: VaultResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "1",
            "error": {"code": -32000, "message": "locked"}
        }))
        .unwrap();
        let err = failed.into_result::<Bytes>("ethSignMessage").unwrap_err();
        assert!(err.to_string().contains("locked"));
    }
}
