use alloy_primitives::{Address, B256, U256};
use connector_types::ChainKey;
use serde::Serialize;

/// What a mined call cost, reported so the user can be billed for it
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GasDebit {
    pub transaction: B256,
    pub block: Option<u64>,
    pub chain: ChainKey,
    pub contract_address: Address,
    pub user: Address,
    /// wei, as a decimal string
    pub gas_cost: String,
}

impl GasDebit {
    pub fn new(
        transaction: B256,
        block: Option<u64>,
        chain: ChainKey,
        contract_address: Address,
        user: Address,
        gas_cost: U256,
    ) -> Self {
        Self {
            transaction,
            block,
            chain,
            contract_address,
            user,
            gas_cost: gas_cost.to_string(),
        }
    }
}

/// Fire and forget, a failed debit is logged and never reaches the caller
#[derive(Clone)]
pub struct GasDebitWebhook {
    url: String,
    client: reqwest::Client,
}

impl GasDebitWebhook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn notify(&self, debit: GasDebit) {
        let webhook = self.clone();
        tokio::spawn(async move {
            let result = webhook
                .client
                .post(&webhook.url)
                .json(&debit)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match result {
                Ok(_) => tracing::debug!("Gas debit of {} sent", debit.transaction),
                Err(err) => tracing::error!(
                    "Failed to call gas debit webhook for {}: {err}",
                    debit.transaction
                ),
            }
        });
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn body_shape() {
        let debit = GasDebit::new(
            B256::ZERO,
            Some(7),
            ChainKey::eip155(5),
            Address::ZERO,
            Address::with_last_byte(1),
            U256::from(42_000),
        );

        let body = serde_json::to_value(&debit).unwrap();
        assert_eq!(body["chain"], json!("eip155:5"));
        assert_eq!(body["gasCost"], json!("42000"));
        assert_eq!(body["block"], json!(7));
        assert!(body.get("contractAddress").is_some());
    }

    #[tokio::test]
    async fn unreachable_webhook_is_only_logged() {
        // nothing listens on port 9 (discard), the spawned task just logs
        GasDebitWebhook::new("http://127.0.0.1:9/debit").notify(GasDebit::new(
            B256::ZERO,
            None,
            ChainKey::eip155(5),
            Address::ZERO,
            Address::ZERO,
            U256::ZERO,
        ));
    }
}
