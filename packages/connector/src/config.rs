use std::{collections::BTreeMap, time::Duration};

use alloy_primitives::Address;
use connector_types::{ChainEndpoint, ChainKey};
use serde::{Deserialize, Serialize};
use utils::config::{expand_env, ConfigExt};

use crate::{
    blocks::BlockSubscriberSettings,
    submission::{ChainSubmissionSettings, FeeStrategy, SubmissionSettings},
};

/// The fully parsed config struct we use in the application
/// this is built up from the ConfigBuilder which can load from multiple sources (in order of preference):
///
/// 1. cli args
/// 2. environment variables
/// 3. config file
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// The log-level to use, in the format of [tracing directives](https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives).
    /// Default is `["info"]`
    pub log_level: Vec<String>,

    /// Per-chain overrides of the built-in chain table
    pub chains: BTreeMap<ChainKey, ChainConfig>,

    /// Default is `30`
    pub poll_interval_secs: u64,

    /// Blocks held back from the head, default is `3`
    pub confirmation_lag: u64,

    /// Default is `500`
    pub max_catchup_blocks: u64,

    /// The hub used on every chain that doesn't set its own
    pub hub_address: Option<Address>,

    pub gas_debit_webhook: Option<String>,

    pub vault_signer_url: Option<String>,

    /// Default is `120`
    pub receipt_timeout_secs: u64,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ChainConfig {
    pub ws_endpoint: Option<String>,
    pub http_endpoint: Option<String>,
    pub hub_address: Option<Address>,
    /// Skips fee estimation entirely, both must be set
    pub fixed_max_fee_per_gas: Option<u128>,
    pub fixed_priority_fee_per_gas: Option<u128>,
    /// Pre-London chains, priced with a single gas price
    pub legacy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: vec!["info".to_string()],
            chains: BTreeMap::from([(
                ChainKey::eip155(42161),
                ChainConfig {
                    // 110 kwei, arbitrum's base fee doesn't move
                    fixed_max_fee_per_gas: Some(110_000),
                    fixed_priority_fee_per_gas: Some(0),
                    ..Default::default()
                },
            )]),
            poll_interval_secs: 30,
            confirmation_lag: 3,
            max_catchup_blocks: 500,
            hub_address: None,
            gas_debit_webhook: None,
            vault_signer_url: None,
            receipt_timeout_secs: 120,
        }
    }
}

impl ConfigExt for Config {
    fn log_levels(&self) -> impl Iterator<Item = &str> {
        self.log_level.iter().map(|s| s.as_str())
    }
}

impl Config {
    /// Resolves the endpoints for a chain: config first, then the built-in table,
    /// with `${VAR}` placeholders expanded
    pub fn endpoint(&self, chain: &ChainKey) -> anyhow::Result<ChainEndpoint> {
        let known = ChainEndpoint::known(chain);
        let overrides = self.chains.get(chain);

        let ws_url = overrides
            .and_then(|c| c.ws_endpoint.clone())
            .or_else(|| known.as_ref().map(|k| k.ws_url.clone()));
        let http_url = overrides
            .and_then(|c| c.http_endpoint.clone())
            .or_else(|| known.as_ref().map(|k| k.http_url.clone()));

        match (ws_url, http_url) {
            (Some(ws_url), Some(http_url)) => Ok(ChainEndpoint {
                chain: chain.clone(),
                ws_url: expand_env(&ws_url)?,
                http_url: expand_env(&http_url)?,
            }),
            _ => Err(crate::connection::ConnectionError::UnknownChain(format!(
                "Invalid chain: {chain}"
            ))
            .into()),
        }
    }

    pub fn block_settings(&self) -> BlockSubscriberSettings {
        BlockSubscriberSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            confirmation_lag: self.confirmation_lag,
            max_catchup_blocks: self.max_catchup_blocks,
            ..Default::default()
        }
    }

    pub fn submission_settings(&self) -> SubmissionSettings {
        let chains = self
            .chains
            .iter()
            .map(|(chain, config)| {
                let fees = match (
                    config.fixed_max_fee_per_gas,
                    config.fixed_priority_fee_per_gas,
                ) {
                    (Some(max_fee_per_gas), Some(max_priority_fee_per_gas)) => FeeStrategy::Fixed {
                        max_fee_per_gas,
                        max_priority_fee_per_gas,
                    },
                    _ if config.legacy => FeeStrategy::Legacy,
                    _ => FeeStrategy::Eip1559,
                };

                (
                    chain.clone(),
                    ChainSubmissionSettings {
                        fees,
                        hub_address: config.hub_address.or(self.hub_address),
                    },
                )
            })
            .collect();

        SubmissionSettings {
            chains,
            default_hub_address: self.hub_address,
            receipt_timeout: Duration::from_secs(self.receipt_timeout_secs),
            gas_debit_webhook: self.gas_debit_webhook.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::args::CliArgs;
    use utils::config::ConfigBuilder;

    #[test]
    fn config_file_and_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("connector.toml"),
            r#"
            [default]
            log_level = ["debug"]

            [connector]
            confirmation_lag = 5

            [connector.chains."eip155:31337"]
            ws_endpoint = "ws://localhost:8546"
            http_endpoint = "http://localhost:${ANVIL_PORT}"
            legacy = true
            "#,
        )
        .unwrap();

        temp_env::with_vars(
            [
                ("CONNECTOR_POLL_INTERVAL_SECS", Some("2")),
                ("ANVIL_PORT", Some("8545")),
            ],
            || {
                let config: Config = ConfigBuilder::new(CliArgs {
                    home: Some(dir.path().to_path_buf()),
                    ..Default::default()
                })
                .build()
                .unwrap();

                assert_eq!(config.log_level, vec!["debug".to_string()]);
                assert_eq!(config.confirmation_lag, 5);
                assert_eq!(config.poll_interval_secs, 2);
                assert_eq!(config.max_catchup_blocks, 500);

                let local = ChainKey::eip155(31337);
                let endpoint = config.endpoint(&local).unwrap();
                assert_eq!(endpoint.http_url, "http://localhost:8545");

                let settings = config.submission_settings();
                assert_eq!(settings.chains[&local].fees, FeeStrategy::Legacy);
            },
        );
    }

    #[test]
    fn unknown_chain_is_rejected() {
        let config = Config::default();
        let err = config.endpoint(&ChainKey::eip155(999_999)).unwrap_err();
        assert!(err.to_string().contains("Invalid chain: eip155:999999"));

        temp_env::with_var("ANKR_KEY", Some("secret"), || {
            let endpoint = config.endpoint(&ChainKey::eip155(1)).unwrap();
            assert_eq!(endpoint.http_url, "https://rpc.ankr.com/eth/secret");
        });
    }
}
