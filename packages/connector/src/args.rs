use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utils::{config::CliEnvExt, serde::deserialize_vec_string};

/// This struct is used for both args and environment variables
/// every env var can be overriden by a cli arg, and both override the config file
/// env vars follow the pattern of CONNECTOR_{UPPERCASE_ARG_NAME}
#[derive(Debug, Parser, Serialize, Deserialize, Default)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct CliArgs {
    #[command(subcommand)]
    #[serde(skip)]
    pub command: Option<Command>,

    /// The home directory of the application, where the connector.toml configuration file is stored
    /// if not provided here or in an env var, a series of default directories will be tried
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// The path to an optional dotenv file to try and load
    /// if not set, will be the current working directory's .env
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotenv: Option<PathBuf>,

    /// Log level in the format of comma-separated tracing directives.
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "deserialize_vec_string")]
    pub log_level: Vec<String>,

    /// Seconds between block height polls
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,

    /// Blocks held back from the head before they are processed
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_lag: Option<u64>,

    /// Beyond this many blocks behind, the block stream jumps to the head
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_catchup_blocks: Option<u64>,

    /// Where gas debits are reported after a transaction is mined
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_debit_webhook: Option<String>,

    /// The JSON-RPC endpoint of the vault signer
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault_signer_url: Option<String>,

    /// Seconds to wait for a receipt before bumping fees
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Runs a trigger and prints every notification as a JSON line
    Watch {
        #[arg(long, required = true)]
        chain: Vec<String>,

        /// Event declaration,
        /// e.g. "Transfer(address indexed from, address indexed to, uint256 value)"
        /// without one, transactions from/to `--address` are watched instead
        #[arg(long)]
        event: Vec<String>,

        #[arg(long)]
        address: Option<String>,

        /// Indexed parameter filters, as name=value
        #[arg(long = "filter")]
        filters: Vec<String>,
    },

    /// Prints the ordered block stream of one or more chains
    Blocks {
        #[arg(long, required = true)]
        chain: Vec<String>,
    },
}

impl CliEnvExt for CliArgs {
    const ENV_VAR_PREFIX: &'static str = "CONNECTOR";
    const TOML_IDENTIFIER: &'static str = "connector";

    fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }

    fn dotenv_path(&self) -> Option<PathBuf> {
        self.dotenv.clone()
    }
}
