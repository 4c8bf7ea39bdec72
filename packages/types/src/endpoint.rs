use serde::{Deserialize, Serialize};

use crate::ChainKey;

/// The websocket and http endpoints of one chain
///
/// Urls may contain `${VAR}` placeholders (api keys), which are expanded
/// from the environment when the endpoint is resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEndpoint {
    pub chain: ChainKey,
    pub ws_url: String,
    pub http_url: String,
}

#[derive(Clone, Copy)]
enum Provider {
    Ankr(&'static str),
    Alchemy(&'static str),
    GetBlock(&'static str),
}

impl Provider {
    fn urls(self) -> (String, String) {
        match self {
            Provider::Ankr(name) => (
                format!("wss://rpc.ankr.com/{name}/ws/${{ANKR_KEY}}"),
                format!("https://rpc.ankr.com/{name}/${{ANKR_KEY}}"),
            ),
            Provider::Alchemy(name) => (
                format!("wss://{name}.g.alchemy.com/v2/${{ALCHEMY_API_KEY}}"),
                format!("https://{name}.g.alchemy.com/v2/${{ALCHEMY_API_KEY}}"),
            ),
            Provider::GetBlock(name) => (
                format!("wss://{name}.getblock.io/mainnet/?api_key=${{GETBLOCK_API_KEY}}"),
                format!("https://{name}.getblock.io/mainnet/?api_key=${{GETBLOCK_API_KEY}}"),
            ),
        }
    }
}

const KNOWN_CHAINS: &[(u64, Provider)] = &[
    (1, Provider::Ankr("eth")),
    (42161, Provider::Ankr("arbitrum")),
    (100, Provider::Ankr("gnosis")),
    (137, Provider::Ankr("polygon")),
    (42220, Provider::Ankr("celo")),
    (43114, Provider::Ankr("avalanche")),
    (56, Provider::Ankr("bsc")),
    (250, Provider::Ankr("fantom")),
    (1666600000, Provider::Ankr("harmony")),
    (25, Provider::GetBlock("cro")),
    (1101, Provider::Ankr("polygon_zkevm")),
    (1284, Provider::Ankr("moonbeam")),
    // testnets
    (80001, Provider::Ankr("polygon_mumbai")),
    (5, Provider::Alchemy("eth-goerli")),
    (11155111, Provider::Ankr("eth_sepolia")),
    (97, Provider::Ankr("bsc_testnet_chapel")),
    (4002, Provider::Ankr("fantom_testnet")),
    (1442, Provider::Ankr("polygon_zkevm_testnet")),
];

impl ChainEndpoint {
    /// Looks up the built-in endpoint table, `None` for chains we don't know
    pub fn known(chain: &ChainKey) -> Option<Self> {
        let chain_id = chain.evm_chain_id().ok()?;
        KNOWN_CHAINS
            .iter()
            .find(|(id, _)| *id == chain_id)
            .map(|(_, provider)| {
                let (ws_url, http_url) = provider.urls();
                Self {
                    chain: chain.clone(),
                    ws_url,
                    http_url,
                }
            })
    }

    pub fn known_chains() -> impl Iterator<Item = ChainKey> {
        KNOWN_CHAINS.iter().map(|(id, _)| ChainKey::eip155(*id))
    }
}
