mod rpc_types;
mod socket;

use std::sync::Arc;

use connector_types::ChainKey;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use utils::{error::EvmClientError, evm_client::ChainRpc};

use crate::blocks::{BlockEvent, BlockSubscriber, BlockSubscriberSettings};

pub use socket::WsHeads;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Unsupported chain {0}, only eip155 chains are served")]
    UnsupportedChain(ChainKey),

    #[error(transparent)]
    Client(#[from] EvmClientError),

    #[error("Connection to {0} is closed")]
    Closed(ChainKey),
}

/// Pushes new block heights, e.g. a `newHeads` subscription
pub trait HeadsSource: Send + Sync + 'static {
    /// Every call gets its own receiver
    fn heads(&self) -> broadcast::Receiver<u64>;

    /// Drops the current transport and establishes a fresh one
    fn reconnect(&self);

    fn close(&self);
}

/// One physical connection to one chain: request/response over http,
/// heads pushed over websocket, and the block subscriber layered on top
pub struct ChainConnection {
    chain: ChainKey,
    rpc: Arc<dyn ChainRpc>,
    heads: Arc<dyn HeadsSource>,
    blocks: BlockSubscriber,
    shutdown: CancellationToken,
}

impl ChainConnection {
    pub fn new(
        chain: ChainKey,
        rpc: Arc<dyn ChainRpc>,
        heads: Arc<dyn HeadsSource>,
        settings: BlockSubscriberSettings,
    ) -> Self {
        Self {
            blocks: BlockSubscriber::new(settings),
            chain,
            rpc,
            heads,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn chain(&self) -> &ChainKey {
        &self.chain
    }

    pub fn rpc(&self) -> Arc<dyn ChainRpc> {
        self.rpc.clone()
    }

    /// Starts the block subscriber on first use
    pub fn subscribe_blocks(&self) -> Result<broadcast::Receiver<BlockEvent>, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed(self.chain.clone()));
        }

        Ok(self.blocks.subscribe(
            self.chain.clone(),
            self.rpc.clone(),
            self.heads.clone(),
            self.shutdown.clone(),
        ))
    }

    /// Once closed, a connection is never reused
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!("EVM: closing connection to {}", self.chain);
        }
        self.shutdown.cancel();
        self.heads.close();
    }
}

impl Drop for ChainConnection {
    fn drop(&mut self) {
        self.close();
    }
}
