use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use connector_types::ChainKey;
use tokio::sync::broadcast;
use utils::{evm_client::ChainRpc, test_utils::mock_chain::MockChain};

use crate::{
    connection::{ConnectionError, HeadsSource},
    pool::ConnectionFactory,
};

/// Heads pushed by hand
pub struct MockHeads {
    tx: broadcast::Sender<u64>,
    reconnects: AtomicUsize,
    closed: AtomicBool,
}

impl Default for MockHeads {
    fn default() -> Self {
        Self {
            tx: broadcast::channel(256).0,
            reconnects: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

impl MockHeads {
    pub fn push(&self, height: u64) {
        let _ = self.tx.send(height);
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl HeadsSource for MockHeads {
    fn heads(&self) -> broadcast::Receiver<u64> {
        self.tx.subscribe()
    }

    fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out one [`MockChain`] and one [`MockHeads`] per chain, shared across reopens
#[derive(Default)]
pub struct MockFactory {
    chains: Mutex<HashMap<ChainKey, (MockChain, Arc<MockHeads>)>>,
    opened: Mutex<HashMap<ChainKey, usize>>,
}

impl MockFactory {
    pub fn chain(&self, chain: &ChainKey) -> MockChain {
        self.entry(chain).0
    }

    pub fn heads(&self, chain: &ChainKey) -> Arc<MockHeads> {
        self.entry(chain).1
    }

    pub fn opened(&self, chain: &ChainKey) -> usize {
        self.opened
            .lock()
            .unwrap()
            .get(chain)
            .copied()
            .unwrap_or_default()
    }

    fn entry(&self, chain: &ChainKey) -> (MockChain, Arc<MockHeads>) {
        self.chains
            .lock()
            .unwrap()
            .entry(chain.clone())
            .or_insert_with(|| {
                let mock = MockChain::new();
                if let Ok(chain_id) = chain.evm_chain_id() {
                    mock.with_state(|state| state.chain_id = chain_id);
                }
                (mock, Arc::new(MockHeads::default()))
            })
            .clone()
    }
}

impl ConnectionFactory for MockFactory {
    fn open(
        &self,
        chain: &ChainKey,
    ) -> Result<(Arc<dyn ChainRpc>, Arc<dyn HeadsSource>), ConnectionError> {
        if !chain.is_evm() {
            return Err(ConnectionError::UnsupportedChain(chain.clone()));
        }

        *self.opened.lock().unwrap().entry(chain.clone()).or_default() += 1;

        let (mock, heads) = self.entry(chain);
        Ok((Arc::new(mock), heads))
    }
}
