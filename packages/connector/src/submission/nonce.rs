use std::sync::Arc;

use alloy_primitives::Address;
use connector_types::ChainKey;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per `(chain, sender)`, created on first use and kept for the process lifetime
#[derive(Default)]
pub struct NonceLocks {
    locks: DashMap<(ChainKey, Address), Arc<Mutex<()>>>,
}

impl NonceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Held from reading the pending nonce until the node accepted the transaction
    pub async fn lock(&self, chain: &ChainKey, sender: Address) -> OwnedMutexGuard<()> {
        // clone out of the map so no shard lock is held while waiting
        let lock = self
            .locks
            .entry((chain.clone(), sender))
            .or_default()
            .clone();

        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn serializes_per_key() {
        let locks = Arc::new(NonceLocks::new());
        let chain = ChainKey::eip155(5);
        let sender = Address::with_last_byte(1);

        let guard = locks.lock(&chain, sender).await;

        // another sender isn't blocked
        let _other = locks.lock(&chain, Address::with_last_byte(2)).await;
        let _other_chain = locks.lock(&ChainKey::eip155(1), sender).await;

        let waiter = {
            let locks = locks.clone();
            let chain = chain.clone();
            tokio::spawn(async move { locks.lock(&chain, sender).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 3);
    }
}
