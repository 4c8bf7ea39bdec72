use std::{
    collections::HashMap,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use connector_types::ChainKey;
use tracing::instrument;
use utils::evm_client::{ChainRpc, EvmQueryClient};

use crate::{
    blocks::BlockSubscriberSettings,
    config::Config,
    connection::{ChainConnection, ConnectionError, HeadsSource, WsHeads},
};

/// Opens the transports of a new connection
pub trait ConnectionFactory: Send + Sync + 'static {
    fn open(
        &self,
        chain: &ChainKey,
    ) -> Result<(Arc<dyn ChainRpc>, Arc<dyn HeadsSource>), ConnectionError>;
}

/// Resolves endpoints from config and the built-in chain table
pub struct EndpointFactory {
    config: Config,
}

impl EndpointFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConnectionFactory for EndpointFactory {
    fn open(
        &self,
        chain: &ChainKey,
    ) -> Result<(Arc<dyn ChainRpc>, Arc<dyn HeadsSource>), ConnectionError> {
        if !chain.is_evm() {
            return Err(ConnectionError::UnsupportedChain(chain.clone()));
        }

        let endpoint = self
            .config
            .endpoint(chain)
            .map_err(|e| ConnectionError::UnknownChain(e.to_string()))?;

        let rpc = EvmQueryClient::new_http(&endpoint.http_url)?;
        let heads = WsHeads::new(endpoint.ws_url);

        Ok((Arc::new(rpc), Arc::new(heads)))
    }
}

/// Chain id to shared connection, opened lazily and closed with the last handle
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    settings: BlockSubscriberSettings,
    // never held across an await
    entries: std::sync::Mutex<HashMap<ChainKey, PoolEntry>>,
}

struct PoolEntry {
    connection: Arc<ChainConnection>,
    refs: usize,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, settings: BlockSubscriberSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                settings,
                entries: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(EndpointFactory::new(config.clone())),
            config.block_settings(),
        )
    }

    #[instrument(skip(self), fields(subsys = "ConnectionPool"))]
    pub fn acquire(&self, chain: &ChainKey) -> Result<ConnectionHandle, ConnectionError> {
        let mut entries = self.inner.entries.lock().unwrap();

        if let Some(entry) = entries.get_mut(chain) {
            if !entry.connection.is_closed() {
                entry.refs += 1;
                return Ok(ConnectionHandle::new(
                    entry.connection.clone(),
                    self.inner.clone(),
                ));
            }
            tracing::info!("EVM: evicting closed connection to {chain}");
            entries.remove(chain);
        }

        let (rpc, heads) = self.inner.factory.open(chain)?;
        let connection = Arc::new(ChainConnection::new(
            chain.clone(),
            rpc,
            heads,
            self.inner.settings.clone(),
        ));
        tracing::debug!("EVM: opened connection to {chain}");

        entries.insert(
            chain.clone(),
            PoolEntry {
                connection: connection.clone(),
                refs: 1,
            },
        );

        Ok(ConnectionHandle::new(connection, self.inner.clone()))
    }

    /// Live handles on the current connection of `chain`
    pub fn ref_count(&self, chain: &ChainKey) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap()
            .get(chain)
            .map(|entry| entry.refs)
            .unwrap_or_default()
    }
}

impl PoolInner {
    fn release(&self, connection: &Arc<ChainConnection>) {
        let mut entries = self.entries.lock().unwrap();
        let chain = connection.chain();

        match entries.get_mut(chain) {
            Some(entry) if Arc::ptr_eq(&entry.connection, connection) => {
                entry.refs -= 1;
                if entry.refs == 0 {
                    entries.remove(chain);
                    connection.close();
                }
            }
            // already evicted and replaced, this one is closed anyway
            _ => connection.close(),
        }
    }
}

/// A counted reference to a pooled connection, released on drop
pub struct ConnectionHandle {
    connection: Arc<ChainConnection>,
    pool: Arc<PoolInner>,
    released: AtomicBool,
}

impl ConnectionHandle {
    fn new(connection: Arc<ChainConnection>, pool: Arc<PoolInner>) -> Self {
        Self {
            connection,
            pool,
            released: AtomicBool::new(false),
        }
    }

    /// Safe to call more than once, only the first call counts
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.pool.release(&self.connection);
        }
    }
}

impl Deref for ConnectionHandle {
    type Target = ChainConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::MockFactory;

    #[tokio::test]
    async fn shared_until_last_release() {
        let factory = Arc::new(MockFactory::default());
        let pool = ConnectionPool::new(factory.clone(), BlockSubscriberSettings::default());
        let chain = ChainKey::eip155(5);

        let a = pool.acquire(&chain).unwrap();
        let b = pool.acquire(&chain).unwrap();
        assert_eq!(pool.ref_count(&chain), 2);
        assert_eq!(factory.opened(&chain), 1);

        a.release();
        a.release();
        assert_eq!(pool.ref_count(&chain), 1);
        assert!(!b.is_closed());

        drop(b);
        assert_eq!(pool.ref_count(&chain), 0);

        let c = pool.acquire(&chain).unwrap();
        assert_eq!(factory.opened(&chain), 2);
        assert!(!c.is_closed());
    }

    #[tokio::test]
    async fn closed_connection_is_replaced() {
        let factory = Arc::new(MockFactory::default());
        let pool = ConnectionPool::new(factory.clone(), BlockSubscriberSettings::default());
        let chain = ChainKey::eip155(5);

        let stale = pool.acquire(&chain).unwrap();
        stale.close();

        let fresh = pool.acquire(&chain).unwrap();
        assert!(!fresh.is_closed());
        assert_eq!(factory.opened(&chain), 2);
        assert_eq!(pool.ref_count(&chain), 1);

        // releasing the evicted handle leaves the new entry alone
        drop(stale);
        assert_eq!(pool.ref_count(&chain), 1);
    }

    #[test]
    fn unknown_chains_fail_fast() {
        let pool = ConnectionPool::from_config(&Config::default());
        assert!(matches!(
            pool.acquire(&ChainKey::new("cosmos:hub").unwrap()),
            Err(ConnectionError::UnsupportedChain(_))
        ));
        assert!(matches!(
            pool.acquire(&ChainKey::eip155(999_999)),
            Err(ConnectionError::UnknownChain(_))
        ));
    }
}
