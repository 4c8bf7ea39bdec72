mod cursor;

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use alloy_rpc_types_eth::Block;
use connector_types::ChainKey;
use futures::{stream::SelectAll, Stream, StreamExt};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use utils::evm_client::ChainRpc;

use crate::{
    connection::{ConnectionError, HeadsSource},
    pool::{ConnectionHandle, ConnectionPool},
};

pub use cursor::{BlockCursor, CursorStep};

#[derive(Clone, Debug)]
pub enum BlockEvent {
    /// A full block, transactions included
    Block(Arc<Block>),
    /// The subscriber fell too far behind and jumped to the head,
    /// blocks `from..=to` are never delivered
    Skipped { from: u64, to: u64 },
    /// The connection gave up, nothing follows
    Fatal(String),
}

#[derive(Clone, Debug)]
pub struct BlockSubscriberSettings {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub fetch_timeout: Duration,
    pub confirmation_lag: u64,
    pub max_catchup_blocks: u64,
    /// Catching up pauses this long after a block couldn't be fetched
    pub fetch_cooldown: Duration,
    /// Polls in a row without a push head before the push channel is considered stalled
    pub stalled_push_polls: u32,
    /// Failed polls in a row, with no height ever seen, before giving up
    pub max_poll_failures: u32,
    pub channel_capacity: usize,
}

impl Default for BlockSubscriberSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(30),
            confirmation_lag: 3,
            max_catchup_blocks: 500,
            fetch_cooldown: Duration::from_secs(5),
            stalled_push_polls: 10,
            max_poll_failures: 10,
            channel_capacity: 1024,
        }
    }
}

/// Turns pushed heads plus a polling fallback into an ordered, gap-filled stream of full blocks
///
/// Runs while anyone listens: the task starts with the first subscriber and
/// exits once the last receiver is gone.
pub struct BlockSubscriber {
    settings: BlockSubscriberSettings,
    tx: broadcast::Sender<BlockEvent>,
    task: TaskSlot,
}

/// The running subscriber task, `None` once it decided to exit
///
/// Subscribing and exiting both happen under this lock, so a receiver added
/// while the task winds down is either seen by it or gets a fresh task.
type TaskSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

impl BlockSubscriber {
    pub fn new(settings: BlockSubscriberSettings) -> Self {
        let (tx, _) = broadcast::channel(settings.channel_capacity);
        Self {
            settings,
            tx,
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(
        &self,
        chain: ChainKey,
        rpc: Arc<dyn ChainRpc>,
        heads: Arc<dyn HeadsSource>,
        connection_shutdown: CancellationToken,
    ) -> broadcast::Receiver<BlockEvent> {
        let mut task = self.task.lock().unwrap();
        let rx = self.tx.subscribe();

        if task.as_ref().map(|t| t.is_finished()).unwrap_or(true) {
            *task = Some(tokio::spawn(run_subscriber(
                chain,
                rpc,
                heads,
                self.tx.clone(),
                self.settings.clone(),
                connection_shutdown,
                self.task.clone(),
            )));
        }

        rx
    }
}

impl Drop for BlockSubscriber {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

struct SubscriberState {
    chain: ChainKey,
    rpc: Arc<dyn ChainRpc>,
    heads: Arc<dyn HeadsSource>,
    tx: broadcast::Sender<BlockEvent>,
    settings: BlockSubscriberSettings,
    cursor: BlockCursor,
    /// polls since the last pushed head
    num_polled: u32,
    poll_failures: u32,
}

#[instrument(skip_all, fields(subsys = "BlockSubscriber", chain = %chain))]
async fn run_subscriber(
    chain: ChainKey,
    rpc: Arc<dyn ChainRpc>,
    heads: Arc<dyn HeadsSource>,
    tx: broadcast::Sender<BlockEvent>,
    settings: BlockSubscriberSettings,
    shutdown: CancellationToken,
    task: TaskSlot,
) {
    let mut heads_rx = Some(heads.heads());
    let mut poll = tokio::time::interval(settings.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut state = SubscriberState {
        cursor: BlockCursor::new(
            settings.confirmation_lag,
            settings.max_catchup_blocks,
            settings.fetch_cooldown,
        ),
        chain,
        rpc,
        heads,
        tx,
        settings,
        num_polled: 0,
        poll_failures: 0,
    };

    tracing::debug!("EVM: block subscriber started");

    loop {
        let height = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,

            head = async {
                match heads_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => match head {
                Ok(height) => {
                    state.num_polled = 0;
                    Some(height)
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!("EVM: skipped {n} pushed heads, polling covers them");
                    None
                }
                Err(RecvError::Closed) => {
                    tracing::warn!("EVM: push channel closed, relying on polling");
                    heads_rx = None;
                    None
                }
            },

            _ = poll.tick() => match state.poll().await {
                Ok(height) => height,
                Err(fatal) => {
                    tracing::error!("EVM: {fatal}");
                    let _ = state.tx.send(BlockEvent::Fatal(fatal));
                    state.heads.close();
                    shutdown.cancel();
                    break;
                }
            },
        };

        if let Some(height) = height {
            state.cursor.observe(height);
        }

        if !state.catch_up(heads_rx.as_mut()).await {
            let mut task = task.lock().unwrap();
            if state.tx.receiver_count() > 0 {
                // someone subscribed in the meantime
                continue;
            }
            tracing::debug!("EVM: no block receivers left");
            task.take();
            break;
        }
    }

    tracing::debug!("EVM: block subscriber stopped");
}

impl SubscriberState {
    /// `Err` only when the connection should be given up on
    async fn poll(&mut self) -> Result<Option<u64>, String> {
        match tokio::time::timeout(self.settings.poll_timeout, self.rpc.block_number()).await {
            Ok(Ok(height)) => {
                self.poll_failures = 0;
                self.num_polled += 1;

                if self.cursor.is_new(height) && self.num_polled > self.settings.stalled_push_polls
                {
                    tracing::warn!(
                        "EVM: push channel stalled for {} polls, reconnecting",
                        self.num_polled
                    );
                    self.heads.reconnect();
                    self.num_polled = 0;
                }

                Ok(Some(height))
            }
            Ok(Err(err)) => self.poll_failed(err.to_string()),
            Err(_) => self.poll_failed("timed out".to_string()),
        }
    }

    fn poll_failed(&mut self, reason: String) -> Result<Option<u64>, String> {
        self.poll_failures += 1;
        tracing::warn!(
            "EVM: block height poll failed ({} in a row): {reason}",
            self.poll_failures
        );

        if self.poll_failures > self.settings.max_poll_failures && self.cursor.latest().is_none()
        {
            return Err(format!(
                "{} failed polls in a row without ever seeing a block on {}",
                self.poll_failures, self.chain
            ));
        }

        Ok(None)
    }

    /// Returns false once nobody listens anymore
    async fn catch_up(&mut self, mut heads_rx: Option<&mut broadcast::Receiver<u64>>) -> bool {
        loop {
            // heights pushed while fetching extend this same run
            if let Some(rx) = heads_rx.as_mut() {
                while let Ok(height) = rx.try_recv() {
                    self.num_polled = 0;
                    self.cursor.observe(height);
                }
            }

            match self.cursor.next_step(Instant::now()) {
                CursorStep::Idle => return self.tx.receiver_count() > 0,
                CursorStep::Skip { from, to } => {
                    tracing::warn!("EVM: too far behind, skipping blocks {from}..={to}");
                    if self.tx.send(BlockEvent::Skipped { from, to }).is_err() {
                        return false;
                    }
                }
                CursorStep::Fetch(height) => {
                    let result = tokio::time::timeout(
                        self.settings.fetch_timeout,
                        self.rpc.block_with_transactions(height),
                    )
                    .await;

                    match result {
                        Ok(Ok(Some(block))) => {
                            self.cursor.advance(height);
                            if self.tx.send(BlockEvent::Block(Arc::new(block))).is_err() {
                                return false;
                            }
                        }
                        Ok(Ok(None)) => {
                            tracing::warn!("EVM: block {height} not available yet");
                            self.cursor.failed(Instant::now());
                            return true;
                        }
                        Ok(Err(err)) => {
                            tracing::warn!("EVM: {err}");
                            self.cursor.failed(Instant::now());
                            return true;
                        }
                        Err(_) => {
                            tracing::warn!("EVM: fetching block {height} timed out");
                            self.cursor.failed(Instant::now());
                            return true;
                        }
                    }
                }
            }
        }
    }
}

/// The merged block streams of several chains
///
/// Holds a pool handle per chain, dropping it unsubscribes from all of them.
pub struct MultiChainBlocks {
    streams: SelectAll<Pin<Box<dyn Stream<Item = (ChainKey, BlockEvent)> + Send>>>,
    handles: Vec<ConnectionHandle>,
}

impl MultiChainBlocks {
    /// The request/response side of a subscribed chain's connection
    pub fn rpc(&self, chain: &ChainKey) -> Option<Arc<dyn ChainRpc>> {
        self.handles
            .iter()
            .find(|handle| handle.chain() == chain)
            .map(|handle| handle.rpc())
    }
}

impl Stream for MultiChainBlocks {
    type Item = (ChainKey, BlockEvent);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.streams.poll_next_unpin(cx)
    }
}

pub fn subscribe_blocks(
    pool: &ConnectionPool,
    chains: &[ChainKey],
) -> Result<MultiChainBlocks, ConnectionError> {
    let mut streams = SelectAll::new();
    let mut handles = Vec::with_capacity(chains.len());

    for chain in chains {
        let handle = pool.acquire(chain)?;
        let mut rx = handle.subscribe_blocks()?;
        let chain = chain.clone();

        let stream: Pin<Box<dyn Stream<Item = (ChainKey, BlockEvent)> + Send>> =
            Box::pin(async_stream::stream! {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let fatal = matches!(event, BlockEvent::Fatal(_));
                            yield (chain.clone(), event);
                            if fatal {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::error!(
                                "EVM: block consumer on {chain} lagged, {n} events lost"
                            );
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });

        streams.push(stream);
        handles.push(handle);
    }

    Ok(MultiChainBlocks {
        streams,
        handles,
    })
}

#[cfg(test)]
mod test {
    use utils::test_utils::mock_chain::MockChain;

    use super::*;
    use crate::test_utils::MockHeads;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn resubscribing_while_the_task_winds_down() {
        let chain = ChainKey::eip155(5);
        let mock = MockChain::new();
        let heads = Arc::new(MockHeads::default());
        let subscriber = BlockSubscriber::new(BlockSubscriberSettings {
            confirmation_lag: 0,
            ..Default::default()
        });
        let shutdown = CancellationToken::new();

        let mut height = 1;
        mock.advance_to(height);

        for round in 0..50 {
            let mut rx = subscriber.subscribe(
                chain.clone(),
                Arc::new(mock.clone()),
                heads.clone(),
                shutdown.clone(),
            );

            let delivered = tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    height += 1;
                    mock.advance_to(height);
                    heads.push(height);

                    if let Ok(Ok(BlockEvent::Block(_))) =
                        tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
                    {
                        break;
                    }
                }
            })
            .await;
            assert!(delivered.is_ok(), "no block after resubscribing in round {round}");

            // the next subscribe races the task noticing this drop
            drop(rx);
        }

        shutdown.cancel();
    }
}
