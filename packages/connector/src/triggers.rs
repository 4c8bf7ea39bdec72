mod event;
mod filter;
mod logs;
mod pending;
mod transaction;

use std::sync::{Arc, Mutex};

use alloy_rpc_types_eth::Block;
use async_trait::async_trait;
use connector_types::{ChainKey, Notification, TriggerKind};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use utils::evm_client::ChainRpc;

use crate::{
    abi::AbiError,
    blocks::{subscribe_blocks, BlockEvent},
    connection::ConnectionError,
    pool::ConnectionPool,
};

pub use event::EventProcessor;
pub use filter::{DecodedLog, EventFilter, LogQueryKey, TopicSlots};
pub use logs::{LogCache, LogFetchSettings};
pub use pending::PendingLogWindow;
pub use transaction::TransactionProcessor;

/// Where a trigger delivers its notifications
pub type NotificationSink = mpsc::UnboundedSender<Notification>;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Abi(#[from] AbiError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Unable to get logs: {0}")]
    Logs(String),

    #[error("Connection to {chain} failed: {reason}")]
    Fatal { chain: ChainKey, reason: String },

    #[error("Trigger already started")]
    AlreadyStarted,

    #[error("Notification sink closed")]
    SinkClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    Running,
    Stopped,
}

/// A long running watcher that pushes notifications into its sink
#[async_trait]
pub trait Trigger: Send + Sync {
    /// Validation already happened on construction, this only spawns the work
    fn start(&self) -> Result<(), TriggerError>;

    fn stop(&self);

    fn state(&self) -> TriggerState;

    /// Resolves once the trigger stopped, with the error that interrupted it if any.
    /// Only the first waiter gets the error.
    async fn wait_until_stopped(&self) -> Result<(), TriggerError>;
}

/// The per-block work of a trigger
#[async_trait]
pub trait BlockHandler: Send + Sync + 'static {
    fn chains(&self) -> &[ChainKey];

    /// An `Err` interrupts the whole trigger
    async fn handle_block(
        &self,
        chain: &ChainKey,
        block: &Block,
        rpc: &Arc<dyn ChainRpc>,
        sink: &NotificationSink,
    ) -> Result<(), TriggerError>;
}

/// Drives a [`BlockHandler`] with the merged block streams of its chains
pub struct BlockTrigger<H: BlockHandler> {
    inner: Arc<TriggerInner<H>>,
}

struct TriggerInner<H> {
    handler: H,
    pool: ConnectionPool,
    sink: NotificationSink,
    shutdown: CancellationToken,
    state: watch::Sender<TriggerState>,
    outcome: Mutex<Option<Result<(), TriggerError>>>,
}

impl<H: BlockHandler> BlockTrigger<H> {
    pub fn new(handler: H, pool: ConnectionPool, sink: NotificationSink) -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                handler,
                pool,
                sink,
                shutdown: CancellationToken::new(),
                state: watch::channel(TriggerState::Idle).0,
                outcome: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl<H: BlockHandler> Trigger for BlockTrigger<H> {
    fn start(&self) -> Result<(), TriggerError> {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == TriggerState::Idle {
                *state = TriggerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(TriggerError::AlreadyStarted);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = inner.run().await;
            if let Err(err) = &outcome {
                tracing::error!("Trigger interrupted: {err}");
            }
            *inner.outcome.lock().unwrap() = Some(outcome);
            inner.state.send_replace(TriggerState::Stopped);
        });

        Ok(())
    }

    fn stop(&self) {
        self.inner.shutdown.cancel();
        // never started, nothing will flip the state for us
        self.inner.state.send_if_modified(|state| {
            if *state == TriggerState::Idle {
                *state = TriggerState::Stopped;
                true
            } else {
                false
            }
        });
    }

    fn state(&self) -> TriggerState {
        *self.inner.state.borrow()
    }

    async fn wait_until_stopped(&self) -> Result<(), TriggerError> {
        let mut rx = self.inner.state.subscribe();
        // the sender lives in `inner`, so this can't see a closed channel
        let _ = rx.wait_for(|state| *state == TriggerState::Stopped).await;

        self.inner
            .outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Ok(()))
    }
}

impl<H: BlockHandler> Drop for BlockTrigger<H> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl<H: BlockHandler> TriggerInner<H> {
    #[instrument(skip(self), fields(subsys = "Trigger"))]
    async fn run(&self) -> Result<(), TriggerError> {
        // handles are released when this is dropped, on every exit path
        let mut blocks = subscribe_blocks(&self.pool, self.handler.chains())?;

        loop {
            let (chain, event) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                next = blocks.next() => match next {
                    Some(next) => next,
                    None => return Ok(()),
                },
            };

            match event {
                BlockEvent::Block(block) => {
                    let Some(rpc) = blocks.rpc(&chain) else {
                        continue;
                    };

                    let result = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Ok(()),
                        result = self.handler.handle_block(&chain, &block, &rpc, &self.sink) => {
                            result
                        }
                    };

                    match result {
                        Ok(()) => {}
                        Err(TriggerError::SinkClosed) => {
                            tracing::debug!("Trigger sink closed, stopping");
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    }
                }
                BlockEvent::Skipped { from, to } => {
                    tracing::warn!(
                        "EVM: {chain} blocks {from}..={to} were skipped, their events are lost"
                    );
                }
                BlockEvent::Fatal(reason) => return Err(TriggerError::Fatal { chain, reason }),
            }
        }
    }
}

/// Hands a started trigger's notifications to `out` until the trigger stops,
/// either on its own or because `shutdown` fired, and returns how it stopped
pub async fn forward(
    trigger: &dyn Trigger,
    notifications: &mut mpsc::UnboundedReceiver<Notification>,
    shutdown: &CancellationToken,
    mut out: impl FnMut(Notification),
) -> Result<(), TriggerError> {
    let stopped = trigger.wait_until_stopped();
    tokio::pin!(stopped);
    let mut stopping = false;

    let result = loop {
        tokio::select! {
            biased;
            result = &mut stopped => break result,
            _ = shutdown.cancelled(), if !stopping => {
                tracing::info!("Shutting down");
                trigger.stop();
                stopping = true;
            }
            Some(notification) = notifications.recv() => out(notification),
        }
    };

    // sent before the trigger stopped
    while let Ok(notification) = notifications.try_recv() {
        out(notification);
    }

    result
}

/// Builds triggers from their control-plane description, sharing the pool and the log cache
#[derive(Clone)]
pub struct TriggerFactory {
    pool: ConnectionPool,
    logs: Arc<LogCache>,
    confirmation_lag: u64,
}

impl TriggerFactory {
    pub fn new(pool: ConnectionPool, logs: Arc<LogCache>, confirmation_lag: u64) -> Self {
        Self {
            pool,
            logs,
            confirmation_lag,
        }
    }

    /// Fails with [`TriggerError::InvalidParams`] before anything is subscribed
    pub fn create(
        &self,
        kind: &TriggerKind,
        sink: NotificationSink,
    ) -> Result<Box<dyn Trigger>, TriggerError> {
        Ok(match kind {
            TriggerKind::Transaction(config) => Box::new(BlockTrigger::new(
                TransactionProcessor::new(config)?,
                self.pool.clone(),
                sink,
            )),
            TriggerKind::Event(config) => Box::new(BlockTrigger::new(
                EventProcessor::new(config, self.logs.clone(), self.confirmation_lag)?,
                self.pool.clone(),
                sink,
            )),
        })
    }
}

/// `"eip155:5"` becomes `"5"`, other chains are left alone
fn chain_id_string(chain: &ChainKey) -> String {
    chain
        .evm_chain_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|_| chain.to_string())
}

fn send(sink: &NotificationSink, notification: Notification) -> Result<(), TriggerError> {
    sink.send(notification).map_err(|_| TriggerError::SinkClosed)
}
