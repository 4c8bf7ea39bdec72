use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use super::{
    rpc_types::{RpcIds, RpcInbound, RpcRequest, RpcRequestKind, RpcResponse},
    HeadsSource,
};

/// The push half of a chain connection: a `newHeads` subscription over one websocket
///
/// The socket is recreated in place whenever it drops, and the subscription
/// re-established on the new socket.
///
/// ## Retry Strategy
///
/// - **Backoff Timing**: starts at 1 second, doubles after each failed attempt,
///   capped at 30 seconds
/// - **Reset on Success**: the backoff resets as soon as a socket is established
/// - **Forced Reconnect**: [`HeadsSource::reconnect`] drops a live socket that stopped delivering
///   and reconnects right away
pub struct WsHeads {
    endpoint: String,
    heads_tx: broadcast::Sender<u64>,
    force_reconnect: Arc<Notify>,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

enum Disconnect {
    Shutdown,
    Forced,
    Dropped,
}

impl WsHeads {
    pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
    pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

    pub fn new(endpoint: String) -> Self {
        let (heads_tx, _) = broadcast::channel(256);
        let force_reconnect = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(connection_loop(
            endpoint.clone(),
            heads_tx.clone(),
            force_reconnect.clone(),
            shutdown.clone(),
        ));

        Self {
            endpoint,
            heads_tx,
            force_reconnect,
            shutdown,
            handle,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn next_backoff(current: Duration) -> Duration {
        (current * 2).min(Self::BACKOFF_CAP)
    }
}

impl HeadsSource for WsHeads {
    fn heads(&self) -> broadcast::Receiver<u64> {
        self.heads_tx.subscribe()
    }

    fn reconnect(&self) {
        self.force_reconnect.notify_one();
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WsHeads {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

async fn connection_loop(
    endpoint: String,
    heads_tx: broadcast::Sender<u64>,
    force_reconnect: Arc<Notify>,
    shutdown: CancellationToken,
) {
    let rpc_ids = RpcIds::default();
    let mut backoff = WsHeads::BACKOFF_BASE;

    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = connect_async(&endpoint) => result,
        };

        match result {
            Ok((ws, _)) => {
                tracing::info!("EVM: connected {endpoint}");
                backoff = WsHeads::BACKOFF_BASE;

                // responses from the previous socket will never arrive
                rpc_ids.clear_all();

                match handle_connection(ws, &rpc_ids, &heads_tx, &force_reconnect, &shutdown)
                    .await
                {
                    Ok(Disconnect::Shutdown) => break,
                    Ok(Disconnect::Forced) => {
                        tracing::warn!("EVM: forced reconnect of {endpoint}");
                    }
                    Ok(Disconnect::Dropped) => {
                        tracing::info!("EVM: disconnected {endpoint}");
                    }
                    Err(err) => {
                        tracing::error!("EVM: connection lost from {endpoint}: {err:?}");
                    }
                }
            }
            Err(err) => {
                tracing::error!(
                    "EVM: connect error to {endpoint}: {err:?}, retrying in {backoff:?}"
                );

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }

                backoff = WsHeads::next_backoff(backoff);
            }
        }
    }

    tracing::debug!("EVM: connection loop for {endpoint} exited");
}

async fn handle_connection(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    rpc_ids: &RpcIds,
    heads_tx: &broadcast::Sender<u64>,
    force_reconnect: &Notify,
    shutdown: &CancellationToken,
) -> Result<Disconnect, Box<dyn std::error::Error + Send + Sync>> {
    let (mut sink, mut stream) = ws.split();

    let request = serde_json::to_string(&RpcRequest::new_heads(rpc_ids))?;
    sink.send(Message::Text(request.into())).await?;

    let mut subscription_id: Option<String> = None;

    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                if let Some(subscription_id) = subscription_id.take() {
                    let request =
                        serde_json::to_string(&RpcRequest::unsubscribe(rpc_ids, subscription_id))?;
                    let _ = sink.send(Message::Text(request.into())).await;
                }
                let _ = sink.close().await;
                return Ok(Disconnect::Shutdown);
            }
            _ = force_reconnect.notified() => {
                let _ = sink.close().await;
                return Ok(Disconnect::Forced);
            }
            msg = stream.next() => msg,
        };

        let text = match msg {
            None => return Ok(Disconnect::Dropped),
            Some(msg) => match msg? {
                Message::Text(text) => text.to_string(),
                Message::Binary(bin) => match String::from_utf8(bin.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::debug!("EVM: ignoring non-utf8 binary message");
                        continue;
                    }
                },
                Message::Close(_) => {
                    tracing::info!("EVM: WebSocket closed gracefully");
                    return Ok(Disconnect::Dropped);
                }
                // tungstenite answers pings itself
                _ => continue,
            },
        };

        match serde_json::from_str::<RpcInbound>(&text) {
            Ok(RpcInbound::Response { id, result }) => match (rpc_ids.take(id), result) {
                (
                    Some(RpcRequestKind::SubscribeNewHeads),
                    Ok(RpcResponse::NewSubscription {
                        subscription_id: id,
                    }),
                ) => {
                    tracing::info!("EVM: subscribed to newHeads with subscription id {id}");
                    subscription_id = Some(id);
                }
                (Some(RpcRequestKind::Unsubscribe { subscription_id }), Ok(_)) => {
                    tracing::debug!("EVM: unsubscribed from {subscription_id}");
                }
                (Some(kind), Err(err)) => {
                    tracing::error!("EVM: RPC error for {kind:?}: {}", err.message);
                    if kind == RpcRequestKind::SubscribeNewHeads {
                        // nothing will ever arrive on this socket
                        return Ok(Disconnect::Dropped);
                    }
                }
                (kind, result) => {
                    tracing::warn!("EVM: unexpected response {result:?} for {kind:?}");
                }
            },
            Ok(RpcInbound::NewHead {
                subscription_id: id,
                number,
            }) => {
                if subscription_id.as_deref() != Some(id.as_str()) {
                    tracing::warn!("EVM: newHeads event for unknown subscription id {id}");
                    continue;
                }
                // no receivers is fine, the block subscriber may not be listening yet
                let _ = heads_tx.send(number);
            }
            Err(err) => {
                tracing::error!("EVM: failed to parse RPC message: {err}");
            }
        }
    }
}
