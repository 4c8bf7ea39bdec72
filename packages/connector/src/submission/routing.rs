use alloy_primitives::{Address, Bytes, TxKind, U256};
use alloy_rpc_types_eth::{TransactionInput, TransactionReceipt, TransactionRequest};
use alloy_sol_types::{sol, SolCall, SolEvent};
use connector_types::ChainKey;
use dashmap::DashMap;
use utils::evm_client::{signing::RemoteSigner, ChainRpc};

use super::SubmissionError;

sol! {
    interface IHub {
        function getUserDroneAddress(address user) external view returns (address);
        function getTransactionHash(address drone, address to, uint256 nonce, bytes calldata data) external view returns (bytes32);
        function deployDroneAndSendTransaction(address user, address to, bytes calldata data, bytes calldata signature) external returns (bool success, bytes memory returnData);
    }

    interface IDrone {
        function getNextNonce() external view returns (uint256);
        function sendTransaction(address to, uint256 nonce, bytes calldata data, bytes calldata signature) external returns (bool success, bytes memory returnData);

        event TransactionResult(bool success, bytes returnData);
    }
}

/// How a call reaches its contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    /// Through the user's drone, deployed on the fly by the hub when it doesn't exist yet
    Drone {
        hub: Address,
        drone: Address,
        deployed: bool,
    },
}

/// The transaction that actually gets sent
#[derive(Debug, Clone)]
pub struct RoutedCall {
    pub route: Route,
    pub to: Address,
    pub data: Bytes,
}

impl RoutedCall {
    pub fn direct(to: Address, data: Bytes) -> Self {
        Self {
            route: Route::Direct,
            to,
            data,
        }
    }

    pub fn is_routed(&self) -> bool {
        !matches!(self.route, Route::Direct)
    }

    /// Unwraps the `(bool success, bytes returnData)` a routed call returns
    pub fn unwrap_output(&self, output: Bytes) -> Result<Bytes, SubmissionError> {
        if !self.is_routed() {
            return Ok(output);
        }

        let result = IDrone::sendTransactionCall::abi_decode_returns(&output).map_err(|e| {
            SubmissionError::Reverted(format!("Unexpected drone response: {e}"))
        })?;

        if result.success {
            Ok(result.returnData)
        } else {
            Err(SubmissionError::reverted(&result.returnData))
        }
    }

    /// The drone's `TransactionResult` in a mined receipt
    pub fn unwrap_receipt(&self, receipt: &TransactionReceipt) -> Result<Bytes, SubmissionError> {
        let Route::Drone { hub, drone, .. } = &self.route else {
            return Ok(Bytes::new());
        };

        let log = receipt
            .inner
            .logs()
            .iter()
            .filter(|log| log.address() == *drone || log.address() == *hub)
            .find(|log| log.topic0() == Some(&IDrone::TransactionResult::SIGNATURE_HASH))
            .ok_or_else(|| {
                SubmissionError::Reverted("No transaction result log in receipt".to_string())
            })?;

        let result = IDrone::TransactionResult::decode_log_data(log.data()).map_err(|e| {
            SubmissionError::Reverted(format!("Unexpected transaction result: {e}"))
        })?;

        if result.success {
            Ok(result.returnData)
        } else {
            Err(SubmissionError::reverted(&result.returnData))
        }
    }
}

/// Hub availability per chain and drone address per user, both cached for the process lifetime
#[derive(Default)]
pub struct RouteCache {
    hubs: DashMap<ChainKey, bool>,
    drones: DashMap<(ChainKey, Address), Address>,
}

async fn view<C: SolCall>(
    rpc: &dyn ChainRpc,
    to: Address,
    call: C,
) -> Result<C::Return, SubmissionError> {
    let tx = TransactionRequest {
        to: Some(TxKind::Call(to)),
        input: TransactionInput::new(call.abi_encode().into()),
        ..Default::default()
    };
    let output = rpc.call(&tx).await?;

    C::abi_decode_returns(&output)
        .map_err(|e| SubmissionError::Reverted(format!("Unexpected response from {to}: {e}")))
}

async fn has_code(rpc: &dyn ChainRpc, address: Address) -> bool {
    match rpc.code_at(address).await {
        Ok(code) => !code.is_empty(),
        Err(err) => {
            tracing::warn!("EVM: {err}");
            false
        }
    }
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn hub_available(&self, rpc: &dyn ChainRpc, chain: &ChainKey, hub: Address) -> bool {
        if let Some(available) = self.hubs.get(chain) {
            return *available;
        }

        let available = has_code(rpc, hub).await;
        tracing::info!("EVM: hub on {chain} available: {available}");
        self.hubs.insert(chain.clone(), available);
        available
    }

    async fn drone_address(
        &self,
        rpc: &dyn ChainRpc,
        chain: &ChainKey,
        hub: Address,
        user: Address,
    ) -> Result<Address, SubmissionError> {
        let key = (chain.clone(), user);
        if let Some(drone) = self.drones.get(&key) {
            return Ok(*drone);
        }

        let drone = view(rpc, hub, IHub::getUserDroneAddressCall { user }).await?;
        self.drones.insert(key, drone);
        Ok(drone)
    }

    /// Wraps a call to `to` so it executes from `user`'s drone, the signer authorizes it
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve(
        &self,
        rpc: &dyn ChainRpc,
        signer: &dyn RemoteSigner,
        chain: &ChainKey,
        hub: Option<Address>,
        user: Address,
        to: Address,
        data: Bytes,
    ) -> Result<RoutedCall, SubmissionError> {
        let Some(hub) = hub else {
            return Ok(RoutedCall::direct(to, data));
        };
        if !self.hub_available(rpc, chain, hub).await {
            return Ok(RoutedCall::direct(to, data));
        }

        let drone = self.drone_address(rpc, chain, hub, user).await?;
        let deployed = has_code(rpc, drone).await;
        let nonce = if deployed {
            view(rpc, drone, IDrone::getNextNonceCall {}).await?
        } else {
            U256::ZERO
        };

        let hash = view(
            rpc,
            hub,
            IHub::getTransactionHashCall {
                drone,
                to,
                nonce,
                data: data.clone(),
            },
        )
        .await?;
        let signature = signer
            .sign_message(hash.as_slice())
            .await
            .map_err(SubmissionError::Signing)?;

        let (target, data) = if deployed {
            (
                drone,
                IDrone::sendTransactionCall {
                    to,
                    nonce,
                    data,
                    signature,
                }
                .abi_encode(),
            )
        } else {
            (
                hub,
                IHub::deployDroneAndSendTransactionCall {
                    user,
                    to,
                    data,
                    signature,
                }
                .abi_encode(),
            )
        };

        Ok(RoutedCall {
            route: Route::Drone {
                hub,
                drone,
                deployed,
            },
            to: target,
            data: data.into(),
        })
    }
}
