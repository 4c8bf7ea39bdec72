use alloy_primitives::{Address, B256};
use rand::prelude::*;

use crate::evm_client::signing::LocalSigner;

pub const DEV_MNEMONIC: &str = "test test test test test test test test test test test junk";

pub fn rand_address_evm() -> Address {
    Address::from(rand::rng().random::<[u8; 20]>())
}

pub fn rand_hash() -> B256 {
    B256::from(rand::rng().random::<[u8; 32]>())
}

/// Signs with one of the well known anvil/hardhat dev accounts
pub type MockSigner = LocalSigner;

pub fn mock_signer(index: u32) -> MockSigner {
    LocalSigner::new(DEV_MNEMONIC, Some(index)).unwrap()
}
