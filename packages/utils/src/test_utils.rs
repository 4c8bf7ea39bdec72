pub mod address;
pub mod mock_chain;
