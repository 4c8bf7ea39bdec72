#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod error;
pub mod evm_client;
pub mod serde;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// the test version of init_tracing does not take a config,
// tests run in parallel and each would otherwise race to install its own subscriber
#[cfg(debug_assertions)]
pub fn init_tracing_tests() {
    use std::sync::LazyLock;

    static INIT: LazyLock<std::sync::Mutex<bool>> = LazyLock::new(|| std::sync::Mutex::new(false));

    let mut init = INIT.lock().unwrap();

    if !*init {
        *init = true;

        // a second init would panic, which doubles as a check that this is the only one
        tracing_subscriber::fmt::init();
        tracing::debug!("Tracing initialized for tests");
    }
}
