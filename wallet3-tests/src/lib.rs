//! Shared setup for the wallet3 integration tests

use std::sync::{Arc, Once};
use std::time::Duration;

use wallet3_config::{Network, WalletConfig};
use wallet3_sync::mocks::{self, MockDaemon};
use wallet3_sync::storage::InMemoryStorage;
use wallet3_sync::sync::Wallet;

/// Wallet over the in-memory store and the mock daemon
pub type TestWallet = Wallet<InMemoryStorage, MockDaemon>;

static LOG_INIT: Once = Once::new();

/// Installs a log subscriber writing through the test harness, once per test binary
pub fn init_tracing() {
    LOG_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init();
    });
}

/// Fakechain config with a short deregistration timeout
pub fn fakechain_config() -> WalletConfig {
    let mut config = WalletConfig::create_unconnected(Network::Fakechain, None);
    config.daemon.deregister_timeout = Duration::from_millis(100);
    config
}

/// Opens a stopped wallet for keyring `seed` over `storage`, talking to `daemon`
pub fn open_wallet(
    seed: u8,
    storage: Arc<InMemoryStorage>,
    daemon: Arc<MockDaemon>,
) -> Arc<TestWallet> {
    Wallet::new(
        Arc::new(mocks::keyring(seed)),
        storage,
        daemon,
        &fakechain_config(),
    )
    .expect("in-memory storage opens")
}

/// Fresh storage and daemon with a wallet already registered
pub fn running_wallet(seed: u8) -> (Arc<TestWallet>, Arc<MockDaemon>) {
    init_tracing();
    let daemon = Arc::new(MockDaemon::new());
    let wallet = open_wallet(seed, Arc::new(InMemoryStorage::new()), daemon.clone());
    wallet.init();
    (wallet, daemon)
}
