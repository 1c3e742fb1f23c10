use std::sync::Arc;

use wallet3_sync::mocks::{self, ChainBuilder, MockDaemon, Registration};
use wallet3_sync::primitives::SubaddressIndex;
use wallet3_sync::storage::InMemoryStorage;
use wallet3_sync::sync::{SyncStatus, Wallet};
use wallet3_tests::{fakechain_config, init_tracing, open_wallet, running_wallet};

#[test]
fn receive_then_spend_across_blocks() {
    let (wallet, daemon) = running_wallet(1);
    let address = wallet.keyring().main_address();
    let mut chain = ChainBuilder::new();

    chain.empty_blocks(1);
    chain.pay(&address, 10);
    chain.block();
    daemon.deliver_blocks(chain.blocks().to_vec());

    assert_eq!(wallet.last_scan_height(), 2);
    assert_eq!(wallet.get_balance().unwrap(), 10);
    let received = wallet.storage().outputs();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].block_height(), 2);
    assert_eq!(received[0].subaddress(), SubaddressIndex::PRIMARY);

    let key_image = received[0].key_image();
    let spend_hash = chain.spend(&[key_image]);
    daemon.deliver_blocks(vec![chain.block()]);

    assert_eq!(wallet.last_scan_height(), 3);
    assert_eq!(wallet.get_balance().unwrap(), 0);
    let spend = wallet.storage().spend(&key_image).unwrap();
    assert_eq!(spend.height(), 3);
    assert_eq!(spend.tx_hash(), spend_hash);
    assert!(wallet.storage().outputs()[0].spent());
}

#[test]
fn payments_from_strangers_are_ignored() {
    let (wallet, daemon) = running_wallet(1);
    let mut chain = ChainBuilder::new();

    chain.pay(&mocks::keyring(2).main_address(), 500);
    chain.pay(&wallet.keyring().main_address(), 7);
    chain.pay(&mocks::keyring(3).main_address(), 900);
    daemon.deliver_blocks(vec![chain.block()]);

    assert_eq!(wallet.get_balance().unwrap(), 7);
    assert_eq!(wallet.storage().outputs()[0].global_index(), 1);
}

#[test]
fn subaddress_payments_are_attributed() {
    init_tracing();
    let daemon = Arc::new(MockDaemon::new());
    let keyring = Arc::new(mocks::keyring_with_subaddresses(1));
    let wallet = Wallet::new(
        keyring.clone(),
        Arc::new(InMemoryStorage::new()),
        daemon.clone(),
        &fakechain_config(),
    )
    .unwrap();
    wallet.init();

    let index = SubaddressIndex::new(1, 3);
    let mut chain = ChainBuilder::new();
    chain.pay(&keyring.subaddress(index), 40);
    chain.pay(&keyring.main_address(), 2);
    daemon.deliver_blocks(vec![chain.block()]);

    let mut received = wallet.storage().outputs();
    received.sort_by_key(|output| output.amount());
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].subaddress(), SubaddressIndex::PRIMARY);
    assert_eq!(received[1].subaddress(), index);
    assert_eq!(wallet.get_balance().unwrap(), 42);
}

#[test]
fn coinbase_unlocks_later_than_transfers() {
    let (wallet, daemon) = running_wallet(1);
    let address = wallet.keyring().main_address();
    let mut chain = ChainBuilder::new();
    chain.coinbase(&address, 100);
    chain.pay(&address, 1);
    daemon.deliver_blocks(vec![chain.block()]);
    daemon.deliver_blocks(chain.empty_blocks(10));

    assert_eq!(wallet.last_scan_height(), 11);
    assert_eq!(wallet.get_balance().unwrap(), 101);
    assert_eq!(wallet.get_unlocked_balance().unwrap(), 1);

    daemon.deliver_blocks(chain.empty_blocks(20));
    assert_eq!(wallet.get_unlocked_balance().unwrap(), 101);
}

#[test]
fn timestamp_locked_payment_unlocks_at_converted_height() {
    let (wallet, daemon) = running_wallet(1);
    let address = wallet.keyring().main_address();
    let mut chain = ChainBuilder::new();
    // fakechain converts at one second per block: 20 blocks past block 1
    let unlock_time = mocks::GENESIS_TIMESTAMP + mocks::BLOCK_INTERVAL + 20;
    chain.pay_locked(&address, 60, unlock_time);
    chain.pay(&address, 4);
    daemon.deliver_blocks(vec![chain.block()]);

    let locked = wallet
        .storage()
        .outputs()
        .into_iter()
        .find(|output| output.amount() == 60)
        .unwrap();
    assert_eq!(locked.unlock_height(), 21);

    daemon.deliver_blocks(chain.empty_blocks(19));
    assert_eq!(wallet.last_scan_height(), 20);
    assert_eq!(wallet.get_unlocked_balance().unwrap(), 4);

    daemon.deliver_blocks(chain.empty_blocks(1));
    assert_eq!(wallet.get_unlocked_balance().unwrap(), 64);
}

#[test]
fn gaps_are_refilled_after_reregistration() {
    let (wallet, daemon) = running_wallet(1);
    let mut chain = ChainBuilder::new();
    chain.pay(&wallet.keyring().main_address(), 5);
    let blocks: Vec<_> = std::iter::once(chain.block())
        .chain(chain.empty_blocks(5))
        .collect();

    daemon.deliver_blocks(blocks[..2].to_vec());
    daemon.deliver_blocks(blocks[4..].to_vec());
    assert_eq!(wallet.last_scan_height(), 2);
    assert_eq!(
        daemon.last_registration(),
        Some(Registration {
            next_height: 3,
            update_sync_height: true,
            new_wallet: false,
        })
    );

    // the daemon resends from the rewound height
    daemon.deliver_blocks(blocks[2..].to_vec());
    assert_eq!(wallet.last_scan_height(), 6);
    assert_eq!(wallet.get_balance().unwrap(), 5);
    assert_eq!(wallet.status(), SyncStatus::AwaitingBlocks);
}

#[test]
fn session_survives_restart() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let mut chain = ChainBuilder::new();
    let address = mocks::keyring(1).main_address();

    let first_daemon = Arc::new(MockDaemon::new());
    let wallet = open_wallet(1, storage.clone(), first_daemon.clone());
    wallet.init();
    chain.pay(&address, 3);
    first_daemon.deliver_blocks(vec![chain.block()]);
    first_daemon.deliver_blocks(chain.empty_blocks(3));
    wallet.deregister().unwrap();
    assert!(!first_daemon.deliver_blocks(chain.empty_blocks(1)));
    drop(wallet);

    let second_daemon = Arc::new(MockDaemon::new());
    let reopened = open_wallet(1, storage, second_daemon.clone());
    assert_eq!(reopened.status(), SyncStatus::Stopped);
    reopened.init();

    assert_eq!(
        second_daemon.registrations(),
        vec![Registration {
            next_height: 5,
            update_sync_height: true,
            new_wallet: true,
        }]
    );
    second_daemon.deliver_blocks(chain.blocks()[4..].to_vec());
    assert_eq!(reopened.last_scan_height(), 5);
    assert_eq!(reopened.get_balance().unwrap(), 3);
}
