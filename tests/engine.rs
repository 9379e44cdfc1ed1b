//! Transaction engine scenarios: cancellation, expiry, externally imposed
//! failure, reorg rollback, settlement clamping and a full sender
//! negotiation driven through the wallet supervisor.

use std::sync::Arc;

use tempfile::tempdir;

use mirage_wallet::config::EngineConfig;
use mirage_wallet::engine::{StubNodeEndpoint, StubPeerEndpoint, Wallet};
use mirage_wallet::types::MAX_HEIGHT;
use mirage_wallet::{
    ChainState, Coin, CoinId, CoinStatus, KeyKeeper, LocalKeyKeeper, SimpleTransfer, StubGateway,
    TxFailureReason, TxId, TxParameterId, TxParamsMessage, TxStateMachine, TxStatus, TxType,
    UpdateQueue, WalletId, WalletStore,
};

fn coin_kind_regular(idx: u64, value: u64) -> Coin {
    let mut coin = Coin::new(CoinId::new(idx, mirage_wallet::types::CoinKind::Regular, 0, value));
    coin.status = CoinStatus::Available;
    coin.confirm_height = 1;
    coin.maturity = 1;
    coin
}

fn tip_at(height: u64) -> ChainState {
    ChainState {
        height,
        hash: [height as u8; 32],
        hash_prev: [height.wrapping_sub(1) as u8; 32],
        difficulty: 1,
        timestamp: 1_700_000_000 + height,
        hash_utxos: [0u8; 32],
        hash_kernels: [0u8; 32],
    }
}

struct MachineFixture {
    _dir: tempfile::TempDir,
    store: Arc<WalletStore>,
    machine: TxStateMachine,
    tx_id: TxId,
}

fn machine_fixture() -> MachineFixture {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(WalletStore::open(&dir.path().join("wallet.redb")).expect("open store"));
    let keykeeper: Arc<dyn KeyKeeper> = Arc::new(LocalKeyKeeper::new([3u8; 32]));
    let tx_id = TxId::generate();
    let machine = TxStateMachine::new(
        tx_id,
        Arc::clone(&store),
        Some(keykeeper),
        Arc::new(UpdateQueue::new()),
        Box::new(SimpleTransfer),
    );
    MachineFixture {
        _dir: dir,
        store,
        machine,
        tx_id,
    }
}

fn seed_negotiation(fixture: &MachineFixture, status: TxStatus) {
    let store = &fixture.store;
    let tx_id = &fixture.tx_id;
    store
        .set_parameter(tx_id, TxParameterId::TransactionType, &TxType::Simple, true, 0)
        .expect("type");
    store
        .set_parameter(tx_id, TxParameterId::IsSender, &true, false, 0)
        .expect("sender");
    store
        .set_parameter(tx_id, TxParameterId::IsInitiator, &true, false, 0)
        .expect("initiator");
    store
        .set_parameter(tx_id, TxParameterId::Amount, &1_000u64, true, 0)
        .expect("amount");
    store
        .set_parameter(tx_id, TxParameterId::Fee, &100u64, true, 0)
        .expect("fee");
    store
        .set_parameter(tx_id, TxParameterId::MyId, &WalletId::from_bytes([1u8; 32]), false, 0)
        .expect("my id");
    store
        .set_parameter(tx_id, TxParameterId::PeerId, &WalletId::from_bytes([2u8; 32]), false, 0)
        .expect("peer id");
    store
        .set_parameter(tx_id, TxParameterId::Status, &status, true, 0)
        .expect("status");
}

#[test]
fn cancel_from_in_progress_notifies_peer_once() {
    let fixture = machine_fixture();
    seed_negotiation(&fixture, TxStatus::InProgress);

    // A reserved input that must return to the pool.
    let mut reserved = coin_kind_regular(1, 5_000);
    reserved.status = CoinStatus::Outgoing;
    reserved.spent_tx_id = Some(fixture.tx_id);
    fixture.store.save_coins(&[reserved]).expect("save coin");

    let gateway = StubGateway::new();
    assert!(fixture.machine.cancel(&gateway).expect("cancel"));

    let sent = gateway.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, WalletId::from_bytes([2u8; 32]));
    assert_eq!(
        sent[0].1.get::<TxFailureReason>(TxParameterId::FailureReason),
        Some(TxFailureReason::Canceled)
    );

    assert_eq!(gateway.completed(), vec![fixture.tx_id]);
    assert_eq!(
        fixture
            .store
            .get_parameter::<TxStatus>(&fixture.tx_id, TxParameterId::Status, 0)
            .expect("status"),
        Some(TxStatus::Canceled)
    );
    let coins = fixture.store.coins().expect("coins");
    assert_eq!(coins.len(), 1);
    assert_eq!(coins[0].status, CoinStatus::Available);
    assert_eq!(coins[0].spent_tx_id, None);

    // A second cancel is refused without another completion report.
    assert!(!fixture.machine.cancel(&gateway).expect("second cancel"));
    assert_eq!(gateway.completed().len(), 1);
}

#[test]
fn cancel_from_pending_stays_silent() {
    let fixture = machine_fixture();
    seed_negotiation(&fixture, TxStatus::Pending);

    let gateway = StubGateway::new();
    assert!(fixture.machine.cancel(&gateway).expect("cancel"));
    assert!(gateway.sent_messages().is_empty());
    assert_eq!(gateway.completed(), vec![fixture.tx_id]);
}

#[test]
fn tip_past_max_height_expires_unregistered_transfer() {
    let fixture = machine_fixture();
    seed_negotiation(&fixture, TxStatus::InProgress);
    fixture
        .store
        .set_parameter(&fixture.tx_id, TxParameterId::MinHeight, &50u64, false, 0)
        .expect("min height");
    fixture
        .store
        .set_parameter(&fixture.tx_id, TxParameterId::MaxHeight, &100u64, false, 0)
        .expect("max height");
    fixture
        .store
        .set_parameter(&fixture.tx_id, TxParameterId::InvitationSent, &true, false, 0)
        .expect("invitation mark");

    let gateway = StubGateway::new().with_tip(tip_at(100));
    fixture.machine.update(&gateway);
    assert_eq!(
        fixture
            .store
            .get_parameter::<TxStatus>(&fixture.tx_id, TxParameterId::Status, 0)
            .expect("status"),
        Some(TxStatus::InProgress)
    );

    gateway.set_tip(tip_at(101));
    fixture.machine.update(&gateway);
    assert_eq!(
        fixture
            .store
            .get_parameter::<TxStatus>(&fixture.tx_id, TxParameterId::Status, 0)
            .expect("status"),
        Some(TxStatus::Failed)
    );
    assert_eq!(
        fixture
            .store
            .get_parameter::<TxFailureReason>(&fixture.tx_id, TxParameterId::FailureReason, 0)
            .expect("reason"),
        Some(TxFailureReason::TransactionExpired)
    );
    assert_eq!(gateway.completed(), vec![fixture.tx_id]);

    // Updates into the terminal transfer are no-ops.
    fixture.machine.update(&gateway);
    assert_eq!(gateway.completed().len(), 1);
    assert_eq!(gateway.async_depth(), 0);
}

#[test]
fn externally_imposed_failure_is_adopted_and_echoed() {
    let fixture = machine_fixture();
    seed_negotiation(&fixture, TxStatus::InProgress);
    fixture
        .store
        .set_parameter(
            &fixture.tx_id,
            TxParameterId::FailureReason,
            &TxFailureReason::PeerSignatureInvalid,
            false,
            0,
        )
        .expect("reason");

    let gateway = StubGateway::new();
    fixture.machine.update(&gateway);

    assert_eq!(
        fixture
            .store
            .get_parameter::<TxStatus>(&fixture.tx_id, TxParameterId::Status, 0)
            .expect("status"),
        Some(TxStatus::Failed)
    );
    let sent = gateway.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].1.get::<TxFailureReason>(TxParameterId::FailureReason),
        Some(TxFailureReason::PeerSignatureInvalid)
    );
    assert_eq!(gateway.completed(), vec![fixture.tx_id]);
}

#[test]
fn reorg_rollback_reopens_proved_kernels_only() {
    let fixture = machine_fixture();
    seed_negotiation(&fixture, TxStatus::Registering);
    fixture
        .store
        .set_parameter(&fixture.tx_id, TxParameterId::KernelProofHeight, &42u64, false, 0)
        .expect("proof height");
    fixture
        .store
        .set_parameter(
            &fixture.tx_id,
            TxParameterId::KernelUnconfirmedHeight,
            &41u64,
            false,
            0,
        )
        .expect("unconfirmed height");

    // Reorg above the proof height changes nothing.
    assert!(!fixture.machine.rollback(42).expect("rollback"));

    assert!(fixture.machine.rollback(40).expect("rollback"));
    assert_eq!(
        fixture
            .store
            .get_parameter::<TxStatus>(&fixture.tx_id, TxParameterId::Status, 0)
            .expect("status"),
        Some(TxStatus::Registering)
    );
    assert_eq!(
        fixture
            .store
            .get_parameter::<u64>(&fixture.tx_id, TxParameterId::KernelProofHeight, 0)
            .expect("proof"),
        Some(0)
    );
    assert_eq!(
        fixture
            .store
            .get_parameter::<u64>(&fixture.tx_id, TxParameterId::KernelUnconfirmedHeight, 0)
            .expect("unconfirmed"),
        Some(0)
    );
}

#[test]
fn settlement_clamps_heights_down_never_up() {
    let fixture = machine_fixture();
    seed_negotiation(&fixture, TxStatus::Registering);

    let mut created_confirmed = coin_kind_regular(1, 700);
    created_confirmed.status = CoinStatus::Incoming;
    created_confirmed.create_tx_id = Some(fixture.tx_id);
    created_confirmed.confirm_height = 5;

    let mut created_unconfirmed = coin_kind_regular(2, 300);
    created_unconfirmed.status = CoinStatus::Incoming;
    created_unconfirmed.create_tx_id = Some(fixture.tx_id);
    created_unconfirmed.confirm_height = MAX_HEIGHT;

    let mut spent = coin_kind_regular(3, 900);
    spent.status = CoinStatus::Outgoing;
    spent.spent_tx_id = Some(fixture.tx_id);
    spent.spent_height = MAX_HEIGHT;

    fixture
        .store
        .save_coins(&[created_confirmed, created_unconfirmed, spent])
        .expect("save coins");

    fixture
        .machine
        .set_completed_tx_coin_statuses(10)
        .expect("settle");

    let coins = fixture.store.coins().expect("coins");
    let by_idx = |idx: u64| coins.iter().find(|coin| coin.id.idx == idx).unwrap();
    // Already below the proof height: untouched.
    assert_eq!(by_idx(1).confirm_height, 5);
    assert_eq!(by_idx(1).maturity, 10 + mirage_wallet::types::MATURITY_STD);
    assert_eq!(by_idx(2).confirm_height, 10);
    assert_eq!(by_idx(3).spent_height, 10);
}

#[test]
fn modify_time_is_monotonic() {
    let fixture = machine_fixture();
    seed_negotiation(&fixture, TxStatus::InProgress);
    fixture
        .store
        .set_parameter(&fixture.tx_id, TxParameterId::InvitationSent, &true, false, 0)
        .expect("invitation mark");

    let future = mirage_wallet::types::now_timestamp() + 10_000;
    fixture
        .store
        .set_parameter(&fixture.tx_id, TxParameterId::ModifyTime, &future, true, 0)
        .expect("future stamp");

    let gateway = StubGateway::new();
    fixture.machine.update(&gateway);
    let stamped = fixture
        .store
        .get_parameter::<u64>(&fixture.tx_id, TxParameterId::ModifyTime, 0)
        .expect("modify time")
        .expect("present");
    assert!(stamped >= future);
}

#[test]
fn sender_negotiation_completes_through_the_wallet() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(WalletStore::open(&dir.path().join("wallet.redb")).expect("open store"));
    let keykeeper: Arc<dyn KeyKeeper> = Arc::new(LocalKeyKeeper::new([9u8; 32]));
    let peers = Arc::new(StubPeerEndpoint::new());
    let node = Arc::new(StubNodeEndpoint::new());
    node.set_tip(tip_at(50));

    store.save_coins(&[coin_kind_regular(1, 1_500)]).expect("seed coin");

    let wallet = Wallet::new(
        Arc::clone(&store),
        Some(keykeeper),
        peers.clone(),
        node.clone(),
        EngineConfig::default(),
    );

    let my_id = WalletId::from_bytes([1u8; 32]);
    let peer_id = WalletId::from_bytes([2u8; 32]);
    let tx_id = wallet
        .start_simple_transfer(my_id, peer_id, 1_000, 100, b"lunch".to_vec())
        .expect("start transfer");

    // The invitation went out and the machine is blocked on the peer.
    let sent = peers.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, peer_id);
    assert_eq!(sent[0].1.get::<u64>(TxParameterId::Amount), Some(1_000));
    assert_eq!(sent[0].1.get::<bool>(TxParameterId::IsSender), Some(false));
    assert_eq!(
        store
            .get_parameter::<TxStatus>(&tx_id, TxParameterId::Status, 0)
            .expect("status"),
        Some(TxStatus::InProgress)
    );
    assert_eq!(wallet.outstanding_async(), 0);

    // Inputs are reserved, change is planned.
    let status = wallet.status().expect("status");
    assert_eq!(status.sending, 1_500);
    assert_eq!(status.receiving, 400);

    // Peer confirms with its signature.
    let mut confirmation = TxParamsMessage::new();
    confirmation.tx_id = tx_id;
    confirmation.tx_type = Some(TxType::Simple);
    confirmation.from = peer_id;
    confirmation.add(TxParameterId::PeerSignature, &vec![7u8; 64]);
    wallet.on_tx_message(my_id, confirmation).expect("peer confirmation");

    assert_eq!(
        store
            .get_parameter::<TxStatus>(&tx_id, TxParameterId::Status, 0)
            .expect("status"),
        Some(TxStatus::Registering)
    );
    let requests = node.kernel_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, tx_id);

    // The kernel proof lands; the transfer settles and completes.
    wallet.on_kernel_proof(tx_id, Some(60)).expect("proof");
    assert_eq!(wallet.active_count(), 0);
    let description = store
        .tx_description(&tx_id)
        .expect("description")
        .expect("present");
    assert_eq!(description.status, TxStatus::Completed);

    let coins = store.coins().expect("coins");
    let input = coins.iter().find(|coin| coin.id.idx == 1).expect("input");
    assert_eq!(input.status, CoinStatus::Spent);
    assert_eq!(input.spent_height, 60);
    let change = coins
        .iter()
        .find(|coin| coin.create_tx_id == Some(tx_id))
        .expect("change coin");
    assert_eq!(change.status, CoinStatus::Available);
    assert_eq!(change.id.value, 400);
    assert_eq!(change.confirm_height, 60);
    assert_eq!(wallet.outstanding_async(), 0);
}

#[test]
fn messages_from_an_unexpected_peer_are_ignored() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(WalletStore::open(&dir.path().join("wallet.redb")).expect("open store"));
    let keykeeper: Arc<dyn KeyKeeper> = Arc::new(LocalKeyKeeper::new([6u8; 32]));
    let peers = Arc::new(StubPeerEndpoint::new());
    let node = Arc::new(StubNodeEndpoint::new());
    node.set_tip(tip_at(50));
    store.save_coins(&[coin_kind_regular(1, 1_500)]).expect("seed coin");

    let wallet = Wallet::new(
        Arc::clone(&store),
        Some(keykeeper),
        peers.clone(),
        node.clone(),
        EngineConfig::default(),
    );
    let my_id = WalletId::from_bytes([1u8; 32]);
    let peer_id = WalletId::from_bytes([2u8; 32]);
    let tx_id = wallet
        .start_simple_transfer(my_id, peer_id, 1_000, 100, Vec::new())
        .expect("start transfer");
    peers.drain();

    // A forged confirmation from a third party must not touch the
    // transfer's parameters.
    let mut forged = TxParamsMessage::new();
    forged.tx_id = tx_id;
    forged.tx_type = Some(TxType::Simple);
    forged.from = WalletId::from_bytes([66u8; 32]);
    forged.add(TxParameterId::PeerSignature, &vec![9u8; 64]);
    wallet.on_tx_message(my_id, forged).expect("forged message");

    assert_eq!(
        store
            .get_parameter::<Vec<u8>>(&tx_id, TxParameterId::PeerSignature, 0)
            .expect("signature slot"),
        None
    );
    assert_eq!(
        store
            .get_parameter::<TxStatus>(&tx_id, TxParameterId::Status, 0)
            .expect("status"),
        Some(TxStatus::InProgress)
    );
    assert!(node.kernel_requests().is_empty());

    // The recorded peer still negotiates normally.
    let mut confirmation = TxParamsMessage::new();
    confirmation.tx_id = tx_id;
    confirmation.tx_type = Some(TxType::Simple);
    confirmation.from = peer_id;
    confirmation.add(TxParameterId::PeerSignature, &vec![7u8; 64]);
    wallet.on_tx_message(my_id, confirmation).expect("peer confirmation");

    assert_eq!(
        store
            .get_parameter::<TxStatus>(&tx_id, TxParameterId::Status, 0)
            .expect("status"),
        Some(TxStatus::Registering)
    );
    assert_eq!(node.kernel_requests().len(), 1);
}

#[test]
fn fee_below_the_configured_floor_is_refused() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(WalletStore::open(&dir.path().join("wallet.redb")).expect("open store"));
    let keykeeper: Arc<dyn KeyKeeper> = Arc::new(LocalKeyKeeper::new([5u8; 32]));
    let peers = Arc::new(StubPeerEndpoint::new());
    let node = Arc::new(StubNodeEndpoint::new());
    node.set_tip(tip_at(50));
    store.save_coins(&[coin_kind_regular(1, 1_500)]).expect("seed coin");

    let config = EngineConfig {
        min_fee: 100,
        ..EngineConfig::default()
    };
    let wallet = Wallet::new(Arc::clone(&store), Some(keykeeper), peers.clone(), node, config);

    let err = wallet
        .start_simple_transfer(
            WalletId::from_bytes([1u8; 32]),
            WalletId::from_bytes([2u8; 32]),
            1_000,
            99,
            Vec::new(),
        )
        .expect_err("fee below floor must fail");
    assert!(matches!(
        err,
        mirage_wallet::TxError::Fault(fault) if fault.reason == TxFailureReason::FeeTooLow
    ));

    // Nothing was persisted and nothing went out.
    assert!(store.list_tx_ids().expect("tx ids").is_empty());
    assert!(peers.sent().is_empty());
    assert_eq!(wallet.active_count(), 0);
}

#[test]
fn insufficient_funds_fail_the_transfer() {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(WalletStore::open(&dir.path().join("wallet.redb")).expect("open store"));
    let keykeeper: Arc<dyn KeyKeeper> = Arc::new(LocalKeyKeeper::new([4u8; 32]));
    let peers = Arc::new(StubPeerEndpoint::new());
    let node = Arc::new(StubNodeEndpoint::new());
    node.set_tip(tip_at(50));
    store.save_coins(&[coin_kind_regular(1, 200)]).expect("seed coin");

    let wallet = Wallet::new(
        Arc::clone(&store),
        Some(keykeeper),
        peers.clone(),
        node,
        EngineConfig::default(),
    );
    let tx_id = wallet
        .start_simple_transfer(
            WalletId::from_bytes([1u8; 32]),
            WalletId::from_bytes([2u8; 32]),
            1_000,
            100,
            Vec::new(),
        )
        .expect("start transfer");

    assert_eq!(
        store
            .get_parameter::<TxStatus>(&tx_id, TxParameterId::Status, 0)
            .expect("status"),
        Some(TxStatus::Failed)
    );
    assert_eq!(
        store
            .get_parameter::<TxFailureReason>(&tx_id, TxParameterId::FailureReason, 0)
            .expect("reason"),
        Some(TxFailureReason::NotEnoughFunds)
    );
    assert!(peers.sent().is_empty());
    assert_eq!(wallet.active_count(), 0);
}
