//! End-to-end flows over the wired server state: fan-out, direct vs push
//! delivery, acknowledgement idempotency, and rotation contention.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use cachet_model::rpc::{ClientEvent, DeliveryRequest, DeliveryResponse, ReceiverKey};
use cachet_model::{ClientRegistration, CoreError, DeliveryState, MemberRole, Message};
use cachet_server::config::{PushConfig, ServerConfig};
use cachet_server::connection_table::ConnectionHandle;
use cachet_server::db;
use cachet_server::gateway::{PersistenceGateway, SqliteGateway};
use cachet_server::push::{PushOutcome, PushProvider, PushStatus, WakePayload};
use cachet_server::rpc::handle_request;
use cachet_server::server_state::ServerState;

struct RecordingProvider {
    calls: Mutex<Vec<String>>,
    outcome: fn() -> PushStatus,
}

impl RecordingProvider {
    fn new(outcome: fn() -> PushStatus) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            outcome,
        })
    }
}

impl PushProvider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
    }
    fn supports(&self, registration: &ClientRegistration) -> bool {
        registration.gcm_registration_id.is_some()
    }
    fn push(
        &self,
        registrations: &[ClientRegistration],
        wake: &WakePayload,
    ) -> Result<Vec<PushOutcome>, CoreError> {
        self.calls.lock().push(wake.message.clone());
        Ok(registrations
            .iter()
            .map(|r| PushOutcome {
                client_id: r.client_id.clone(),
                status: (self.outcome)(),
            })
            .collect())
    }
}

fn server(providers: Vec<Arc<dyn PushProvider>>) -> Arc<ServerState> {
    let gateway: Arc<dyn PersistenceGateway> =
        Arc::new(SqliteGateway::new(db::open_in_memory_db().unwrap()));
    // Short coalescing window so tests observe wake cycles quickly.
    let config = ServerConfig {
        push: PushConfig {
            rate_limit_ms: 20,
            ..PushConfig::default()
        },
        ..ServerConfig::default()
    };
    ServerState::new(config, gateway, providers)
}

fn message(id: &str, sender: &str) -> Message {
    Message {
        id: id.into(),
        sender_id: sender.into(),
        salt: vec![1],
        body: vec![2, 3, 4],
        attachment_ref: None,
        shared_key_id: None,
        hmac: vec![5],
        signature: vec![6],
        sent_at: 1_000,
        delivery_count: 0,
    }
}

fn key(receiver: &str) -> ReceiverKey {
    ReceiverKey {
        receiver_id: receiver.into(),
        key_id: "k1".into(),
        ciphertext: vec![7, 8],
    }
}

fn register_gcm(state: &Arc<ServerState>, client: &str) {
    state
        .gateway
        .save_registration(&ClientRegistration {
            client_id: client.into(),
            gcm_package: Some("com.example.app".into()),
            gcm_registration_id: Some(format!("{client}-reg")),
            ..Default::default()
        })
        .unwrap();
}

#[tokio::test]
async fn fan_out_creates_one_delivery_per_receiver_and_is_idempotent() {
    let state = server(Vec::new());
    let (tx, _rx) = mpsc::channel(1);
    let receivers: Vec<String> = vec!["bob".into(), "carol".into(), "dave".into()];

    let request = DeliveryRequest::AcceptMessage {
        message: message("m1", "alice"),
        group_id: None,
        receiver_ids: receivers.clone(),
        receiver_keys: receivers.iter().map(|r| key(r)).collect(),
    };
    let resp = handle_request(&state, request.clone(), &tx).await;
    match resp {
        DeliveryResponse::Accepted { deliveries } => assert_eq!(deliveries.len(), 3),
        other => panic!("unexpected response: {other:?}"),
    }

    // One receiver acknowledges before the sender retransmits.
    handle_request(
        &state,
        DeliveryRequest::AcknowledgeDelivery {
            message_id: "m1".into(),
            receiver_id: "bob".into(),
        },
        &tx,
    )
    .await;

    let resp = handle_request(&state, request, &tx).await;
    match resp {
        DeliveryResponse::Accepted { deliveries } => assert_eq!(deliveries.len(), 3),
        other => panic!("unexpected response: {other:?}"),
    }
    // The advanced delivery was not reset by the retransmit.
    let d = state.gateway.find_delivery("m1", "bob").unwrap().unwrap();
    assert_eq!(d.state, DeliveryState::Delivered);
    let d = state.gateway.find_delivery("m1", "carol").unwrap().unwrap();
    assert_eq!(d.state, DeliveryState::Delivering);
}

#[tokio::test]
async fn online_receiver_gets_direct_delivery_without_push() {
    let provider = RecordingProvider::new(|| PushStatus::Delivered);
    let state = server(vec![Arc::clone(&provider) as Arc<dyn PushProvider>]);
    let (tx, _rx) = mpsc::channel(1);
    register_gcm(&state, "bob");

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    state.connections.register(
        "bob",
        ConnectionHandle::new(state.connections.next_connection_id(), conn_tx),
    );

    handle_request(
        &state,
        DeliveryRequest::AcceptMessage {
            message: message("m1", "alice"),
            group_id: None,
            receiver_ids: vec!["bob".into()],
            receiver_keys: vec![key("bob")],
        },
        &tx,
    )
    .await;

    let frame = conn_rx.try_recv().expect("direct frame on live connection");
    let event: ClientEvent = serde_json::from_str(&frame).unwrap();
    let ClientEvent::NewMessage { message, .. } = event;
    assert_eq!(message.id, "m1");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        provider.calls.lock().is_empty(),
        "no wake for an online receiver"
    );
}

#[tokio::test]
async fn offline_receiver_triggers_one_wake_with_backlog_count() {
    let provider = RecordingProvider::new(|| PushStatus::Delivered);
    let state = server(vec![Arc::clone(&provider) as Arc<dyn PushProvider>]);
    let (tx, _rx) = mpsc::channel(1);
    register_gcm(&state, "bob");

    handle_request(
        &state,
        DeliveryRequest::AcceptMessage {
            message: message("m1", "alice"),
            group_id: None,
            receiver_ids: vec!["bob".into()],
            receiver_keys: vec![key("bob")],
        },
        &tx,
    )
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let calls = provider.calls.lock().clone();
    assert_eq!(calls, vec!["undelivered:1".to_string()]);

    let reg = state.gateway.find_registration("bob").unwrap().unwrap();
    assert_eq!(reg.last_push_fingerprint.as_deref(), Some("undelivered:1"));
    assert_eq!(reg.unread_count, 1);
    assert!(reg.is_push_capable());
}

#[tokio::test]
async fn canonical_registration_id_is_persisted_for_later_wakes() {
    let provider = RecordingProvider::new(|| PushStatus::Canonical("canonical-reg".into()));
    let state = server(vec![Arc::clone(&provider) as Arc<dyn PushProvider>]);
    let (tx, _rx) = mpsc::channel(1);
    register_gcm(&state, "bob");

    handle_request(
        &state,
        DeliveryRequest::AcceptMessage {
            message: message("m1", "alice"),
            group_id: None,
            receiver_ids: vec!["bob".into()],
            receiver_keys: vec![key("bob")],
        },
        &tx,
    )
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let reg = state.gateway.find_registration("bob").unwrap().unwrap();
    assert_eq!(reg.gcm_registration_id.as_deref(), Some("canonical-reg"));
    // The wake itself counted as sent.
    assert_eq!(reg.last_push_fingerprint.as_deref(), Some("undelivered:1"));
}

#[tokio::test]
async fn group_rotation_contention_rejects_fanout_until_cleared() {
    let state = server(Vec::new());
    let (tx, _rx) = mpsc::channel(1);
    for client in ["alice", "bob", "carol", "dave"] {
        state.ledger.invite("g1", client, MemberRole::Member).unwrap();
        state.ledger.join("g1", client).unwrap();
    }

    // Another admin's rotation marker is fresh.
    assert!(state
        .gateway
        .try_acquire_rotation_marker("g1", now_ms(), 30_000)
        .unwrap());

    let accept = DeliveryRequest::AcceptMessage {
        message: message("m1", "alice"),
        group_id: Some("g1".into()),
        receiver_ids: vec![],
        receiver_keys: vec![key("bob"), key("carol"), key("dave")],
    };
    let resp = handle_request(&state, accept.clone(), &tx).await;
    assert!(matches!(
        resp,
        DeliveryResponse::RotationInProgress { group_id } if group_id == "g1"
    ));

    // A competing rotation is rejected the same way.
    let rotate = DeliveryRequest::RotateGroupKey {
        group_id: "g1".into(),
        shared_key_id: "epoch-2".into(),
        supplier_id: "alice".into(),
        member_keys: ["alice", "bob", "carol", "dave"].iter().map(|c| key(c)).collect(),
    };
    let resp = handle_request(&state, rotate.clone(), &tx).await;
    assert!(matches!(resp, DeliveryResponse::RotationInProgress { .. }));

    state.gateway.clear_rotation_marker("g1").unwrap();

    let resp = handle_request(&state, rotate, &tx).await;
    assert!(matches!(resp, DeliveryResponse::Ok));
    for client in ["bob", "carol", "dave"] {
        let m = state.gateway.find_membership("g1", client).unwrap().unwrap();
        assert_eq!(m.shared_key_id.as_deref(), Some("epoch-2"));
    }

    let resp = handle_request(&state, accept, &tx).await;
    match resp {
        // Sender excluded: three deliveries for a four-member group.
        DeliveryResponse::Accepted { deliveries } => assert_eq!(deliveries.len(), 3),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_acknowledgement_and_confirmation_are_noops() {
    let state = server(Vec::new());
    let (tx, _rx) = mpsc::channel(1);

    handle_request(
        &state,
        DeliveryRequest::AcceptMessage {
            message: message("m1", "alice"),
            group_id: None,
            receiver_ids: vec!["bob".into()],
            receiver_keys: vec![key("bob")],
        },
        &tx,
    )
    .await;

    let ack = DeliveryRequest::AcknowledgeDelivery {
        message_id: "m1".into(),
        receiver_id: "bob".into(),
    };
    assert!(matches!(
        handle_request(&state, ack.clone(), &tx).await,
        DeliveryResponse::Ok
    ));
    assert!(matches!(
        handle_request(&state, ack.clone(), &tx).await,
        DeliveryResponse::Ok
    ));
    let d = state.gateway.find_delivery("m1", "bob").unwrap().unwrap();
    assert_eq!(d.state, DeliveryState::Delivered);

    let confirm = DeliveryRequest::ConfirmDelivery {
        message_id: "m1".into(),
        receiver_id: "bob".into(),
    };
    handle_request(&state, confirm, &tx).await;
    let d = state.gateway.find_delivery("m1", "bob").unwrap().unwrap();
    assert_eq!(d.state, DeliveryState::Confirmed);

    // A stale acknowledgement after confirmation changes nothing.
    handle_request(&state, ack, &tx).await;
    let d = state.gateway.find_delivery("m1", "bob").unwrap().unwrap();
    assert_eq!(d.state, DeliveryState::Confirmed);
}

#[tokio::test]
async fn on_disk_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.db");
    let path = path.to_string_lossy();

    {
        let gw = SqliteGateway::new(db::open_server_db(&path).unwrap());
        gw.save_registration(&ClientRegistration {
            client_id: "bob".into(),
            gcm_registration_id: Some("reg".into()),
            ..Default::default()
        })
        .unwrap();
    }

    let gw = SqliteGateway::new(db::open_server_db(&path).unwrap());
    let reg = gw.find_registration("bob").unwrap().unwrap();
    assert_eq!(reg.gcm_registration_id.as_deref(), Some("reg"));
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap()
}
