//! In-process RPC round trip: assemble the full core with the mock provider,
//! start the JSON-RPC server on a free port, and drive it with the WS client
//! the way a frontend would, client-side crypto included.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use jsonrpsee::core::client::{ClientT, Subscription, SubscriptionClientT};
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::WsClientBuilder;

use veil_billing::{MemoryReservationStore, PricingTable, RateLimiter, ReservationStore};
use veil_broadcast::HubRegistry;
use veil_core::constants::{CREDITS_PER_DOLLAR, GUEST_RATE_WINDOW_SECS};
use veil_core::{Clock, SystemClock};
use veil_crypto::{open_message, EciesKeyPair};
use veil_epoch::keys::create_first_epoch;
use veil_epoch::EpochManager;
use veil_roster::RosterService;
use veil_rpc::types::{
    RpcConversation, RpcCreateConversation, RpcLedgerEntry, RpcMessage, RpcPaymentEvent,
    RpcPostMessage, RpcPostedMessage, RpcRegisterAccount, RpcRegisteredAccount, RpcWallet,
    RpcWebhookAck,
};
use veil_rpc::{RpcServer, RpcServerState, SessionRegistry};
use veil_store::{KeyedLocks, StoreDb};
use veil_stream::{MockEchoStreamer, StreamConfig, StreamPipeline};
use veil_wallet::record_pending_payment;

const WEBHOOK_SECRET: &str = "whsec_test";

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn start_node(name: &str) -> (SocketAddr, Arc<StoreDb>) {
    let db = Arc::new(StoreDb::open_temp(&format!("rpc_{name}")).unwrap());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hubs = Arc::new(HubRegistry::new());
    let conversation_locks = Arc::new(KeyedLocks::new());
    let wallet_locks = Arc::new(KeyedLocks::new());
    let reservations: Arc<dyn ReservationStore> = Arc::new(MemoryReservationStore::new());

    let roster = Arc::new(RosterService::new(
        Arc::clone(&db),
        Arc::clone(&hubs),
        Arc::clone(&clock),
    ));
    let epochs = Arc::new(EpochManager::new(
        Arc::clone(&db),
        Arc::clone(&hubs),
        conversation_locks,
        Arc::clone(&clock),
    ));
    let pipeline = Arc::new(StreamPipeline::new(
        Arc::clone(&db),
        Arc::clone(&hubs),
        Arc::clone(&roster),
        Arc::new(MockEchoStreamer::default()),
        reservations,
        Arc::new(PricingTable::builtin()),
        wallet_locks,
        Arc::clone(&clock),
        StreamConfig {
            free_allowance: 0,
            token_batch_interval: Duration::from_millis(0),
            ..StreamConfig::default()
        },
    ));

    let state = Arc::new(RpcServerState {
        db: Arc::clone(&db),
        pipeline,
        roster,
        epochs,
        hubs,
        sessions: Arc::new(SessionRegistry::new()),
        clock,
        webhook_secret: WEBHOOK_SECRET.to_string(),
        welcome_credit: 0,
        free_allowance: 0,
        guest_access_limiter: RateLimiter::new(30, GUEST_RATE_WINDOW_SECS),
        guest_send_limiter: RateLimiter::new(6, GUEST_RATE_WINDOW_SECS),
    });

    let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    // Leaked intentionally: dropping the handle stops the server, and this
    // helper doesn't thread a handle back to the caller for shutdown.
    std::mem::forget(RpcServer::new(state).start(addr).await.unwrap());
    (addr, db)
}

struct Client {
    rpc: jsonrpsee::ws_client::WsClient,
    keys: EciesKeyPair,
    session: RpcRegisteredAccount,
}

async fn register(addr: SocketAddr, name: &str) -> Client {
    let rpc = WsClientBuilder::default()
        .build(format!("ws://{addr}"))
        .await
        .unwrap();
    let keys = EciesKeyPair::generate();
    let session: RpcRegisteredAccount = rpc
        .request(
            "veil_registerAccount",
            rpc_params![RpcRegisterAccount {
                email: format!("{name}@example.com"),
                username: name.to_string(),
                public_key: hex::encode(keys.public_key()),
                password_wrapped_key: hex::encode([1u8; 49]),
                recovery_wrapped_key: hex::encode([2u8; 49]),
            }],
        )
        .await
        .unwrap();
    Client { rpc, keys, session }
}

#[tokio::test]
async fn register_create_post_and_read_back() {
    let (addr, _db) = start_node("round_trip").await;
    let client = register(addr, "alice").await;

    // Client-side first-epoch crypto, exactly as a frontend would do it.
    let first = create_first_epoch(&client.keys.public_key()).unwrap();
    let epoch_secret = *first.keys.secret_bytes();
    let conv: RpcConversation = client
        .rpc
        .request(
            "veil_createConversation",
            rpc_params![RpcCreateConversation {
                session_token: client.session.session_token.clone(),
                epoch_public_key: hex::encode(first.epoch_public_key),
                confirmation_hash: hex::encode(first.confirmation_hash),
                owner_wrap: hex::encode(&first.owner_wrap),
                encrypted_title: None,
            }],
        )
        .await
        .unwrap();
    assert_eq!(conv.current_epoch, 1);
    assert_eq!(conv.privilege, "owner");
    assert!(conv.wrapped_epoch_key.is_some());

    // Live feed sees the user-only post, without plaintext.
    let mut feed: Subscription<serde_json::Value> = client
        .rpc
        .subscribe(
            "veil_subscribeConversation",
            rpc_params![
                conv.conversation_id.clone(),
                Some(client.session.session_token.clone()),
                None::<String>,
                None::<String>
            ],
            "veil_unsubscribeConversation",
        )
        .await
        .unwrap();

    let message_id = hex::encode([7u8; 32]);
    let posted: RpcPostedMessage = client
        .rpc
        .request(
            "veil_postMessage",
            rpc_params![RpcPostMessage {
                session_token: Some(client.session.session_token.clone()),
                link_id: None,
                display_name: None,
                client_ip: None,
                conversation_id: conv.conversation_id.clone(),
                message_id: message_id.clone(),
                content: "hello over rpc".to_string(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(posted.sequence_number, 1);
    assert_eq!(posted.epoch_number, 1);

    let event = tokio::time::timeout(Duration::from_secs(5), feed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event["event"], "message:new");
    assert!(event.get("content").is_none());

    // History comes back as ciphertext the epoch key opens.
    let messages: Vec<RpcMessage> = client
        .rpc
        .request(
            "veil_listMessages",
            rpc_params![client.session.session_token.clone(), conv.conversation_id.clone(), 0u64, 50u32],
        )
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, message_id);
    let blob = hex::decode(&messages[0].blob).unwrap();
    assert_eq!(open_message(&epoch_secret, &blob).unwrap(), b"hello over rpc");
}

#[tokio::test]
async fn webhook_is_idempotent_over_rpc() {
    let (addr, db) = start_node("webhook").await;
    let client = register(addr, "payer").await;

    let account_id =
        veil_core::types::AccountId::from_public_key(&client.keys.public_key());
    record_pending_payment(&db, "txn_T", account_id, 25 * CREDITS_PER_DOLLAR, 0).unwrap();

    for _ in 0..2 {
        let ack: RpcWebhookAck = client
            .rpc
            .request(
                "veil_paymentWebhook",
                rpc_params![
                    WEBHOOK_SECRET,
                    RpcPaymentEvent { event_type: "cardTransaction".into(), id: "txn_T".into() }
                ],
            )
            .await
            .unwrap();
        assert!(ack.received);
    }

    let wallets: Vec<RpcWallet> = client
        .rpc
        .request(
            "veil_getWalletBalances",
            rpc_params![client.session.session_token.clone()],
        )
        .await
        .unwrap();
    let purchased = wallets.iter().find(|w| w.kind == "purchased").unwrap();
    assert_eq!(purchased.balance, "25.00");

    let ledger: Vec<RpcLedgerEntry> = client
        .rpc
        .request(
            "veil_getLedger",
            rpc_params![client.session.session_token.clone(), purchased.wallet_id.clone()],
        )
        .await
        .unwrap();
    let deposits = ledger.iter().filter(|e| e.entry_type == "deposit").count();
    assert_eq!(deposits, 1);

    // Wrong secret is rejected outright.
    let err = client
        .rpc
        .request::<RpcWebhookAck, _>(
            "veil_paymentWebhook",
            rpc_params![
                "wrong-secret",
                RpcPaymentEvent { event_type: "cardTransaction".into(), id: "txn_T".into() }
            ],
        )
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn streaming_send_over_subscription() {
    let (addr, db) = start_node("stream").await;
    let client = register(addr, "streamer").await;

    let account_id =
        veil_core::types::AccountId::from_public_key(&client.keys.public_key());
    record_pending_payment(&db, "txn_s", account_id, 10 * CREDITS_PER_DOLLAR, 0).unwrap();
    let ack: RpcWebhookAck = client
        .rpc
        .request(
            "veil_paymentWebhook",
            rpc_params![
                WEBHOOK_SECRET,
                RpcPaymentEvent { event_type: "cardTransaction".into(), id: "txn_s".into() }
            ],
        )
        .await
        .unwrap();
    assert!(ack.received);

    let first = create_first_epoch(&client.keys.public_key()).unwrap();
    let conv: RpcConversation = client
        .rpc
        .request(
            "veil_createConversation",
            rpc_params![RpcCreateConversation {
                session_token: client.session.session_token.clone(),
                epoch_public_key: hex::encode(first.epoch_public_key),
                confirmation_hash: hex::encode(first.confirmation_hash),
                owner_wrap: hex::encode(&first.owner_wrap),
                encrypted_title: None,
            }],
        )
        .await
        .unwrap();

    let mut stream: Subscription<serde_json::Value> = client
        .rpc
        .subscribe(
            "veil_subscribeStream",
            rpc_params![veil_rpc::types::RpcSendMessage {
                session_token: Some(client.session.session_token.clone()),
                link_id: None,
                display_name: None,
                client_ip: None,
                conversation_id: conv.conversation_id.clone(),
                model: "swift".to_string(),
                message_id: hex::encode([9u8; 32]),
                content: "Hello".to_string(),
                messages_for_inference: vec![veil_rpc::types::RpcChatTurn {
                    role: "user".to_string(),
                    content: "Hello".to_string(),
                }],
                funding_source: "personal_balance".to_string(),
                rotation: None,
            }],
            "veil_unsubscribeStream",
        )
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), stream.next()).await
    {
        let event = event.unwrap();
        kinds.push(event["type"].as_str().unwrap().to_string());
        if event["type"] == "done" {
            assert_eq!(event["userSequence"], 1);
            assert_eq!(event["aiSequence"], 2);
            assert_eq!(event["epochNumber"], 1);
            break;
        }
    }
    assert_eq!(kinds.first().map(String::as_str), Some("start"));
    assert!(kinds.iter().any(|k| k == "token"));
    assert_eq!(kinds.last().map(String::as_str), Some("done"));
}
