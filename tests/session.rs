//! Session behaviour over the in-process broker.
//!
//! Run with: cargo test --test session
//!
//! The in-process broker stands in for RabbitMQ: tests act as the game
//! server by observing published requests and delivering responses to
//! `bob_i`, and inject channel closes and failures to drive reconnects.

use std::sync::Arc;
use std::time::Duration;

use cwapi::envelope::Action;
use cwapi::feeds::{Deal, Feed};
use cwapi::transport::{InProcessBroker, TransportError};
use cwapi::{ClientError, CorrelationKey, LinkState, Request, ResultCode, Session, SessionSettings};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

fn settings() -> SessionSettings {
    let mut settings = SessionSettings::for_user("bob");
    settings.call_timeout = Duration::from_secs(2);
    settings
}

async fn connect(broker: &InProcessBroker) -> Arc<Session> {
    connect_with(broker, settings()).await
}

async fn connect_with(broker: &InProcessBroker, settings: SessionSettings) -> Arc<Session> {
    Arc::new(
        Session::connect_with(Arc::new(broker.clone()), settings)
            .await
            .unwrap(),
    )
}

/// Answer every published request with `respond(request)` on `bob_i`.
fn spawn_server<F>(broker: &InProcessBroker, respond: F) -> JoinHandle<()>
where
    F: Fn(Value) -> Value + Send + 'static,
{
    let mut requests = broker.observe();
    let broker = broker.clone();
    tokio::spawn(async move {
        while let Some(published) = requests.recv().await {
            let request: Value = serde_json::from_slice(&published.body).unwrap();
            broker.deliver("bob_i", respond(request).to_string());
        }
    })
}

/// Echo the requested user id back with result `Ok`.
fn echo_ok(request: Value) -> Value {
    let user_id = request["payload"]["userId"].as_i64().unwrap_or_default();
    json!({
        "uuid": format!("resp-{}", user_id),
        "action": request["action"],
        "result": "Ok",
        "payload": { "userId": user_id },
    })
}

fn get_info(uuid: &str) -> String {
    json!({
        "uuid": uuid,
        "action": "getInfo",
        "result": "Ok",
        "payload": { "balance": 5 },
    })
    .to_string()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// Correlation
// ============================================================================

#[tokio::test]
async fn test_call_round_trip_resolves_and_forwards() {
    let broker = InProcessBroker::new();
    let _server = spawn_server(&broker, echo_ok);
    let session = connect(&broker).await;
    let mut updates = session.take_updates().unwrap();

    let response = session
        .call(CorrelationKey(42), &Request::create_auth_code(42))
        .await
        .unwrap();

    assert_eq!(response.uuid, "resp-42");
    assert_eq!(response.action, Action::CreateAuthCode);
    assert_eq!(response.result, ResultCode::Ok);
    assert!(session.registry().is_empty());

    let forwarded = updates.recv().await.unwrap();
    assert_eq!(forwarded, response);

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, "bob_ex");
    assert_eq!(published[0].routing_key, "bob_o");
    let body: Value = serde_json::from_slice(&published[0].body).unwrap();
    assert_eq!(body, json!({"action": "createAuthCode", "payload": {"userId": 42}}));
}

#[tokio::test]
async fn test_second_call_for_pending_key_is_rejected_without_publishing() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call(CorrelationKey(42), &Request::create_auth_code(42))
                .await
        })
    };
    eventually(|| session.registry().is_pending(CorrelationKey(42))).await;
    eventually(|| broker.published().len() == 1).await;

    let second = session
        .call(CorrelationKey(42), &Request::create_auth_code(42))
        .await;
    assert!(matches!(second, Err(ClientError::AlreadyPending { .. })));
    assert_eq!(broker.published().len(), 1);

    broker.deliver(
        "bob_i",
        echo_ok(json!({"action": "createAuthCode", "payload": {"userId": 42}})).to_string(),
    );
    assert!(first.await.unwrap().is_ok());
    assert!(session.registry().is_empty());
}

#[tokio::test]
async fn test_timeout_frees_key_for_next_call() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    let mut updates = session.take_updates().unwrap();

    let result = session
        .call_with_timeout(
            CorrelationKey(7),
            &Request::create_auth_code(7),
            Duration::from_millis(50),
        )
        .await;
    assert!(matches!(
        result,
        Err(ClientError::Timeout { key, .. }) if key.0 == 7
    ));
    assert!(!session.registry().is_pending(CorrelationKey(7)));

    // The late response reaches the stream but no waiter.
    broker.deliver(
        "bob_i",
        echo_ok(json!({"action": "createAuthCode", "payload": {"userId": 7}})).to_string(),
    );
    assert_eq!(updates.recv().await.unwrap().uuid, "resp-7");

    let _server = spawn_server(&broker, echo_ok);
    let response = session
        .call(CorrelationKey(7), &Request::create_auth_code(7))
        .await
        .unwrap();
    assert_eq!(response.uuid, "resp-7");
}

#[tokio::test]
async fn test_application_error_carries_required_operation() {
    let broker = InProcessBroker::new();
    let _server = spawn_server(&broker, |request| {
        json!({
            "uuid": "forbidden",
            "action": request["action"],
            "result": "Forbidden",
            "payload": { "userId": 5, "requiredOperation": "GetUserProfile" },
        })
    });
    let session = connect(&broker).await;

    let err = session
        .call(CorrelationKey(5), &Request::request_profile("token-5"))
        .await
        .unwrap_err();

    assert_eq!(err.required_operation(), Some("GetUserProfile"));
    match err {
        ClientError::Application { result, response } => {
            assert_eq!(result, ResultCode::Forbidden);
            assert_eq!(response.action, Action::RequestProfile);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_identityless_response_never_resolves_a_waiter() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    drop(session.take_updates());

    let call = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call_with_timeout(
                    CorrelationKey(0),
                    &Request::get_info(),
                    Duration::from_millis(200),
                )
                .await
        })
    };
    eventually(|| session.registry().is_pending(CorrelationKey(0))).await;

    broker.deliver("bob_i", get_info("info"));

    assert!(matches!(
        call.await.unwrap(),
        Err(ClientError::Timeout { .. })
    ));
}

#[tokio::test]
async fn test_untaken_updates_stream_never_stalls_calls() {
    let broker = InProcessBroker::new();
    let _server = spawn_server(&broker, echo_ok);
    let mut settings = settings();
    settings.updates_capacity = 2;
    let session = connect_with(&broker, settings).await;

    for id in 1..=5 {
        let response = session
            .call(CorrelationKey(id), &Request::create_auth_code(id))
            .await;
        assert!(response.is_ok(), "call {id} failed: {response:?}");
    }

    let mut updates = session.take_updates().unwrap();
    assert_eq!(updates.try_recv().unwrap().uuid, "resp-1");
    assert_eq!(updates.try_recv().unwrap().uuid, "resp-2");
    assert!(updates.try_recv().is_none());
}

#[tokio::test]
async fn test_unread_updates_stream_stalls_calls_after_capacity() {
    let broker = InProcessBroker::new();
    let _server = spawn_server(&broker, echo_ok);
    let mut settings = settings();
    settings.updates_capacity = 2;
    let session = connect_with(&broker, settings).await;
    let mut updates = session.take_updates().unwrap();

    let mut resolved = Vec::new();
    for id in 1..=5 {
        let response = session
            .call_with_timeout(
                CorrelationKey(id),
                &Request::create_auth_code(id),
                Duration::from_millis(200),
            )
            .await;
        resolved.push(response.is_ok());
    }
    // Two fill the stream, the third resolves before the dispatcher blocks.
    assert_eq!(resolved, vec![true, true, true, false, false]);

    let uuids: Vec<_> = std::iter::from_fn(|| updates.try_recv().map(|r| r.uuid)).collect();
    assert_eq!(uuids, vec!["resp-1", "resp-2"]);
    assert_eq!(updates.recv().await.unwrap().uuid, "resp-3");
}

#[tokio::test]
async fn test_null_fields_still_fail_the_call_with_application_error() {
    let broker = InProcessBroker::new();
    let _server = spawn_server(&broker, |request| {
        json!({
            "uuid": "pay-1",
            "action": request["action"],
            "result": "InsufficientFunds",
            "payload": { "userId": 1, "fee": null, "debit": null },
        })
    });
    let session = connect(&broker).await;
    drop(session.take_updates());

    let err = session
        .call_with_timeout(
            CorrelationKey(1),
            &Request::pay("tkn", "tx-1", 5, "c0de"),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ClientError::Application {
            result: ResultCode::InsufficientFunds,
            ..
        }
    ));
    assert!(session.registry().is_empty());
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_updates_arrive_exactly_once_in_broker_order() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    let mut updates = session.take_updates().unwrap();

    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while seen.len() < 250 {
            seen.push(updates.recv().await.unwrap().uuid);
        }
        (seen, updates.try_recv())
    });

    for i in 0..250 {
        broker.deliver("bob_i", get_info(&format!("m{}", i)));
    }

    let (seen, extra) = reader.await.unwrap();
    let expected: Vec<_> = (0..250).map(|i| format!("m{}", i)).collect();
    assert_eq!(seen, expected);
    assert!(extra.is_none());
}

#[tokio::test]
async fn test_malformed_messages_are_dropped_and_unknown_actions_kept() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    let mut updates = session.take_updates().unwrap();

    broker.deliver("bob_i", "not json at all");
    broker.deliver("bob_i", r#"{"uuid":"bad","action":"createAuthCode","result":"Ok","payload":{"userId":"x"}}"#);
    broker.deliver("bob_i", r#"{"uuid":"new","action":"brandNewAction","result":"Ok","payload":{"x":1}}"#);
    broker.deliver("bob_i", get_info("after"));

    let unknown = updates.recv().await.unwrap();
    assert_eq!(unknown.uuid, "new");
    assert_eq!(unknown.action, Action::UnknownAction);
    assert!(unknown.correlation_key().is_none());

    assert_eq!(updates.recv().await.unwrap().uuid, "after");
}

// ============================================================================
// Feeds
// ============================================================================

#[tokio::test]
async fn test_feed_subscription() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    let mut deals = session.subscribe_feed::<Deal>().await.unwrap();

    broker.deliver("bob_deals", r#"{"item":"Thread","qty":2,"price":3}"#);
    broker.deliver("bob_deals", "garbage");
    broker.deliver("bob_deals", r#"{"item":"Pelt","qty":1,"price":7}"#);

    assert_eq!(deals.recv().await.unwrap().item, "Thread");
    assert_eq!(deals.recv().await.unwrap().item, "Pelt");
}

#[tokio::test]
async fn test_feed_stream_is_bounded_by_configured_capacity() {
    let broker = InProcessBroker::new();
    let mut settings = settings();
    settings.feed_capacity = 2;
    let session = connect_with(&broker, settings).await;
    let mut deals = session.subscribe_feed::<Deal>().await.unwrap();

    for price in 0..5 {
        broker.deliver(
            "bob_deals",
            json!({"item": "Thread", "qty": 1, "price": price}).to_string(),
        );
    }

    eventually(|| deals.len() == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(deals.len(), 2);

    for price in 0..5 {
        assert_eq!(deals.recv().await.unwrap().price, price);
    }
}

#[test]
fn test_feed_topics_follow_prefix() {
    let mut config = cwapi::ClientConfig::new("bob", "secret");
    assert_eq!(SessionSettings::from(&config).feed_topic(Feed::Deals), "bob_deals");

    config.feed_prefix = Some("cw2-".to_string());
    assert_eq!(
        SessionSettings::from(&config).feed_topic(Feed::AuDigest),
        "cw2-au_digest"
    );
}

#[tokio::test]
async fn test_custom_topic_subscription() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;

    let mut raw = session
        .subscribe("custom_topic", 5, |body: &[u8]| Ok(body.to_vec()))
        .await
        .unwrap();

    broker.deliver("custom_topic", "hello");
    assert_eq!(raw.recv().await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_subscribing_twice_is_rejected() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;

    let _deals = session.subscribe_feed::<Deal>().await.unwrap();
    let again = session.subscribe_feed::<Deal>().await;
    assert!(matches!(
        again,
        Err(ClientError::AlreadySubscribed { topic }) if topic == "bob_deals"
    ));

    let inbound = session.subscribe("bob_i", 1, |_: &[u8]| Ok(())).await;
    assert!(matches!(inbound, Err(ClientError::AlreadySubscribed { .. })));
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn test_channel_close_reconnects_and_preserves_subscriptions() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    let mut updates = session.take_updates().unwrap();
    let mut deals = session.subscribe_feed::<Deal>().await.unwrap();

    broker.close_all_channels();
    assert!(!broker.has_consumer("bob_i"));

    session.send(&Request::get_info()).await.unwrap();

    assert_eq!(broker.connection_count(), 2);
    assert_eq!(session.generation().await, 2);
    assert_eq!(session.state().await, LinkState::Open);
    assert_eq!(broker.published().len(), 1);

    broker.deliver("bob_i", get_info("after-reconnect"));
    broker.deliver("bob_deals", r#"{"item":"Thread","qty":1,"price":1}"#);

    assert_eq!(updates.recv().await.unwrap().uuid, "after-reconnect");
    assert_eq!(deals.recv().await.unwrap().item, "Thread");
}

#[tokio::test]
async fn test_reconnect_keeps_deliveries_already_taken() {
    let broker = InProcessBroker::new();
    let mut settings = settings();
    settings.updates_capacity = 1;
    let session = connect_with(&broker, settings).await;
    let mut updates = session.take_updates().unwrap();
    let mut deals = session.subscribe_feed::<Deal>().await.unwrap();

    for i in 0..3 {
        broker.deliver("bob_i", get_info(&format!("m{}", i)));
        broker.deliver(
            "bob_deals",
            json!({"item": format!("d{}", i), "qty": 1, "price": 1}).to_string(),
        );
    }
    eventually(|| updates.len() == 1).await;

    broker.close_all_channels();
    session.send(&Request::get_info()).await.unwrap();
    assert_eq!(session.generation().await, 2);

    broker.deliver("bob_i", get_info("m3"));
    broker.deliver("bob_deals", r#"{"item":"d3","qty":1,"price":1}"#);

    let mut seen = Vec::new();
    while seen.len() < 4 {
        let next = tokio::time::timeout(Duration::from_secs(2), updates.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(next.uuid);
    }
    assert_eq!(seen, vec!["m0", "m1", "m2", "m3"]);

    let mut items = Vec::new();
    while items.len() < 4 {
        items.push(deals.recv().await.unwrap().item);
    }
    assert_eq!(items, vec!["d0", "d1", "d2", "d3"]);
    assert!(updates.try_recv().is_none());
}

#[tokio::test]
async fn test_pending_call_survives_reconnect() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    drop(session.take_updates());

    broker.close_all_channels();
    let _server = spawn_server(&broker, echo_ok);

    let response = session
        .call(CorrelationKey(42), &Request::create_auth_code(42))
        .await
        .unwrap();
    assert_eq!(response.uuid, "resp-42");
    assert_eq!(broker.connection_count(), 2);
}

#[tokio::test]
async fn test_retry_is_bounded_to_one() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;

    broker.close_on_next_publishes(2);
    let result = session.send(&Request::get_info()).await;

    assert!(matches!(
        result,
        Err(ClientError::Transport(TransportError::ChannelClosed(_)))
    ));
    assert_eq!(broker.connection_count(), 2);
    assert!(broker.published().is_empty());

    // The next publish reconnects again and goes through.
    session.send(&Request::get_info()).await.unwrap();
    assert_eq!(broker.connection_count(), 3);
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_other_publish_errors_do_not_reconnect() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;

    broker.fail_publishes(Some(TransportError::Publish("nack".to_string())));
    let result = session.send(&Request::get_info()).await;

    assert!(matches!(
        result,
        Err(ClientError::Transport(TransportError::Publish(_)))
    ));
    assert_eq!(broker.connection_count(), 1);

    broker.fail_publishes(None);
    session.send(&Request::get_info()).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_failures_trigger_one_reconnect() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    drop(session.take_updates());

    broker.close_all_channels();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            session.send(&Request::get_info()).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(broker.connection_count(), 2);
    assert_eq!(session.generation().await, 2);
    assert_eq!(broker.published().len(), 16);
}

#[tokio::test]
async fn test_failed_consumer_restart_leaves_session_broken() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    let _deals = session.subscribe_feed::<Deal>().await.unwrap();

    broker.refuse_consume("bob_deals", true);
    let result = session.reconnect().await;
    assert!(matches!(
        result,
        Err(ClientError::Transport(TransportError::Consume(_)))
    ));
    assert_eq!(session.state().await, LinkState::Broken);
    assert!(!broker.has_consumer("bob_i"));

    assert!(matches!(
        session.send(&Request::get_info()).await,
        Err(ClientError::Broken)
    ));
    assert!(matches!(
        session.subscribe("other", 1, |_: &[u8]| Ok(())).await,
        Err(ClientError::Broken)
    ));

    broker.refuse_consume("bob_deals", false);
    session.reconnect().await.unwrap();
    assert_eq!(session.state().await, LinkState::Open);
    assert!(broker.has_consumer("bob_i"));
    assert!(broker.has_consumer("bob_deals"));
    session.send(&Request::get_info()).await.unwrap();
}

#[tokio::test]
async fn test_dial_retries_with_backoff() {
    let broker = InProcessBroker::new();
    broker.fail_next_connects(2);

    let session = connect(&broker).await;
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(session.state().await, LinkState::Open);
}

#[tokio::test]
async fn test_dial_gives_up_after_configured_attempts() {
    let broker = InProcessBroker::new();
    broker.fail_next_connects(2);

    let mut settings = settings();
    settings.dial_attempts = 2;
    let result = Session::connect_with(Arc::new(broker.clone()), settings).await;

    assert!(matches!(
        result,
        Err(ClientError::Transport(TransportError::Connection(_)))
    ));
    assert_eq!(broker.connection_count(), 0);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_closes_everything_and_is_idempotent() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    let mut updates = session.take_updates().unwrap();
    let mut deals = session.subscribe_feed::<Deal>().await.unwrap();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call(CorrelationKey(42), &Request::create_auth_code(42))
                .await
        })
    };
    eventually(|| session.registry().is_pending(CorrelationKey(42))).await;

    session.shutdown().await;

    assert!(matches!(pending.await.unwrap(), Err(ClientError::Closed)));
    assert!(updates.recv().await.is_none());
    assert!(deals.recv().await.is_none());
    assert!(!broker.has_consumer("bob_i"));
    assert!(!broker.has_consumer("bob_deals"));
    assert_eq!(session.state().await, LinkState::Closed);

    session.shutdown().await;

    assert!(matches!(
        session.send(&Request::get_info()).await,
        Err(ClientError::Closed)
    ));
    assert!(matches!(session.reconnect().await, Err(ClientError::Closed)));
}

#[tokio::test]
async fn test_dropping_session_stops_consumers() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;
    let mut deals = session.subscribe_feed::<Deal>().await.unwrap();
    assert!(broker.has_consumer("bob_i"));

    drop(session);

    eventually(|| !broker.has_consumer("bob_i") && !broker.has_consumer("bob_deals")).await;
    assert!(deals.recv().await.is_none());
}

#[tokio::test]
async fn test_shutdown_without_feeds_or_reader() {
    let broker = InProcessBroker::new();
    let session = connect(&broker).await;

    session.shutdown().await;
    assert_eq!(session.state().await, LinkState::Closed);
}
