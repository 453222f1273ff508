use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mux_rpc::{
    //
    create_memory_link,
    CallContext,
    CallKind,
    CancelNotice,
    CancellationToken,
    ConnectionId,
    CorrelationId,
    Error,
    Payload,
    Result,
    Router,
    RpcClient,
    RpcConfig,
    RpcServer,
    Transport,
    TransportPtr,
};

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}

#[derive(Debug, Serialize, Deserialize)]
struct UserQuery {
    id: u32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct User {
    id: u32,
    name: String,
}

/// One wired bridge: server attached on the host side, client on the UI
/// side, both ends kept alive by the returned handles.
struct Bridge {
    // ---
    client: RpcClient,
    ui_side: TransportPtr,
    _server: RpcServer,
    _dispatch: JoinHandle<()>,
}

async fn bridge(router: Router, connection: ConnectionId) -> Result<Bridge> {
    // ---
    init_logging();

    let (ui_side, host_side) = create_memory_link("ui", "host").await?;

    let server = RpcServer::new(router, RpcConfig::default());
    let dispatch = server.attach(host_side, connection).await?;

    let client = RpcClient::with_transport(ui_side.clone(), RpcConfig::default()).await?;

    Ok(Bridge {
        client,
        ui_side,
        _server: server,
        _dispatch: dispatch,
    })
}

/// Streaming handler that emits increasing integers until released, then
/// reports its shutdown on `stopped`.
fn endless_router(stopped: mpsc::UnboundedSender<()>) -> Router {
    // ---
    Router::builder()
        .subscription("endless", move |_ctx: CallContext, _input: ()| {
            // ---
            let stopped = stopped.clone();

            async move {
                let (tx, rx) = mpsc::channel(8);

                tokio::spawn(async move {
                    // ---
                    let mut i = 0u64;
                    loop {
                        i += 1;
                        if tx.send(Ok(i)).await.is_err() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    let _ = stopped.send(());
                });

                Ok(rx)
            }
        })
        .build()
}

#[tokio::test]
async fn test_basic_query() -> Result<()> {
    // ---
    let router = Router::builder()
        .query("getUser", |_ctx: CallContext, q: UserQuery| async move {
            Ok(User {
                id: q.id,
                name: "Alice".to_string(),
            })
        })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await?;

    let user: User = bridge.client.query("getUser", &UserQuery { id: 1 }).await?;

    assert_eq!(
        user,
        User {
            id: 1,
            name: "Alice".to_string()
        }
    );

    Ok(())
}

#[tokio::test]
async fn test_mutation_round_trip() -> Result<()> {
    // ---
    let router = Router::builder()
        .mutation("shout", |_ctx: CallContext, s: String| async move {
            Ok(s.to_uppercase())
        })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await?;

    let loud: String = bridge.client.mutation("shout", &"hello").await?;
    assert_eq!(loud, "HELLO");

    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls() {
    // ---
    let router = Router::builder()
        .query("double", |_ctx: CallContext, n: i64| async move { Ok(n * 2) })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await.unwrap();

    let mut handles = Vec::new();

    for i in 0..10i64 {
        // ---
        let client = bridge.client.clone();

        handles.push(tokio::spawn(async move {
            let doubled: i64 = client.query("double", &i).await.unwrap();
            doubled
        }));
    }

    for (i, task) in handles.into_iter().enumerate() {
        let doubled = task.await.unwrap();
        assert_eq!(doubled, (i as i64) * 2);
    }
}

#[tokio::test]
async fn test_unknown_path_fails_predictably() {
    // ---
    let router = Router::builder().build();
    let bridge = bridge(router, ConnectionId(1)).await.unwrap();

    let outcome: Result<serde_json::Value> = bridge.client.query("nope", &1).await;

    match outcome {
        Err(Error::Handler(description)) => {
            assert!(description.contains("no handler registered"));
            assert!(description.contains("nope"));
        }
        other => panic!("expected a failure outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handler_failure_carries_description_only() {
    // ---
    let router = Router::builder()
        .query("explode", |_ctx: CallContext, _input: ()| async move {
            Err::<(), Error>(Error::Handler("kaboom".to_string()))
        })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await.unwrap();

    let outcome: Result<()> = bridge.client.query("explode", &()).await;

    match outcome {
        Err(Error::Handler(description)) => assert!(description.contains("kaboom")),
        other => panic!("expected a failure outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_before_response() {
    // ---
    let (saw_cancel_tx, mut saw_cancel_rx) = mpsc::unbounded_channel();

    let router = Router::builder()
        .query("slowOp", move |ctx: CallContext, _input: ()| {
            // ---
            let saw_cancel = saw_cancel_tx.clone();

            async move {
                // Cooperative handler: parks until the advisory token fires.
                ctx.cancel_token().cancelled().await;
                let _ = saw_cancel.send(());
                Err::<(), Error>(Error::Cancelled)
            }
        })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await.unwrap();

    // Compose a timeout from a plain timer and the cancellation signal.
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome: Result<()> = bridge
        .client
        .query_with_cancel("slowOp", &(), token)
        .await;

    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_millis(100));

    // The handler-side token observed the cancellation.
    assert_eq!(saw_cancel_rx.recv().await, Some(()));
}

#[tokio::test]
async fn test_cancel_after_response_is_noop() -> Result<()> {
    // ---
    let router = Router::builder()
        .query("fast", |_ctx: CallContext, n: i64| async move { Ok(n + 1) })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await?;

    let token = CancellationToken::new();
    let n: i64 = bridge
        .client
        .query_with_cancel("fast", &41, token.clone())
        .await?;
    assert_eq!(n, 42);

    // Firing the signal after delivery changes nothing.
    token.cancel();

    let again: i64 = bridge.client.query("fast", &1).await?;
    assert_eq!(again, 2);

    Ok(())
}

#[tokio::test]
async fn test_stray_cancel_notice_is_ignored() -> Result<()> {
    // ---
    let router = Router::builder()
        .query("fast", |_ctx: CallContext, n: i64| async move { Ok(n + 1) })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await?;

    // A cancel notice for an id nobody is tracking must not disturb the
    // dispatcher.
    let stray = CancelNotice {
        id: CorrelationId::generate(),
    };
    let message = bytes::Bytes::from(serde_json::to_vec(&stray).unwrap());
    bridge.ui_side.notify("rpc:cancel", message).await?;

    let n: i64 = bridge.client.query("fast", &1).await?;
    assert_eq!(n, 2);

    Ok(())
}

#[tokio::test]
async fn test_subscription_delivers_in_order_then_completes() -> Result<()> {
    // ---
    let router = Router::builder()
        .subscription("ticker", |_ctx: CallContext, _input: ()| async move {
            // ---
            let (tx, rx) = mpsc::channel(8);

            tokio::spawn(async move {
                for i in 1..=3 {
                    let _ = tx.send(Ok(i)).await;
                }
                // Dropping the sender completes the stream.
            });

            Ok(rx)
        })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await?;

    let mut sub = bridge.client.subscribe::<(), i32>("ticker", &()).await?;

    assert_eq!(sub.next().await.unwrap()?, 1);
    assert_eq!(sub.next().await.unwrap()?, 2);
    assert_eq!(sub.next().await.unwrap()?, 3);

    // Complete, and nothing after it.
    assert!(sub.next().await.is_none());
    assert!(sub.next().await.is_none());

    Ok(())
}

#[tokio::test]
async fn test_subscription_error_is_terminal() -> Result<()> {
    // ---
    let router = Router::builder()
        .subscription("faulty", |_ctx: CallContext, _input: ()| async move {
            // ---
            let (tx, rx) = mpsc::channel(8);

            tokio::spawn(async move {
                let _ = tx.send(Ok(7)).await;
                let _ = tx.send(Err(Error::Handler("source failed".to_string()))).await;
                // Anything after the error must never surface.
                let _ = tx.send(Ok(8)).await;
            });

            Ok(rx)
        })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await?;

    let mut sub = bridge.client.subscribe::<(), i32>("faulty", &()).await?;

    assert_eq!(sub.next().await.unwrap()?, 7);

    match sub.next().await {
        Some(Err(Error::Handler(description))) => assert!(description.contains("source failed")),
        other => panic!("expected the terminal error event, got {other:?}"),
    }

    assert!(sub.next().await.is_none());

    // Unsubscribing an already-finished subscription is a no-op.
    sub.unsubscribe().await;

    Ok(())
}

#[tokio::test]
async fn test_unknown_subscription_path_errors() -> Result<()> {
    // ---
    let router = Router::builder().build();
    let bridge = bridge(router, ConnectionId(1)).await?;

    let mut sub = bridge
        .client
        .subscribe::<(), i32>("missing", &())
        .await?;

    match sub.next().await {
        Some(Err(Error::Handler(description))) => {
            assert!(description.contains("no handler registered"));
        }
        other => panic!("expected the terminal error event, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn test_unsubscribe_releases_the_producer() -> Result<()> {
    // ---
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    let bridge = bridge(endless_router(stopped_tx), ConnectionId(1)).await?;

    let mut sub = bridge.client.subscribe::<(), u64>("endless", &()).await?;

    // Let a few events flow before detaching.
    assert!(sub.next().await.unwrap().is_ok());
    assert!(sub.next().await.unwrap().is_ok());

    sub.unsubscribe().await;

    // The stop notice propagates back to the producer task.
    assert_eq!(stopped_rx.recv().await, Some(()));

    Ok(())
}

#[tokio::test]
async fn test_sibling_subscriptions_are_independent() -> Result<()> {
    // ---
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    let bridge = bridge(endless_router(stopped_tx), ConnectionId(1)).await?;

    let mut s1 = bridge.client.subscribe::<(), u64>("endless", &()).await?;
    let mut s2 = bridge.client.subscribe::<(), u64>("endless", &()).await?;

    assert!(s1.next().await.unwrap().is_ok());
    assert!(s2.next().await.unwrap().is_ok());

    s1.unsubscribe().await;
    assert_eq!(stopped_rx.recv().await, Some(()));

    // The sibling keeps delivering after the stop.
    for _ in 0..3 {
        assert!(s2.next().await.unwrap().is_ok());
    }

    Ok(())
}

#[tokio::test]
async fn test_teardown_releases_only_its_connection() -> Result<()> {
    // ---
    init_logging();

    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    let router = endless_router(stopped_tx);

    let (ui_a, host_a) = create_memory_link("ui-a", "host").await?;
    let (ui_b, host_b) = create_memory_link("ui-b", "host").await?;

    let server = RpcServer::new(router, RpcConfig::default());
    let _dispatch_a = server.attach(host_a, ConnectionId(1)).await?;
    let _dispatch_b = server.attach(host_b, ConnectionId(2)).await?;

    let client_a = RpcClient::with_transport(ui_a, RpcConfig::default()).await?;
    let client_b = RpcClient::with_transport(ui_b, RpcConfig::default()).await?;

    let mut s1 = client_a.subscribe::<(), u64>("endless", &()).await?;
    let mut s2 = client_a.subscribe::<(), u64>("endless", &()).await?;
    let mut s3 = client_b.subscribe::<(), u64>("endless", &()).await?;

    assert!(s1.next().await.unwrap().is_ok());
    assert!(s2.next().await.unwrap().is_ok());
    assert!(s3.next().await.unwrap().is_ok());

    // Tearing down connection 1 releases s1 and s2, and nothing else.
    server.teardown(ConnectionId(1));

    assert_eq!(stopped_rx.recv().await, Some(()));
    assert_eq!(stopped_rx.recv().await, Some(()));
    assert!(stopped_rx.try_recv().is_err());

    for _ in 0..3 {
        assert!(s3.next().await.unwrap().is_ok());
    }

    Ok(())
}

#[tokio::test]
async fn test_wire_absence_survives_the_round_trip() -> Result<()> {
    // ---
    let router = Router::builder()
        .query_raw("echoPresence", |_ctx: CallContext, payload: Payload| async move {
            Ok(payload)
        })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await?;

    let reply = bridge
        .client
        .call_raw("echoPresence", CallKind::Query, Payload::absent(), None)
        .await?;
    assert!(!reply.is_present());

    // A serialized null is a different animal than absence.
    let null = Payload::encode(&serde_json::Value::Null)?;
    let reply = bridge
        .client
        .call_raw("echoPresence", CallKind::Query, null.clone(), None)
        .await?;
    assert!(reply.is_present());
    assert_eq!(reply, null);

    Ok(())
}

#[tokio::test]
async fn test_channel_failure_is_scoped_to_its_bridge() -> Result<()> {
    // ---
    let router = Router::builder()
        .query("fast", |_ctx: CallContext, n: i64| async move { Ok(n + 1) })
        .build();

    let bridge = bridge(router, ConnectionId(1)).await?;

    // A second client speaking an unattached prefix fails on the channel,
    // not on the shared link.
    let stranded = RpcClient::with_transport(
        bridge.ui_side.clone(),
        RpcConfig::default().with_channel_prefix("nobody-home"),
    )
    .await?;

    let outcome: Result<i64> = stranded.query("fast", &1).await;
    assert!(matches!(outcome, Err(Error::Channel(_))));

    // The attached bridge is unaffected.
    let n: i64 = bridge.client.query("fast", &1).await?;
    assert_eq!(n, 2);

    Ok(())
}
