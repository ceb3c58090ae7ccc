//! End-to-end subscription scenarios against an in-process websocket server
//!
//! Each test spins up a real `tokio-tungstenite` listener that speaks one of
//! the two subscription protocols well enough for the scenario under test.

use futures_util::{SinkExt, StreamExt};
use graphql_stream_client::{
    GraphQLClientError, GraphqlWs, OperationMessage, SubscriptionClient, SubscriptionStatus,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

type ServerWs = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Bind a listener and serve every incoming connection with `handler`
async fn spawn_server<F, Fut>(handler: F) -> String
where
    F: Fn(ServerWs) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let callback = |request: &tungstenite::handshake::server::Request,
                                 mut response: tungstenite::handshake::server::Response| {
                    if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
                        response
                            .headers_mut()
                            .insert("Sec-WebSocket-Protocol", protocol.clone());
                    }
                    Ok(response)
                };
                if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
                    handler(ws).await;
                }
            });
        }
    });
    format!("ws://{addr}")
}

async fn read_message(ws: &mut ServerWs) -> Option<OperationMessage> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    let _ = ws.send(Message::Text(value.to_string().into())).await;
}

async fn wait_for_status(client: &SubscriptionClient, id: &str, status: SubscriptionStatus) {
    timeout(WAIT, async {
        loop {
            if client.get_subscription(id).await.map(|s| s.status()) == Some(status) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscription never reached the expected status");
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let cloned = Arc::clone(&count);
    (count, move || {
        cloned.fetch_add(1, Ordering::SeqCst);
    })
}

/// A legacy-protocol server that acks, answers every `start` with one `data`
/// frame, and every `stop` with a `complete`
async fn legacy_echo_server() -> String {
    spawn_server(|mut ws| async move {
        while let Some(message) = read_message(&mut ws).await {
            match message.message_type.as_str() {
                "connection_init" => send_json(&mut ws, json!({"type": "connection_ack"})).await,
                "start" => {
                    let id = message.id.clone().unwrap_or_default();
                    send_json(
                        &mut ws,
                        json!({
                            "type": "data",
                            "id": id,
                            "payload": {"data": {"value": 1}}
                        }),
                    )
                    .await;
                }
                "stop" => {
                    let id = message.id.clone().unwrap_or_default();
                    send_json(&mut ws, json!({"type": "complete", "id": id})).await;
                }
                "connection_terminate" => return,
                _ => {}
            }
        }
    })
    .await
}

#[tokio::test]
async fn lifecycle_events_on_legacy_protocol() {
    let url = legacy_echo_server().await;

    let (connected, on_connected) = counter();
    let (disconnected, on_disconnected) = counter();
    let completed_queries = Arc::new(Mutex::new(Vec::<String>::new()));
    let (data_tx, mut data_rx) = mpsc::unbounded_channel::<String>();

    let client = Arc::new(
        SubscriptionClient::new(&url)
            .with_sync_mode(true)
            .with_exit_when_no_subscription(true)
            .with_retry_delay(Duration::from_millis(50))
            .on_connected(on_connected)
            .on_disconnected(on_disconnected)
            .on_subscription_complete({
                let completed_queries = Arc::clone(&completed_queries);
                move |subscription| {
                    completed_queries
                        .lock()
                        .unwrap()
                        .push(subscription.payload().query.clone());
                }
            }),
    );

    let handler = {
        let data_tx = data_tx.clone();
        move |event: graphql_stream_client::Result<bytes::Bytes>| {
            if let Ok(data) = event {
                let _ = data_tx.send(String::from_utf8_lossy(&data).to_string());
            }
            Ok(())
        }
    };
    let x = client
        .subscribe_raw("subscription { x }", None, None, handler.clone())
        .await
        .unwrap();
    let y = client
        .subscribe_raw("subscription { y }", None, None, handler)
        .await
        .unwrap();

    let run = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run().await })
    };

    // both subscriptions deliver a data frame
    let first = timeout(WAIT, data_rx.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, data_rx.recv()).await.unwrap().unwrap();
    assert!(first.contains("value"));
    assert!(second.contains("value"));

    client.unsubscribe(&x).await.unwrap();
    client.unsubscribe(&y).await.unwrap();

    // the server completes both, after which the client exits on its own
    let result = timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_ok());

    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);

    let mut queries = completed_queries.lock().unwrap().clone();
    queries.sort();
    assert_eq!(queries, vec!["subscription { x }", "subscription { y }"]);
}

#[tokio::test]
async fn modern_protocol_echoes_ping_payload() {
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Value>();
    let pong_tx = Arc::new(pong_tx);

    let url = spawn_server({
        move |mut ws| {
            let pong_tx = Arc::clone(&pong_tx);
            async move {
                while let Some(message) = read_message(&mut ws).await {
                    match message.message_type.as_str() {
                        "connection_init" => {
                            send_json(&mut ws, json!({"type": "connection_ack"})).await;
                            send_json(&mut ws, json!({"type": "ping", "payload": {"t": 1}})).await;
                        }
                        "pong" => {
                            let _ = pong_tx.send(message.payload.clone().unwrap_or(Value::Null));
                        }
                        _ => {}
                    }
                }
            }
        }
    })
    .await;

    let (alive, on_alive) = counter();
    let client = Arc::new(
        SubscriptionClient::new(&url)
            .with_protocol(GraphqlWs)
            .with_sync_mode(true)
            .on_connection_alive(on_alive),
    );

    let ctx = CancellationToken::new();
    let run = {
        let client = Arc::clone(&client);
        let ctx = ctx.clone();
        tokio::spawn(async move { client.run_with_cancellation(ctx).await })
    };

    let pong = timeout(WAIT, pong_rx.recv()).await.unwrap().unwrap();
    assert_eq!(pong, json!({"t": 1}));
    assert!(alive.load(Ordering::SeqCst) >= 1);

    ctx.cancel();
    let result = timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn close_and_rerun_preserves_subscriptions() {
    let url = legacy_echo_server().await;

    let client = Arc::new(SubscriptionClient::new(&url).with_sync_mode(true));
    let a = client
        .subscribe_raw("subscription { a }", None, None, |_| Ok(()))
        .await
        .unwrap();
    let b = client
        .subscribe_raw("subscription { b }", None, None, |_| Ok(()))
        .await
        .unwrap();

    let run_first = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run().await })
    };
    wait_for_status(&client, &a, SubscriptionStatus::Running).await;
    wait_for_status(&client, &b, SubscriptionStatus::Running).await;

    let first_session_ids = (
        client.get_subscription(&a).await.unwrap().session_id().to_string(),
        client.get_subscription(&b).await.unwrap().session_id().to_string(),
    );

    client.close().await.unwrap();
    let result = timeout(WAIT, run_first).await.unwrap().unwrap();
    assert!(result.is_ok());

    // the registry survives the shutdown
    assert_eq!(
        client.get_subscription(&a).await.unwrap().status(),
        SubscriptionStatus::Waiting
    );
    assert_eq!(
        client.get_subscription(&b).await.unwrap().status(),
        SubscriptionStatus::Waiting
    );

    let run_second = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run().await })
    };
    wait_for_status(&client, &a, SubscriptionStatus::Running).await;
    wait_for_status(&client, &b, SubscriptionStatus::Running).await;

    let second_session_ids = (
        client.get_subscription(&a).await.unwrap().session_id().to_string(),
        client.get_subscription(&b).await.unwrap().session_id().to_string(),
    );
    assert_ne!(first_session_ids.0, second_session_ids.0);
    assert_ne!(first_session_ids.1, second_session_ids.1);

    client.close().await.unwrap();
    let result = timeout(WAIT, run_second).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn retry_status_code_reconnects_without_error_callback() {
    // ack the session, then close it with 4400
    let url = spawn_server(|mut ws| async move {
        while let Some(message) = read_message(&mut ws).await {
            if message.message_type == "connection_init" {
                send_json(&mut ws, json!({"type": "connection_ack"})).await;
                let _ = ws
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(4400u16),
                        reason: "invalid message".into(),
                    })))
                    .await;
            }
        }
    })
    .await;

    let (disconnected, on_disconnected) = counter();
    let errors_seen = Arc::new(AtomicUsize::new(0));

    let client = Arc::new(
        SubscriptionClient::new(&url)
            .with_sync_mode(true)
            .with_retry_delay(Duration::from_millis(20))
            .with_retry_status_codes(vec!["4400".parse().unwrap()])
            .on_disconnected(on_disconnected)
            .on_error({
                let errors_seen = Arc::clone(&errors_seen);
                move |_| {
                    errors_seen.fetch_add(1, Ordering::SeqCst);
                    None
                }
            }),
    );

    let ctx = CancellationToken::new();
    let run = {
        let client = Arc::clone(&client);
        let ctx = ctx.clone();
        tokio::spawn(async move { client.run_with_cancellation(ctx).await })
    };

    timeout(WAIT, async {
        while disconnected.load(Ordering::SeqCst) < 5 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("expected at least five disconnect cycles");

    assert_eq!(errors_seen.load(Ordering::SeqCst), 0);

    ctx.cancel();
    let result = timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn graceful_context_cancellation() {
    let url = legacy_echo_server().await;

    let client = Arc::new(SubscriptionClient::new(&url).with_sync_mode(true));
    let id = client
        .subscribe_raw("subscription { a }", None, None, |_| Ok(()))
        .await
        .unwrap();

    let ctx = CancellationToken::new();
    let run = {
        let client = Arc::clone(&client);
        let ctx = ctx.clone();
        tokio::spawn(async move { client.run_with_cancellation(ctx).await })
    };

    wait_for_status(&client, &id, SubscriptionStatus::Running).await;
    ctx.cancel();

    let result = timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(!client.is_session_active().await);
}

#[tokio::test]
async fn initialisation_timeout_synthesizes_4408() {
    // never acks
    let url = spawn_server(|mut ws| async move {
        while read_message(&mut ws).await.is_some() {}
    })
    .await;

    let observed = Arc::new(Mutex::new(None::<GraphQLClientError>));
    let client = Arc::new(
        SubscriptionClient::new(&url)
            .with_sync_mode(true)
            .with_connection_initialisation_timeout(Duration::from_millis(300))
            .on_error({
                let observed = Arc::clone(&observed);
                move |err| {
                    *observed.lock().unwrap() = Some(err.clone());
                    Some(err.clone())
                }
            }),
    );

    let started = Instant::now();
    let result = timeout(WAIT, client.run()).await.unwrap();
    let elapsed = started.elapsed();

    let err = result.unwrap_err();
    assert_eq!(err.close_status(), 4408);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(2));

    let observed = observed.lock().unwrap().clone().unwrap();
    assert_eq!(observed.close_status(), 4408);
}

#[tokio::test]
async fn handler_error_reaches_error_observer() {
    let url = legacy_echo_server().await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
    let client = Arc::new(
        SubscriptionClient::new(&url)
            .with_sync_mode(true)
            .on_error({
                let seen_tx = seen_tx.clone();
                move |err| {
                    let _ = seen_tx.send(err.to_string());
                    Some(err.clone())
                }
            }),
    );

    client
        .subscribe_raw("subscription { a }", None, None, |_| {
            Err(GraphQLClientError::custom("handler rejected the frame"))
        })
        .await
        .unwrap();

    let ctx = CancellationToken::new();
    let run = {
        let client = Arc::clone(&client);
        let ctx = ctx.clone();
        tokio::spawn(async move { client.run_with_cancellation(ctx).await })
    };

    let seen = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    assert!(seen.contains("handler rejected the frame"));

    let result = timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_err());
    ctx.cancel();
}
