//! End-to-end tests against a real WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use iterlink_client::{EventCache, MemoryCache, SyncEngine, WsConnector};
use iterlink_core::logging::capture_logs;
use iterlink_core::{ChatEvent, InstanceId, PersistedEvent, SessionId};
use iterlink_settings::SyncSettings;
use iterlink_store::EventStore;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::Level;

type ServerSocket = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (tcp, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(tcp).await.unwrap()
}

async fn send_json(ws: &mut ServerSocket, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next non-ping message from the client.
async fn recv_json(ws: &mut ServerSocket) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if value["type"] != "ping" {
                    return value;
                }
            }
            Some(Ok(_)) => {}
            other => panic!("client went away: {other:?}"),
        }
    }
}

fn settings(url: &str) -> SyncSettings {
    let mut settings = SyncSettings::default();
    settings.server.url = url.to_owned();
    settings.reconnect.initial_delay_ms = 20;
    settings.reconnect.max_delay_ms = 100;
    settings
}

fn server_history() -> Vec<Value> {
    (1..=5)
        .map(|i| {
            let event_type = if i == 1 { "session_start" } else { "output" };
            json!({ "type": event_type, "id": format!("evt-{i}"), "timestamp": i * 100 })
        })
        .collect()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn connected_history_repairs_lagging_store() {
    let (logs, _guard) = capture_logs();
    let instance = InstanceId::from_raw("A");

    // Two of the server's five events already on disk.
    let store = Arc::new(EventStore::in_memory().unwrap());
    let session = SessionId::from_raw("A-100");
    for raw in server_history().into_iter().take(2) {
        let event = ChatEvent::from_value(raw).unwrap();
        let _ = store
            .put_event(&PersistedEvent::new(event, session.clone(), instance.clone()))
            .unwrap();
    }

    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send_json(
            &mut ws,
            json!({ "type": "connected", "instanceId": "A", "events": server_history(), "status": "idle" }),
        )
        .await;
        // Hold the socket open until the client leaves.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let cache = Arc::new(MemoryCache::new(instance.clone()));
    let engine = SyncEngine::start(
        &settings(&url),
        store.clone(),
        cache.clone(),
        Arc::new(WsConnector::new(url.clone())),
    )
    .await
    .unwrap();
    assert_eq!(cache.event_count(&instance), 2);

    engine.connect();
    wait_until(|| cache.view(&instance).synced).await;
    engine.flush().await;

    let warnings = logs.matching(Level::WARN, "local history behind server");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].field("local"), Some("2"));
    assert_eq!(warnings[0].field("server"), Some("5"));

    assert_eq!(store.count_events(&instance).unwrap(), 5);
    let cached: Vec<String> = cache
        .events(&instance)
        .into_iter()
        .map(|e| e.id.unwrap().to_string())
        .collect();
    assert_eq!(cached, vec!["evt-1", "evt-2", "evt-3", "evt-4", "evt-5"]);

    engine.stop().await;
    server.await.unwrap();
}

#[tokio::test]
async fn dropped_connection_catches_up_from_last_timestamp() {
    let instance = InstanceId::from_raw("A");
    let store = Arc::new(EventStore::in_memory().unwrap());
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        // First connection: a session starts, then the socket drops.
        let mut ws = accept(&listener).await;
        send_json(
            &mut ws,
            json!({ "type": "loop:event", "event": { "type": "session_start", "id": "s", "timestamp": 42 } }),
        )
        .await;
        ws.close(None).await.unwrap();
        drop(ws);

        // Second connection: the client asks for what it missed.
        let mut ws = accept(&listener).await;
        let request = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({
                "type": "pending_events",
                "instanceId": "A",
                "events": [
                    { "type": "output", "id": "p1", "timestamp": 43 },
                    { "type": "output", "id": "p2", "timestamp": 44 },
                ],
            }),
        )
        .await;
        while let Some(Ok(_)) = ws.next().await {}
        request
    });

    let cache = Arc::new(MemoryCache::new(instance.clone()));
    let engine = SyncEngine::start(
        &settings(&url),
        store.clone(),
        cache.clone(),
        Arc::new(WsConnector::new(url.clone())),
    )
    .await
    .unwrap();

    engine.connect();
    wait_until(|| cache.event_count(&instance) == 3).await;
    engine.flush().await;

    assert_eq!(store.count_events(&instance).unwrap(), 3);
    let sessions = store.list_sessions(&instance).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id.as_str(), "A-42");

    engine.stop().await;
    let request = server.await.unwrap();
    assert_eq!(
        request,
        json!({ "type": "reconnect", "instanceId": "A", "lastEventTimestamp": 42 })
    );
}
