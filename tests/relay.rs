//! End-to-end relay scenarios over a real listener: agents and viewers
//! are driven with `tokio-tungstenite`, the HTTP bridge with `reqwest`.

use futures::{SinkExt, StreamExt};
use relay_server::config::Config;
use relay_server::protocol::Role;
use relay_server::state::{AppState, SharedState};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> Config {
    Config {
        store_path: std::env::temp_dir().join(format!(
            "relay-e2e-test-{}.json",
            Uuid::new_v4().simple()
        )),
        receive_deadline: Duration::from_secs(5),
        // Generous buffer so burst tests never shed frames.
        frame_buffer_capacity: 1024,
        ..Config::default()
    }
}

async fn spawn_relay(config: Config) -> (SocketAddr, SharedState) {
    let state: SharedState = Arc::new(AppState::new(config));
    let app = relay_server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, direction: &str, role: &str, tenant: &str, key: &str) -> WsClient {
    let url = format!("ws://{}/ws/{}/{}/{}/{}", addr, direction, role, tenant, key);
    let (ws, _) = connect_async(url).await.expect("websocket connect failed");
    ws
}

/// Waits for the agent's registration to land so the minted public key
/// can be read back.
async fn public_key_for(state: &SharedState, tenant: &str) -> String {
    for _ in 0..100 {
        if let Some(publickey) = state.keystore.get_public_by_name(tenant) {
            return publickey;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent registration never reached the key store");
}

/// Waits until the uplink for a slot is registered, so viewer actions
/// observe the agent rather than racing its registration.
async fn wait_for_uplink(state: &SharedState, tenant: &str, role: Role, key: &str) {
    for _ in 0..100 {
        if state.registry.uplink_for(tenant, role, key).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("uplink for {}/{}/{} never registered", tenant, role, key);
}

async fn next_binary(ws: &mut WsClient) -> Vec<u8> {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        match message {
            Message::Binary(data) => return data.to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a binary frame, got {:?}", other),
        }
    }
}

async fn next_text(ws: &mut WsClient) -> String {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a text frame")
            .expect("socket closed")
            .expect("socket error");
        match message {
            Message::Text(text) => return text.to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

// ─── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn pause_and_unpause_follow_the_viewer_set() {
    let (addr, state) = spawn_relay(test_config()).await;

    let mut agent = connect(addr, "rev", "c_agent", "tenant-a", "priv-key").await;
    let publickey = public_key_for(&state, "tenant-a").await;
    wait_for_uplink(&state, "tenant-a", Role::CAgent, "priv-key").await;

    // First viewer resumes the agent.
    let mut viewer = connect(addr, "cli", "c_agent", "tenant-a", &publickey).await;
    assert_eq!(
        next_binary(&mut agent).await,
        vec![0x00, 0x49, 0x00, 0x06, 0x00, 0x01]
    );

    // Last viewer leaving pauses it.
    viewer.close(None).await.unwrap();
    assert_eq!(
        next_binary(&mut agent).await,
        vec![0x00, 0x4A, 0x00, 0x06, 0x00, 0x01]
    );
}

#[tokio::test]
async fn viewer_traffic_reaches_the_agent_in_order() {
    let (addr, state) = spawn_relay(test_config()).await;

    let mut agent = connect(addr, "rev", "file_agent", "tenant-b", "priv-key").await;
    let publickey = public_key_for(&state, "tenant-b").await;
    wait_for_uplink(&state, "tenant-b", Role::FileAgent, "priv-key").await;
    let mut viewer = connect(addr, "cli", "file_agent", "tenant-b", &publickey).await;

    // A structured command is forwarded as its original bytes (the
    // relay's annotations only matter for broadcast types), and raw
    // binary goes through verbatim.
    viewer
        .send(Message::Text("{\"type\":\"mouse_move\",\"x\":4}".into()))
        .await
        .unwrap();
    viewer
        .send(Message::Binary(vec![9, 9, 9].into()))
        .await
        .unwrap();

    let command = next_text(&mut agent).await;
    let parsed: Value = serde_json::from_str(&command).unwrap();
    assert_eq!(parsed["type"], "mouse_move");
    assert_eq!(parsed["x"], 4);
    assert_eq!(next_binary(&mut agent).await, vec![9, 9, 9]);
}

#[tokio::test]
async fn http_call_falls_back_to_the_aliased_role() {
    let (addr, state) = spawn_relay(test_config()).await;

    // The only uplink is a c_agent; the HTTP call addresses file_agent.
    let mut agent = connect(addr, "rev", "c_agent", "tenant-c", "priv-key").await;
    let publickey = public_key_for(&state, "tenant-c").await;
    wait_for_uplink(&state, "tenant-c", Role::CAgent, "priv-key").await;

    let echo = tokio::spawn(async move {
        loop {
            match agent.next().await {
                Some(Ok(Message::Text(text))) => {
                    let message: Value = serde_json::from_str(text.as_str()).unwrap();
                    assert_eq!(message["type"], "list_remote");
                    let reply = json!({
                        "request_id": message["request_id"],
                        "files": ["notes.txt"],
                    });
                    agent
                        .send(Message::Text(reply.to_string().into()))
                        .await
                        .unwrap();
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("agent socket ended early: {:?}", other),
            }
        }
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!(
            "http://{}/api/v1/files/list/file_agent/tenant-c/{}",
            addr, publickey
        ))
        .json(&json!({"path": "/home", "show_hidden": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["files"], json!(["notes.txt"]));
    assert!(state.pending.is_empty());

    echo.await.unwrap();
}

#[tokio::test]
async fn dead_viewer_does_not_disturb_the_healthy_one() {
    let (addr, state) = spawn_relay(test_config()).await;

    let mut agent = connect(addr, "rev", "c_agent", "tenant-d", "priv-key").await;
    let publickey = public_key_for(&state, "tenant-d").await;
    wait_for_uplink(&state, "tenant-d", Role::CAgent, "priv-key").await;

    let first = connect(addr, "cli", "c_agent", "tenant-d", &publickey).await;
    let mut second = connect(addr, "cli", "c_agent", "tenant-d", &publickey).await;

    // Resume control packet for the first viewer.
    assert_eq!(next_binary(&mut agent).await[1], 0x49);

    // The first viewer vanishes; wait for the relay to notice so the
    // burst below only has one recipient.
    drop(first);
    let private = state
        .keystore
        .get_private_by_public(&publickey)
        .expect("key mapping must exist");
    for _ in 0..100 {
        if state
            .registry
            .viewer_sinks("tenant-d", Role::CAgent, &private)
            .await
            .len()
            == 1
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for i in 0..100u8 {
        agent
            .send(Message::Binary(vec![i, 0xAB].into()))
            .await
            .unwrap();
    }

    for i in 0..100u8 {
        assert_eq!(next_binary(&mut second).await, vec![i, 0xAB]);
    }

    // The agent is unaffected: its uplink still answers HTTP calls.
    assert!(state
        .registry
        .uplink_for("tenant-d", Role::CAgent, &private)
        .await
        .is_some());
}

#[tokio::test]
async fn chat_presence_follows_the_uplink() {
    let (addr, state) = spawn_relay(test_config()).await;

    let mut agent = connect(addr, "rev", "chat_agent", "tenant-e", "priv-key").await;
    let publickey = public_key_for(&state, "tenant-e").await;
    wait_for_uplink(&state, "tenant-e", Role::ChatAgent, "priv-key").await;

    let mut viewer = connect(addr, "cli", "chat_agent", "tenant-e", &publickey).await;

    // Connect-time snapshot: the registered uplink reports online.
    let online: Value = serde_json::from_str(&next_text(&mut viewer).await).unwrap();
    assert_eq!(
        online,
        json!({
            "type": "status_update",
            "agent_id": "tenant-e",
            "status": "online",
            "agent_type": "chat_agent",
        })
    );

    // Agent leaves: the disconnect event and the offline status follow.
    agent.close(None).await.unwrap();
    let mut saw_disconnect_event = false;
    loop {
        let message = timeout(WAIT, viewer.next())
            .await
            .expect("timed out waiting for presence updates")
            .expect("viewer socket closed")
            .expect("viewer socket error");
        match message {
            Message::Text(text) => {
                let parsed: Value = serde_json::from_str(text.as_str()).unwrap();
                match parsed["type"].as_str() {
                    Some("agent_disconnected") => {
                        assert_eq!(parsed["tenant_id"], "tenant-e");
                        saw_disconnect_event = true;
                    }
                    Some("status_update") => {
                        assert_eq!(parsed["status"], "offline");
                        break;
                    }
                    other => panic!("unexpected broadcast type {:?}", other),
                }
            }
            // The in-band disconnect byte for this slot's viewers.
            Message::Binary(data) => assert_eq!(data.to_vec(), vec![0x63]),
            _ => {}
        }
    }
    assert!(saw_disconnect_event);
}

#[tokio::test]
async fn chat_messages_are_annotated_and_broadcast() {
    let (addr, state) = spawn_relay(test_config()).await;

    let mut agent = connect(addr, "rev", "chat_agent", "tenant-f", "priv-key").await;
    let publickey = public_key_for(&state, "tenant-f").await;
    wait_for_uplink(&state, "tenant-f", Role::ChatAgent, "priv-key").await;
    let mut viewer = connect(addr, "cli", "chat_agent", "tenant-f", &publickey).await;

    // Skip the connect-time presence snapshot.
    let snapshot: Value = serde_json::from_str(&next_text(&mut viewer).await).unwrap();
    assert_eq!(snapshot["type"], "status_update");

    agent
        .send(Message::Text(
            "{\"type\":\"chat_message\",\"message\":\"hello\",\"uuid\":\"u-1\"}".into(),
        ))
        .await
        .unwrap();

    let chat: Value = serde_json::from_str(&next_text(&mut viewer).await).unwrap();
    assert_eq!(chat["type"], "chat_message");
    assert_eq!(chat["message"], "hello");
    assert_eq!(chat["source"], "chat_agent");
    assert_eq!(chat["from"], "tenant-f");
    assert_eq!(chat["uuid"], "u-1");
}

#[tokio::test]
async fn public_key_survives_agent_reconnect() {
    let (addr, state) = spawn_relay(test_config()).await;

    let agent = connect(addr, "rev", "c_agent", "tenant-g", "priv-1").await;
    let first_key = public_key_for(&state, "tenant-g").await;
    drop(agent);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _agent = connect(addr, "rev", "c_agent", "tenant-g", "priv-2").await;
    for _ in 0..100 {
        if state.keystore.get_private_by_public(&first_key).as_deref() == Some("priv-2") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.keystore.get_public_by_name("tenant-g"), Some(first_key));
}
