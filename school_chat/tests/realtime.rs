use futures::{SinkExt, StreamExt};
use school_chat::api::{build_router, AppState};
use school_chat::auth;
use school_chat::config::Config;
use school_chat::model::{Role, UserRecord};
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(
    tweak: impl FnOnce(&mut Config),
) -> (SocketAddr, JoinHandle<()>, AppState, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config {
        bind: addr.to_string(),
        data_dir: tmp.path().to_path_buf(),
        logging_enabled: false,
        jwt_secret: None,
        auth_grace_secs: 10,
        heartbeat_interval_secs: 20,
        heartbeat_missed_allowance: 2,
        device_limit: 5,
        malformed_frame_threshold: 25,
        send_queue_capacity: 64,
        edit_grace_secs: 300,
        typing_debounce_secs: 2,
    };
    tweak(&mut config);
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, state, tmp)
}

fn token(state: &AppState, id: &str, role: Role) -> String {
    let user = UserRecord {
        id: id.into(),
        username: id.into(),
        display_name: id.to_uppercase(),
        role,
    };
    auth::issue_jwt(&state.jwt_secret, &user, time::Duration::hours(1)).unwrap()
}

async fn touch(client: &reqwest::Client, addr: SocketAddr, token: &str) {
    let resp = client
        .get(format!("http://{addr}/messages/conversations"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

async fn create_direct(
    client: &reqwest::Client,
    addr: SocketAddr,
    token: &str,
    other: &str,
) -> Uuid {
    let resp = client
        .post(format!("http://{addr}/messages/conversations"))
        .bearer_auth(token)
        .json(&serde_json::json!({"participants": [other], "conversation_type": "direct"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    resp.json::<serde_json::Value>().await.unwrap()["id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap()
}

async fn connect(addr: SocketAddr, token: &str) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .unwrap();
    ws
}

/// Read text frames until one matches the wanted type.
async fn read_frame_of_type(ws: &mut WsClient, wanted: &str) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for '{wanted}' frame"))
            .expect("stream ended")
            .expect("socket error");
        if let WsMessage::Text(text) = msg {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == wanted {
                return value;
            }
        }
    }
}

/// Read until the server closes the socket, returning the close code.
async fn read_close_code(ws: &mut WsClient, wait: Duration) -> u16 {
    loop {
        match tokio::time::timeout(wait, ws.next())
            .await
            .expect("timed out waiting for close frame")
        {
            Some(Ok(WsMessage::Close(Some(frame)))) => return frame.code.into(),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("socket ended without a close frame"),
        }
    }
}

#[tokio::test]
async fn message_read_receipt_ping_and_typing_flow() {
    let (addr, server, state, _tmp) = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    let alice = token(&state, "alice", Role::Teacher);
    let bob = token(&state, "bob", Role::Student);
    touch(&client, addr, &alice).await;
    touch(&client, addr, &bob).await;
    let conv = create_direct(&client, addr, &alice, "bob").await;

    let mut bob_ws = connect(addr, &bob).await;
    let mut alice_ws = connect(addr, &alice).await;

    // bob sees alice come online (his own presence frame may arrive first)
    loop {
        let presence = read_frame_of_type(&mut bob_ws, "presence").await;
        if presence["user_id"] == "alice" {
            assert_eq!(presence["status"], "online");
            break;
        }
    }

    // live delivery
    alice_ws
        .send(WsMessage::Text(
            serde_json::json!({"type": "message", "conversation_id": conv, "content": "hello bob"})
                .to_string(),
        ))
        .await
        .unwrap();
    let frame = read_frame_of_type(&mut bob_ws, "message").await;
    assert_eq!(frame["message"]["content"], "hello bob");
    assert_eq!(frame["message"]["sender_id"], "alice");
    let message_id = frame["message"]["id"].as_str().unwrap().to_string();
    // the sender's own device receives the accepted message as its ack
    let echo = read_frame_of_type(&mut alice_ws, "message").await;
    assert_eq!(echo["message"]["id"].as_str().unwrap(), message_id);

    // read receipt reaches the sender
    bob_ws
        .send(WsMessage::Text(
            serde_json::json!({"type": "message_read", "message_id": message_id, "conversation_id": conv})
                .to_string(),
        ))
        .await
        .unwrap();
    let receipt = read_frame_of_type(&mut alice_ws, "message_read").await;
    assert_eq!(receipt["user_id"], "bob");

    // ping answers with a server-stamped pong
    bob_ws
        .send(WsMessage::Text(
            serde_json::json!({"type": "ping", "timestamp": "2026-01-01T00:00:00Z"}).to_string(),
        ))
        .await
        .unwrap();
    let pong = read_frame_of_type(&mut bob_ws, "pong").await;
    assert!(pong["timestamp"].is_string());

    // typing is debounced and never echoed back to the typist
    alice_ws
        .send(WsMessage::Text(
            serde_json::json!({"type": "message_typing", "conversation_id": conv}).to_string(),
        ))
        .await
        .unwrap();
    alice_ws
        .send(WsMessage::Text(
            serde_json::json!({"type": "message_typing", "conversation_id": conv}).to_string(),
        ))
        .await
        .unwrap();
    let typing = read_frame_of_type(&mut bob_ws, "message_typing").await;
    assert_eq!(typing["user_id"], "alice");
    // the second indicator was debounced away
    let quiet = tokio::time::timeout(Duration::from_millis(500), bob_ws.next()).await;
    assert!(quiet.is_err());
    server.abort();
}

#[tokio::test]
async fn scenario_malformed_flood_closes_only_the_abuser() {
    let (addr, server, state, _tmp) = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    let bob = token(&state, "bob", Role::Student);
    touch(&client, addr, &bob).await;

    let mut abuser = connect(addr, &bob).await;
    let mut well_behaved = connect(addr, &bob).await;

    for _ in 0..50 {
        // the server may close mid-flood; keep sending like a bad client would
        let _ = abuser
            .send(WsMessage::Text("{\"type\":\"bogus\"}".to_string()))
            .await;
    }
    let code = read_close_code(&mut abuser, Duration::from_secs(10)).await;
    assert_eq!(code, 4429);

    // the second connection from the same user is unaffected
    well_behaved
        .send(WsMessage::Text(
            serde_json::json!({"type": "ping"}).to_string(),
        ))
        .await
        .unwrap();
    read_frame_of_type(&mut well_behaved, "pong").await;
    server.abort();
}

#[tokio::test]
async fn scenario_sixth_device_evicts_the_oldest() {
    let (addr, server, state, _tmp) = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    let bob = token(&state, "bob", Role::Student);
    touch(&client, addr, &bob).await;

    let mut first = connect(addr, &bob).await;
    let mut _others = Vec::new();
    for _ in 0..4 {
        _others.push(connect(addr, &bob).await);
    }
    let mut sixth = connect(addr, &bob).await;

    let code = read_close_code(&mut first, Duration::from_secs(10)).await;
    assert_eq!(code, 4409);

    // the newest device works
    sixth
        .send(WsMessage::Text(
            serde_json::json!({"type": "ping"}).to_string(),
        ))
        .await
        .unwrap();
    read_frame_of_type(&mut sixth, "pong").await;
    server.abort();
}

#[tokio::test]
async fn silent_connection_goes_offline_after_missed_heartbeats() {
    let (addr, server, state, _tmp) = spawn_server(|cfg| {
        cfg.heartbeat_interval_secs = 1;
        cfg.heartbeat_missed_allowance = 2;
    })
    .await;
    let client = reqwest::Client::new();
    let alice = token(&state, "alice", Role::Teacher);
    let bob = token(&state, "bob", Role::Student);
    touch(&client, addr, &alice).await;
    touch(&client, addr, &bob).await;

    let mut bob_ws = connect(addr, &bob).await;
    // never ping: the reaper declares the connection dead
    let code = read_close_code(&mut bob_ws, Duration::from_secs(10)).await;
    assert_eq!(code, 4408);

    // presence converges to offline once the dead connection is reaped
    let mut offline = false;
    for _ in 0..20 {
        let users: serde_json::Value = client
            .get(format!("http://{addr}/messages/online-users"))
            .bearer_auth(&alice)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if users.as_array().unwrap().is_empty() {
            offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert!(offline, "user never went offline after heartbeat death");
    server.abort();
}

#[tokio::test]
async fn missing_authentication_times_out_with_a_policy_close() {
    let (addr, server, _state, _tmp) = spawn_server(|cfg| {
        cfg.auth_grace_secs = 1;
    })
    .await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let code = read_close_code(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(code, 4401);
    server.abort();
}

#[tokio::test]
async fn bad_token_is_rejected_and_auth_frame_is_accepted() {
    let (addr, server, state, _tmp) = spawn_server(|_| {}).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws?token=garbage"))
        .await
        .unwrap();
    let code = read_close_code(&mut ws, Duration::from_secs(5)).await;
    assert_eq!(code, 4403);

    // explicit authentication frame inside the grace window
    let bob = token(&state, "bob", Role::Student);
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws.send(WsMessage::Text(
        serde_json::json!({"type": "authentication", "token": bob}).to_string(),
    ))
    .await
    .unwrap();
    ws.send(WsMessage::Text(
        serde_json::json!({"type": "ping"}).to_string(),
    ))
    .await
    .unwrap();
    read_frame_of_type(&mut ws, "pong").await;
    server.abort();
}

#[tokio::test]
async fn conversation_socket_starts_with_a_snapshot() {
    let (addr, server, state, _tmp) = spawn_server(|_| {}).await;
    let client = reqwest::Client::new();
    let alice = token(&state, "alice", Role::Teacher);
    let bob = token(&state, "bob", Role::Student);
    let eve = token(&state, "eve", Role::Teacher);
    touch(&client, addr, &alice).await;
    touch(&client, addr, &bob).await;
    touch(&client, addr, &eve).await;
    let conv = create_direct(&client, addr, &alice, "bob").await;
    for content in ["one", "two"] {
        let resp = client
            .post(format!("http://{addr}/messages/send"))
            .bearer_auth(&alice)
            .json(&serde_json::json!({"conversation_id": conv, "content": content}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }

    let (mut bob_ws, _) = connect_async(format!("ws://{addr}/ws/conversation/{conv}?token={bob}"))
        .await
        .unwrap();
    let snapshot = read_frame_of_type(&mut bob_ws, "snapshot").await;
    assert_eq!(snapshot["unread_count"], 2);
    assert_eq!(snapshot["total_messages"], 2);

    // a non-participant is turned away from the pre-subscribed socket
    let (mut eve_ws, _) = connect_async(format!("ws://{addr}/ws/conversation/{conv}?token={eve}"))
        .await
        .unwrap();
    let error = read_frame_of_type(&mut eve_ws, "error").await;
    assert_eq!(error["code"], "not_a_participant");
    let code = read_close_code(&mut eve_ws, Duration::from_secs(5)).await;
    assert_eq!(code, 4404);
    server.abort();
}
