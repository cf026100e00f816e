use futures_util::{SinkExt, StreamExt};
use practice_relay::handlers::LIVENESS_BODY;
use practice_relay::relay::Relay;
use practice_relay::server::{build_router, AppState};
use serde_json::{json, Value};
use signal_proto::{PeerId, RelayMode};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay(mode: RelayMode) -> (SocketAddr, Relay) {
    let relay = Relay::new(mode);
    let state = AppState {
        relay: relay.clone(),
        metrics: None,
    };
    let router = build_router(state, None).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, relay)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("no frame within 2s")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn assert_silent(client: &mut Client) {
    if let Ok(Some(Ok(Message::Text(text)))) =
        timeout(Duration::from_millis(200), client.next()).await
    {
        panic!("unexpected frame: {text}");
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 1s");
}

#[test_timeout::tokio_timeout_test(10)]
async fn offer_and_answer_cross_the_relay() {
    let (addr, relay) = spawn_relay(RelayMode::Addressed).await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    send(&mut alice, json!({ "type": "register", "peerId": "alice" })).await;
    send(&mut bob, json!({ "type": "register", "peerId": "bob" })).await;
    wait_for(|| relay.registry().len() == 2).await;

    let offer = json!({ "type": "offer", "sdp": "v=0 alice" });
    send(
        &mut alice,
        json!({ "type": "offer", "to": "bob", "from": "alice", "offer": offer }),
    )
    .await;
    let received = recv(&mut bob).await;
    assert_eq!(received["type"], "offer");
    assert_eq!(received["from"], "alice");
    assert_eq!(received["offer"], offer);

    let answer = json!({ "type": "answer", "sdp": "v=0 bob" });
    send(
        &mut bob,
        json!({ "type": "answer", "to": "alice", "from": "bob", "answer": answer }),
    )
    .await;
    let received = recv(&mut alice).await;
    assert_eq!(received["type"], "answer");
    assert_eq!(received["from"], "bob");
    assert_eq!(received["answer"], answer);

    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn signals_to_a_departed_peer_are_dropped() {
    let (addr, relay) = spawn_relay(RelayMode::Addressed).await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    send(&mut alice, json!({ "type": "register", "peerId": "alice" })).await;
    send(&mut bob, json!({ "type": "register", "peerId": "bob" })).await;
    wait_for(|| relay.registry().len() == 2).await;

    bob.close(None).await.unwrap();
    wait_for(|| relay.registry().lookup(&PeerId::from("bob")).is_none()).await;

    send(
        &mut alice,
        json!({
            "type": "ice-candidate",
            "to": "bob",
            "from": "alice",
            "candidate": { "candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host" }
        }),
    )
    .await;
    assert_silent(&mut alice).await;

    // The sender's connection keeps working after the miss.
    let mut carol = connect(addr).await;
    send(&mut carol, json!({ "type": "register", "peerId": "carol" })).await;
    wait_for(|| relay.registry().lookup(&PeerId::from("carol")).is_some()).await;
    send(
        &mut alice,
        json!({ "type": "offer", "to": "carol", "from": "alice", "offer": { "sdp": "x" } }),
    )
    .await;
    assert_eq!(recv(&mut carol).await["from"], "alice");
}

#[test_timeout::tokio_timeout_test(10)]
async fn malformed_frames_do_not_kill_the_connection() {
    let (addr, relay) = spawn_relay(RelayMode::Addressed).await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    alice
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    send(&mut alice, json!({ "type": "offer", "offer": { "sdp": "x" } })).await;
    send(&mut alice, json!({ "type": "register", "peerId": "alice" })).await;
    send(&mut bob, json!({ "type": "register", "peerId": "bob" })).await;
    wait_for(|| relay.registry().len() == 2).await;

    send(
        &mut bob,
        json!({ "type": "answer", "to": "alice", "from": "bob", "answer": { "sdp": "y" } }),
    )
    .await;
    assert_eq!(recv(&mut alice).await["type"], "answer");
}

#[test_timeout::tokio_timeout_test(10)]
async fn broadcast_profile_announces_sharers_to_everyone_else() {
    let (addr, relay) = spawn_relay(RelayMode::Broadcast).await;
    let mut host = connect(addr).await;
    let mut viewer = connect(addr).await;
    wait_for(|| relay.stats().connections == 2).await;

    send(&mut host, json!({ "type": "start-sharing", "userId": "host-1" })).await;
    let announced = recv(&mut viewer).await;
    assert_eq!(announced, json!({ "type": "new-user", "userId": "host-1" }));
    assert_silent(&mut host).await;

    send(&mut viewer, json!({ "type": "answer", "answer": { "sdp": "v" } })).await;
    assert_eq!(recv(&mut host).await["type"], "answer");

    host.close(None).await.unwrap();
    let gone = recv(&mut viewer).await;
    assert_eq!(
        gone,
        json!({ "type": "user-disconnected", "userId": "host-1" })
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn liveness_route_answers_plain_text() {
    let (addr, _relay) = spawn_relay(RelayMode::Addressed).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(LIVENESS_BODY, "Server is running");
    assert!(response.ends_with("Server is running"));
}
