//! End-to-end: a real relay on 127.0.0.1 with terminals over WebSocket.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{stream, SinkExt, StreamExt};
use serde_json::json;
use termnet_core::info::{METHOD_LIST_TERMINALS, METHOD_TERMINATE};
use termnet_core::protocol::HOST_ID_HEADER;
use termnet_core::{
    ConnectParams, Keypair, Response, Schema, TerminalInfo, HOST_TERMINAL_ID, PROTOCOL_VERSION,
};
use termnet_host::{HostConfig, Relay, RelayHandle};
use termnet_terminal::transport::{self, HostSocket};
use termnet_terminal::{
    response_data, streaming, unary, Output, Reply, ServiceOptions, Terminal, TerminalConfig,
    TerminalOptions, TransportError,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn start_host(handshake_timeout_ms: u64) -> (SocketAddr, RelayHandle) {
    let config = HostConfig {
        bind: "127.0.0.1".into(),
        port: 0,
        handshake_timeout_ms,
        directory_refresh_ms: 50,
        ..Default::default()
    };
    let relay = Relay::bind(config).await.unwrap();
    let addr = relay.local_addr().unwrap();
    let handle = relay.handle();
    tokio::spawn(relay.run());
    (addr, handle)
}

fn terminal(addr: SocketAddr, keypair: &Keypair, id: &str) -> Terminal {
    let config = TerminalConfig::new(addr.to_string(), id, keypair.clone());
    let options = TerminalOptions {
        directory_refresh: Duration::from_millis(100),
        retry_delay: Duration::from_millis(100),
        ..Default::default()
    };
    Terminal::connect(config, options)
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let wait = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn advertises(t: &Terminal, of: &str, method: &str) -> bool {
    t.directory()
        .get(of)
        .is_some_and(|info| info.services_for(method).next().is_some())
}

/// Next data message, `None` once the socket is closed.
async fn next_data(s: &mut HostSocket) -> Option<Vec<u8>> {
    while let Some(msg) = s.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(msg) => {
                if let Some(bytes) = transport::from_message(msg) {
                    return Some(bytes);
                }
            }
        }
    }
    None
}

fn refused_with(result: Result<impl std::fmt::Debug, tungstenite::Error>) -> u16 {
    match result {
        Err(tungstenite::Error::Http(res)) => res.status().as_u16(),
        other => panic!("expected an http refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn url_parameters_alone_admit_a_terminal() {
    let (addr, host) = start_host(5_000).await;
    let kp = Keypair::generate();
    let url = format!(
        "ws://{addr}/?public_key={}&terminal_id=A&signature={}",
        kp.public_key(),
        kp.sign_challenge()
    );
    let (_socket, res) = tokio_tungstenite::connect_async(url).await.unwrap();
    assert_eq!(res.status().as_u16(), 101);
    assert_eq!(res.headers()[HOST_ID_HEADER], "termnet-host");
    eventually("A registered", || host.live_terminals(kp.public_key()) == ["A"]).await;
}

#[tokio::test]
async fn bad_credentials_are_refused_before_the_upgrade() {
    let (addr, host) = start_host(5_000).await;
    let kp = Keypair::generate();
    let other = Keypair::generate();

    let mut forged = ConnectParams::sign(&kp, "A");
    forged.public_key = *other.public_key();
    let url = format!("ws://{addr}/?{}", forged.to_query());
    assert_eq!(refused_with(tokio_tungstenite::connect_async(url).await), 401);

    let url = format!("ws://{addr}/?terminal_id=A");
    assert_eq!(refused_with(tokio_tungstenite::connect_async(url).await), 401);
    let url = format!("ws://{addr}/");
    assert_eq!(refused_with(tokio_tungstenite::connect_async(url).await), 401);

    let mut future = ConnectParams::sign(&kp, "A");
    future.protocol_version = Some(PROTOCOL_VERSION + 1);
    let url = format!("ws://{addr}/?{}", future.to_query());
    assert_eq!(refused_with(tokio_tungstenite::connect_async(url).await), 426);

    match transport::connect(&addr.to_string(), &kp, HOST_TERMINAL_ID).await {
        Err(TransportError::Rejected { code, reason }) => {
            assert_eq!(code, 401);
            assert!(!reason.is_empty());
        }
        other => panic!("expected rejection, got {:?}", other.map(|(_, id)| id)),
    }
    assert!(host.live_terminals(kp.public_key()).is_empty());
}

#[tokio::test]
async fn silent_connection_is_dropped_after_handshake_timeout() {
    let (addr, _host) = start_host(100).await;
    let mut s = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 64];
    let closed = timeout(Duration::from_secs(2), s.read(&mut buf)).await.unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));
}

#[tokio::test]
async fn raw_envelopes_reach_only_their_target_unchanged() {
    let (addr, _host) = start_host(5_000).await;
    let kp = Keypair::generate();
    let other = Keypair::generate();
    let target = addr.to_string();
    let (mut a, host_id) = transport::connect(&target, &kp, "A").await.unwrap();
    assert_eq!(host_id, "termnet-host");
    let (mut b, _) = transport::connect(&target, &kp, "B").await.unwrap();
    let (mut c, _) = transport::connect(&target, &kp, "C").await.unwrap();
    let (mut foreign_b, _) = transport::connect(&target, &other, "B").await.unwrap();

    let raw = r#"{ "trace_id":"t1",  "source_terminal_id":"A","target_terminal_id":"B","method":"Echo","req":{"x" : 5},"extra":[1,2]}"#;
    a.send(Message::Text(raw.to_string())).await.unwrap();

    let got = timeout(Duration::from_secs(2), next_data(&mut b))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, raw.as_bytes());
    assert!(timeout(Duration::from_millis(200), next_data(&mut c)).await.is_err());
    assert!(timeout(Duration::from_millis(200), next_data(&mut foreign_b)).await.is_err());
}

#[tokio::test]
async fn second_connection_under_same_id_closes_the_first() {
    let (addr, host) = start_host(5_000).await;
    let kp = Keypair::generate();
    let target = addr.to_string();
    let (mut first, _) = transport::connect(&target, &kp, "dup").await.unwrap();
    let (_second, _) = transport::connect(&target, &kp, "dup").await.unwrap();

    let closed = timeout(Duration::from_secs(2), next_data(&mut first)).await.unwrap();
    assert!(closed.is_none());
    assert_eq!(host.live_terminals(kp.public_key()), vec!["dup".to_string()]);
}

#[tokio::test]
async fn echo_between_terminals_and_bootstrap_services() {
    let (addr, _host) = start_host(5_000).await;
    let kp = Keypair::generate();
    let a = terminal(addr, &kp, "A");
    let b = terminal(addr, &kp, "B");
    a.provide_service(
        "Echo",
        Schema::Any,
        unary(|req, _abort| async move { Ok(Response::ok(req.req)) }),
        ServiceOptions::default(),
    )
    .unwrap();

    eventually("Echo in B's directory", || advertises(&b, "A", "Echo")).await;
    eventually("B's own info listed", || b.directory().get("B").is_some()).await;
    let res = b.request_for_response("Echo", json!({"x": 5})).await.unwrap();
    assert_eq!(
        serde_json::to_value(&res).unwrap(),
        json!({"code": 0, "message": "OK", "data": {"x": 5}})
    );

    let listed: Vec<TerminalInfo> =
        response_data(b.call(METHOD_LIST_TERMINALS, HOST_TERMINAL_ID, json!({})).await.unwrap())
            .unwrap();
    let mut ids: Vec<_> = listed.iter().map(|i| i.terminal_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["@host", "A", "B"]);

    let res = b
        .call(METHOD_TERMINATE, HOST_TERMINAL_ID, json!({"terminal_id": "A"}))
        .await
        .unwrap();
    assert_eq!((res.code, res.message.as_str()), (403, "Forbidden"));
}

#[tokio::test]
async fn streamed_frames_arrive_in_order_before_the_response() {
    let (addr, _host) = start_host(5_000).await;
    let kp = Keypair::generate();
    let a = terminal(addr, &kp, "A");
    let b = terminal(addr, &kp, "B");
    a.provide_service(
        "Count",
        Schema::Any,
        streaming(|_req, _abort| {
            stream::iter(1..=3)
                .map(|i| Ok(Output::Frame(json!(i))))
                .chain(stream::once(async { Ok(Output::Response(Response::ok(json!("done")))) }))
        }),
        ServiceOptions::default(),
    )
    .unwrap();
    b.connected().await;
    eventually("A connected", || a.is_connected()).await;

    let replies: Vec<Reply> = b
        .request("Count", "A", json!({}))
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(
        replies,
        vec![
            Reply::Frame(json!(1)),
            Reply::Frame(json!(2)),
            Reply::Frame(json!(3)),
            Reply::Response(Response::ok(json!("done"))),
        ]
    );
}

#[tokio::test]
async fn dropping_a_call_aborts_the_remote_handler() {
    let (addr, _host) = start_host(5_000).await;
    let kp = Keypair::generate();
    let a = terminal(addr, &kp, "A");
    let b = terminal(addr, &kp, "B");
    let seen: Arc<Mutex<Option<CancellationToken>>> = Arc::default();
    let slot = seen.clone();
    a.provide_service(
        "Ticks",
        Schema::Any,
        streaming(move |_req, abort| {
            *slot.lock().unwrap() = Some(abort);
            stream::iter([Ok(Output::Frame(json!("tick")))]).chain(stream::pending())
        }),
        ServiceOptions::default(),
    )
    .unwrap();
    b.connected().await;
    eventually("A connected", || a.is_connected()).await;

    let mut call = b.request("Ticks", "A", json!({}));
    assert_eq!(call.next().await.unwrap().unwrap(), Reply::Frame(json!("tick")));
    drop(call);

    eventually("handler abort", || {
        seen.lock()
            .unwrap()
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    })
    .await;
}

#[tokio::test]
async fn shutdown_closes_live_sockets() {
    let (addr, host) = start_host(5_000).await;
    let kp = Keypair::generate();
    let (mut s, _) = transport::connect(&addr.to_string(), &kp, "A").await.unwrap();
    host.shutdown();
    let closed = timeout(Duration::from_secs(2), next_data(&mut s)).await.unwrap();
    assert!(closed.is_none());
    assert!(host.live_terminals(kp.public_key()).is_empty());
}
