//! End-to-end scenarios: a UI link talking to a scripted background.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use frames::{Frame, RpcMessage, RpcResponse};
use futures::FutureExt;
use portlink::bootstrap::connect_to_account_manager;
use portlink::transport::ws::{self, WireCodec};
use portlink::transport::{self, memory};
use portlink::{DisconnectReason, LinkError, Multiplexer, RpcClient, TransportChannel, VirtualChannel};
use serde_json::{Value, json};
use tokio::sync::mpsc;

// =============================================================================
// SCRIPTED BACKGROUND
// =============================================================================

/// Background side of a link: every payload received on `name` is forwarded
/// to the returned receiver; the channel is returned for replies.
fn listen(mux: &Multiplexer, name: &str) -> (VirtualChannel, mpsc::UnboundedReceiver<Value>) {
    let channel = mux.create_channel(name).expect("create");
    let (tx, rx) = mpsc::unbounded_channel();
    channel.on_message(move |payload| {
        let _ = tx.send(payload);
    });
    (channel, rx)
}

/// Answer every controller request with `answer(method, params)`.
fn serve_controller(
    transport: TransportChannel,
    answer: fn(&str, &[Value]) -> Value,
) -> tokio::task::JoinHandle<Vec<Value>> {
    // The channel must exist before the first frame is routed.
    let mux = Multiplexer::new(transport);
    let (channel, mut inbound) = listen(&mux, "controller");
    tokio::spawn(async move {
        let _mux = mux;
        let mut seen = Vec::new();
        while let Some(payload) = inbound.recv().await {
            seen.push(payload.clone());
            if let Ok(RpcMessage::Request(request)) = frames::classify(&payload) {
                let result = answer(&request.method, &request.params);
                if channel.send(RpcResponse::ok(request.id, result).to_value()).is_err() {
                    break;
                }
            }
        }
        seen
    })
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn get_state_resolves_with_background_result() {
    let (ui, background) = memory::pair();
    let server = serve_controller(background, |method, _| match method {
        "getState" => json!({"ok": true}),
        _ => Value::Null,
    });

    let link = connect_to_account_manager(ui).expect("link");
    assert_eq!(link.mux().channel_names(), vec!["controller".to_owned(), "provider".to_owned()]);

    let state = link.background().rpc().invoke("getState", vec![]).await;
    assert_eq!(state, Ok(json!({"ok": true})));

    link.mux().close();
    let seen = server.await.expect("server");
    assert_eq!(seen, vec![json!({"id": "1", "method": "getState", "params": []})]);
}

#[tokio::test]
async fn pending_invoke_rejects_in_the_same_turn_as_disconnect() {
    let (ui, wire) = transport::channel("background");
    let mux = Multiplexer::new(ui);
    let _provider = mux.create_channel("provider").expect("provider");
    let rpc = RpcClient::new(mux.create_channel("controller").expect("controller"));

    let pending = rpc.invoke("getState", vec![]);
    wire.disconnect(DisconnectReason::TransportFailure("port died".into()));

    assert_eq!(pending.now_or_never(), Some(Err(LinkError::connection_lost("getState"))));
}

#[tokio::test]
async fn event_reaches_listener_and_is_not_a_reply() {
    let (ui, wire) = transport::channel("background");
    let mux = Multiplexer::new(ui);
    let rpc = RpcClient::new(mux.create_channel("controller").expect("controller"));
    let accounts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&accounts);
    rpc.on("accountsChanged", move |params| sink.lock().unwrap().extend(params.iter().cloned()));

    let mut pending = rpc.invoke("getState", vec![]);
    wire.deliver(Frame::new("controller", json!({"method": "accountsChanged", "params": [["0xabc"]]})));

    assert_eq!(*accounts.lock().unwrap(), vec![json!(["0xabc"])]);
    assert_eq!(rpc.pending_count(), 1);
    assert!((&mut pending).now_or_never().is_none());

    wire.deliver(Frame::new("controller", json!({"id": "1", "result": {"ok": true}})));
    assert_eq!(pending.await, Ok(json!({"ok": true})));
}

#[tokio::test]
async fn out_of_order_replies_resolve_the_right_calls() {
    let (ui, background) = memory::pair();
    let ui_mux = Multiplexer::new(ui);
    let rpc = RpcClient::new(ui_mux.create_channel("controller").expect("controller"));
    let bg_mux = Multiplexer::new(background);
    let (bg_channel, mut inbound) = listen(&bg_mux, "controller");

    let first = rpc.invoke("first", vec![]);
    let second = rpc.invoke("second", vec![]);
    let a = inbound.recv().await.expect("first request");
    let b = inbound.recv().await.expect("second request");

    bg_channel.send(json!({"id": b["id"], "result": "second"})).expect("reply");
    bg_channel.send(json!({"id": a["id"], "result": "first"})).expect("reply");

    assert_eq!(first.await, Ok(json!("first")));
    assert_eq!(second.await, Ok(json!("second")));
}

#[tokio::test]
async fn closing_twice_delivers_one_disconnect() {
    let (ui, background) = memory::pair();
    let ui_count = Arc::new(AtomicUsize::new(0));
    let bg_count = Arc::new(AtomicUsize::new(0));
    for (transport, count) in [(&ui, &ui_count), (&background, &bg_count)] {
        let count = Arc::clone(count);
        transport.on_disconnect(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    ui.close();
    ui.close();
    background.closed().await;
    ui.close();

    assert_eq!(ui_count.load(Ordering::SeqCst), 1);
    assert_eq!(bg_count.load(Ordering::SeqCst), 1);
    assert_eq!(ui.send(Frame::new("controller", json!(1))), Err(LinkError::ChannelClosed));
}

#[tokio::test]
async fn channels_never_observe_each_other() {
    let (ui, background) = memory::pair();
    let ui_mux = Multiplexer::new(ui);
    let ui_controller = ui_mux.create_channel("controller").expect("controller");
    let ui_provider = ui_mux.create_channel("provider").expect("provider");

    let bg_mux = Multiplexer::new(background);
    let (_bg_controller, mut controller_in) = listen(&bg_mux, "controller");
    let (_bg_provider, mut provider_in) = listen(&bg_mux, "provider");

    for n in 0..5 {
        ui_controller.send(json!({"controller": n})).expect("send");
        ui_provider.send(json!({"provider": n})).expect("send");
    }

    for n in 0..5 {
        assert_eq!(controller_in.recv().await, Some(json!({"controller": n})));
        assert_eq!(provider_in.recv().await, Some(json!({"provider": n})));
    }
    assert!(controller_in.try_recv().is_err());
    assert!(provider_in.try_recv().is_err());
}

// =============================================================================
// WEBSOCKET
// =============================================================================

async fn websocket_round_trip(codec: WireCodec) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let background = ws::accept(stream, "background", codec).await.expect("handshake");
        let mux = Multiplexer::new(background);
        let (channel, mut inbound) = listen(&mux, "controller");

        let request = inbound.recv().await.expect("request");
        channel
            .send(json!({"method": "accountsChanged", "params": [["0xabc"]]}))
            .expect("event");
        channel
            .send(json!({"id": request["id"], "result": {"ok": true, "codec": codec.to_string()}}))
            .expect("reply");

        // Leave the second call unanswered and hang up.
        inbound.recv().await.expect("second request");
        mux.close();
    });

    let ui = ws::connect(&format!("ws://{addr}"), "popup", codec).await.expect("connect");
    assert!(ui.peer().starts_with("popup:"));
    let link = connect_to_account_manager(ui).expect("link");
    let rpc = link.background().rpc();
    let mut events = rpc.subscribe();

    let state = rpc.invoke("getState", vec![]).await;
    assert_eq!(state, Ok(json!({"ok": true, "codec": codec.to_string()})));
    let event = events.recv().await.expect("event");
    assert_eq!(event.method, "accountsChanged");

    let lost = rpc.invoke("setLocked", vec![]).await;
    assert_eq!(lost, Err(LinkError::connection_lost("setLocked")));
    assert_eq!(link.mux().transport().disconnect_reason(), Some(DisconnectReason::PeerClosed));

    server.await.expect("server");
}

#[tokio::test]
async fn websocket_round_trip_json() {
    websocket_round_trip(WireCodec::Json).await;
}

#[tokio::test]
async fn websocket_round_trip_protobuf() {
    websocket_round_trip(WireCodec::Protobuf).await;
}
