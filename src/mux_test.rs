use super::*;
use crate::transport::{Wire, channel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn setup() -> (Multiplexer, Wire) {
    let (transport, wire) = channel("background");
    (Multiplexer::new(transport), wire)
}

fn collect(channel: &VirtualChannel) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    channel.on_message(move |data| sink.lock().unwrap().push(data));
    seen
}

#[test]
fn send_tags_frames_with_channel_name() {
    let (mux, mut wire) = setup();
    let controller = mux.create_channel("controller").expect("create");

    controller.send(serde_json::json!({"hello": 1})).expect("send");

    assert_eq!(
        wire.try_next_outbound(),
        Some(Frame::new("controller", serde_json::json!({"hello": 1})))
    );
}

#[test]
fn duplicate_channel_name_is_rejected() {
    let (mux, _wire) = setup();
    let _controller = mux.create_channel("controller").expect("create");

    let err = mux.create_channel("controller").err();
    assert_eq!(err, Some(LinkError::DuplicateChannelName("controller".into())));
}

#[test]
fn channels_only_receive_their_own_frames() {
    let (mux, wire) = setup();
    let controller = mux.create_channel("controller").expect("create");
    let provider = mux.create_channel("provider").expect("create");
    let controller_seen = collect(&controller);
    let provider_seen = collect(&provider);

    wire.deliver(Frame::new("controller", serde_json::json!(1)));
    wire.deliver(Frame::new("provider", serde_json::json!(2)));
    wire.deliver(Frame::new("controller", serde_json::json!(3)));

    assert_eq!(*controller_seen.lock().unwrap(), vec![serde_json::json!(1), serde_json::json!(3)]);
    assert_eq!(*provider_seen.lock().unwrap(), vec![serde_json::json!(2)]);
}

#[test]
fn frames_for_unknown_channels_are_dropped() {
    let (mux, wire) = setup();
    let controller = mux.create_channel("controller").expect("create");
    let seen = collect(&controller);

    wire.deliver(Frame::new("nobody", serde_json::json!("lost")));
    wire.deliver(Frame::new("controller", serde_json::json!("kept")));

    assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!("kept")]);
    assert!(!mux.is_closed());
}

#[test]
fn payloads_before_handler_are_replayed_in_order() {
    let (mux, wire) = setup();
    let controller = mux.create_channel("controller").expect("create");

    wire.deliver(Frame::new("controller", serde_json::json!(1)));
    wire.deliver(Frame::new("controller", serde_json::json!(2)));
    let seen = collect(&controller);
    wire.deliver(Frame::new("controller", serde_json::json!(3)));

    assert_eq!(
        *seen.lock().unwrap(),
        vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)]
    );
}

#[test]
fn replay_stays_ordered_while_frames_keep_arriving() {
    const FRAMES: i64 = 2000;

    for _ in 0..20 {
        let (mux, wire) = setup();
        let controller = mux.create_channel("controller").expect("create");
        let feeder = std::thread::spawn(move || {
            for n in 0..FRAMES {
                wire.deliver(Frame::new("controller", serde_json::json!(n)));
            }
            wire
        });
        std::thread::sleep(Duration::from_micros(50));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (sink, in_handler, overlap) = (Arc::clone(&seen), Arc::clone(&busy), Arc::clone(&overlapped));
        controller.on_message(move |data| {
            if in_handler.swap(true, Ordering::SeqCst) {
                overlap.store(true, Ordering::SeqCst);
            }
            for _ in 0..200 {
                std::hint::spin_loop();
            }
            sink.lock().unwrap().push(data);
            in_handler.store(false, Ordering::SeqCst);
        });
        let _wire = feeder.join().expect("feeder");

        let expected: Vec<Value> = (0..FRAMES).map(|n| serde_json::json!(n)).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        assert!(!overlapped.load(Ordering::SeqCst), "handler ran concurrently with itself");
    }
}

#[test]
fn disconnect_closes_every_live_channel() {
    let (mux, wire) = setup();
    let controller = mux.create_channel("controller").expect("create");
    let provider = mux.create_channel("provider").expect("create");

    let reasons = Arc::new(Mutex::new(Vec::new()));
    for channel in [&controller, &provider] {
        let sink = Arc::clone(&reasons);
        let name = channel.name().to_owned();
        channel.on_close(move |reason| sink.lock().unwrap().push((name, reason.clone())));
    }

    wire.disconnect(DisconnectReason::PeerClosed);

    let mut reasons = reasons.lock().unwrap().clone();
    reasons.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        reasons,
        vec![
            ("controller".to_owned(), DisconnectReason::PeerClosed),
            ("provider".to_owned(), DisconnectReason::PeerClosed),
        ]
    );
    assert!(controller.is_closed());
    assert_eq!(controller.send(serde_json::json!(1)), Err(LinkError::ChannelClosed));
    assert!(mux.channel_names().is_empty());
}

#[test]
fn on_close_after_disconnect_runs_immediately() {
    let (mux, wire) = setup();
    let controller = mux.create_channel("controller").expect("create");
    wire.disconnect(DisconnectReason::TransportFailure("reset".into()));

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    controller.on_close(move |reason| *sink.lock().unwrap() = Some(reason.clone()));

    assert_eq!(*seen.lock().unwrap(), Some(DisconnectReason::TransportFailure("reset".into())));
    assert_eq!(controller.close_reason(), Some(DisconnectReason::TransportFailure("reset".into())));
}

#[test]
fn create_channel_after_disconnect_fails() {
    let (mux, wire) = setup();
    wire.disconnect(DisconnectReason::PeerClosed);
    assert_eq!(mux.create_channel("controller").err(), Some(LinkError::ChannelClosed));
}

#[test]
fn dropped_channel_stops_receiving_and_frees_its_name() {
    let (mux, wire) = setup();
    let controller = mux.create_channel("controller").expect("create");
    drop(controller);
    assert!(mux.channel_names().is_empty());

    wire.deliver(Frame::new("controller", serde_json::json!("late")));

    let again = mux.create_channel("controller").expect("name is free again");
    let seen = collect(&again);
    wire.deliver(Frame::new("controller", serde_json::json!("fresh")));
    assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!("fresh")]);
}

#[test]
fn panicking_consumer_does_not_break_routing() {
    let (mux, wire) = setup();
    let faulty = mux.create_channel("faulty").expect("create");
    let healthy = mux.create_channel("healthy").expect("create");
    faulty.on_message(|_| panic!("consumer bug"));
    let seen = collect(&healthy);

    wire.deliver(Frame::new("faulty", serde_json::json!(1)));
    wire.deliver(Frame::new("healthy", serde_json::json!(2)));
    wire.deliver(Frame::new("faulty", serde_json::json!(3)));
    wire.deliver(Frame::new("healthy", serde_json::json!(4)));

    assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!(2), serde_json::json!(4)]);
    assert!(!faulty.is_closed());
}

#[test]
fn close_tears_down_transport_and_channels() {
    let (mux, wire) = setup();
    let controller = mux.create_channel("controller").expect("create");

    mux.close();
    mux.close();

    assert!(wire.is_closed());
    assert_eq!(controller.close_reason(), Some(DisconnectReason::LocalClose));
}

#[test]
fn channel_names_are_sorted() {
    let (mux, _wire) = setup();
    let _p = mux.create_channel("provider").expect("create");
    let _c = mux.create_channel("controller").expect("create");
    assert_eq!(mux.channel_names(), vec!["controller".to_owned(), "provider".to_owned()]);
    assert_eq!(mux.transport().peer(), "background");
}
