//! In-process transport pair.
//!
//! Two links joined by a pump task: whatever one side sends is delivered to the
//! other, in order. When either side closes, its queued frames are flushed to
//! the other side and then the other side sees `PeerClosed`.

use tracing::debug;

use super::{DisconnectReason, TransportChannel, Wire, channel};

/// Create two connected links. Must be called from inside a Tokio runtime.
#[must_use]
pub fn pair() -> (TransportChannel, TransportChannel) {
    pair_named("ui", "background")
}

/// Like [`pair`], with explicit peer identities.
#[must_use]
pub fn pair_named(left: &str, right: &str) -> (TransportChannel, TransportChannel) {
    // Each consumer's peer identity names the other side.
    let (left_transport, left_wire) = channel(right);
    let (right_transport, right_wire) = channel(left);
    tokio::spawn(pump(left_wire, right_wire));
    (left_transport, right_transport)
}

async fn pump(mut left: Wire, mut right: Wire) {
    let left_closed = left.signal();
    let right_closed = right.signal();

    loop {
        tokio::select! {
            biased;
            Some(frame) = left.next_outbound() => right.deliver(frame),
            Some(frame) = right.next_outbound() => left.deliver(frame),
            () = left_closed.wait() => {
                flush(&mut left, &right);
                right.disconnect(DisconnectReason::PeerClosed);
                break;
            }
            () = right_closed.wait() => {
                flush(&mut right, &left);
                left.disconnect(DisconnectReason::PeerClosed);
                break;
            }
        }
    }
    debug!(left = %left.peer(), right = %right.peer(), "memory: pump finished");
}

fn flush(from: &mut Wire, to: &Wire) {
    while let Some(frame) = from.try_next_outbound() {
        to.deliver(frame);
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
