//! Transport channel: the single ordered, framed duplex link to the peer.
//!
//! DESIGN
//! ======
//! `channel()` returns two ends of one link:
//! - `TransportChannel` is what the multiplexer talks to: `send`, `on_receive`,
//!   `on_disconnect`, `close`.
//! - `Wire` is what an adapter (in-memory pump, WebSocket) drives: it drains the
//!   outbound queue and feeds inbound frames and the disconnect signal.
//!
//! LIFECYCLE
//! =========
//! Open until the first disconnect (peer closed, local close, or transport
//! failure). Closure is terminal: the disconnect handlers run exactly once,
//! later sends fail with `ChannelClosed`, later inbound frames are dropped.
//! Handlers are always invoked outside the internal lock, so they may call back
//! into the link.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use frames::Frame;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, trace};

use crate::error::LinkError;
use crate::lock;

pub mod memory;
pub mod ws;

// =============================================================================
// TYPES
// =============================================================================

/// Why a link closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its end (process exit, explicit close).
    PeerClosed,
    /// This side tore the link down.
    LocalClose,
    /// The underlying transport failed.
    TransportFailure(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::LocalClose => f.write_str("closed locally"),
            Self::TransportFailure(msg) => write!(f, "transport failure: {msg}"),
        }
    }
}

type ReceiveHandler = Arc<dyn Fn(Frame) + Send + Sync>;
type DisconnectHandler = Box<dyn FnOnce(&DisconnectReason) + Send>;

struct Shared {
    peer: String,
    closed: AtomicBool,
    outbound: mpsc::UnboundedSender<Frame>,
    handlers: Mutex<Handlers>,
    notify: Notify,
}

#[derive(Default)]
struct Handlers {
    receive: Vec<ReceiveHandler>,
    disconnect: Vec<DisconnectHandler>,
    /// Inbound frames not yet handed to the receive handlers, in arrival order.
    backlog: VecDeque<Frame>,
    /// Set while one thread is draining `backlog`; other threads only append.
    dispatching: bool,
    reason: Option<DisconnectReason>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn deliver(&self, frame: Frame) {
        if self.is_closed() {
            debug!(peer = %self.peer, channel = %frame.name, "transport: dropping inbound frame after close");
            return;
        }

        lock(&self.handlers).backlog.push_back(frame);
        self.dispatch();
    }

    /// Run queued frames through the receive handlers. At most one thread
    /// dispatches at a time, so frames reach the handlers strictly in arrival
    /// order even when an adapter delivers while a handler is being attached.
    fn dispatch(&self) {
        {
            let mut handlers = lock(&self.handlers);
            if handlers.dispatching || handlers.receive.is_empty() {
                return;
            }
            handlers.dispatching = true;
        }
        loop {
            let next = {
                let mut handlers = lock(&self.handlers);
                let next = if handlers.receive.is_empty() {
                    None
                } else {
                    let receivers = handlers.receive.clone();
                    handlers.backlog.pop_front().map(|frame| (receivers, frame))
                };
                if next.is_none() {
                    handlers.dispatching = false;
                }
                next
            };
            let Some((receivers, frame)) = next else {
                return;
            };

            trace!(peer = %self.peer, channel = %frame.name, "transport: recv frame");
            for handler in receivers {
                let frame = frame.clone();
                if catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
                    error!(peer = %self.peer, "transport: receive handler panicked");
                }
            }
        }
    }

    /// Close the link. Returns `false` if it was already closed.
    fn shutdown(&self, reason: DisconnectReason) -> bool {
        let callbacks = {
            let mut handlers = lock(&self.handlers);
            if handlers.reason.is_some() {
                return false;
            }
            self.closed.store(true, Ordering::SeqCst);
            handlers.reason = Some(reason.clone());
            handlers.receive.clear();
            handlers.backlog.clear();
            std::mem::take(&mut handlers.disconnect)
        };

        info!(peer = %self.peer, %reason, "transport: disconnected");
        for callback in callbacks {
            callback(&reason);
        }
        self.notify.notify_waiters();
        true
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// CONSTRUCTOR
// =============================================================================

/// Create a link: the consumer end and the adapter end.
pub fn channel(peer: impl Into<String>) -> (TransportChannel, Wire) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        peer: peer.into(),
        closed: AtomicBool::new(false),
        outbound: outbound_tx,
        handlers: Mutex::new(Handlers::default()),
        notify: Notify::new(),
    });

    (TransportChannel { shared: Arc::clone(&shared) }, Wire { shared, outbound: outbound_rx })
}

// =============================================================================
// TRANSPORT CHANNEL
// =============================================================================

/// Consumer end of a link.
#[derive(Clone)]
pub struct TransportChannel {
    shared: Arc<Shared>,
}

impl TransportChannel {
    /// Opaque identity of the peer this link talks to.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Queue a frame for delivery to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ChannelClosed`] once the link has closed.
    pub fn send(&self, frame: Frame) -> Result<(), LinkError> {
        if self.shared.is_closed() {
            return Err(LinkError::ChannelClosed);
        }
        trace!(peer = %self.shared.peer, channel = %frame.name, "transport: send frame");
        if self.shared.outbound.send(frame).is_err() {
            self.shared.shutdown(DisconnectReason::TransportFailure("adapter gone".into()));
            return Err(LinkError::ChannelClosed);
        }
        Ok(())
    }

    /// Register a callback invoked once per inbound frame, in arrival order.
    ///
    /// The first handler registered also receives any frames that arrived
    /// before it, ahead of frames that arrive during that replay. Registering
    /// after closure is a no-op.
    pub fn on_receive(&self, handler: impl Fn(Frame) + Send + Sync + 'static) {
        {
            let mut handlers = lock(&self.shared.handlers);
            if handlers.reason.is_some() {
                return;
            }
            handlers.receive.push(Arc::new(handler));
        }
        self.shared.dispatch();
    }

    /// Register a callback invoked exactly once when the link closes.
    ///
    /// If the link is already closed the callback runs immediately.
    pub fn on_disconnect(&self, handler: impl FnOnce(&DisconnectReason) + Send + 'static) {
        let reason = {
            let mut handlers = lock(&self.shared.handlers);
            match &handlers.reason {
                Some(reason) => reason.clone(),
                None => {
                    handlers.disconnect.push(Box::new(handler));
                    return;
                }
            }
        };
        handler(&reason);
    }

    /// Tear the link down from this side. Idempotent.
    pub fn close(&self) {
        self.shared.shutdown(DisconnectReason::LocalClose);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the link closed, if it has.
    #[must_use]
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        lock(&self.shared.handlers).reason.clone()
    }

    /// Wait until the link closes.
    pub async fn closed(&self) {
        self.shared.wait_closed().await;
    }
}

// =============================================================================
// WIRE (ADAPTER END)
// =============================================================================

/// Adapter end of a link. Dropping it closes the link.
pub struct Wire {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Frame>,
}

impl Wire {
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Hand an inbound frame to the consumer end.
    pub fn deliver(&self, frame: Frame) {
        self.shared.deliver(frame);
    }

    /// Report the link as closed. Only the first call has any effect.
    pub fn disconnect(&self, reason: DisconnectReason) {
        self.shared.shutdown(reason);
    }

    /// Next frame queued by the consumer, waiting if none is queued.
    pub async fn next_outbound(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Next queued frame without waiting.
    pub fn try_next_outbound(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// A waitable handle that completes when the link closes.
    #[must_use]
    pub fn signal(&self) -> CloseSignal {
        CloseSignal { shared: Arc::clone(&self.shared) }
    }
}

impl Drop for Wire {
    fn drop(&mut self) {
        self.shared.shutdown(DisconnectReason::TransportFailure("adapter dropped".into()));
    }
}

/// Completes when the link it was taken from closes.
#[derive(Clone)]
pub struct CloseSignal {
    shared: Arc<Shared>,
}

impl CloseSignal {
    pub async fn wait(&self) {
        self.shared.wait_closed().await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
