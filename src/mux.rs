//! Multiplexer: named virtual channels over one transport channel.
//!
//! ARCHITECTURE
//! ============
//! Outbound, a virtual channel wraps its payload in `Frame {name, data}` and
//! hands it to the transport. Inbound, every transport frame is routed by
//! `name` to the live virtual channel with that name. Channel creation is not
//! coordinated with the peer, so a frame for a name that has no live channel is
//! dropped, not treated as an error.
//!
//! TEARDOWN
//! ========
//! When the transport disconnects, every live virtual channel receives a close
//! signal carrying the reason, so its consumer can fail outstanding work.
//!
//! ISOLATION
//! =========
//! Consumer callbacks run outside the routing table lock and behind
//! `catch_unwind`: a consumer that panics is logged and the routing loop keeps
//! serving every other channel. Each slot has at most one thread running its
//! handler, so a channel's payloads arrive in order even when the adapter
//! delivers from another worker while the handler is being attached.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use frames::Frame;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::LinkError;
use crate::lock;
use crate::transport::{DisconnectReason, TransportChannel};

type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce(&DisconnectReason) + Send>;

// =============================================================================
// MULTIPLEXER
// =============================================================================

/// Splits one transport into named virtual channels.
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

struct MuxShared {
    transport: TransportChannel,
    channels: Mutex<HashMap<String, Arc<Slot>>>,
}

impl Multiplexer {
    /// Take ownership of `transport` and start routing its inbound frames.
    #[must_use]
    pub fn new(transport: TransportChannel) -> Self {
        let shared = Arc::new(MuxShared { transport, channels: Mutex::new(HashMap::new()) });

        let routing = Arc::downgrade(&shared);
        shared.transport.on_receive(move |frame| {
            if let Some(shared) = routing.upgrade() {
                shared.route(frame);
            }
        });

        let teardown: Weak<MuxShared> = Arc::downgrade(&shared);
        shared.transport.on_disconnect(move |reason| {
            if let Some(shared) = teardown.upgrade() {
                shared.close_all(reason);
            }
        });

        Self { shared }
    }

    /// Create the virtual channel `name`.
    ///
    /// # Errors
    ///
    /// - [`LinkError::DuplicateChannelName`] if a live channel already uses `name`.
    /// - [`LinkError::ChannelClosed`] if the transport has already closed.
    pub fn create_channel(&self, name: impl Into<String>) -> Result<VirtualChannel, LinkError> {
        let name = name.into();
        let slot = {
            let mut channels = lock(&self.shared.channels);
            if self.shared.transport.is_closed() {
                return Err(LinkError::ChannelClosed);
            }
            if channels.contains_key(&name) {
                return Err(LinkError::DuplicateChannelName(name));
            }
            let slot = Arc::new(Slot::new(name.clone()));
            channels.insert(name.clone(), Arc::clone(&slot));
            slot
        };

        debug!(peer = %self.shared.transport.peer(), channel = %name, "mux: channel created");
        Ok(VirtualChannel { name, slot, mux: Arc::clone(&self.shared) })
    }

    /// Names of the live virtual channels, sorted.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.shared.channels).keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn transport(&self) -> &TransportChannel {
        &self.shared.transport
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.transport.is_closed()
    }

    /// Graceful teardown: closes the transport, which closes every channel.
    pub fn close(&self) {
        self.shared.transport.close();
    }
}

impl MuxShared {
    fn route(&self, frame: Frame) {
        let slot = lock(&self.channels).get(&frame.name).cloned();
        let Some(slot) = slot else {
            debug!(peer = %self.transport.peer(), channel = %frame.name, "mux: dropping frame for unknown channel");
            return;
        };
        slot.deliver(frame.data);
    }

    fn close_all(&self, reason: &DisconnectReason) {
        let slots: Vec<Arc<Slot>> = lock(&self.channels).drain().map(|(_, slot)| slot).collect();
        info!(peer = %self.transport.peer(), channels = slots.len(), %reason, "mux: closing channels");
        for slot in slots {
            slot.close(reason);
        }
    }

    fn unregister(&self, slot: &Arc<Slot>) {
        let mut channels = lock(&self.channels);
        if channels.get(&slot.name).is_some_and(|live| Arc::ptr_eq(live, slot)) {
            channels.remove(&slot.name);
            debug!(channel = %slot.name, "mux: channel destroyed");
        }
    }
}

// =============================================================================
// SLOT
// =============================================================================

/// Routing-table entry behind a virtual channel.
struct Slot {
    name: String,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    on_message: Option<MessageHandler>,
    on_close: Vec<CloseHandler>,
    /// Payloads not yet handed to the message handler, in arrival order.
    backlog: VecDeque<Value>,
    /// Set while one thread is draining `backlog`; other threads only append.
    draining: bool,
    closed: Option<DisconnectReason>,
}

impl Slot {
    fn new(name: String) -> Self {
        Self { name, state: Mutex::new(SlotState::default()) }
    }

    fn deliver(&self, data: Value) {
        {
            let mut state = lock(&self.state);
            if state.closed.is_some() {
                return;
            }
            state.backlog.push_back(data);
        }
        self.drain();
    }

    /// Hand queued payloads to the message handler one at a time. Only one
    /// thread drains a slot at once, so the handler never runs concurrently
    /// with itself and sees payloads in arrival order.
    fn drain(&self) {
        {
            let mut state = lock(&self.state);
            if state.draining || state.on_message.is_none() {
                return;
            }
            state.draining = true;
        }
        loop {
            let next = {
                let mut state = lock(&self.state);
                let next = match state.on_message.clone() {
                    Some(handler) => state.backlog.pop_front().map(|data| (handler, data)),
                    None => None,
                };
                if next.is_none() {
                    state.draining = false;
                }
                next
            };
            let Some((handler, data)) = next else {
                return;
            };
            self.invoke(&handler, data);
        }
    }

    fn invoke(&self, handler: &MessageHandler, data: Value) {
        if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
            error!(channel = %self.name, "mux: consumer panicked while handling frame");
        }
    }

    fn close(&self, reason: &DisconnectReason) {
        let callbacks = {
            let mut state = lock(&self.state);
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.clone());
            state.on_message = None;
            state.backlog.clear();
            std::mem::take(&mut state.on_close)
        };
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(reason))).is_err() {
                error!(channel = %self.name, "mux: consumer panicked while handling close");
            }
        }
    }
}

// =============================================================================
// VIRTUAL CHANNEL
// =============================================================================

/// A logical duplex sub-channel. Owned by exactly one consumer; dropping it
/// destroys the channel.
pub struct VirtualChannel {
    name: String,
    slot: Arc<Slot>,
    mux: Arc<MuxShared>,
}

impl VirtualChannel {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a payload to the same-named channel on the peer.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ChannelClosed`] once the channel or its transport
    /// has closed.
    pub fn send(&self, data: Value) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::ChannelClosed);
        }
        self.mux.transport.send(Frame::new(self.name.clone(), data))
    }

    /// Attach the inbound payload handler, replacing any previous one.
    ///
    /// Payloads that arrived before the first handler are replayed in order,
    /// ahead of anything that arrives while the replay runs.
    pub fn on_message(&self, handler: impl Fn(Value) + Send + Sync + 'static) {
        {
            let mut state = lock(&self.slot.state);
            if state.closed.is_some() {
                return;
            }
            state.on_message = Some(Arc::new(handler));
        }
        self.slot.drain();
    }

    /// Register a callback for when the channel closes. Runs immediately if
    /// the channel is already closed.
    pub fn on_close(&self, handler: impl FnOnce(&DisconnectReason) + Send + 'static) {
        let reason = {
            let mut state = lock(&self.slot.state);
            match &state.closed {
                Some(reason) => reason.clone(),
                None => {
                    state.on_close.push(Box::new(handler));
                    return;
                }
            }
        };
        handler(&reason);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.slot.state).closed.is_some()
    }

    /// Why the channel closed, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        lock(&self.slot.state).closed.clone()
    }
}

impl Drop for VirtualChannel {
    fn drop(&mut self) {
        self.mux.unregister(&self.slot);
        self.slot.close(&DisconnectReason::LocalClose);
    }
}

#[cfg(test)]
#[path = "mux_test.rs"]
mod tests;
