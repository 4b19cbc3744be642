//! RPC client over a virtual channel.
//!
//! DESIGN
//! ======
//! Every call gets a fresh correlation id (decimal string of a per-client
//! counter starting at 1) and a pending entry holding a oneshot sender. The
//! request is sent synchronously inside [`RpcClient::invoke`]; only the caller
//! awaiting the returned [`ReplyFuture`] suspends.
//!
//! Inbound payloads are classified by shape:
//! - `{id, result | error}` resolves the pending call with that id. Replies may
//!   arrive in any order; a reply for an unknown id is dropped. An `error` that
//!   is not a well-formed fault object still rejects the call.
//! - `{method, params}` without `id` is a push event, fanned out to `on`
//!   listeners and `subscribe` receivers. A listener that panics is logged and
//!   the remaining listeners still run.
//! - `{id, method}` is a peer-initiated request. The UI side serves none, so
//!   it is logged and dropped.
//!
//! SETTLEMENT
//! ==========
//! Every call settles. When the channel closes, all pending calls reject with
//! `ConnectionLost` inside the close notification itself, before control
//! returns to the event loop. Calls issued after that reject immediately.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use frames::{RpcEvent, RpcMessage, RpcRequest, RpcResponse};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::error::LinkError;
use crate::lock;
use crate::mux::VirtualChannel;
use crate::transport::DisconnectReason;

pub(crate) type Reply = Result<Value, LinkError>;
type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Handle returned by [`RpcClient::on`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct CallTable {
    pending: HashMap<String, PendingCall>,
    closed: Option<DisconnectReason>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_event: HashMap<String, Vec<(ListenerId, EventHandler)>>,
    subscribers: Vec<mpsc::UnboundedSender<RpcEvent>>,
}

struct RpcShared {
    channel_name: String,
    next_id: AtomicU64,
    calls: Mutex<CallTable>,
    listeners: Mutex<Listeners>,
}

// =============================================================================
// CLIENT
// =============================================================================

/// Future-based RPC client bound to one virtual channel.
pub struct RpcClient {
    shared: Arc<RpcShared>,
    channel: VirtualChannel,
}

impl RpcClient {
    /// Bind a client to `channel`. The client becomes the channel's only
    /// consumer.
    #[must_use]
    pub fn new(channel: VirtualChannel) -> Self {
        let shared = Arc::new(RpcShared {
            channel_name: channel.name().to_owned(),
            next_id: AtomicU64::new(1),
            calls: Mutex::new(CallTable::default()),
            listeners: Mutex::new(Listeners::default()),
        });

        let inbound: Weak<RpcShared> = Arc::downgrade(&shared);
        channel.on_message(move |payload| {
            if let Some(shared) = inbound.upgrade() {
                shared.handle(&payload);
            }
        });

        let teardown = Arc::downgrade(&shared);
        channel.on_close(move |reason| {
            if let Some(shared) = teardown.upgrade() {
                shared.fail_all(reason);
            }
        });

        Self { shared, channel }
    }

    /// Call `method` on the peer.
    ///
    /// The request is on the wire by the time this returns. The future
    /// resolves to the result, [`LinkError::RemoteError`],
    /// [`LinkError::ChannelClosed`] if the send failed, or
    /// [`LinkError::ConnectionLost`] if the link ended first.
    pub fn invoke(&self, method: impl Into<String>, params: Vec<Value>) -> ReplyFuture {
        let method = method.into();
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut calls = lock(&self.shared.calls);
            if calls.closed.is_some() {
                debug!(channel = %self.shared.channel_name, %method, "rpc: call after close");
                return ReplyFuture::ready(method.clone(), Err(LinkError::connection_lost(method)));
            }
            calls.pending.insert(id.clone(), PendingCall { method: method.clone(), reply: tx });
        }

        let request = RpcRequest { id: id.clone(), method: method.clone(), params };
        trace!(channel = %self.shared.channel_name, %id, %method, "rpc: call");
        if let Err(error) = self.channel.send(request.to_value()) {
            // A close racing this send may already have settled the call.
            if lock(&self.shared.calls).pending.remove(&id).is_some() {
                return ReplyFuture::ready(method, Err(error));
            }
        }

        ReplyFuture::waiting(method, rx)
    }

    /// Call `method` and deserialize the result into `T`.
    ///
    /// # Errors
    ///
    /// Everything [`RpcClient::invoke`] settles with, plus
    /// [`LinkError::Decode`] if the result does not fit `T`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, LinkError> {
        let value = self.invoke(method, params).await?;
        serde_json::from_value(value).map_err(|error| LinkError::Decode(format!("{method}: {error}")))
    }

    /// Listen for push events named `event`. Handlers run in arrival order on
    /// the link's dispatch path.
    pub fn on(&self, event: impl Into<String>, handler: impl Fn(&[Value]) + Send + Sync + 'static) -> ListenerId {
        let mut listeners = lock(&self.shared.listeners);
        listeners.next_id += 1;
        let id = ListenerId(listeners.next_id);
        listeners.by_event.entry(event.into()).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Remove a listener added with [`RpcClient::on`]. Returns whether it was
    /// registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let mut removed = false;
        for handlers in listeners.by_event.values_mut() {
            let before = handlers.len();
            handlers.retain(|(listener, _)| *listener != id);
            removed |= handlers.len() != before;
        }
        listeners.by_event.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    /// Receive every push event. The stream ends when the link closes.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RpcEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            lock(&self.shared.listeners).subscribers.push(tx);
        }
        rx
    }

    /// Calls still waiting for a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.calls).pending.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.calls).closed.is_some()
    }

    #[must_use]
    pub fn channel_name(&self) -> &str {
        &self.shared.channel_name
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shared.fail_all(&DisconnectReason::LocalClose);
    }
}

// =============================================================================
// INBOUND
// =============================================================================

impl RpcShared {
    fn handle(&self, payload: &Value) {
        match frames::classify(payload) {
            Ok(RpcMessage::Response(response)) => self.resolve(response),
            Ok(RpcMessage::Event(event)) => self.dispatch(event),
            Ok(RpcMessage::Request(request)) => {
                warn!(
                    channel = %self.channel_name,
                    id = %request.id,
                    method = %request.method,
                    "rpc: ignoring inbound request"
                );
            }
            Err(error) => {
                warn!(channel = %self.channel_name, %error, "rpc: dropping malformed payload");
            }
        }
    }

    fn resolve(&self, response: RpcResponse) {
        let Some(call) = lock(&self.calls).pending.remove(&response.id) else {
            debug!(channel = %self.channel_name, id = %response.id, "rpc: dropping reply for unknown id");
            return;
        };
        trace!(channel = %self.channel_name, id = %response.id, method = %call.method, "rpc: reply");
        if call.reply.send(response.outcome.map_err(LinkError::from_fault)).is_err() {
            trace!(channel = %self.channel_name, method = %call.method, "rpc: caller stopped waiting");
        }
    }

    fn dispatch(&self, event: RpcEvent) {
        let handlers: Vec<EventHandler> = {
            let mut listeners = lock(&self.listeners);
            listeners.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
            listeners
                .by_event
                .get(&event.method)
                .map(|handlers| handlers.iter().map(|(_, handler)| Arc::clone(handler)).collect())
                .unwrap_or_default()
        };

        trace!(channel = %self.channel_name, event = %event.method, listeners = handlers.len(), "rpc: event");
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event.params))).is_err() {
                error!(channel = %self.channel_name, event = %event.method, "rpc: event listener panicked");
            }
        }
    }

    fn fail_all(&self, reason: &DisconnectReason) {
        let drained: Vec<PendingCall> = {
            let mut calls = lock(&self.calls);
            if calls.closed.is_some() {
                return;
            }
            calls.closed = Some(reason.clone());
            calls.pending.drain().map(|(_, call)| call).collect()
        };
        lock(&self.listeners).subscribers.clear();

        if !drained.is_empty() {
            debug!(channel = %self.channel_name, calls = drained.len(), %reason, "rpc: failing pending calls");
        }
        for call in drained {
            let error = LinkError::connection_lost(call.method.as_str());
            if call.reply.send(Err(error)).is_err() {
                trace!(channel = %self.channel_name, method = %call.method, "rpc: caller stopped waiting");
            }
        }
    }
}

// =============================================================================
// REPLY FUTURE
// =============================================================================

/// Resolves once the reply to one call arrives or the call is abandoned.
#[must_use = "a reply future does nothing unless awaited"]
pub struct ReplyFuture {
    method: String,
    state: ReplyState,
}

enum ReplyState {
    Waiting(oneshot::Receiver<Reply>),
    Ready(Option<Reply>),
}

impl ReplyFuture {
    pub(crate) fn waiting(method: String, rx: oneshot::Receiver<Reply>) -> Self {
        Self { method, state: ReplyState::Waiting(rx) }
    }

    pub(crate) fn ready(method: String, reply: Reply) -> Self {
        Self { method, state: ReplyState::Ready(Some(reply)) }
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Future for ReplyFuture {
    type Output = Reply;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            ReplyState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(reply)) => Poll::Ready(reply),
                Poll::Ready(Err(_)) => Poll::Ready(Err(LinkError::connection_lost(this.method.as_str()))),
                Poll::Pending => Poll::Pending,
            },
            ReplyState::Ready(reply) => {
                Poll::Ready(reply.take().unwrap_or_else(|| Err(LinkError::connection_lost(this.method.as_str()))))
            }
        }
    }
}

#[cfg(test)]
#[path = "rpc_test.rs"]
mod tests;
