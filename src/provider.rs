//! Provider proxy: request/response provider over a virtual channel.
//!
//! DESIGN
//! ======
//! Payloads go out verbatim and replies come back in the order the requests
//! were sent, so a reply is matched to the oldest waiting request. There is no
//! correlation layer of its own; any ids inside the payloads belong to the
//! caller.
//!
//! Inbound payloads with a `method` and no `id` are notifications and never
//! consume a waiting request. A reply with nobody waiting, a failed send and an
//! unexpected close are reported to the error listeners. Waiting requests
//! reject with `ConnectionLost` when the channel closes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::LinkError;
use crate::lock;
use crate::mux::VirtualChannel;
use crate::rpc::{Reply, ReplyFuture};
use crate::transport::DisconnectReason;

/// Resolves to the reply payload for one provider request.
pub type ProviderReply = ReplyFuture;

type NotificationHandler = Arc<dyn Fn(&Value) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&LinkError) + Send + Sync>;

struct Waiting {
    seq: u64,
    method: String,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Queue {
    waiting: VecDeque<Waiting>,
    closed: Option<DisconnectReason>,
}

#[derive(Default)]
struct ProviderListeners {
    notification: Vec<NotificationHandler>,
    error: Vec<ErrorHandler>,
}

struct ProviderShared {
    channel_name: String,
    next_seq: AtomicU64,
    queue: Mutex<Queue>,
    listeners: Mutex<ProviderListeners>,
}

/// FIFO provider bound to one virtual channel.
pub struct ProviderProxy {
    shared: Arc<ProviderShared>,
    channel: VirtualChannel,
}

impl ProviderProxy {
    #[must_use]
    pub fn new(channel: VirtualChannel) -> Self {
        let shared = Arc::new(ProviderShared {
            channel_name: channel.name().to_owned(),
            next_seq: AtomicU64::new(0),
            queue: Mutex::new(Queue::default()),
            listeners: Mutex::new(ProviderListeners::default()),
        });

        let inbound = Arc::downgrade(&shared);
        channel.on_message(move |payload| {
            if let Some(shared) = inbound.upgrade() {
                shared.handle(payload);
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

    /// Forward `payload` to the provider. The returned future resolves to the
    /// next reply that is not claimed by an earlier request.
    pub fn request(&self, payload: Value) -> ProviderReply {
        let method = payload.get("method").and_then(Value::as_str).unwrap_or("provider request").to_owned();
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        {
            let mut queue = lock(&self.shared.queue);
            if queue.closed.is_some() {
                return ReplyFuture::ready(method.clone(), Err(LinkError::connection_lost(method)));
            }
            queue.waiting.push_back(Waiting { seq, method: method.clone(), reply: tx });
        }

        trace!(channel = %self.shared.channel_name, %method, "provider: request");
        if let Err(error) = self.channel.send(payload) {
            let removed = {
                let mut queue = lock(&self.shared.queue);
                let position = queue.waiting.iter().position(|waiting| waiting.seq == seq);
                position.and_then(|index| queue.waiting.remove(index))
            };
            self.shared.report(&error);
            if removed.is_some() {
                return ReplyFuture::ready(method, Err(error));
            }
        }

        ReplyFuture::waiting(method, rx)
    }

    /// Listen for provider notifications (payloads with `method` and no `id`).
    pub fn on_notification(&self, handler: impl Fn(&Value) + Send + Sync + 'static) {
        lock(&self.shared.listeners).notification.push(Arc::new(handler));
    }

    /// Listen for channel errors and unmatched replies.
    pub fn on_error(&self, handler: impl Fn(&LinkError) + Send + Sync + 'static) {
        lock(&self.shared.listeners).error.push(Arc::new(handler));
    }

    /// Requests still waiting for a reply.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        lock(&self.shared.queue).waiting.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.queue).closed.is_some()
    }
}

impl Drop for ProviderProxy {
    fn drop(&mut self) {
        self.shared.fail_all(&DisconnectReason::LocalClose);
    }
}

impl ProviderShared {
    fn handle(&self, payload: Value) {
        if is_notification(&payload) {
            let handlers = lock(&self.listeners).notification.clone();
            trace!(channel = %self.channel_name, listeners = handlers.len(), "provider: notification");
            for handler in handlers {
                handler(&payload);
            }
            return;
        }

        let Some(waiting) = lock(&self.queue).waiting.pop_front() else {
            warn!(channel = %self.channel_name, "provider: reply with no waiting request");
            self.report(&LinkError::Decode(format!("unsolicited provider reply: {payload}")));
            return;
        };
        if waiting.reply.send(Ok(payload)).is_err() {
            trace!(channel = %self.channel_name, method = %waiting.method, "provider: caller stopped waiting");
        }
    }

    fn report(&self, error: &LinkError) {
        let handlers = lock(&self.listeners).error.clone();
        for handler in handlers {
            handler(error);
        }
    }

    fn fail_all(&self, reason: &DisconnectReason) {
        let drained: Vec<Waiting> = {
            let mut queue = lock(&self.queue);
            if queue.closed.is_some() {
                return;
            }
            queue.closed = Some(reason.clone());
            queue.waiting.drain(..).collect()
        };

        debug!(channel = %self.channel_name, waiting = drained.len(), %reason, "provider: channel closed");
        for waiting in drained {
            if waiting.reply.send(Err(LinkError::connection_lost(waiting.method.as_str()))).is_err() {
                trace!(channel = %self.channel_name, method = %waiting.method, "provider: caller stopped waiting");
            }
        }
        if *reason != DisconnectReason::LocalClose {
            self.report(&LinkError::ChannelClosed);
        }
    }
}

fn is_notification(payload: &Value) -> bool {
    payload.get("method").is_some_and(Value::is_string) && payload.get("id").is_none_or(Value::is_null)
}

#[cfg(test)]
#[path = "provider_test.rs"]
mod tests;
