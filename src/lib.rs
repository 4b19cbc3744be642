//! portlink: multiplexed duplex link between a UI process and its background.
//!
//! ARCHITECTURE
//! ============
//! One ordered, framed transport channel carries every exchange with the
//! background. The [`mux::Multiplexer`] splits it into named virtual channels:
//! - `"controller"` carries correlated RPC calls and push events
//!   ([`rpc::RpcClient`], wrapped by [`background::BackgroundConnection`]).
//! - `"provider"` carries FIFO provider traffic ([`provider::ProviderProxy`],
//!   wrapped by [`chain::ChainQuery`]).
//!
//! [`bootstrap::Bootstrap`] wires these together with the host collaborators
//! (locale, tabs, platform, presenter, UI launcher) and returns a
//! [`bootstrap::Session`].

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod background;
pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod environment;
pub mod error;
pub mod mux;
pub mod provider;
pub mod rpc;
pub mod transport;

pub use background::BackgroundConnection;
pub use bootstrap::{Bootstrap, Session};
pub use error::{BootstrapError, ConfigError, ErrorCode, LinkError};
pub use mux::{Multiplexer, VirtualChannel};
pub use provider::ProviderProxy;
pub use rpc::RpcClient;
pub use transport::{DisconnectReason, TransportChannel};

/// Virtual channel carrying RPC traffic to the background controller.
pub const CONTROLLER_CHANNEL: &str = "controller";

/// Virtual channel carrying provider requests.
pub const PROVIDER_CHANNEL: &str = "provider";

/// Lock a mutex, recovering the guard if a consumer callback panicked while
/// it was held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
