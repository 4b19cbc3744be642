//! Typed view of the background controller's remote interface.

use serde_json::Value;

use crate::error::LinkError;
use crate::rpc::{ListenerId, RpcClient};

/// Push event the background emits whenever its state changes.
pub const UPDATE_EVENT: &str = "sendUpdate";

/// Controller connection handed to the UI.
pub struct BackgroundConnection {
    rpc: RpcClient,
}

impl BackgroundConnection {
    #[must_use]
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    /// Full state snapshot from the background.
    ///
    /// # Errors
    ///
    /// Any [`LinkError`] the call settles with.
    pub async fn get_state(&self) -> Result<Value, LinkError> {
        self.rpc.invoke("getState", vec![]).await
    }

    /// # Errors
    ///
    /// Any [`LinkError`] the call settles with.
    pub async fn set_current_locale(&self, locale: &str) -> Result<Value, LinkError> {
        self.rpc.invoke("setCurrentLocale", vec![Value::from(locale)]).await
    }

    /// # Errors
    ///
    /// Any [`LinkError`] the call settles with.
    pub async fn set_locked(&self) -> Result<(), LinkError> {
        self.rpc.invoke("setLocked", vec![]).await.map(drop)
    }

    /// # Errors
    ///
    /// [`LinkError::RemoteError`] when the background rejects the password.
    pub async fn submit_password(&self, password: &str) -> Result<(), LinkError> {
        self.rpc.invoke("submitPassword", vec![Value::from(password)]).await.map(drop)
    }

    /// Run `handler` with the new state on every `sendUpdate` push.
    pub fn on_update(&self, handler: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.rpc.on(UPDATE_EVENT, move |params| {
            if let Some(state) = params.first() {
                handler(state);
            }
        })
    }

    /// The underlying RPC client, for methods without a typed wrapper.
    #[must_use]
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }
}

/// Whether the user finished onboarding, read from a state snapshot.
///
/// The flag normally lives under `metamask`; a flattened snapshot carrying it at
/// the top level is accepted too. Missing means not completed.
#[must_use]
pub fn completed_onboarding(state: &Value) -> bool {
    state
        .get("metamask")
        .and_then(|store| store.get("completedOnboarding"))
        .or_else(|| state.get("completedOnboarding"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "background_test.rs"]
mod tests;
