//! Bootstrap: bring a UI process up over a fresh link to the background.
//!
//! STARTUP
//! =======
//! 1. Load the preferred locale's messages (needed to render fatal errors).
//! 2. Watch the link: an unexpected disconnect renders a critical error.
//! 3. Resolve the active tab (popup only).
//! 4. Split the link into `"controller"` (RPC) and `"provider"` channels.
//! 5. Launch the UI with the tab, the background connection and the provider.
//!    A launch failure renders a critical error and ends startup.
//! 6. If onboarding is incomplete outside fullscreen, open the full extension
//!    view in the browser.
//!
//! The result is an owned [`Session`]. Nothing is stored globally; shutting the
//! session down is graceful and does not render the disconnect error.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::background::{BackgroundConnection, completed_onboarding};
use crate::chain::ChainQuery;
use crate::config::{DEFAULT_LOCALE, DEFAULT_SUPPORT_LINK};
use crate::environment::{ActiveTab, EnvironmentType, TabQuery, resolve_active_tab};
use crate::error::{BootstrapError, LinkError};
use crate::mux::Multiplexer;
use crate::provider::ProviderProxy;
use crate::rpc::RpcClient;
use crate::transport::{DisconnectReason, TransportChannel};
use crate::{CONTROLLER_CHANNEL, PROVIDER_CHANNEL};

/// Message key rendered when the background goes away.
pub const BACKGROUND_CLOSED_KEY: &str = "backgroundPortClosedError";
/// Message key rendered when the UI fails to launch.
pub const FAILED_TO_LOAD_KEY: &str = "failedToLoadMessage";
/// Message key for the support link text.
pub const NEED_HELP_KEY: &str = "needHelpLinkText";

const BACKGROUND_CLOSED_DETAIL: &str = "Connection lost to background script";

// =============================================================================
// LOCALE MESSAGES
// =============================================================================

/// Localized UI strings, keyed by message name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Messages {
    entries: HashMap<String, String>,
}

#[derive(Deserialize)]
struct MessageEntry {
    message: String,
}

impl Messages {
    /// Parse a `messages.json` document: `{"key": {"message": "..."}}`.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the document does not have that shape.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, MessageEntry> = serde_json::from_str(text)?;
        Ok(Self { entries: raw.into_iter().map(|(key, entry)| (key, entry.message)).collect() })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The message for `key`, or the key itself when it is missing.
    #[must_use]
    pub fn text<'a>(&'a self, key: &'a str) -> &'a str {
        self.get(key).unwrap_or(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Messages {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Source of the user's preferred locale and its message catalogue.
#[async_trait]
pub trait LocaleSource: Send + Sync {
    async fn preferred_locale(&self) -> String;

    async fn messages(&self, locale: &str) -> Result<Messages, BootstrapError>;
}

/// Host platform actions.
pub trait Platform: Send + Sync {
    fn open_extension_in_browser(&self);
}

/// Renders a fatal error to the user.
pub trait Presenter: Send + Sync {
    fn critical_error(&self, error: CriticalError);
}

/// Starts the UI proper and returns its initial state snapshot.
#[async_trait]
pub trait UiLauncher: Send + Sync {
    async fn launch(&self, context: LaunchContext) -> Result<Value, BootstrapError>;
}

/// Everything the UI gets at launch.
#[derive(Clone)]
pub struct LaunchContext {
    pub environment: EnvironmentType,
    pub active_tab: Option<ActiveTab>,
    pub background: Arc<BackgroundConnection>,
    pub chain: Arc<ChainQuery>,
}

/// A fatal error ready to render: localized headline, technical detail and
/// where to get help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalError {
    pub key: String,
    pub message: String,
    pub detail: String,
    pub support_link: String,
    pub help_text: String,
}

impl CriticalError {
    #[must_use]
    pub fn new(messages: &Messages, key: &str, detail: impl Into<String>, support_link: &str) -> Self {
        Self {
            key: key.to_owned(),
            message: messages.text(key).to_owned(),
            detail: detail.into(),
            support_link: support_link.to_owned(),
            help_text: messages.text(NEED_HELP_KEY).to_owned(),
        }
    }
}

impl fmt::Display for CriticalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\n    {}\n\n{}: {}", self.message, self.detail, self.help_text, self.support_link)
    }
}

/// Reads `<dir>/<locale>/messages.json`, falling back to the default locale
/// when the preferred one has no catalogue.
pub struct JsonLocaleSource {
    dir: PathBuf,
    locale: String,
}

impl JsonLocaleSource {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, locale: impl Into<String>) -> Self {
        Self { dir: dir.into(), locale: locale.into() }
    }

    async fn read(&self, locale: &str) -> Result<Messages, BootstrapError> {
        let path = self.dir.join(locale).join("messages.json");
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| BootstrapError::Locale(format!("{}: {err}", path.display())))?;
        Messages::from_json(&text).map_err(|err| BootstrapError::Locale(format!("{}: {err}", path.display())))
    }
}

#[async_trait]
impl LocaleSource for JsonLocaleSource {
    async fn preferred_locale(&self) -> String {
        self.locale.clone()
    }

    async fn messages(&self, locale: &str) -> Result<Messages, BootstrapError> {
        match self.read(locale).await {
            Err(err) if locale != DEFAULT_LOCALE => {
                warn!(%locale, error = %err, "bootstrap: falling back to default locale");
                self.read(DEFAULT_LOCALE).await
            }
            result => result,
        }
    }
}

// =============================================================================
// ACCOUNT MANAGER CONNECTION
// =============================================================================

/// The two logical connections carried by one link.
pub struct Link {
    mux: Multiplexer,
    background: Arc<BackgroundConnection>,
    chain: Arc<ChainQuery>,
}

impl Link {
    #[must_use]
    pub fn background(&self) -> &Arc<BackgroundConnection> {
        &self.background
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<ChainQuery> {
        &self.chain
    }

    #[must_use]
    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }
}

/// Split `transport` into the controller RPC connection and the provider.
///
/// # Errors
///
/// [`LinkError::ChannelClosed`] if the transport has already closed.
pub fn connect_to_account_manager(transport: TransportChannel) -> Result<Link, LinkError> {
    let mux = Multiplexer::new(transport);
    let controller = mux.create_channel(CONTROLLER_CHANNEL)?;
    let provider = ProviderProxy::new(mux.create_channel(PROVIDER_CHANNEL)?);

    provider.on_error(|err| warn!(error = %err, "bootstrap: provider error"));
    provider.on_notification(|payload| debug!(%payload, "bootstrap: provider notification"));

    let background = Arc::new(BackgroundConnection::new(RpcClient::new(controller)));
    let chain = Arc::new(ChainQuery::new(Arc::new(provider)));
    Ok(Link { mux, background, chain })
}

// =============================================================================
// BOOTSTRAP
// =============================================================================

/// Host capabilities the bootstrap drives.
#[derive(Clone)]
pub struct Collaborators {
    pub locale: Arc<dyn LocaleSource>,
    pub tabs: Arc<dyn TabQuery>,
    pub platform: Arc<dyn Platform>,
    pub presenter: Arc<dyn Presenter>,
    pub launcher: Arc<dyn UiLauncher>,
}

pub struct Bootstrap {
    environment: EnvironmentType,
    support_link: String,
    collaborators: Collaborators,
}

impl Bootstrap {
    #[must_use]
    pub fn new(environment: EnvironmentType, collaborators: Collaborators) -> Self {
        Self { environment, support_link: DEFAULT_SUPPORT_LINK.to_owned(), collaborators }
    }

    #[must_use]
    pub fn with_support_link(mut self, link: impl Into<String>) -> Self {
        self.support_link = link.into();
        self
    }

    /// Run startup over `transport` and return the live session.
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::Locale`] if the messages cannot be loaded.
    /// - [`BootstrapError::Link`] if the link closed before the channels could
    ///   be created.
    /// - Whatever the launcher fails with, after the failure was rendered.
    pub async fn start(self, transport: TransportChannel) -> Result<Session, BootstrapError> {
        let Self { environment, support_link, collaborators } = self;

        let locale = collaborators.locale.preferred_locale().await;
        let messages = Arc::new(collaborators.locale.messages(&locale).await?);
        info!(%environment, %locale, messages = messages.len(), "bootstrap: locale loaded");

        let graceful = Arc::new(AtomicBool::new(false));
        watch_disconnect(&transport, &graceful, &messages, &support_link, &collaborators.presenter);

        let active_tab = resolve_active_tab(environment, &*collaborators.tabs).await;
        debug!(origin = ?active_tab.as_ref().map(|tab| tab.origin.as_str()), "bootstrap: active tab");

        let link = connect_to_account_manager(transport)?;
        let context = LaunchContext {
            environment,
            active_tab: active_tab.clone(),
            background: Arc::clone(&link.background),
            chain: Arc::clone(&link.chain),
        };

        let state = match collaborators.launcher.launch(context).await {
            Ok(state) => state,
            Err(err) => {
                error!(error = %err, "bootstrap: ui failed to launch");
                collaborators.presenter.critical_error(CriticalError::new(
                    &messages,
                    FAILED_TO_LOAD_KEY,
                    err.to_string(),
                    &support_link,
                ));
                graceful.store(true, Ordering::SeqCst);
                link.mux.close();
                return Err(err);
            }
        };

        if !completed_onboarding(&state) && environment != EnvironmentType::Fullscreen {
            info!(%environment, "bootstrap: onboarding incomplete, opening extension");
            collaborators.platform.open_extension_in_browser();
        }

        info!(%environment, "bootstrap: ui launched");
        Ok(Session { environment, active_tab, messages, state, link, graceful })
    }
}

fn watch_disconnect(
    transport: &TransportChannel,
    graceful: &Arc<AtomicBool>,
    messages: &Arc<Messages>,
    support_link: &str,
    presenter: &Arc<dyn Presenter>,
) {
    let graceful = Arc::clone(graceful);
    let messages = Arc::clone(messages);
    let support_link = support_link.to_owned();
    let presenter = Arc::clone(presenter);

    transport.on_disconnect(move |reason| {
        if graceful.load(Ordering::SeqCst) {
            debug!(%reason, "bootstrap: link closed after shutdown");
            return;
        }
        error!(%reason, "bootstrap: lost connection to background");
        presenter.critical_error(CriticalError::new(
            &messages,
            BACKGROUND_CLOSED_KEY,
            BACKGROUND_CLOSED_DETAIL,
            &support_link,
        ));
    });
}

// =============================================================================
// SESSION
// =============================================================================

/// A running UI session. Owns the link.
pub struct Session {
    environment: EnvironmentType,
    active_tab: Option<ActiveTab>,
    messages: Arc<Messages>,
    state: Value,
    link: Link,
    graceful: Arc<AtomicBool>,
}

impl Session {
    #[must_use]
    pub fn environment(&self) -> EnvironmentType {
        self.environment
    }

    #[must_use]
    pub fn active_tab(&self) -> Option<&ActiveTab> {
        self.active_tab.as_ref()
    }

    #[must_use]
    pub fn messages(&self) -> &Messages {
        &self.messages
    }

    /// State snapshot the UI launched with.
    #[must_use]
    pub fn initial_state(&self) -> &Value {
        &self.state
    }

    #[must_use]
    pub fn background(&self) -> &Arc<BackgroundConnection> {
        self.link.background()
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<ChainQuery> {
        self.link.chain()
    }

    #[must_use]
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Close the link without rendering the disconnect error. Idempotent.
    pub fn shutdown(&self) {
        self.graceful.store(true, Ordering::SeqCst);
        self.link.mux.close();
    }

    /// Wait for the link to end and report why.
    pub async fn disconnected(&self) -> DisconnectReason {
        let transport = self.link.mux.transport();
        transport.closed().await;
        transport.disconnect_reason().unwrap_or(DisconnectReason::LocalClose)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "bootstrap_test.rs"]
mod tests;
