//! Window environment and active-tab resolution.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// Kind of window the UI runs in. Doubles as the connection name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    #[default]
    Popup,
    Notification,
    Fullscreen,
    Background,
}

impl EnvironmentType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Popup => "popup",
            Self::Notification => "notification",
            Self::Fullscreen => "fullscreen",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "popup" => Ok(Self::Popup),
            "notification" => Ok(Self::Notification),
            "fullscreen" => Ok(Self::Fullscreen),
            "background" => Ok(Self::Background),
            other => Err(other.to_owned()),
        }
    }
}

/// A tab as reported by the host's tab query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserTab {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub url: Option<String>,
}

/// The tab the popup was opened over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTab {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub origin: String,
    /// Scheme with its trailing colon, e.g. `"https:"`.
    pub protocol: String,
    pub url: String,
}

impl ActiveTab {
    /// Derive origin and protocol from the tab's URL. Tabs without a URL, or
    /// whose origin is opaque (`about:blank`, `data:` ...), yield `None`.
    #[must_use]
    pub fn from_browser_tab(tab: &BrowserTab) -> Option<Self> {
        let raw = tab.url.as_deref()?;
        let parsed = Url::parse(raw).ok()?;
        let origin = parsed.origin();
        if !origin.is_tuple() {
            return None;
        }
        Some(Self {
            id: tab.id,
            title: tab.title.clone(),
            origin: origin.ascii_serialization(),
            protocol: format!("{}:", parsed.scheme()),
            url: raw.to_owned(),
        })
    }
}

/// Host capability for listing the active tab of the current window.
#[async_trait]
pub trait TabQuery: Send + Sync {
    async fn active_tabs(&self) -> Vec<BrowserTab>;
}

/// Resolve the active tab for `environment`. Only the popup can see tabs.
pub async fn resolve_active_tab(environment: EnvironmentType, tabs: &dyn TabQuery) -> Option<ActiveTab> {
    if environment != EnvironmentType::Popup {
        return None;
    }
    let found = tabs.active_tabs().await;
    found.first().and_then(ActiveTab::from_browser_tab)
}

#[cfg(test)]
#[path = "environment_test.rs"]
mod tests;
