//! Link configuration from environment variables.
//!
//! | Variable                | Default               |
//! |-------------------------|-----------------------|
//! | `PORTLINK_URL`          | `ws://127.0.0.1:9339` |
//! | `PORTLINK_ENVIRONMENT`  | `popup`               |
//! | `PORTLINK_CODEC`        | `json`                |
//! | `PORTLINK_LOCALE`       | `en`                  |
//! | `PORTLINK_LOCALES_DIR`  | `_locales`            |
//! | `PORTLINK_SUPPORT_LINK` | project support page  |

use std::path::PathBuf;
use std::str::FromStr;

use crate::environment::EnvironmentType;
use crate::error::ConfigError;
use crate::transport::ws::WireCodec;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:9339";
pub const DEFAULT_LOCALE: &str = "en";
pub const DEFAULT_LOCALES_DIR: &str = "_locales";
pub const DEFAULT_SUPPORT_LINK: &str = "https://support.metamask.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub url: String,
    pub environment: EnvironmentType,
    pub codec: WireCodec,
    pub locale: String,
    pub locales_dir: PathBuf,
    pub support_link: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_owned(),
            environment: EnvironmentType::Popup,
            codec: WireCodec::Json,
            locale: DEFAULT_LOCALE.to_owned(),
            locales_dir: PathBuf::from(DEFAULT_LOCALES_DIR),
            support_link: DEFAULT_SUPPORT_LINK.to_owned(),
        }
    }
}

impl LinkConfig {
    /// Read the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable is set to something
    /// that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`LinkConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).filter(|v| !v.trim().is_empty()).unwrap_or(default);

        Ok(Self {
            url: text("PORTLINK_URL", defaults.url),
            environment: env_parse(&lookup, "PORTLINK_ENVIRONMENT", defaults.environment)?,
            codec: env_parse(&lookup, "PORTLINK_CODEC", defaults.codec)?,
            locale: text("PORTLINK_LOCALE", defaults.locale),
            locales_dir: lookup("PORTLINK_LOCALES_DIR")
                .filter(|v| !v.trim().is_empty())
                .map_or(defaults.locales_dir, PathBuf::from),
            support_link: text("PORTLINK_SUPPORT_LINK", defaults.support_link),
        })
    }
}

fn env_parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { var: key.to_owned(), value: raw }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
