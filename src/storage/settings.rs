//! Typed records stored as JSON documents in the key-value table.
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::schema::Database;

/// Key of the settings document.
pub const SETTINGS_KEY: &str = "settings";
/// Key of the saved login.
pub const CREDENTIALS_KEY: &str = "credentials";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    #[default]
    System,
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ViewType {
    #[default]
    List,
    Card,
    Magazine,
    Compact,
}

/// User preferences persisted as one JSON blob.
///
/// Missing fields take their defaults, so documents written by older versions
/// still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub theme: ThemeMode,
    pub view_type: ViewType,
    pub unread_only: bool,
    pub mark_read_on_open: bool,
    pub page_size: u32,
    /// Stream shown when the client last exited.
    pub last_stream: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: ThemeMode::System,
            view_type: ViewType::List,
            unread_only: false,
            mark_read_on_open: true,
            page_size: 20,
            last_stream: None,
        }
    }
}

impl Settings {
    /// Parse a stored document, substituting defaults when it is not valid.
    pub fn from_json(json: &str) -> Self {
        match serde_json::from_str(json) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "Stored settings are invalid, using defaults");
                Self::default()
            }
        }
    }
}

/// Saved login for the aggregation server.
pub struct Credentials {
    pub server: String,
    pub username: String,
    pub token: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// On-disk shape of [`Credentials`].
#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    server: String,
    username: String,
    token: String,
}

impl Database {
    /// Load settings. A missing or malformed document yields the defaults;
    /// only database failures are errors.
    pub async fn load_settings(&self) -> Result<Settings> {
        let stored = self.get_preference(SETTINGS_KEY).await?;
        Ok(stored
            .as_deref()
            .map(Settings::from_json)
            .unwrap_or_default())
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<()> {
        let json = serde_json::to_string(settings).context("Failed to encode settings")?;
        self.set_preference(SETTINGS_KEY, &json).await
    }

    /// Saved login, or `None` if absent or unreadable.
    pub async fn load_credentials(&self) -> Result<Option<Credentials>> {
        let Some(json) = self.get_preference(CREDENTIALS_KEY).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<StoredCredentials>(&json) {
            Ok(stored) => Ok(Some(Credentials {
                server: stored.server,
                username: stored.username,
                token: SecretString::from(stored.token),
            })),
            Err(e) => {
                tracing::warn!(error = %e, "Stored credentials are invalid, ignoring");
                Ok(None)
            }
        }
    }

    pub async fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        let stored = StoredCredentials {
            server: credentials.server.clone(),
            username: credentials.username.clone(),
            token: credentials.token.expose_secret().to_owned(),
        };
        let json = serde_json::to_string(&stored).context("Failed to encode credentials")?;
        self.set_preference(CREDENTIALS_KEY, &json).await
    }

    pub async fn clear_credentials(&self) -> Result<bool> {
        self.delete_preference(CREDENTIALS_KEY).await
    }
}
