use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NotifierError, Result};

const APP_DIR: &str = "gmail-notifier";
pub const DEFAULT_FEED_BASE_URL: &str = "https://mail.google.com/mail/feed/atom";
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub refresh_interval_secs: u64,
    pub show_snippets: bool,
    pub show_unread_count: bool,
    /// Feed label path segment; empty means the inbox.
    pub messages_source: String,
    pub only_show_new_messages: bool,
    pub client_secret_path: PathBuf,
    pub feed_base_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            show_snippets: true,
            show_unread_count: true,
            messages_source: String::new(),
            only_show_new_messages: true,
            client_secret_path: PathBuf::from("client_secret.json"),
            feed_base_url: DEFAULT_FEED_BASE_URL.to_string(),
        }
    }
}

impl Settings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(MIN_REFRESH_INTERVAL_SECS))
    }

    pub fn feed_url(&self) -> String {
        let base = self.feed_base_url.trim_end_matches('/');
        let source = self.messages_source.trim_matches('/');
        if source.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, source)
        }
    }

    /// Missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No settings at {}, using defaults", path.display());
            return Ok(Settings::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| NotifierError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&contents)
            .map_err(|e| NotifierError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| NotifierError::Config(e.to_string()))?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| NotifierError::Config(e.to_string()))?;
        fs::write(path, contents).map_err(|e| NotifierError::Config(e.to_string()))
    }
}

pub fn default_settings_path() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| NotifierError::Config("no config dir available".to_string()))?;
    Ok(dir.join(APP_DIR).join("config.toml"))
}
