use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{ApplicationSecret, InstalledFlowAuthenticator, InstalledFlowReturnMethod};

use crate::error::{NotifierError, Result};
use crate::types::{Credential, LoginPrompt};

pub const KEYRING_SERVICE_NAME: &str = "gmail-notifier";
pub const KEYRING_USERNAME: &str = "oauth2-refresh-token";

pub const FEED_SCOPE: &str = "https://mail.google.com/mail/feed/atom";
pub const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

// Define a trait for Keyring operations to allow mocking
#[cfg_attr(test, mockall::automock)]
pub trait KeyringEntry: Send + Sync {
    fn get_password(&self) -> std::result::Result<String, keyring::Error>;
    fn set_password(&self, password: &str) -> std::result::Result<(), keyring::Error>;
    fn delete_password(&self) -> std::result::Result<(), keyring::Error>;
}

// Implement the trait for the real keyring::Entry
impl KeyringEntry for Entry {
    fn get_password(&self) -> std::result::Result<String, keyring::Error> {
        self.get_password()
    }
    fn set_password(&self, password: &str) -> std::result::Result<(), keyring::Error> {
        self.set_password(password)
    }
    fn delete_password(&self) -> std::result::Result<(), keyring::Error> {
        self.delete_password()
    }
}

pub fn default_keyring_entry() -> Result<Entry> {
    Ok(Entry::new(KEYRING_SERVICE_NAME, KEYRING_USERNAME)?)
}

/// The only thing persisted is the refresh token, under one fixed item.
pub struct CredentialStore<K: KeyringEntry> {
    entry: K,
}

impl<K: KeyringEntry> CredentialStore<K> {
    pub fn new(entry: K) -> Self {
        Self { entry }
    }

    pub fn load_refresh_token(&self) -> Result<Option<String>> {
        match self.entry.get_password() {
            Ok(token) if token.is_empty() => Ok(None),
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_refresh_token(&self, token: &str) -> Result<()> {
        Ok(self.entry.set_password(token)?)
    }

    pub fn clear(&self) -> Result<()> {
        match self.entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// Define a trait for the OAuth2 round-trips to allow mocking
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Interactive consent flow. Fails with `AuthDenied` or `NetworkError`.
    async fn authorize(&self, prompt: LoginPrompt) -> Result<Credential>;

    /// Exchange a refresh token for a new access token, without user input.
    async fn refresh(&self, refresh_token: &str) -> Result<Credential>;

    async fn revoke(&self, token: &str) -> Result<()>;
}

pub async fn load_client_secret(path: &Path) -> Result<ApplicationSecret> {
    yup_oauth2::read_application_secret(path).await.map_err(|e| {
        NotifierError::Config(format!(
            "failed to read client secret {}: {}",
            path.display(),
            e
        ))
    })
}

pub struct GoogleAuthorizer {
    secret: ApplicationSecret,
    client: reqwest::Client,
    scopes: Vec<String>,
}

impl GoogleAuthorizer {
    pub fn new(secret: ApplicationSecret, client: reqwest::Client) -> Self {
        Self {
            secret,
            client,
            scopes: vec![FEED_SCOPE.to_string()],
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

#[async_trait]
impl Authorizer for GoogleAuthorizer {
    async fn authorize(&self, prompt: LoginPrompt) -> Result<Credential> {
        let captured = CapturedToken::default();
        let auth = InstalledFlowAuthenticator::builder(
            self.secret.clone(),
            InstalledFlowReturnMethod::HTTPRedirect,
        )
        .with_storage(Box::new(captured.clone()))
        .flow_delegate(Box::new(PromptDelegate { prompt }))
        .build()
        .await
        .map_err(|e| NotifierError::NetworkError(e.to_string()))?;

        let scopes_refs: Vec<&str> = self.scopes.iter().map(|s| s.as_str()).collect();
        let token = auth.token(&scopes_refs).await.map_err(|e| match e {
            yup_oauth2::Error::AuthError(auth_error) => {
                NotifierError::AuthDenied(auth_error.to_string())
            }
            other => NotifierError::NetworkError(other.to_string()),
        })?;

        let info = captured.take();
        let access_token = token
            .token()
            .map(str::to_string)
            .or_else(|| info.as_ref().and_then(|i| i.access_token.clone()))
            .ok_or_else(|| NotifierError::AuthDenied("no access token granted".to_string()))?;

        let mut credential = Credential::new(access_token).with_scopes(self.scopes.clone());
        if let Some(expiry) = token.expiration_time().and_then(offset_to_chrono) {
            credential = credential.with_expiry(expiry);
        }
        if let Some(refresh_token) = info.and_then(|i| i.refresh_token) {
            credential = credential.with_refresh_token(refresh_token);
        }
        Ok(credential)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        let response = self
            .client
            .post(&self.secret.token_uri)
            .form(&[
                ("client_id", self.secret.client_id.as_str()),
                ("client_secret", self.secret.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = response.json().await?;
            let mut credential = Credential::new(body.access_token)
                .with_scopes(self.scopes.clone())
                .with_refresh_token(
                    body.refresh_token
                        .unwrap_or_else(|| refresh_token.to_string()),
                );
            if let Some(expires_in) = body.expires_in {
                credential = credential.with_expiry(Utc::now() + Duration::seconds(expires_in));
            }
            Ok(credential)
        } else if status.is_client_error() {
            // invalid_grant and friends: the stored grant is gone
            let reason = match response.json::<TokenErrorResponse>().await {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{} ({})", err.error, description),
                    None => err.error,
                },
                Err(_) => status.to_string(),
            };
            Err(NotifierError::AuthDenied(reason))
        } else {
            Err(NotifierError::NetworkError(format!(
                "token endpoint returned {}",
                status
            )))
        }
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        let response = self
            .client
            .post(REVOKE_URL)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| NotifierError::RevocationFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(NotifierError::RevocationFailed(error_text))
        }
    }
}

fn offset_to_chrono(t: time::OffsetDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond())
}

// yup-oauth2 hides the refresh token behind its storage trait; this storage
// never answers lookups (every login is a fresh consent) and keeps what the
// flow hands back.
#[derive(Clone, Default)]
struct CapturedToken {
    slot: Arc<Mutex<Option<TokenInfo>>>,
}

impl CapturedToken {
    fn take(&self) -> Option<TokenInfo> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl TokenStorage for CapturedToken {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> anyhow::Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("token slot poisoned"))?;
        *slot = Some(token);
        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        None
    }
}

struct PromptDelegate {
    prompt: LoginPrompt,
}

impl InstalledFlowDelegate for PromptDelegate {
    fn present_user_url<'a>(
        &'a self,
        url: &'a str,
        _need_code: bool,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<String, String>> + Send + 'a>> {
        Box::pin(async move {
            println!("Sign in to Gmail by visiting:\n\n  {}\n", url);
            if self.prompt == LoginPrompt::OpenBrowser {
                if let Err(e) = open::that(url) {
                    tracing::warn!("Could not open a browser: {}", e);
                }
            }
            Ok(String::new())
        })
    }
}
