use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifierError {
    /// The user (or the authorization server) refused to grant access.
    #[error("authorization denied: {0}")]
    AuthDenied(String),

    #[error("a login is already in progress")]
    AlreadyInProgress,

    #[error("network error: {0}")]
    NetworkError(String),

    /// The access token was rejected and a silent refresh did not help.
    #[error("unauthorized: the access token was rejected")]
    Unauthorized,

    #[error("failed to fetch messages: {cause}")]
    FetchError { cause: String },

    /// Never propagated out of logout; only logged.
    #[error("token revocation failed: {0}")]
    RevocationFailed(String),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not show notification: {0}")]
    Notification(String),

    #[error("notifier service is no longer running")]
    ServiceClosed,
}

impl NotifierError {
    pub fn fetch(cause: impl Into<String>) -> Self {
        NotifierError::FetchError {
            cause: cause.into(),
        }
    }

    /// Errors the user has to act on (sign in again) rather than wait out.
    pub fn needs_user_action(&self) -> bool {
        matches!(
            self,
            NotifierError::AuthDenied(_) | NotifierError::Unauthorized
        )
    }
}

impl From<reqwest::Error> for NotifierError {
    fn from(e: reqwest::Error) -> Self {
        NotifierError::NetworkError(e.to_string())
    }
}

impl From<keyring::Error> for NotifierError {
    fn from(e: keyring::Error) -> Self {
        NotifierError::Keyring(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NotifierError>;
