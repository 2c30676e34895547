//! Gmail endpoints, split into:
//! - auth: OAuth2 authorization, refresh, revocation and keyring storage
//! - feed: the Atom message feed and its parser

pub mod auth;
pub mod feed;

pub use auth::{
    default_keyring_entry, load_client_secret, Authorizer, CredentialStore, GoogleAuthorizer,
    KeyringEntry,
};
pub use feed::{parse_feed, GmailFeedClient, MailFeed};

pub use auth::{KEYRING_SERVICE_NAME, KEYRING_USERNAME};

#[cfg(test)]
pub use auth::{MockAuthorizer, MockKeyringEntry};
#[cfg(test)]
pub use feed::MockMailFeed;
