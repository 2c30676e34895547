//! Polls the Gmail Atom feed for one signed-in account and announces new
//! messages as desktop notifications.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod gmail_api;
pub mod notifications;
pub mod poller;
pub mod service;
pub mod session;
pub mod types;

pub use error::{NotifierError, Result};
pub use service::{NotifierEvent, NotifierHandle, NotifierService};
