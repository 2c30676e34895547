use crate::gmail_api::{default_keyring_entry, CredentialStore};
use crate::types::LoginPrompt;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file (defaults to the platform config dir).
    #[clap(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print the sign-in URL instead of opening a browser.
    #[clap(long, global = true)]
    pub no_browser: bool,

    /// Clear the stored refresh token from the system keyring and exit.
    #[clap(long)]
    pub clear_keyring: bool,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Poll in the foreground and show desktop notifications (default).
    Run,
    /// Fetch once, print the messages and exit.
    Check,
    /// Sign in and store the refresh token.
    Login,
    /// Revoke and forget the stored credentials.
    Logout,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Run)
    }

    pub fn login_prompt(&self) -> LoginPrompt {
        if self.no_browser {
            LoginPrompt::PrintUrl
        } else {
            LoginPrompt::OpenBrowser
        }
    }
}

pub fn handle_keyring_clear() -> anyhow::Result<()> {
    let store = CredentialStore::new(default_keyring_entry()?);

    if let Err(e) = store.clear() {
        eprintln!("Failed to delete credentials from keyring: {}", e);
    } else {
        println!("Credentials removed from keyring. Exiting.");
    }
    Ok(())
}
