use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::cli::{Cli, Command};
use crate::config::{default_settings_path, Settings};
use crate::error::NotifierError;
use crate::gmail_api::{
    default_keyring_entry, load_client_secret, CredentialStore, GmailFeedClient, GoogleAuthorizer,
};
use crate::notifications::{spawn_presenter, DesktopNotifier, Presenter};
use crate::service::{NotifierEvent, NotifierHandle, NotifierService};
use crate::session::SessionManager;
use crate::types::{LoginPrompt, MessageSummary};

// Upper bound for a one-shot `check`
const CHECK_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_settings_path()?,
    };
    let settings = Settings::load(&settings_path)?;
    tracing::debug!("Loaded settings from {}", settings_path.display());

    let (handle, service) = initialize_service(&settings).await?;
    let prompt = cli.login_prompt();

    let result = match cli.command() {
        Command::Run => run_notifier(&handle, &settings, prompt).await,
        Command::Check => check_once(&handle, prompt).await,
        Command::Login => {
            sign_in(&handle, prompt).await?;
            println!("Signed in.");
            Ok(())
        }
        Command::Logout => {
            // Restoring first gives logout a token to revoke
            if let Err(e) = handle.restore().await {
                tracing::debug!("Nothing to restore before logout: {}", e);
            }
            handle.logout().await?;
            println!("Signed out.");
            Ok(())
        }
    };

    handle.shutdown().await;
    if let Err(e) = service.await {
        tracing::error!("Notifier service task failed: {}", e);
    }
    result
}

pub async fn initialize_service(
    settings: &Settings,
) -> anyhow::Result<(NotifierHandle, JoinHandle<()>)> {
    let secret_path: PathBuf = settings.client_secret_path.clone();
    let secret = load_client_secret(&secret_path)
        .await
        .context("Make sure client_secret.json is present and valid")?;

    let client = reqwest::Client::new();
    let authorizer = Arc::new(GoogleAuthorizer::new(secret, client.clone()));
    let store = CredentialStore::new(default_keyring_entry()?);
    let session = SessionManager::new(store, authorizer);
    let feed = Arc::new(GmailFeedClient::new(client, settings.feed_url()));

    Ok(NotifierService::spawn(
        session,
        feed,
        settings.only_show_new_messages,
    ))
}

/// Silent restore from the keyring, falling back to the interactive flow.
pub async fn sign_in(handle: &NotifierHandle, prompt: LoginPrompt) -> anyhow::Result<()> {
    match handle.restore().await {
        Ok(true) => return Ok(()),
        Ok(false) => tracing::info!("No stored session, starting sign-in"),
        Err(e) => tracing::warn!("Could not restore the stored session: {}", e),
    }
    handle.login(prompt).await.context("Sign-in failed")?;
    Ok(())
}

async fn run_notifier(
    handle: &NotifierHandle,
    settings: &Settings,
    prompt: LoginPrompt,
) -> anyhow::Result<()> {
    let presenter = spawn_presenter(
        Presenter::new(DesktopNotifier::default(), settings),
        handle.clone(),
    );

    sign_in(handle, prompt).await?;
    handle.start(settings.refresh_interval()).await?;
    tracing::info!("Watching for new mail, press Ctrl+C to quit");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    handle.stop().await?;
    presenter.abort();
    Ok(())
}

async fn check_once(handle: &NotifierHandle, prompt: LoginPrompt) -> anyhow::Result<()> {
    let mut events = handle.subscribe();
    sign_in(handle, prompt).await?;
    handle.check_now().await?;

    let event = tokio::time::timeout(CHECK_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) => return Ok(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(NotifierError::ServiceClosed),
            }
        }
    })
    .await
    .context("Timed out waiting for the feed")??;

    match event {
        NotifierEvent::Messages(batch) => {
            println!("{} unread", batch.unread_count);
            for message in &batch.messages {
                println!("{}", format_message_line(message));
            }
            Ok(())
        }
        NotifierEvent::FetchFailed(e) => Err(e.into()),
    }
}

pub fn format_message_line(message: &MessageSummary) -> String {
    format!(
        "{}  {:<30}  {}",
        message
            .received_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M"),
        message.author,
        message.subject
    )
}
