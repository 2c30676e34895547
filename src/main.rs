use clap::Parser;
use gmail_notifier::app;
use gmail_notifier::cli::{handle_keyring_clear, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gmail_notifier=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if cli.clear_keyring {
        handle_keyring_clear()?;
        return Ok(());
    }

    app::run(cli).await
}
