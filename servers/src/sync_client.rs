use anyhow::{Context, Result};
use tokio::signal;

mod shared;
mod sync_logic;
use shared::logger;
use sync_logic::{client::SyncClient, config};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = config::load_config();
    let log_file = logger::setup_logging("sync_client", &config.log_dir(), config.log_level())?;
    log::info!("Logging to {}", log_file.display());

    let cooldown_path = config.cooldown_path();
    if let Some(parent) = cooldown_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating cooldown directory {}", parent.display()))?;
    }

    let sync_config = config.sync_config();
    log::info!("Feed: {}", sync_config.channel.url);

    let mut client = SyncClient::build(&sync_config, &cooldown_path)?;
    client.start(&config.symbols());
    let sweeper = client.spawn_cooldown_sweeper();

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    sweeper.abort();
    client.shutdown().await;

    log::info!("Shutdown complete.");
    Ok(())
}
