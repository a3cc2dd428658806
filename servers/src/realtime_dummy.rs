use anyhow::Result;
use tokio::signal;

mod dummy_logic;
mod shared;
use dummy_logic::{config, downstream, state};
use shared::logger;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    let log_file = logger::setup_logging("realtime_dummy", &config.log_dir(), config.log_level())?;
    log::info!("Logging to {}", log_file.display());

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let app_state = state::AppState::new();

    let ticker_handle = tokio::spawn(downstream::run_ticker(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    let downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

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
                std::future::pending::<()>().await;
            }
        } => {}
    }

    let _ = shutdown_tx.send(());

    let (ticker, downstream) = tokio::join!(ticker_handle, downstream_handle);
    ticker?;
    downstream??;

    log::info!("Shutdown complete.");
    Ok(())
}
