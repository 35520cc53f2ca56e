use anyhow::Result;
use tokio::signal;

mod feed_logic;
use feed_logic::{config, downstream, producer};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    lib_realtime::loggers::setup_logging(&config.log_dir, &config.log_level, "server_feed")?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let (frames_tx, _) = tokio::sync::broadcast::channel(1000);
    let state = downstream::FeedState::new(frames_tx.clone());

    let producer_handle = tokio::spawn(producer::run(
        config.clone(),
        frames_tx,
        shutdown_tx.subscribe(),
    ));

    let downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        state,
        shutdown_tx.subscribe(),
    ));

    wait_for_shutdown_signal().await?;

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    let (producer_result, downstream_result) = tokio::join!(producer_handle, downstream_handle);
    producer_result?;
    downstream_result??;

    log::info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                log::info!("Ctrl-C received, initiating shutdown.");
            }
            _ = term_signal.recv() => {
                log::info!("SIGTERM received, initiating shutdown.");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        log::info!("Ctrl-C received, initiating shutdown.");
    }
    Ok(())
}
