use anyhow::{Context, Result};
use lib_realtime::{ConnectionManager, DataDistributionService, Subscription};
use std::time::Duration;
use tokio::signal;

mod monitor_logic;
use monitor_logic::{config, report};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls (wss:// feeds)
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    lib_realtime::loggers::setup_logging(&config.log_dir, &config.log_level, "realtime_monitor")?;
    log::info!("{}", config.realtime);

    let connection = ConnectionManager::new(config.realtime.connection.clone());
    let service = DataDistributionService::new(connection.clone(), config.realtime.distribution.clone());

    let _status = connection.on_status_change(|status| {
        log::info!("Connection status: {}", status);
    });

    // Subscribe before connecting so the first frames are not missed.
    service.start();
    let _global = service.subscribe_global(|source, buffer| match buffer.last() {
        Some(point) => log::debug!(
            "{} holds {} points, latest {}",
            source,
            buffer.len(),
            report::point_line(point)
        ),
        None => log::info!("Source {} registered", source),
    });
    let _watches: Vec<Subscription> = config
        .watch
        .iter()
        .map(|source| {
            service.subscribe_latest(source, |point| {
                if let Some(point) = point {
                    log::info!("{}", report::point_line(point));
                }
            })
        })
        .collect();

    connection
        .connect(&config.url)
        .await
        .with_context(|| format!("connecting to {}", config.url))?;

    let reporter = tokio::spawn(report_stats(
        service.clone(),
        Duration::from_secs(config.stats_interval_seconds),
    ));

    wait_for_shutdown_signal().await?;

    reporter.abort();
    service.stop();
    connection.force_disconnect();
    log::info!("Final stats: {}", report::summarize(&service.get_stats()));
    log::info!("Shutdown complete.");
    Ok(())
}

async fn report_stats(service: DataDistributionService, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stats = service.get_stats();
        log::info!("Service: {}", report::summarize(&stats));
        for line in report::queue_lines(&stats) {
            log::info!("  {}", line);
        }
        log::info!(
            "Connection: {}",
            report::connection_line(&service.connection().get_connection_stats())
        );
    }
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
