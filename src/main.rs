//! ==============================================================================
//! main.rs - monitor host entry point
//! ==============================================================================
//!
//! responsibilities:
//!     - load host.toml and configure logging
//!     - pick peripherals for this build (mock or real)
//!     - start the monitor and wait for Ctrl-C, SIGTERM or a display power-off
//!     - shut down cleanly, then power the device off if that was asked for
//!
//! ==============================================================================

use airmon::config::HostConfig;
use airmon::hal::Peripherals;
use airmon::server::MonitorServer;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  airmon - CO2 / Humidity / Temperature Monitor");
    println!("===========================================================");

    // step 1: load configuration (logged with a default filter until the
    // configured one is known)
    let bootstrap = tracing_subscriber::fmt().with_env_filter(filter("info")).finish();
    let config = tracing::subscriber::with_default(bootstrap, HostConfig::load_or_default);

    // step 2: logging as configured; RUST_LOG wins when set
    tracing_subscriber::fmt().with_env_filter(filter(&config.logging.level)).init();
    config.print_summary();

    // step 3: peripherals + monitor tasks
    let peripherals = Peripherals::detect(&config);
    let server = match MonitorServer::start(&config, peripherals).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("[STARTUP] Fatal: {:#}", e);
            return Err(e);
        }
    };

    // step 4: run until asked to stop
    let power_off = tokio::select! {
        _ = stop_signal() => false,
        _ = server.power_off_requested() => true,
    };

    server.shutdown().await?;

    if power_off {
        power_off_host();
    } else {
        tracing::info!("[SHUTDOWN] Exiting normally");
    }
    Ok(())
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

async fn stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("SIGTERM handler unavailable: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Ctrl-C handler failed: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(feature = "hardware")]
fn power_off_host() {
    tracing::info!("[SHUTDOWN] Powering off");
    if let Err(e) = std::process::Command::new("poweroff").status() {
        tracing::error!("[SHUTDOWN] poweroff failed: {}", e);
    }
}

#[cfg(not(feature = "hardware"))]
fn power_off_host() {
    tracing::info!("[SHUTDOWN] Power-off requested (mock build) - exiting instead");
}
