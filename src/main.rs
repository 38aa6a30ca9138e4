use relayer_server::RelayConfig;
use relayer_telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() {
    init_telemetry(&TelemetryConfig::from_env());

    tracing::info!("Starting signaling relay");

    let config = RelayConfig::from_env();
    let handle = relayer_server::start(config)
        .await
        .expect("Failed to start server");

    tracing::info!(port = handle.port, "Signaling relay ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("Shutting down");
}
