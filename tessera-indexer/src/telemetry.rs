//! Tracing subscriber setup.

use tessera_core::{ConfigError, TelemetryConfig, TesseraResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `log_filter`. Fails if the filter does not parse or a
/// subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> TesseraResult<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter).map_err(|e| ConfigError::InvalidValue {
            field: "telemetry.log_filter".to_string(),
            value: config.log_filter.clone(),
            reason: e.to_string(),
        })?,
    };

    let json_layer = config
        .json_logs
        .then(|| tracing_subscriber::fmt::layer().json());
    let plain_layer = (!config.json_logs).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(plain_layer)
        .try_init()
        .map_err(|e| ConfigError::Parse {
            reason: format!("Failed to init subscriber: {}", e),
        })?;

    tracing::info!(
        log_filter = %config.log_filter,
        json_logs = config.json_logs,
        "Telemetry initialized"
    );
    Ok(())
}
