mod config;
pub mod controller;
mod error;
mod logging;
mod runtime;
pub mod services;

pub use error::AppError;

pub fn run() -> Result<(), AppError> {
    config::load_env_file()?;
    logging::init()?;

    let config = config::AppConfig::from_env()?;

    tracing::info!(
        http_bind = %config.http_bind,
        db_path = %config.db_path,
        rate_per_kwh = config.rate_per_kwh,
        actuator_timeout_ms = config.actuator_timeout_ms,
        telemetry_transport = ?config.telemetry_transport,
        telemetry_bind = %config.telemetry_bind,
        enforce_energy_cap = config.enforce_energy_cap,
        "application bootstrap initialized"
    );

    runtime::run(config)
}
