use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, http, web};

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::db::{open_connection, run_migrations, set_busy_timeout};
use crate::adapters::telemetry::TelemetryChannel;
use crate::adapters::telemetry_memory::{InMemoryTelemetryChannel, SampleSimulator, SimulatedLoad};
use crate::adapters::telemetry_udp::UdpTelemetryChannel;
use crate::app::config::{AppConfig, TelemetryTransport};
use crate::app::controller::{ControllerSettings, SessionController};
use crate::app::error::AppError;
use crate::app::services::SqliteSessionStore;
use crate::domain::session_state::{Clock, SystemClock};

pub fn run(config: AppConfig) -> Result<(), AppError> {
    if let Some(parent) = std::path::Path::new(&config.db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(AppError::database_init)?;
    }

    let mut connection = open_connection(&config.db_path).map_err(AppError::database_init)?;
    set_busy_timeout(
        &connection,
        Duration::from_millis(config.store_busy_timeout_ms),
    )
    .map_err(AppError::database_init)?;
    run_migrations(&mut connection).map_err(AppError::database_init)?;

    let store = SqliteSessionStore::new(Arc::new(Mutex::new(connection)));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (channel, transport) = match config.telemetry_transport {
        TelemetryTransport::Udp => {
            let udp = Arc::new(
                UdpTelemetryChannel::bind(&config.telemetry_bind, Arc::clone(&clock))
                    .map_err(AppError::runtime)?,
            );
            tracing::info!(bind = %config.telemetry_bind, "udp telemetry channel listening");
            (
                udp.clone() as Arc<dyn TelemetryChannel>,
                TransportHandle::Udp(udp),
            )
        }
        TelemetryTransport::Memory => {
            let memory = Arc::new(InMemoryTelemetryChannel::new());
            let simulator = SampleSimulator::spawn(
                Arc::clone(&memory),
                Arc::clone(&clock),
                SimulatedLoad {
                    voltage: config.simulated_voltage,
                    current: config.simulated_current,
                    interval: Duration::from_millis(config.simulation_interval_ms),
                },
            )
            .map_err(AppError::runtime)?;
            tracing::warn!(
                voltage = config.simulated_voltage,
                current = config.simulated_current,
                interval_ms = config.simulation_interval_ms,
                "using in-memory telemetry channel with simulated devices"
            );
            (
                memory as Arc<dyn TelemetryChannel>,
                TransportHandle::Simulated(simulator),
            )
        }
    };

    let controller = SessionController::new(
        Arc::new(store.clone()),
        channel,
        clock,
        ControllerSettings {
            rate_per_kwh: config.rate_per_kwh,
            actuator_timeout: Duration::from_millis(config.actuator_timeout_ms),
            enforce_energy_cap: config.enforce_energy_cap,
        },
    );

    match controller.recover_unfinished() {
        Ok(0) => {}
        Ok(recovered) => tracing::warn!(recovered, "aborted sessions left by previous run"),
        Err(error) => tracing::error!(error = %error, "startup recovery failed"),
    }

    let api_state = ApiState {
        controller,
        diagnostics: store,
    };
    let cors_origin = config.cors_origin.clone();

    tracing::info!(bind = %config.http_bind, "http server starting");

    let server_result = actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            let cors = Cors::default()
                .allowed_origin(&cors_origin)
                .allowed_methods(vec!["GET", "POST"])
                .allowed_headers(vec![http::header::CONTENT_TYPE, http::header::ACCEPT])
                .max_age(3600);

            App::new()
                .wrap(cors)
                .app_data(web::Data::new(api_state.clone()))
                .configure(configure_routes)
        })
        .bind(&config.http_bind)?
        .run()
        .await
    });

    transport.shutdown();
    tracing::info!("http server stopped");

    server_result.map_err(AppError::runtime)
}

/// Background machinery behind the telemetry channel, stopped after the HTTP
/// server exits.
enum TransportHandle {
    Udp(Arc<UdpTelemetryChannel>),
    Simulated(SampleSimulator),
}

impl TransportHandle {
    fn shutdown(&self) {
        match self {
            Self::Udp(udp) => udp.shutdown(),
            Self::Simulated(simulator) => simulator.shutdown(),
        }
    }
}
