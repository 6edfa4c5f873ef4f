use crate::app::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryTransport {
    Udp,
    /// In-process channel fed by a sample simulator, for local runs without
    /// hardware.
    Memory,
}

/// Loads `.env` into the process environment when present.
pub fn load_env_file() -> Result<(), AppError> {
    match dotenvy::dotenv() {
        Ok(_) => Ok(()),
        Err(error) if error.not_found() => Ok(()),
        Err(error) => Err(AppError::config(format!("failed to load .env: {error}"))),
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_bind: String,
    pub db_path: String,
    pub rate_per_kwh: f64,
    pub actuator_timeout_ms: u64,
    pub store_busy_timeout_ms: u64,
    pub telemetry_transport: TelemetryTransport,
    pub telemetry_bind: String,
    pub cors_origin: String,
    pub enforce_energy_cap: bool,
    pub simulated_voltage: f64,
    pub simulated_current: f64,
    pub simulation_interval_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rate_per_kwh = parse_or_default(&lookup, "RATE_PER_KWH", 20.0_f64)?;
        if !rate_per_kwh.is_finite() || rate_per_kwh <= 0.0 {
            return Err(AppError::config("RATE_PER_KWH must be greater than zero"));
        }

        let actuator_timeout_ms = parse_or_default(&lookup, "ACTUATOR_TIMEOUT_MS", 5000_u64)?;
        if actuator_timeout_ms == 0 {
            return Err(AppError::config("ACTUATOR_TIMEOUT_MS must be greater than zero"));
        }

        let telemetry_transport = match string_or_default(&lookup, "TELEMETRY_TRANSPORT", "udp")
            .to_ascii_lowercase()
            .as_str()
        {
            "udp" => TelemetryTransport::Udp,
            "memory" => TelemetryTransport::Memory,
            other => {
                return Err(AppError::config(format!(
                    "TELEMETRY_TRANSPORT must be udp or memory, got {other}"
                )));
            }
        };

        let simulated_voltage = parse_or_default(&lookup, "SIMULATED_VOLTAGE", 230.0_f64)?;
        let simulated_current = parse_or_default(&lookup, "SIMULATED_CURRENT", 16.0_f64)?;
        if !simulated_voltage.is_finite()
            || !simulated_current.is_finite()
            || simulated_voltage < 0.0
            || simulated_current < 0.0
        {
            return Err(AppError::config(
                "SIMULATED_VOLTAGE and SIMULATED_CURRENT must not be negative",
            ));
        }

        let simulation_interval_ms = parse_or_default(&lookup, "SIMULATION_INTERVAL_MS", 1000_u64)?;
        if simulation_interval_ms == 0 {
            return Err(AppError::config("SIMULATION_INTERVAL_MS must be greater than zero"));
        }

        Ok(Self {
            http_bind: string_or_default(&lookup, "HTTP_BIND", "0.0.0.0:5000"),
            db_path: string_or_default(&lookup, "DB_PATH", "./data/charge_sessions.db"),
            rate_per_kwh,
            actuator_timeout_ms,
            store_busy_timeout_ms: parse_or_default(&lookup, "STORE_BUSY_TIMEOUT_MS", 2000_u64)?,
            telemetry_transport,
            telemetry_bind: string_or_default(&lookup, "TELEMETRY_BIND", "0.0.0.0:7090"),
            cors_origin: string_or_default(&lookup, "CORS_ORIGIN", "http://localhost:3000"),
            enforce_energy_cap: parse_bool_or_default(&lookup, "ENFORCE_ENERGY_CAP", false)?,
            simulated_voltage,
            simulated_current,
            simulation_interval_ms,
        })
    }
}

fn string_or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}

fn parse_bool_or_default<F>(lookup: &F, key: &str, default: bool) -> Result<bool, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(AppError::config(format!("{key} must be true or false"))),
        },
        None => Ok(default),
    }
}
