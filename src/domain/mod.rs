pub mod metering;
pub mod models;
pub mod session_state;
pub mod telemetry_payload;
