pub mod api;
pub mod db;
pub mod telemetry;
pub mod telemetry_memory;
pub mod telemetry_udp;
