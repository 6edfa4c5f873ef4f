use std::path::Path;

use chrono::{SecondsFormat, Utc};

use charge_session_api::adapters::db::{
    count_sessions, create_session_if_absent, list_unfinished_sessions, open_connection,
    run_migrations, schema_version, update_session,
};
use charge_session_api::domain::models::{
    NewSession, RelayState, SessionStatus, SessionUpdate, StopReason, derive_session_id,
};

const DEFAULT_PATH: &str = "./data/charge_sessions_test.db";

struct Options {
    path: String,
    force: bool,
    seed: u32,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("failed to create test db: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let Some(options) = parse_args(std::env::args().skip(1).collect())? else {
        print_help();
        return Ok(());
    };

    let path_ref = Path::new(&options.path);
    if let Some(parent) = path_ref.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|error| format!("failed to create parent directory: {error}"))?;
    }

    if options.force && path_ref.exists() {
        std::fs::remove_file(path_ref)
            .map_err(|error| format!("failed to remove existing db file: {error}"))?;
    }

    let mut connection = open_connection(&options.path).map_err(|error| error.to_string())?;
    run_migrations(&mut connection).map_err(|error| error.to_string())?;

    for index in 0..options.seed {
        seed_completed_session(&connection, index)?;
    }

    let version = schema_version(&connection).map_err(|error| error.to_string())?;
    let sessions = count_sessions(&connection).map_err(|error| error.to_string())?;
    let unfinished = list_unfinished_sessions(&connection)
        .map_err(|error| error.to_string())?
        .len();

    println!("created/updated test db at: {}", options.path);
    println!("schema version: {version}");
    println!("sessions: {sessions} ({unfinished} unfinished)");
    Ok(())
}

fn parse_args(args: Vec<String>) -> Result<Option<Options>, String> {
    let mut options = Options {
        path: DEFAULT_PATH.to_string(),
        force: false,
        seed: 0,
    };

    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--path" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--path requires a value".to_string());
                };
                options.path = value.clone();
                index += 2;
            }
            "--seed" => {
                let Some(value) = args.get(index + 1) else {
                    return Err("--seed requires a value".to_string());
                };
                options.seed = value
                    .parse()
                    .map_err(|_| format!("--seed must be a number, got {value}"))?;
                index += 2;
            }
            "--force" => {
                options.force = true;
                index += 1;
            }
            "--help" | "-h" => return Ok(None),
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    Ok(Some(options))
}

/// Inserts a finished session billed at 20 per kWh, 1.5 kWh per seed index.
fn seed_completed_session(connection: &rusqlite::Connection, index: u32) -> Result<(), String> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let transaction_id = format!("seed-{}-{index}", Utc::now().timestamp_millis());
    let session_id = derive_session_id(&transaction_id);
    let energy_kwh = 1.5 * f64::from(index + 1);

    create_session_if_absent(
        connection,
        &NewSession {
            transaction_id,
            session_id: session_id.clone(),
            device_id: "demo-wallbox".to_string(),
            started_at: now.clone(),
            budget: 100.0,
            energy_cap_kwh: 0.0,
            rate_per_kwh: 20.0,
        },
    )
    .map_err(|error| error.to_string())?;

    for (expected, status) in [
        (SessionStatus::Pending, SessionStatus::Active),
        (SessionStatus::Active, SessionStatus::Completed),
    ] {
        let mut update = SessionUpdate::guarded(expected, now.clone());
        update.status = Some(status);
        if status == SessionStatus::Completed {
            update.relay_state = Some(RelayState::Off);
            update.cumulative_energy_kwh = Some(energy_kwh);
            update.cumulative_cost = Some(energy_kwh * 20.0);
            update.ended_at = Some(now.clone());
            update.stop_reason = Some(StopReason::UserRequested);
        } else {
            update.relay_state = Some(RelayState::On);
        }
        update_session(connection, &session_id, &update).map_err(|error| error.to_string())?;
    }

    Ok(())
}

fn print_help() {
    println!("create_test_db");
    println!();
    println!("Usage:");
    println!("  cargo run --bin create_test_db -- [--path <file>] [--force] [--seed <n>]");
    println!();
    println!("Options:");
    println!("  --path <file>   target sqlite file (default: {DEFAULT_PATH})");
    println!("  --force         delete existing file before creating");
    println!("  --seed <n>      insert n completed demo sessions");
}
