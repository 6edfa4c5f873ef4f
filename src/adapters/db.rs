use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use crate::domain::models::{
    DeviceSummary, LogEventRecord, NewLogEventRecord, NewSession, RelayState, Session,
    SessionStatus, SessionUpdate, StopReason,
};

pub const LATEST_SCHEMA_VERSION: u32 = 3;

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS charge_sessions (
    transaction_id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL UNIQUE,
    device_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    cumulative_energy_kwh REAL NOT NULL DEFAULT 0,
    cumulative_cost REAL NOT NULL DEFAULT 0,
    relay_state TEXT NOT NULL DEFAULT 'OFF',
    budget REAL NOT NULL,
    energy_cap_kwh REAL NOT NULL DEFAULT 0,
    rate_per_kwh REAL NOT NULL,
    status TEXT NOT NULL,
    stop_reason TEXT,
    last_voltage REAL,
    last_current REAL,
    last_sample_at TEXT,
    actuator_error TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_charge_sessions_status
ON charge_sessions (status);
"#,
    ),
    (
        2,
        r#"
CREATE TABLE IF NOT EXISTS log_events (
    id TEXT PRIMARY KEY NOT NULL,
    created_at TEXT NOT NULL,
    level TEXT NOT NULL,
    code TEXT NOT NULL,
    message TEXT NOT NULL,
    session_id TEXT,
    device_id TEXT,
    details_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_log_events_created_at_desc
ON log_events (created_at DESC);
"#,
    ),
    (
        3,
        r#"
ALTER TABLE charge_sessions ADD COLUMN last_power_w REAL;

CREATE INDEX IF NOT EXISTS idx_charge_sessions_device
ON charge_sessions (device_id);
"#,
    ),
];

const SESSION_COLUMNS: &str = "transaction_id, session_id, device_id, started_at, ended_at, \
     cumulative_energy_kwh, cumulative_cost, relay_state, budget, energy_cap_kwh, rate_per_kwh, \
     status, stop_reason, last_voltage, last_current, last_sample_at, actuator_error, updated_at, \
     last_power_w";

/// One row per device: its newest session (by insertion order) plus counts.
const DEVICE_SUMMARY_SELECT: &str = "SELECT
            latest.device_id, totals.session_count, latest.session_id, latest.status,
            latest.started_at, latest.last_sample_at, latest.last_power_w,
            (SELECT unfinished.session_id FROM charge_sessions AS unfinished
              WHERE unfinished.device_id = latest.device_id
                AND unfinished.status IN ('PENDING', 'ACTIVE')
              ORDER BY unfinished.rowid DESC LIMIT 1)
     FROM charge_sessions AS latest
     JOIN (SELECT device_id, COUNT(*) AS session_count, MAX(rowid) AS latest_rowid
             FROM charge_sessions GROUP BY device_id) AS totals
       ON latest.rowid = totals.latest_rowid";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
    #[error("corrupt value in column {column}: {value}")]
    CorruptValue { column: &'static str, value: String },
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    Connection::open(path).map_err(DbError::from)
}

/// Writes that find the database locked retry for up to `timeout` before failing.
pub fn set_busy_timeout(connection: &Connection, timeout: Duration) -> Result<(), DbError> {
    connection.busy_timeout(timeout).map_err(DbError::from)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Inserts a PENDING record unless one already exists for the transaction or
/// session id. Returns `false` when nothing was inserted.
pub fn create_session_if_absent(
    connection: &Connection,
    new_session: &NewSession,
) -> Result<bool, DbError> {
    let inserted = connection.execute(
        "INSERT OR IGNORE INTO charge_sessions (
            transaction_id, session_id, device_id, started_at, budget, energy_cap_kwh,
            rate_per_kwh, status, relay_state, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?4)",
        params![
            new_session.transaction_id,
            new_session.session_id,
            new_session.device_id,
            new_session.started_at,
            new_session.budget,
            new_session.energy_cap_kwh,
            new_session.rate_per_kwh,
            SessionStatus::Pending.as_str(),
            RelayState::Off.as_str(),
        ],
    )?;

    Ok(inserted == 1)
}

pub fn get_session_by_transaction_id(
    connection: &Connection,
    transaction_id: &str,
) -> Result<Option<Session>, DbError> {
    query_one_session(
        connection,
        &format!("SELECT {SESSION_COLUMNS} FROM charge_sessions WHERE transaction_id = ?1"),
        transaction_id,
    )
}

pub fn get_session_by_session_id(
    connection: &Connection,
    session_id: &str,
) -> Result<Option<Session>, DbError> {
    query_one_session(
        connection,
        &format!("SELECT {SESSION_COLUMNS} FROM charge_sessions WHERE session_id = ?1"),
        session_id,
    )
}

/// Applies `update` only if the stored status still equals
/// `update.expected_status`. Totals can only grow. Returns `false` when the
/// guard did not match or the session does not exist.
pub fn update_session(
    connection: &Connection,
    session_id: &str,
    update: &SessionUpdate,
) -> Result<bool, DbError> {
    let changed = connection.execute(
        "UPDATE charge_sessions SET
            status = COALESCE(?1, status),
            relay_state = COALESCE(?2, relay_state),
            cumulative_energy_kwh = MAX(cumulative_energy_kwh, COALESCE(?3, cumulative_energy_kwh)),
            cumulative_cost = MAX(cumulative_cost, COALESCE(?4, cumulative_cost)),
            ended_at = COALESCE(?5, ended_at),
            stop_reason = COALESCE(?6, stop_reason),
            last_voltage = COALESCE(?7, last_voltage),
            last_current = COALESCE(?8, last_current),
            last_sample_at = COALESCE(?9, last_sample_at),
            actuator_error = COALESCE(?10, actuator_error),
            last_power_w = COALESCE(?11, last_power_w),
            updated_at = ?12
         WHERE session_id = ?13 AND status = ?14",
        params![
            update.status.map(SessionStatus::as_str),
            update.relay_state.map(RelayState::as_str),
            update.cumulative_energy_kwh,
            update.cumulative_cost,
            update.ended_at,
            update.stop_reason.map(StopReason::as_str),
            update.last_voltage,
            update.last_current,
            update.last_sample_at,
            update.actuator_error,
            update.last_power_w,
            update.updated_at,
            session_id,
            update.expected_status.as_str(),
        ],
    )?;

    Ok(changed == 1)
}

pub fn list_unfinished_sessions(connection: &Connection) -> Result<Vec<Session>, DbError> {
    let mut statement = connection.prepare(&format!(
        "SELECT {SESSION_COLUMNS}
         FROM charge_sessions
         WHERE status IN ('PENDING', 'ACTIVE')
         ORDER BY started_at ASC"
    ))?;

    let mut rows = statement.query([])?;
    let mut sessions = Vec::new();
    while let Some(row) = rows.next()? {
        sessions.push(session_from_row(row)?);
    }

    Ok(sessions)
}

pub fn list_devices(connection: &Connection) -> Result<Vec<DeviceSummary>, DbError> {
    let mut statement =
        connection.prepare(&format!("{DEVICE_SUMMARY_SELECT} ORDER BY latest.device_id ASC"))?;

    let mut rows = statement.query([])?;
    let mut devices = Vec::new();
    while let Some(row) = rows.next()? {
        devices.push(device_from_row(row)?);
    }

    Ok(devices)
}

pub fn get_device(
    connection: &Connection,
    device_id: &str,
) -> Result<Option<DeviceSummary>, DbError> {
    let mut statement =
        connection.prepare(&format!("{DEVICE_SUMMARY_SELECT} WHERE latest.device_id = ?1"))?;

    let mut rows = statement.query(params![device_id])?;
    match rows.next()? {
        Some(row) => device_from_row(row).map(Some),
        None => Ok(None),
    }
}

pub fn count_sessions(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM charge_sessions", [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

pub fn insert_log_event(
    connection: &Connection,
    new_log_event: &NewLogEventRecord,
) -> Result<String, DbError> {
    let id = uuid::Uuid::new_v4().to_string();
    connection.execute(
        "INSERT INTO log_events (id, created_at, level, code, message, session_id, device_id, details_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            new_log_event.created_at,
            new_log_event.level,
            new_log_event.code,
            new_log_event.message,
            new_log_event.session_id,
            new_log_event.device_id,
            new_log_event.details_json,
        ],
    )?;

    Ok(id)
}

pub fn count_log_events(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM log_events", [], |row| row.get(0))?;
    Ok(count)
}

pub fn list_recent_log_events(
    connection: &Connection,
    limit: u32,
) -> Result<Vec<LogEventRecord>, DbError> {
    let mut statement = connection.prepare(
        "SELECT id, created_at, level, code, message, session_id, device_id, details_json
         FROM log_events
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?1",
    )?;

    let rows = statement.query_map(params![i64::from(limit)], |row| {
        Ok(LogEventRecord {
            id: row.get(0)?,
            created_at: row.get(1)?,
            level: row.get(2)?,
            code: row.get(3)?,
            message: row.get(4)?,
            session_id: row.get(5)?,
            device_id: row.get(6)?,
            details_json: row.get(7)?,
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }

    Ok(events)
}

fn query_one_session(
    connection: &Connection,
    sql: &str,
    key: &str,
) -> Result<Option<Session>, DbError> {
    let mut statement = connection.prepare(sql)?;
    let raw = statement
        .query_row(params![key], RawSessionRow::from_row)
        .optional()?;

    raw.map(RawSessionRow::into_session).transpose()
}

fn session_from_row(row: &Row<'_>) -> Result<Session, DbError> {
    RawSessionRow::from_row(row)?.into_session()
}

fn device_from_row(row: &Row<'_>) -> Result<DeviceSummary, DbError> {
    let status: String = row.get(3)?;
    let latest_status = SessionStatus::parse(&status).ok_or(DbError::CorruptValue {
        column: "status",
        value: status.clone(),
    })?;

    Ok(DeviceSummary {
        device_id: row.get(0)?,
        session_count: row.get(1)?,
        latest_session_id: row.get(2)?,
        latest_status,
        latest_started_at: row.get(4)?,
        last_sample_at: row.get(5)?,
        last_power_w: row.get(6)?,
        active_session_id: row.get(7)?,
    })
}

struct RawSessionRow {
    transaction_id: String,
    session_id: String,
    device_id: String,
    started_at: String,
    ended_at: Option<String>,
    cumulative_energy_kwh: f64,
    cumulative_cost: f64,
    relay_state: String,
    budget: f64,
    energy_cap_kwh: f64,
    rate_per_kwh: f64,
    status: String,
    stop_reason: Option<String>,
    last_voltage: Option<f64>,
    last_current: Option<f64>,
    last_sample_at: Option<String>,
    actuator_error: Option<String>,
    updated_at: String,
    last_power_w: Option<f64>,
}

impl RawSessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            transaction_id: row.get(0)?,
            session_id: row.get(1)?,
            device_id: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            cumulative_energy_kwh: row.get(5)?,
            cumulative_cost: row.get(6)?,
            relay_state: row.get(7)?,
            budget: row.get(8)?,
            energy_cap_kwh: row.get(9)?,
            rate_per_kwh: row.get(10)?,
            status: row.get(11)?,
            stop_reason: row.get(12)?,
            last_voltage: row.get(13)?,
            last_current: row.get(14)?,
            last_sample_at: row.get(15)?,
            actuator_error: row.get(16)?,
            updated_at: row.get(17)?,
            last_power_w: row.get(18)?,
        })
    }

    fn into_session(self) -> Result<Session, DbError> {
        let status = SessionStatus::parse(&self.status).ok_or(DbError::CorruptValue {
            column: "status",
            value: self.status.clone(),
        })?;
        let relay_state = RelayState::parse(&self.relay_state).ok_or(DbError::CorruptValue {
            column: "relay_state",
            value: self.relay_state.clone(),
        })?;
        let stop_reason = self
            .stop_reason
            .map(|value| {
                StopReason::parse(&value).ok_or(DbError::CorruptValue {
                    column: "stop_reason",
                    value,
                })
            })
            .transpose()?;

        Ok(Session {
            transaction_id: self.transaction_id,
            session_id: self.session_id,
            device_id: self.device_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            cumulative_energy_kwh: self.cumulative_energy_kwh,
            cumulative_cost: self.cumulative_cost,
            relay_state,
            budget: self.budget,
            energy_cap_kwh: self.energy_cap_kwh,
            rate_per_kwh: self.rate_per_kwh,
            status,
            stop_reason,
            last_voltage: self.last_voltage,
            last_current: self.last_current,
            last_sample_at: self.last_sample_at,
            last_power_w: self.last_power_w,
            actuator_error: self.actuator_error,
            updated_at: self.updated_at,
        })
    }
}
