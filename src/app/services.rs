use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::DbError;
use crate::domain::models::{
    DeviceSummary, LogEventRecord, NewLogEventRecord, NewSession, Session, SessionUpdate,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

/// Session persistence, keyed by transaction id and by session id.
pub trait SessionStore: Send + Sync {
    /// Returns `false` when a record for the transaction already exists.
    fn create_if_absent(&self, new_session: &NewSession) -> Result<bool, ServiceError>;
    fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Session>, ServiceError>;
    fn get_by_session_id(&self, session_id: &str) -> Result<Option<Session>, ServiceError>;
    /// Compare-and-set on the stored status; `false` when the guard missed.
    fn update(&self, session_id: &str, update: &SessionUpdate) -> Result<bool, ServiceError>;
    fn list_unfinished(&self) -> Result<Vec<Session>, ServiceError>;
    fn record_event(&self, event: &NewLogEventRecord) -> Result<String, ServiceError>;
}

pub trait DiagnosticsQueryHandler {
    fn get_schema_version(&self) -> Result<u32, ServiceError>;
    fn count_sessions(&self) -> Result<i64, ServiceError>;
    fn count_log_events(&self) -> Result<i64, ServiceError>;
    fn list_recent_log_events(&self, limit: u32) -> Result<Vec<LogEventRecord>, ServiceError>;
}

/// Devices are known through the sessions started on them.
pub trait DeviceQueryHandler {
    fn list_devices(&self) -> Result<Vec<DeviceSummary>, ServiceError>;
    fn get_device(&self, device_id: &str) -> Result<Option<DeviceSummary>, ServiceError>;
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }
}

impl SessionStore for SqliteSessionStore {
    fn create_if_absent(&self, new_session: &NewSession) -> Result<bool, ServiceError> {
        self.with_connection(|connection| db::create_session_if_absent(connection, new_session))
    }

    fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Session>, ServiceError> {
        self.with_connection(|connection| {
            db::get_session_by_transaction_id(connection, transaction_id)
        })
    }

    fn get_by_session_id(&self, session_id: &str) -> Result<Option<Session>, ServiceError> {
        self.with_connection(|connection| db::get_session_by_session_id(connection, session_id))
    }

    fn update(&self, session_id: &str, update: &SessionUpdate) -> Result<bool, ServiceError> {
        self.with_connection(|connection| db::update_session(connection, session_id, update))
    }

    fn list_unfinished(&self) -> Result<Vec<Session>, ServiceError> {
        self.with_connection(db::list_unfinished_sessions)
    }

    fn record_event(&self, event: &NewLogEventRecord) -> Result<String, ServiceError> {
        self.with_connection(|connection| db::insert_log_event(connection, event))
    }
}

impl DiagnosticsQueryHandler for SqliteSessionStore {
    fn get_schema_version(&self) -> Result<u32, ServiceError> {
        self.with_connection(db::schema_version)
    }

    fn count_sessions(&self) -> Result<i64, ServiceError> {
        self.with_connection(db::count_sessions)
    }

    fn count_log_events(&self) -> Result<i64, ServiceError> {
        self.with_connection(db::count_log_events)
    }

    fn list_recent_log_events(&self, limit: u32) -> Result<Vec<LogEventRecord>, ServiceError> {
        self.with_connection(|connection| db::list_recent_log_events(connection, limit))
    }
}

impl DeviceQueryHandler for SqliteSessionStore {
    fn list_devices(&self) -> Result<Vec<DeviceSummary>, ServiceError> {
        self.with_connection(db::list_devices)
    }

    fn get_device(&self, device_id: &str) -> Result<Option<DeviceSummary>, ServiceError> {
        self.with_connection(|connection| db::get_device(connection, device_id))
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Read-only lookups over the session store.
#[derive(Clone)]
pub struct SessionQueryService {
    store: Arc<dyn SessionStore>,
}

impl SessionQueryService {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn get_by_transaction_id(&self, transaction_id: &str) -> Result<Session, QueryError> {
        self.store
            .get_by_transaction_id(transaction_id)?
            .ok_or_else(|| QueryError::NotFound(transaction_id.to_string()))
    }

    pub fn get_by_session_id(&self, session_id: &str) -> Result<Session, QueryError> {
        self.store
            .get_by_session_id(session_id)?
            .ok_or_else(|| QueryError::NotFound(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        DeviceQueryHandler, DiagnosticsQueryHandler, QueryError, SessionQueryService,
        SessionStore,
    };
    use crate::adapters::db::LATEST_SCHEMA_VERSION;
    use crate::domain::models::{NewSession, SessionStatus};
    use crate::test_support::open_test_store;

    fn new_session(transaction_id: &str) -> NewSession {
        NewSession {
            transaction_id: transaction_id.to_string(),
            session_id: format!("session-{transaction_id}"),
            device_id: "wallbox-1".to_string(),
            started_at: "2026-02-20T10:00:00.000Z".to_string(),
            budget: 50.0,
            energy_cap_kwh: 0.0,
            rate_per_kwh: 20.0,
        }
    }

    #[test]
    fn query_service_finds_session_by_either_key() {
        let store = open_test_store("query-either-key");
        store
            .create_if_absent(&new_session("tx-7"))
            .expect("insert should succeed");
        let queries = SessionQueryService::new(Arc::new(store));

        let by_transaction = queries
            .get_by_transaction_id("tx-7")
            .expect("lookup by transaction id");
        let by_session = queries
            .get_by_session_id("session-tx-7")
            .expect("lookup by session id");

        assert_eq!(by_transaction, by_session);
        assert_eq!(by_session.status, SessionStatus::Pending);
    }

    #[test]
    fn query_service_reports_not_found() {
        let queries = SessionQueryService::new(Arc::new(open_test_store("query-missing")));

        match queries.get_by_session_id("session-none") {
            Err(QueryError::NotFound(key)) => assert_eq!(key, "session-none"),
            other => panic!("expected not found, got {other:?}"),
        }
        assert!(matches!(
            queries.get_by_transaction_id("none"),
            Err(QueryError::NotFound(_))
        ));
    }

    #[test]
    fn diagnostics_reflect_store_contents() {
        let store = open_test_store("diagnostics-counts");
        store
            .create_if_absent(&new_session("tx-1"))
            .expect("insert should succeed");

        assert_eq!(
            store.get_schema_version().expect("version"),
            LATEST_SCHEMA_VERSION
        );
        assert_eq!(store.count_sessions().expect("count"), 1);
        assert_eq!(store.count_log_events().expect("count"), 0);
        assert!(
            store
                .list_recent_log_events(10)
                .expect("list")
                .is_empty()
        );
    }

    #[test]
    fn device_lookups_go_through_the_store() {
        let store = open_test_store("device-lookups");
        for transaction_id in ["tx-1", "tx-2"] {
            store
                .create_if_absent(&new_session(transaction_id))
                .expect("insert should succeed");
        }

        let devices = store.list_devices().expect("list");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].session_count, 2);

        let device = store
            .get_device("wallbox-1")
            .expect("lookup")
            .expect("device should exist");
        assert_eq!(device.latest_session_id, "session-tx-2");
        assert!(store.get_device("wallbox-9").expect("lookup").is_none());
    }
}
