use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use rusqlite::Connection;
use tempfile::TempDir;

use crate::adapters::db::{open_connection, run_migrations};
use crate::app::services::SqliteSessionStore;
use crate::domain::models::{NewSession, derive_session_id};

static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Migrated once per test binary; every test gets its own file copy.
fn template() -> &'static Path {
    static TEMPLATE: OnceLock<(TempDir, PathBuf)> = OnceLock::new();

    let (_, path) = TEMPLATE.get_or_init(|| {
        let dir = tempfile::tempdir().expect("template dir should be created");
        let path = dir.path().join("template.sqlite");
        let mut connection =
            open_connection(path.to_string_lossy().as_ref()).expect("template db should open");
        run_migrations(&mut connection).expect("template migrations should succeed");
        (dir, path)
    });
    path
}

fn scratch_dir() -> &'static Path {
    static SCRATCH: OnceLock<TempDir> = OnceLock::new();
    SCRATCH
        .get_or_init(|| tempfile::tempdir().expect("scratch dir should be created"))
        .path()
}

pub fn open_test_connection(test_name: &str) -> Connection {
    let counter = DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = scratch_dir().join(format!("{test_name}-{counter}.sqlite"));

    std::fs::copy(template(), &path).expect("template db should be copied");
    open_connection(path.to_string_lossy().as_ref()).expect("test db should open")
}

pub fn open_test_store(test_name: &str) -> SqliteSessionStore {
    SqliteSessionStore::new(Arc::new(Mutex::new(open_test_connection(test_name))))
}

/// A PENDING session on `wallbox-1`: budget 10, no cap, rate 20.
pub fn pending_session(transaction_id: &str, started_at: &str) -> NewSession {
    NewSession {
        transaction_id: transaction_id.to_string(),
        session_id: derive_session_id(transaction_id),
        device_id: "wallbox-1".to_string(),
        started_at: started_at.to_string(),
        budget: 10.0,
        energy_cap_kwh: 0.0,
        rate_per_kwh: 20.0,
    }
}
