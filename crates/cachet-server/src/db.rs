use std::sync::{Arc, Mutex};

use rusqlite::Connection;

/// Server-side schema version. Bump when the schema changes.
const SERVER_SCHEMA_VERSION: i64 = 1;

/// Open (or create) the server `SQLite` database and run migrations.
pub fn open_server_db(path: &str) -> Result<Arc<Mutex<Connection>>, String> {
    let conn = Connection::open(path).map_err(|e| format!("failed to open server db: {e}"))?;
    init_connection(conn)
}

/// In-memory database for tests and ephemeral runs.
pub fn open_in_memory_db() -> Result<Arc<Mutex<Connection>>, String> {
    let conn =
        Connection::open_in_memory().map_err(|e| format!("failed to open in-memory db: {e}"))?;
    init_connection(conn)
}

fn init_connection(conn: Connection) -> Result<Arc<Mutex<Connection>>, String> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .map_err(|e| format!("failed to set WAL mode: {e}"))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .map_err(|e| format!("failed to enable foreign keys: {e}"))?;

    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if current != SERVER_SCHEMA_VERSION {
        if current != 0 {
            tracing::info!(
                old = current,
                new = SERVER_SCHEMA_VERSION,
                "server schema version mismatch — recreating"
            );
            drop_all_tables(&conn)?;
        }
        conn.execute_batch(SERVER_SCHEMA)
            .map_err(|e| format!("failed to run server schema: {e}"))?;
        conn.pragma_update(None, "user_version", SERVER_SCHEMA_VERSION)
            .map_err(|e| format!("failed to set schema version: {e}"))?;
    }

    Ok(Arc::new(Mutex::new(conn)))
}

/// Drop every user table so the schema can be cleanly re-applied.
fn drop_all_tables(conn: &Connection) -> Result<(), String> {
    conn.execute_batch("PRAGMA foreign_keys=OFF;")
        .map_err(|e| format!("failed to disable fks: {e}"))?;

    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
        .map_err(|e| format!("failed to list tables: {e}"))?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| format!("failed to query tables: {e}"))?
        .filter_map(Result::ok)
        .collect();
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))
            .map_err(|e| format!("failed to drop table {table}: {e}"))?;
    }

    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .map_err(|e| format!("failed to re-enable fks: {e}"))?;

    Ok(())
}

const SERVER_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    sender_id TEXT NOT NULL,
    salt BLOB NOT NULL,
    body BLOB NOT NULL,
    attachment_ref BLOB,
    shared_key_id TEXT,
    hmac BLOB NOT NULL,
    signature BLOB NOT NULL,
    sent_at INTEGER NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS deliveries (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    sender_id TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    state TEXT NOT NULL CHECK(state IN ('new','delivering','delivered','confirmed','failed','aborted')),
    key_id TEXT,
    encrypted_key BLOB,
    accepted_at INTEGER NOT NULL,
    state_changed_at INTEGER NOT NULL,
    client_notified_at INTEGER,
    PRIMARY KEY (message_id, receiver_id)
);

CREATE INDEX IF NOT EXISTS idx_deliveries_receiver_state
    ON deliveries(receiver_id, state);

CREATE INDEX IF NOT EXISTS idx_deliveries_sender_state
    ON deliveries(sender_id, state);

CREATE TABLE IF NOT EXISTS client_registrations (
    client_id TEXT PRIMARY KEY,
    gcm_package TEXT,
    gcm_registration_id TEXT,
    apns_token TEXT,
    apns_client_name TEXT,
    apns_production INTEGER NOT NULL DEFAULT 0,
    unread_count INTEGER NOT NULL DEFAULT 0,
    last_push_fingerprint TEXT,
    last_login_at INTEGER,
    last_ready_at INTEGER
);

CREATE TABLE IF NOT EXISTS group_memberships (
    group_id TEXT NOT NULL,
    client_id TEXT NOT NULL,
    role TEXT NOT NULL CHECK(role IN ('admin','member','nearby_member','worldwide_member')),
    state TEXT NOT NULL CHECK(state IN ('not_involved','invited','joined','suspended','removed')),
    encrypted_group_key BLOB,
    shared_key_id TEXT,
    key_supplier TEXT,
    key_date INTEGER,
    PRIMARY KEY (group_id, client_id)
);

CREATE TABLE IF NOT EXISTS group_presence (
    group_id TEXT PRIMARY KEY,
    shared_key_id TEXT,
    key_supplier TEXT,
    key_date INTEGER,
    rotation_started_at INTEGER
);

CREATE TABLE IF NOT EXISTS client_presence (
    client_id TEXT PRIMARY KEY,
    connectivity TEXT NOT NULL CHECK(connectivity IN ('offline','background','online','typing')),
    updated_at INTEGER NOT NULL
);
";
