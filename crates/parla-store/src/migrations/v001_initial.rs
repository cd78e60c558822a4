//! v001 -- Initial schema creation.
//!
//! A single key/value table holding client-local preferences as JSON text.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS local_state (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,              -- JSON document
    updated_at TEXT NOT NULL               -- RFC-3339
);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
