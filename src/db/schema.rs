/// Schema for the local store database.
pub const SCHEMA: &str = r#"
-- Caller entries (serialized JSON)
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Internal state records, kept apart from caller keys
CREATE TABLE IF NOT EXISTS breaker_state (
    name TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
