//! Session catalog schema.
//!
//! The catalog is the authority for session state and for the idempotency
//! tokens that make `advance` safe to repeat. Observations themselves never
//! live here; they belong to the per-session segment files.

pub const SESSIONS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        scope TEXT NOT NULL,
        intent TEXT NOT NULL,
        target TEXT NOT NULL,
        state TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        failure_context TEXT
    )
";

pub const SESSIONS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at)";

pub const TRANSITIONS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS session_transitions (
        idempotency_token TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        event TEXT NOT NULL,
        from_state TEXT NOT NULL,
        to_state TEXT NOT NULL,
        ts TEXT NOT NULL,
        FOREIGN KEY(session_id) REFERENCES sessions(id)
    )
";
