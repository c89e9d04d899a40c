//! Investigation session manager.
//!
//! A session moves `created → running → {completed | failed | cancelled}`
//! and never leaves a terminal state. State and idempotency tokens live in
//! the SQLite catalog so each transition is one transaction; the immutable
//! session metadata lives in the segment manifest next to the session's
//! observations.

use crate::core::db;
use crate::core::error::{ErrorContext, SightlineError, io_at};
use crate::core::migration::{self, CURRENT_SCHEMA_VERSION};
use crate::core::storage::{self, SegmentIndex};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::boundary::BoundaryMap;
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const LATEST: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    File,
    Module,
    Package,
    Project,
}

impl SessionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionScope::File => "file",
            SessionScope::Module => "module",
            SessionScope::Package => "package",
            SessionScope::Project => "project",
        }
    }
}

impl FromStr for SessionScope {
    type Err = SightlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(SessionScope::File),
            "module" => Ok(SessionScope::Module),
            "package" => Ok(SessionScope::Package),
            "project" => Ok(SessionScope::Project),
            other => Err(SightlineError::validation(
                format!("unknown session scope '{}'", other),
                ErrorContext::none(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// The state `event` leads to, or `None` if the transition is illegal.
    pub fn apply(self, event: &SessionEvent) -> Option<SessionState> {
        match (self, event) {
            (SessionState::Created, SessionEvent::Start) => Some(SessionState::Running),
            (SessionState::Running, SessionEvent::Complete) => Some(SessionState::Completed),
            (SessionState::Running, SessionEvent::Fail { .. }) => Some(SessionState::Failed),
            (SessionState::Running, SessionEvent::Cancel) => Some(SessionState::Cancelled),
            _ => None,
        }
    }
}

impl FromStr for SessionState {
    type Err = SightlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(SessionState::Created),
            "running" => Ok(SessionState::Running),
            "completed" => Ok(SessionState::Completed),
            "failed" => Ok(SessionState::Failed),
            "cancelled" => Ok(SessionState::Cancelled),
            other => Err(SightlineError::corruption(
                format!("unknown session state '{}' in catalog", other),
                ErrorContext::none(),
            )),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Start,
    Complete,
    /// Unrecoverable collector error; `context` is kept on the session.
    Fail { context: String },
    Cancel,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Start => "start",
            SessionEvent::Complete => "complete",
            SessionEvent::Fail { .. } => "fail",
            SessionEvent::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub scope: SessionScope,
    pub intent: String,
    pub target: PathBuf,
    pub state: SessionState,
    pub created_at: String,
    pub updated_at: String,
    pub failure_context: Option<String>,
    pub observation_ids: Vec<String>,
}

/// Immutable per-session metadata published in the segment directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub schema_version: u32,
    pub session_id: String,
    pub scope: SessionScope,
    pub intent: String,
    pub target: PathBuf,
    pub created_at: String,
    pub policy: BoundaryMap,
}

/// Directory that observation subjects must stay inside.
pub fn investigation_root(target: &Path) -> &Path {
    if target.is_file() {
        target.parent().unwrap_or(target)
    } else {
        target
    }
}

#[derive(Debug, Clone)]
pub struct SessionManager {
    store: Store,
}

impl SessionManager {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
        }
    }

    /// Register a new investigation and publish its segment manifest.
    pub fn create(
        &self,
        scope: SessionScope,
        intent: &str,
        target: &Path,
        policy: &BoundaryMap,
    ) -> Result<Session, SightlineError> {
        if intent.trim().is_empty() {
            return Err(SightlineError::validation(
                "intent must not be empty",
                ErrorContext::path(target),
            ));
        }
        let target = target.canonicalize().map_err(|e| {
            SightlineError::validation(
                format!("target is not readable: {}", e),
                ErrorContext::path(target),
            )
        })?;
        if scope == SessionScope::File && !target.is_file() {
            return Err(SightlineError::validation(
                "file scope requires a file target",
                ErrorContext::path(&target),
            ));
        }
        policy.compile()?;

        let id = time::new_id();
        let now = time::now_epoch_z();
        let manifest = SessionManifest {
            schema_version: CURRENT_SCHEMA_VERSION,
            session_id: id.clone(),
            scope,
            intent: intent.to_string(),
            target: target.clone(),
            created_at: now.clone(),
            policy: policy.clone(),
        };

        let segment = self.store.segment(&id);
        fs::create_dir_all(&segment.dir).map_err(io_at(&segment.dir))?;
        let registered = storage::write_json(&segment.manifest(), &manifest).and_then(|_| {
            let conn = db::open_catalog(&self.store.catalog_path())?;
            conn.execute(
                "INSERT INTO sessions(id, scope, intent, target, state, created_at, updated_at, failure_context)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
                params![
                    id,
                    scope.as_str(),
                    intent,
                    target.to_string_lossy(),
                    SessionState::Created.as_str(),
                    now,
                    now
                ],
            )?;
            Ok(())
        });
        if let Err(err) = registered {
            let _ = fs::remove_dir_all(&segment.dir);
            return Err(err);
        }

        tracing::info!(session_id = %id, scope = scope.as_str(), target = %target.display(), "session created");
        Ok(Session {
            id,
            scope,
            intent: intent.to_string(),
            target,
            state: SessionState::Created,
            created_at: now.clone(),
            updated_at: now,
            failure_context: None,
            observation_ids: Vec::new(),
        })
    }

    /// Apply `event`. The new state is committed before this returns; a token
    /// that was already applied to this session is a no-op.
    pub fn advance(
        &self,
        session_id: &str,
        event: SessionEvent,
        idempotency_token: &str,
    ) -> Result<Session, SightlineError> {
        let ctx = || ErrorContext::session(session_id);
        if idempotency_token.trim().is_empty() {
            return Err(SightlineError::validation("idempotency token must not be empty", ctx()));
        }

        let mut conn = db::open_catalog(&self.store.catalog_path())?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let seen: Option<String> = tx
            .query_row(
                "SELECT session_id FROM session_transitions WHERE idempotency_token = ?1",
                [idempotency_token],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(owner) = seen {
            tx.commit()?;
            if owner != session_id {
                return Err(SightlineError::validation(
                    format!("idempotency token already used by session {}", owner),
                    ctx(),
                ));
            }
            return self.get(session_id);
        }

        let current: Option<String> = tx
            .query_row(
                "SELECT state FROM sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(SightlineError::not_found(format!("session {}", session_id), ctx()));
        };
        let from = SessionState::from_str(&current)?;
        let Some(to) = from.apply(&event) else {
            return Err(SightlineError::validation(
                format!("illegal transition: '{}' from state {}", event.name(), from),
                ctx(),
            ));
        };

        let now = time::now_epoch_z();
        let failure_context = match &event {
            SessionEvent::Fail { context } => Some(context.clone()),
            _ => None,
        };
        tx.execute(
            "UPDATE sessions SET state = ?1, updated_at = ?2, failure_context = COALESCE(?3, failure_context)
             WHERE id = ?4",
            params![to.as_str(), now, failure_context, session_id],
        )?;
        tx.execute(
            "INSERT INTO session_transitions(idempotency_token, session_id, event, from_state, to_state, ts)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![idempotency_token, session_id, event.name(), from.as_str(), to.as_str(), now],
        )?;
        tx.commit()?;

        tracing::info!(session_id, from = from.as_str(), to = to.as_str(), "session advanced");
        self.get(session_id)
    }

    /// Look up by id, or the most recently created session for `"latest"`.
    pub fn get(&self, selector: &str) -> Result<Session, SightlineError> {
        let conn = db::open_catalog(&self.store.catalog_path())?;
        let sql = if selector == LATEST {
            "SELECT id, scope, intent, target, state, created_at, updated_at, failure_context
             FROM sessions ORDER BY rowid DESC LIMIT 1"
        } else {
            "SELECT id, scope, intent, target, state, created_at, updated_at, failure_context
             FROM sessions WHERE id = ?1"
        };
        let mut stmt = conn.prepare(sql)?;
        let row = if selector == LATEST {
            stmt.query_row([], read_row).optional()?
        } else {
            stmt.query_row([selector], read_row).optional()?
        };
        let Some(row) = row else {
            return Err(SightlineError::not_found(
                format!("session {}", selector),
                ErrorContext::session(selector),
            ));
        };
        self.hydrate(row)
    }

    /// All sessions, newest first.
    pub fn list(&self) -> Result<Vec<Session>, SightlineError> {
        let conn = db::open_catalog(&self.store.catalog_path())?;
        let mut stmt = conn.prepare(
            "SELECT id, scope, intent, target, state, created_at, updated_at, failure_context
             FROM sessions ORDER BY rowid DESC",
        )?;
        let rows = stmt.query_map([], read_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(self.hydrate(row?)?);
        }
        Ok(out)
    }

    /// Segment manifest, upgraded to the current format if needed.
    pub fn manifest(&self, session_id: &str) -> Result<SessionManifest, SightlineError> {
        let segment = self.store.segment(session_id);
        if !segment.exists() {
            return Err(SightlineError::not_found(
                format!("segment for session {}", session_id),
                ErrorContext::session(session_id).with_path(&segment.dir),
            ));
        }
        migration::check_and_migrate(&segment)?;
        storage::read_json(&segment.manifest())
    }

    fn hydrate(&self, row: CatalogRow) -> Result<Session, SightlineError> {
        // Index entries only parse in the current format.
        let segment = self.store.segment(&row.id);
        migration::check_and_migrate(&segment)?;
        let index = SegmentIndex::load(&segment)?;
        Ok(Session {
            scope: SessionScope::from_str(&row.scope)?,
            state: SessionState::from_str(&row.state)?,
            target: PathBuf::from(row.target),
            intent: row.intent,
            created_at: row.created_at,
            updated_at: row.updated_at,
            failure_context: row.failure_context,
            observation_ids: index.ids(),
            id: row.id,
        })
    }
}

struct CatalogRow {
    id: String,
    scope: String,
    intent: String,
    target: String,
    state: String,
    created_at: String,
    updated_at: String,
    failure_context: Option<String>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogRow> {
    Ok(CatalogRow {
        id: row.get(0)?,
        scope: row.get(1)?,
        intent: row.get(2)?,
        target: row.get(3)?,
        state: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        failure_context: row.get(7)?,
    })
}
