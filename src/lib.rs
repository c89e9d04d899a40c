//! Sightline: an evidence engine for code investigations.
//!
//! Sightline records what was directly observed about a codebase into an
//! immutable, content-hashed ledger and derives everything else from it.
//! Findings are never stored: boundary violations and pattern matches are
//! recomputed from the observations on every query, so the same session
//! always yields the same answers.
//!
//! # Architecture
//!
//! ## Sessions
//!
//! Each investigation is a session with a small state machine
//! (`created -> running -> completed | failed | cancelled`). Transitions are
//! idempotent per caller-supplied token and committed to the catalog before
//! they are reported.
//!
//! ## Storage
//!
//! Every session owns a segment: an append-only framed log plus an offset
//! index. Republishing the index is the commit point, so a crash at any
//! moment leaves either the old or the new committed prefix, never a mix.
//! A single writer per segment is enforced with a lock file that carries a
//! heartbeat and is reclaimed once stale.
//!
//! ## Derivations
//!
//! - [`plugins::boundary`]: layer policy violations over import observations
//! - [`plugins::patterns`]: rule matches and z-score outliers
//!
//! # Crate Structure
//!
//! - [`core`]: storage, locking, migration, config and shared types
//! - [`plugins`]: ledger, sessions, collector driver and derivations

pub mod core;
pub mod plugins;

use crate::core::config::EngineConfig;
use crate::core::error::SightlineError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::boundary::{self, BoundaryMap, ViolationReport};
use crate::plugins::ledger::{IntegrityReport, Ledger};
use crate::plugins::patterns::{self, PatternEngine, PatternReport};
use crate::plugins::session::{Session, SessionManager, SessionScope};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::path::Path;

/// Query surface over one store.
#[derive(Debug, Clone)]
pub struct Investigator {
    store: Store,
    ledger: Ledger,
}

impl Investigator {
    /// Open the store at `root`, loading `sightline.toml` from it if present.
    pub fn open(root: &Path) -> Result<Self, SightlineError> {
        let store = Store::open(root)?;
        let config = EngineConfig::load(&store.config_path())?;
        Ok(Self::with_config(store, config))
    }

    pub fn with_config(store: Store, config: EngineConfig) -> Self {
        let ledger = Ledger::new(&store, &config);
        Self { store, ledger }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn sessions(&self) -> &SessionManager {
        self.ledger.sessions()
    }

    pub fn create_session(
        &self,
        target: &Path,
        scope: SessionScope,
        intent: &str,
        policy: &BoundaryMap,
    ) -> Result<String, SightlineError> {
        Ok(self.sessions().create(scope, intent, target, policy)?.id)
    }

    /// `selector` is a session id or `"latest"`.
    pub fn get_session(&self, selector: &str) -> Result<Session, SightlineError> {
        self.sessions().get(selector)
    }

    pub fn verify_integrity(&self, session_id: &str) -> Result<IntegrityReport, SightlineError> {
        self.ledger.verify_integrity(session_id)
    }

    pub fn list_violations(&self, session_id: &str) -> Result<ViolationReport, SightlineError> {
        boundary::check_session(&self.ledger, session_id)
    }

    /// Run the default detectors plus any rules in `patterns.toml`.
    pub fn list_pattern_matches(&self, session_id: &str) -> Result<PatternReport, SightlineError> {
        let rules = patterns::load_rules(&self.store.rules_path())?;
        PatternEngine::new(&self.ledger.config().patterns)
            .with_rules(rules)
            .run(&self.ledger, session_id)
    }
}

/// Wrap a query result in the command response envelope.
pub fn envelope<T: Serialize>(cmd: &str, result: &Result<T, SightlineError>) -> JsonValue {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(data) => time::command_envelope(cmd, "ok", serde_json::json!({ "data": data })),
            Err(err) => time::command_envelope(
                cmd,
                "error",
                serde_json::json!({ "error": { "kind": "serde", "message": err.to_string() } }),
            ),
        },
        Err(err) => time::command_envelope(
            cmd,
            "error",
            serde_json::json!({ "error": { "kind": err.kind(), "message": err.to_string() } }),
        ),
    }
}
