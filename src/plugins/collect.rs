//! Collector driver.
//!
//! Runs a sequence of collection steps against one session and drives its
//! lifecycle: `start` before the first step, then exactly one of `complete`,
//! `cancel` or `fail`. Buffered observations are flushed before any terminal
//! transition so nothing already collected is lost. A ledger write that
//! fails with an I/O error ends the run as `fail`, never leaving the session
//! `running`.

use crate::core::cancel::CancellationToken;
use crate::core::error::SightlineError;
use crate::plugins::ledger::{Ledger, Payload};
use crate::plugins::session::{SessionEvent, SessionState};
use serde::{Deserialize, Serialize};
use std::io;

/// One fact produced by a collection step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorFact {
    pub subject: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub session_id: String,
    pub final_state: SessionState,
    pub observations_appended: usize,
    pub failure_context: Option<String>,
}

fn token(session_id: &str, event: &SessionEvent) -> String {
    format!("{}:collector:{}", session_id, event.name())
}

/// Drive `steps` to completion. A step yielding an I/O error, or a ledger
/// write failing with one, fails the session with that error as context.
/// A cancelled `token` is honoured before the next step is pulled. Other
/// ledger errors are returned as `Err`.
pub fn run_collector<I>(
    ledger: &Ledger,
    session_id: &str,
    steps: I,
    cancel: &CancellationToken,
) -> Result<CollectionSummary, SightlineError>
where
    I: IntoIterator<Item = Result<CollectorFact, io::Error>>,
{
    let sessions = ledger.sessions();
    let session = sessions.get(session_id)?;
    if session.state == SessionState::Created {
        sessions.advance(session_id, SessionEvent::Start, &token(session_id, &SessionEvent::Start))?;
    }

    let mut writer = ledger.writer(session_id)?;
    let mut steps = steps.into_iter();
    let mut appended = 0usize;
    let mut outcome = SessionEvent::Complete;
    let mut write_failure = None;

    loop {
        if cancel.is_cancelled() {
            tracing::info!(session_id, appended, "collection cancelled");
            outcome = SessionEvent::Cancel;
            break;
        }
        let Some(step) = steps.next() else {
            break;
        };
        match step {
            Ok(fact) => match writer.append(&fact.subject, fact.payload) {
                Ok(_) => appended += 1,
                Err(err @ SightlineError::IoError { .. }) => {
                    write_failure = Some(err);
                    break;
                }
                Err(err) => return Err(err),
            },
            Err(err) => {
                tracing::warn!(session_id, error = %err, "collection step failed");
                outcome = SessionEvent::Fail {
                    context: err.to_string(),
                };
                break;
            }
        }
    }

    let flushed = match write_failure {
        Some(err) => {
            let dropped = writer.abandon();
            tracing::warn!(session_id, dropped, "abandoning buffered observations");
            Err(err)
        }
        None => writer.finish().map(|_| ()),
    };
    match flushed {
        Ok(()) => {}
        Err(err @ SightlineError::IoError { .. }) => {
            tracing::warn!(session_id, error = %err, "ledger write failed during collection");
            outcome = SessionEvent::Fail {
                context: format!("ledger write failed: {}", err),
            };
        }
        Err(err) => return Err(err),
    }

    let session = sessions.advance(session_id, outcome.clone(), &token(session_id, &outcome))?;

    Ok(CollectionSummary {
        session_id: session_id.to_string(),
        final_state: session.state,
        observations_appended: appended,
        failure_context: session.failure_context,
    })
}
