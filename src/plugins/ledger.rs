//! Observation ledger.
//!
//! Append-only, content-hashed store of directly observed facts, one segment
//! per session. Each observation is one of four closed payload variants and
//! carries the limitation statements of its type, so consumers always see
//! what an observation can *not* tell them.
//!
//! Writes go through a [`LedgerWriter`], which holds the segment's writer
//! lock and buffers at most `flush_threshold` records before a durable flush.
//! Reads go through an [`ObservationReader`], which only ever sees records
//! referenced by the last published index and re-verifies every hash.

use crate::core::config::EngineConfig;
use crate::core::error::{ErrorContext, SightlineError, io_at};
use crate::core::lock::SessionLock;
use crate::core::storage::{IndexEntry, PendingRecord, SegmentIndex, SegmentLog, SegmentReader};
use crate::core::store::{SegmentPaths, Store};
use crate::core::time;
use crate::plugins::session::{SessionEvent, SessionManager, SessionState, investigation_root};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    File,
    Import,
    Export,
    Boundary,
}

impl ObservationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationKind::File => "file",
            ObservationKind::Import => "import",
            ObservationKind::Export => "export",
            ObservationKind::Boundary => "boundary",
        }
    }

    /// What an observation of this type cannot establish.
    pub fn limitations(&self) -> &'static [&'static str] {
        match self {
            ObservationKind::File => &[
                "records size, line count and digest only; says nothing about what the file does",
            ],
            ObservationKind::Import => &[
                "syntactic import statements only; dynamic or computed import expressions are not captured",
                "an import records a reference, not that the referenced code is executed",
            ],
            ObservationKind::Export => &[
                "records declared exports only; re-exports produced at runtime are not captured",
            ],
            ObservationKind::Boundary => &[
                "records a crossing reported by a collector; the mechanism label is taken verbatim",
            ],
        }
    }
}

impl fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFacts {
    pub size_bytes: u64,
    pub line_count: u64,
    pub content_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFacts {
    /// Imported path exactly as written, root-relative or `./`/`../` relative.
    pub target: String,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub statement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFacts {
    pub symbol: String,
    #[serde(default)]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryFacts {
    pub target: String,
    pub mechanism: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    File(FileFacts),
    Import(ImportFacts),
    Export(ExportFacts),
    Boundary(BoundaryFacts),
}

impl Payload {
    pub fn kind(&self) -> ObservationKind {
        match self {
            Payload::File(_) => ObservationKind::File,
            Payload::Import(_) => ObservationKind::Import,
            Payload::Export(_) => ObservationKind::Export,
            Payload::Boundary(_) => ObservationKind::Boundary,
        }
    }

    pub fn to_json(&self) -> Result<JsonValue, SightlineError> {
        let value = match self {
            Payload::File(f) => serde_json::to_value(f)?,
            Payload::Import(i) => serde_json::to_value(i)?,
            Payload::Export(e) => serde_json::to_value(e)?,
            Payload::Boundary(b) => serde_json::to_value(b)?,
        };
        Ok(value)
    }

    pub fn from_json(kind: ObservationKind, value: JsonValue) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ObservationKind::File => Payload::File(serde_json::from_value(value)?),
            ObservationKind::Import => Payload::Import(serde_json::from_value(value)?),
            ObservationKind::Export => Payload::Export(serde_json::from_value(value)?),
            ObservationKind::Boundary => Payload::Boundary(serde_json::from_value(value)?),
        })
    }

    fn validate(&self, ctx: &ErrorContext) -> Result<(), SightlineError> {
        let empty = match self {
            Payload::File(f) => f.content_digest.is_empty(),
            Payload::Import(i) => i.target.trim().is_empty(),
            Payload::Export(e) => e.symbol.trim().is_empty(),
            Payload::Boundary(b) => b.target.trim().is_empty() || b.mechanism.trim().is_empty(),
        };
        if empty {
            return Err(SightlineError::validation(
                format!("{} payload has an empty required field", self.kind()),
                ctx.clone(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub id: String,
    pub session_id: String,
    pub kind: ObservationKind,
    pub subject: String,
    pub payload: Payload,
    /// Milliseconds since the unix epoch.
    pub captured_at: u64,
    pub content_hash: String,
    pub limitations: Vec<String>,
}

/// On-disk record shape.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    session_id: String,
    #[serde(rename = "type")]
    kind: ObservationKind,
    subject: String,
    payload: JsonValue,
    captured_at: u64,
    limitations: Vec<String>,
    hash: String,
}

/// SHA-256 over the canonical JSON of `(type, subject, payload, captured_at)`.
pub fn content_hash(
    kind: ObservationKind,
    subject: &str,
    payload: &JsonValue,
    captured_at: u64,
) -> Result<String, SightlineError> {
    let canonical = serde_json::json!({
        "type": kind,
        "subject": subject,
        "payload": payload,
        "captured_at": captured_at,
    });
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&canonical)?);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Resolve `subject` against `root` lexically and return it root-relative
/// with `/` separators. Anything that escapes `root` is rejected.
pub fn normalize_subject(root: &Path, subject: &str, ctx: &ErrorContext) -> Result<String, SightlineError> {
    let raw = Path::new(subject);
    let relative = if raw.is_absolute() {
        raw.strip_prefix(root).map_err(|_| {
            SightlineError::validation(
                format!("subject '{}' lies outside investigation root", subject),
                ctx.clone().with_path(root),
            )
        })?
    } else {
        raw
    };

    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SightlineError::validation(
                        format!("subject '{}' escapes investigation root", subject),
                        ctx.clone().with_path(root),
                    ));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SightlineError::validation(
                    format!("subject '{}' lies outside investigation root", subject),
                    ctx.clone().with_path(root),
                ));
            }
        }
    }
    if parts.is_empty() {
        return Err(SightlineError::validation(
            "subject must name something inside the investigation root",
            ctx.clone().with_path(root),
        ));
    }
    Ok(parts.join("/"))
}

/// Stream a target file in `chunk_bytes` blocks. The target is opened
/// read-only and never held in memory as a whole.
pub fn observe_file(path: &Path, chunk_bytes: usize) -> Result<FileFacts, SightlineError> {
    let mut file = File::open(path).map_err(io_at(path))?;
    let mut buf = vec![0u8; chunk_bytes.max(1)];
    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;
    let mut newlines = 0u64;
    let mut last_byte = None;

    loop {
        let n = file.read(&mut buf).map_err(io_at(path))?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        hasher.update(chunk);
        size_bytes += n as u64;
        newlines += chunk.iter().filter(|b| **b == b'\n').count() as u64;
        last_byte = chunk.last().copied();
    }

    let line_count = match last_byte {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    };
    Ok(FileFacts {
        size_bytes,
        line_count,
        content_digest: format!("{:x}", hasher.finalize()),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionEvidence {
    pub record_id: String,
    pub offset: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub session_id: String,
    pub records_checked: usize,
    pub is_corrupt: bool,
    pub corruption_count: usize,
    pub evidence: Vec<CorruptionEvidence>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    store: Store,
    config: EngineConfig,
    sessions: SessionManager,
}

impl Ledger {
    pub fn new(store: &Store, config: &EngineConfig) -> Self {
        Self {
            store: store.clone(),
            config: config.clone(),
            sessions: SessionManager::new(store),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Take the session's writer lock. Fails if the session is terminal or
    /// another live process is writing.
    pub fn writer(&self, session_id: &str) -> Result<LedgerWriter<'_>, SightlineError> {
        let session = self.sessions.get(session_id)?;
        if session.state.is_terminal() {
            return Err(SightlineError::validation(
                format!("session is {}; appends are closed", session.state),
                ErrorContext::session(session_id),
            ));
        }
        let manifest = self.sessions.manifest(session_id)?;
        let paths = self.store.segment(session_id);
        let lock = SessionLock::acquire(&paths.lock(), session_id, self.config.lock.stale_after())?;
        let log = SegmentLog::open(&paths, self.config.ledger.max_frame_bytes)?;

        Ok(LedgerWriter {
            ledger: self,
            session_id: session_id.to_string(),
            root: investigation_root(&manifest.target).to_path_buf(),
            lock,
            log,
            pending: Vec::new(),
            state: session.state,
        })
    }

    /// Append a single observation and flush it durably.
    pub fn append(
        &self,
        session_id: &str,
        subject: &str,
        payload: Payload,
    ) -> Result<Observation, SightlineError> {
        let mut writer = self.writer(session_id)?;
        let observation = writer.append(subject, payload)?;
        writer.finish()?;
        Ok(observation)
    }

    /// Lazy reader over the session's committed observations, in append order.
    pub fn read(&self, session_id: &str) -> Result<ObservationReader, SightlineError> {
        let paths = self.segment_for_read(session_id)?;
        let index = SegmentIndex::load(&paths)?;
        let reader = SegmentReader::open(&paths)?;
        Ok(ObservationReader {
            session_id: session_id.to_string(),
            index,
            reader,
            pos: 0,
        })
    }

    /// Full non-throwing scan for diagnostics. Only a missing session or an
    /// unreadable index aborts the scan.
    pub fn verify_integrity(&self, session_id: &str) -> Result<IntegrityReport, SightlineError> {
        let mut reader = self.read(session_id)?;
        let mut evidence = Vec::new();
        let mut records_checked = 0;

        while let Some((entry, result)) = reader.next_with_entry() {
            records_checked += 1;
            if let Err(err) = result {
                tracing::warn!(session_id, record_id = %entry.id, error = %err, "integrity check failed");
                evidence.push(CorruptionEvidence {
                    record_id: entry.id.clone(),
                    offset: entry.offset,
                    reason: err.to_string(),
                });
            }
        }

        Ok(IntegrityReport {
            session_id: session_id.to_string(),
            records_checked,
            is_corrupt: !evidence.is_empty(),
            corruption_count: evidence.len(),
            evidence,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn segment_for_read(&self, session_id: &str) -> Result<SegmentPaths, SightlineError> {
        // Existence comes from the catalog so unknown ids are NotFound, not I/O.
        self.sessions.get(session_id)?;
        self.sessions.manifest(session_id)?;
        Ok(self.store.segment(session_id))
    }
}

/// Buffered single-writer handle on one session's segment.
pub struct LedgerWriter<'a> {
    ledger: &'a Ledger,
    session_id: String,
    root: PathBuf,
    lock: SessionLock,
    log: SegmentLog,
    pending: Vec<PendingRecord>,
    state: SessionState,
}

impl LedgerWriter<'_> {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Buffer one observation; flushes once the pending buffer is full.
    /// The first append of a `created` session moves it to `running`.
    pub fn append(&mut self, subject: &str, payload: Payload) -> Result<Observation, SightlineError> {
        let ctx = ErrorContext::session(&self.session_id);
        let subject = normalize_subject(&self.root, subject, &ctx)?;
        payload.validate(&ctx)?;
        self.ensure_running()?;

        let kind = payload.kind();
        let payload_json = payload.to_json()?;
        let captured_at = time::now_millis();
        let hash = content_hash(kind, &subject, &payload_json, captured_at)?;
        let id = time::new_id();
        let limitations: Vec<String> = kind.limitations().iter().map(|s| s.to_string()).collect();

        let record = StoredRecord {
            id: id.clone(),
            session_id: self.session_id.clone(),
            kind,
            subject: subject.clone(),
            payload: payload_json,
            captured_at,
            limitations: limitations.clone(),
            hash: hash.clone(),
        };
        self.pending.push(PendingRecord {
            id: id.clone(),
            hash: hash.clone(),
            body: serde_json::to_vec(&record)?,
        });
        tracing::debug!(session_id = %self.session_id, record_id = %id, kind = kind.as_str(), "observation buffered");

        if self.pending.len() >= self.ledger.config.ledger.flush_threshold {
            self.flush()?;
        }

        Ok(Observation {
            id,
            session_id: self.session_id.clone(),
            kind,
            subject,
            payload,
            captured_at,
            content_hash: hash,
            limitations,
        })
    }

    /// Stream a target file and append its file observation.
    pub fn append_file(&mut self, path: &Path) -> Result<Observation, SightlineError> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let resolved = resolved.canonicalize().map_err(io_at(&resolved))?;
        let facts = observe_file(&resolved, self.ledger.config.ledger.read_chunk_bytes)?;
        let subject = resolved.to_string_lossy().to_string();
        self.append(&subject, Payload::File(facts))
    }

    /// Durably commit all pending records. Rejected if the session went
    /// terminal while records were buffered.
    pub fn flush(&mut self) -> Result<(), SightlineError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let session = self.ledger.sessions.get(&self.session_id)?;
        if session.state.is_terminal() {
            let dropped = self.pending.len();
            self.pending.clear();
            return Err(SightlineError::validation(
                format!("session is {}; {} pending records discarded", session.state, dropped),
                ErrorContext::session(&self.session_id),
            ));
        }
        // Ownership is confirmed before any log byte is written.
        self.lock.heartbeat()?;
        self.log.commit(&self.pending)?;
        tracing::debug!(
            session_id = %self.session_id,
            records = self.pending.len(),
            committed_len = self.log.index().committed_len,
            "ledger flushed"
        );
        self.pending.clear();
        Ok(())
    }

    /// Drop buffered records without committing them. Returns how many were dropped.
    pub fn abandon(mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Flush and release the writer lock. Returns the committed record count.
    pub fn finish(mut self) -> Result<usize, SightlineError> {
        self.flush()?;
        Ok(self.log.index().entries.len())
    }

    fn ensure_running(&mut self) -> Result<(), SightlineError> {
        match self.state {
            SessionState::Running => Ok(()),
            SessionState::Created => {
                let token = format!("{}:first-append", self.session_id);
                let session = self
                    .ledger
                    .sessions
                    .advance(&self.session_id, SessionEvent::Start, &token)?;
                self.state = session.state;
                if self.state == SessionState::Running {
                    Ok(())
                } else {
                    Err(SightlineError::validation(
                        format!("session is {}; appends are closed", self.state),
                        ErrorContext::session(&self.session_id),
                    ))
                }
            }
            terminal => Err(SightlineError::validation(
                format!("session is {}; appends are closed", terminal),
                ErrorContext::session(&self.session_id),
            )),
        }
    }
}

impl Drop for LedgerWriter<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            if let Err(err) = self.flush() {
                tracing::warn!(session_id = %self.session_id, error = %err, "flush on drop failed");
            }
        }
    }
}

/// Restartable iterator over a committed index snapshot.
pub struct ObservationReader {
    session_id: String,
    index: SegmentIndex,
    reader: SegmentReader,
    pos: usize,
}

impl ObservationReader {
    pub fn len(&self) -> usize {
        self.index.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.entries.is_empty()
    }

    /// Start again from the first record of the same snapshot.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    fn next_with_entry(&mut self) -> Option<(IndexEntry, Result<Observation, SightlineError>)> {
        let entry = self.index.entries.get(self.pos)?.clone();
        self.pos += 1;
        let result = self.decode(&entry);
        Some((entry, result))
    }

    fn decode(&mut self, entry: &IndexEntry) -> Result<Observation, SightlineError> {
        let ctx = || ErrorContext::session(&self.session_id).with_record(&entry.id);
        let body = self.reader.read_entry(entry)?;
        let record: StoredRecord = serde_json::from_slice(&body)
            .map_err(|e| SightlineError::corruption(format!("undecodable record: {}", e), ctx()))?;

        if record.id != entry.id {
            return Err(SightlineError::corruption(
                format!("index names {} but record is {}", entry.id, record.id),
                ctx(),
            ));
        }
        if record.session_id != self.session_id {
            return Err(SightlineError::corruption(
                format!("record belongs to session {}", record.session_id),
                ctx(),
            ));
        }
        let recomputed = content_hash(record.kind, &record.subject, &record.payload, record.captured_at)?;
        if recomputed != record.hash {
            return Err(SightlineError::corruption(
                format!("content hash mismatch: stored {} recomputed {}", record.hash, recomputed),
                ctx(),
            ));
        }
        if record.hash != entry.hash {
            return Err(SightlineError::corruption(
                format!("index hash {} disagrees with record hash {}", entry.hash, record.hash),
                ctx(),
            ));
        }
        let payload = Payload::from_json(record.kind, record.payload)
            .map_err(|e| SightlineError::corruption(format!("payload does not match type: {}", e), ctx()))?;

        Ok(Observation {
            id: record.id,
            session_id: record.session_id,
            kind: record.kind,
            subject: record.subject,
            payload,
            captured_at: record.captured_at,
            content_hash: record.hash,
            limitations: record.limitations,
        })
    }
}

impl Iterator for ObservationReader {
    type Item = Result<Observation, SightlineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_with_entry().map(|(_, result)| result)
    }
}
