use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Where an error happened: enough for a caller to act without reading internals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub path: Option<PathBuf>,
    pub session_id: Option<String>,
    pub record_id: Option<String>,
}

impl ErrorContext {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Self::default()
        }
    }

    pub fn path(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    pub fn with_record(mut self, record_id: &str) -> Self {
        self.record_id = Some(record_id.to_string());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(session_id) = &self.session_id {
            parts.push(format!("session={}", session_id));
        }
        if let Some(record_id) = &self.record_id {
            parts.push(format!("record={}", record_id));
        }
        if let Some(path) = &self.path {
            parts.push(format!("path={}", path.display()));
        }
        if parts.is_empty() {
            write!(f, "no context")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

#[derive(Error, Debug)]
pub enum SightlineError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error ({context}): {source}")]
    IoError {
        #[source]
        source: io::Error,
        context: ErrorContext,
    },
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {message} ({context})")]
    ValidationError {
        message: String,
        context: ErrorContext,
    },
    #[error("Corruption detected: {reason} ({context})")]
    CorruptionError {
        reason: String,
        context: ErrorContext,
    },
    #[error("Not found: {what} ({context})")]
    NotFound { what: String, context: ErrorContext },
    #[error("Writer lock held by live owner pid={owner_pid} ({context})")]
    LockContention { owner_pid: u32, context: ErrorContext },
    #[error("Unsupported storage version {found}, newest supported is {supported} ({context})")]
    UnsupportedVersion {
        found: u32,
        supported: u32,
        context: ErrorContext,
    },
}

impl From<io::Error> for SightlineError {
    fn from(source: io::Error) -> Self {
        SightlineError::IoError {
            source,
            context: ErrorContext::none(),
        }
    }
}

impl SightlineError {
    pub fn io(source: io::Error, context: ErrorContext) -> Self {
        SightlineError::IoError { source, context }
    }

    pub fn validation(message: impl Into<String>, context: ErrorContext) -> Self {
        SightlineError::ValidationError {
            message: message.into(),
            context,
        }
    }

    pub fn corruption(reason: impl Into<String>, context: ErrorContext) -> Self {
        SightlineError::CorruptionError {
            reason: reason.into(),
            context,
        }
    }

    pub fn not_found(what: impl Into<String>, context: ErrorContext) -> Self {
        SightlineError::NotFound {
            what: what.into(),
            context,
        }
    }

    /// Structured context for domain errors; `None` for wrapped library errors.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            SightlineError::IoError { context, .. }
            | SightlineError::ValidationError { context, .. }
            | SightlineError::CorruptionError { context, .. }
            | SightlineError::NotFound { context, .. }
            | SightlineError::LockContention { context, .. }
            | SightlineError::UnsupportedVersion { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Stable machine-readable name for envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            SightlineError::RusqliteError(_) => "catalog",
            SightlineError::IoError { .. } => "io",
            SightlineError::SerdeError(_) => "serde",
            SightlineError::ConfigError(_) => "config",
            SightlineError::ValidationError { .. } => "validation",
            SightlineError::CorruptionError { .. } => "corruption",
            SightlineError::NotFound { .. } => "not_found",
            SightlineError::LockContention { .. } => "lock_contention",
            SightlineError::UnsupportedVersion { .. } => "unsupported_version",
        }
    }
}

/// Attach a path to a raw `io::Error`.
pub fn io_at(path: &Path) -> impl FnOnce(io::Error) -> SightlineError + '_ {
    move |source| SightlineError::io(source, ErrorContext::path(path))
}
