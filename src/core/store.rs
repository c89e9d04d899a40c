//! Store abstraction for Sightline's on-disk state.
//!
//! A store is a directory holding the session catalog and one segment
//! directory per investigation session:
//!
//! ```text
//! <root>/
//!   sightline.toml          optional engine config
//!   patterns.toml           optional pattern rules
//!   catalog.db              session states + idempotency tokens
//!   sessions/<id>/
//!     manifest.json         session metadata + schema version + policy
//!     index.json            published offset index (the commit point)
//!     log.bin               append-only framed records
//!     writer.lock           single-writer advisory lock
//! ```

use crate::core::error::{SightlineError, io_at};
use std::fs;
use std::path::{Path, PathBuf};

pub const CATALOG_DB_NAME: &str = "catalog.db";
pub const CONFIG_FILE_NAME: &str = "sightline.toml";
pub const RULES_FILE_NAME: &str = "patterns.toml";
pub const SESSIONS_DIR: &str = "sessions";

pub const MANIFEST_FILE: &str = "manifest.json";
pub const INDEX_FILE: &str = "index.json";
pub const LOG_FILE: &str = "log.bin";
pub const LOCK_FILE: &str = "writer.lock";

/// Handle on a Sightline state directory.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
}

impl Store {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, SightlineError> {
        let sessions = root.join(SESSIONS_DIR);
        fs::create_dir_all(&sessions).map_err(io_at(&sessions))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_DB_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn rules_path(&self) -> PathBuf {
        self.root.join(RULES_FILE_NAME)
    }

    pub fn segment(&self, session_id: &str) -> SegmentPaths {
        SegmentPaths {
            dir: self.root.join(SESSIONS_DIR).join(session_id),
        }
    }
}

/// File locations inside one session's segment directory.
#[derive(Debug, Clone)]
pub struct SegmentPaths {
    pub dir: PathBuf,
}

impl SegmentPaths {
    pub fn manifest(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn index(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub fn log(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn lock(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    pub fn exists(&self) -> bool {
        self.manifest().exists()
    }
}
