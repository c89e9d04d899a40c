//! Segment format versioning and migration.
//!
//! Every segment manifest carries `schema_version`. Opening a segment with an
//! older version runs the ordered migration table below. Steps operate on an
//! in-memory image of the manifest and index; nothing is written until every
//! step has succeeded, then the index is published first and the manifest
//! last. The manifest is the commit point, so a crash in between simply
//! re-runs the (idempotent) steps on next open.
//!
//! A version newer than [`CURRENT_SCHEMA_VERSION`] fails closed.
//!
//! Format history:
//! - v1: index entries are `{id, offset, length}`; manifest names the target `root`.
//! - v2: index entries also carry the record `hash`.
//! - v3: manifest field `root` renamed to `target`.

use crate::core::error::{ErrorContext, SightlineError};
use crate::core::storage::{self, decode_frames};
use crate::core::store::SegmentPaths;
use serde_json::Value as JsonValue;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Manifest and index as loose JSON while migrations run.
pub struct SegmentImage {
    pub paths: SegmentPaths,
    pub manifest: JsonValue,
    pub index: Option<JsonValue>,
}

pub struct Migration {
    /// Version this step upgrades from; it produces `from_version + 1`.
    pub from_version: u32,
    pub description: &'static str,
    pub up: fn(&mut SegmentImage) -> Result<(), SightlineError>,
}

/// All migrations in ascending order.
pub fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            from_version: 1,
            description: "Copy record hashes into index entries",
            up: migrate_index_hashes,
        },
        Migration {
            from_version: 2,
            description: "Rename manifest field root to target",
            up: migrate_manifest_target,
        },
    ]
}

/// Schema version a manifest declares. An absent field means v1; anything
/// present that is not a non-negative integer fails closed.
pub fn manifest_version(manifest: &JsonValue, ctx: &ErrorContext) -> Result<u32, SightlineError> {
    let Some(raw) = manifest.get("schema_version") else {
        return Ok(1);
    };
    let Some(version) = raw.as_u64() else {
        return Err(SightlineError::corruption(
            format!("schema_version {} is not an integer", raw),
            ctx.clone(),
        ));
    };
    u32::try_from(version).map_err(|_| SightlineError::UnsupportedVersion {
        found: u32::MAX,
        supported: CURRENT_SCHEMA_VERSION,
        context: ctx.clone(),
    })
}

/// Bring a segment up to the current format. Returns the number of steps applied.
pub fn check_and_migrate(paths: &SegmentPaths) -> Result<usize, SightlineError> {
    let manifest_path = paths.manifest();
    let manifest: JsonValue = storage::read_json(&manifest_path)?;
    let found = manifest_version(&manifest, &ErrorContext::path(&manifest_path))?;

    if found > CURRENT_SCHEMA_VERSION {
        return Err(SightlineError::UnsupportedVersion {
            found,
            supported: CURRENT_SCHEMA_VERSION,
            context: ErrorContext::path(&manifest_path),
        });
    }
    if found == CURRENT_SCHEMA_VERSION {
        return Ok(0);
    }

    let index = if paths.index().exists() {
        Some(storage::read_json::<JsonValue>(&paths.index())?)
    } else {
        None
    };
    let mut image = SegmentImage {
        paths: paths.clone(),
        manifest,
        index,
    };

    let mut applied = 0;
    let mut version = found;
    for migration in all_migrations() {
        if migration.from_version < version {
            continue;
        }
        if migration.from_version != version {
            return Err(SightlineError::corruption(
                format!("no migration path from schema version {}", version),
                ErrorContext::path(&manifest_path),
            ));
        }
        tracing::info!(
            from = version,
            to = version + 1,
            step = migration.description,
            dir = %paths.dir.display(),
            "migrating segment"
        );
        (migration.up)(&mut image)?;
        version += 1;
        applied += 1;
    }

    if let Some(obj) = image.manifest.as_object_mut() {
        obj.insert("schema_version".to_string(), JsonValue::from(version));
    }
    if let Some(index) = &image.index {
        storage::write_json(&paths.index(), index)?;
    }
    storage::write_json(&manifest_path, &image.manifest)?;
    Ok(applied)
}

fn migrate_index_hashes(image: &mut SegmentImage) -> Result<(), SightlineError> {
    let Some(index) = image.index.as_mut() else {
        return Ok(());
    };
    let Some(entries) = index.get_mut("entries").and_then(|e| e.as_array_mut()) else {
        return Ok(());
    };
    if entries.is_empty() {
        return Ok(());
    }

    let log_path = image.paths.log();
    let mut log = File::open(&log_path)
        .map_err(|e| SightlineError::io(e, ErrorContext::path(&log_path)))?;
    let log_len = log
        .metadata()
        .map_err(|e| SightlineError::io(e, ErrorContext::path(&log_path)))?
        .len();

    for entry in entries.iter_mut() {
        if entry.get("hash").and_then(|h| h.as_str()).is_some() {
            continue;
        }
        let id = entry
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let ctx = || ErrorContext::path(&log_path).with_record(&id);
        let offset = entry.get("offset").and_then(|v| v.as_u64());
        let length = entry.get("length").and_then(|v| v.as_u64());
        let (Some(offset), Some(length)) = (offset, length) else {
            return Err(SightlineError::corruption("index entry missing offset/length", ctx()));
        };

        let length = storage::checked_extent(offset, length, log_len)
            .map_err(|reason| SightlineError::corruption(reason, ctx()))?;
        let mut raw = vec![0u8; length];
        log.seek(SeekFrom::Start(offset))
            .and_then(|_| log.read_exact(&mut raw))
            .map_err(|e| SightlineError::io(e, ctx()))?;
        let body = decode_frames(&raw).map_err(|reason| SightlineError::corruption(reason, ctx()))?;
        let record: JsonValue = serde_json::from_slice(&body)
            .map_err(|e| SightlineError::corruption(format!("undecodable record: {}", e), ctx()))?;
        let hash = record
            .get("hash")
            .and_then(|h| h.as_str())
            .ok_or_else(|| SightlineError::corruption("record has no hash", ctx()))?;

        if let Some(obj) = entry.as_object_mut() {
            obj.insert("hash".to_string(), JsonValue::from(hash));
        }
    }
    Ok(())
}

fn migrate_manifest_target(image: &mut SegmentImage) -> Result<(), SightlineError> {
    let Some(obj) = image.manifest.as_object_mut() else {
        return Err(SightlineError::corruption(
            "manifest is not an object",
            ErrorContext::path(&image.paths.manifest()),
        ));
    };
    if let Some(root) = obj.remove("root") {
        obj.entry("target".to_string()).or_insert(root);
    }
    Ok(())
}
