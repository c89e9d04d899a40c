//! Crash-safe storage primitives.
//!
//! Two mechanisms keep readers from ever seeing a partial write:
//!
//! - **Atomic publish**: small documents (manifest, index, lock) are written
//!   to a temp file in the same directory, fsynced, then renamed into place.
//! - **Log + republished index**: records are appended to `log.bin` as
//!   length-prefixed frames and only become visible once a new `index.json`
//!   referencing them has been atomically published. A crash between the two
//!   leaves an unreferenced log tail, which is truncated the next time a
//!   writer opens the segment.
//!
//! Frame layout: `u32` little-endian header followed by the frame body. The
//! low 31 bits hold the body length; the high bit marks that another frame of
//! the same record follows.

use crate::core::error::{ErrorContext, SightlineError, io_at};
use crate::core::store::SegmentPaths;
use crate::core::time;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Largest body a single frame header can describe.
pub const MAX_FRAME_LEN: usize = (1 << 31) - 1;
const CONTINUATION_BIT: u32 = 1 << 31;
const FRAME_HEADER_LEN: usize = 4;

/// Write `bytes` to `path` so that readers see either the old file or the
/// complete new one.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), SightlineError> {
    let dir = path.parent().ok_or_else(|| {
        SightlineError::validation("atomic write target has no parent", ErrorContext::path(path))
    })?;
    fs::create_dir_all(dir).map_err(io_at(dir))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string());
    let tmp_path = dir.join(format!(".{}.tmp-{}", file_name, time::new_id()));

    let write_result = (|| -> Result<(), SightlineError> {
        let mut tmp = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .map_err(io_at(&tmp_path))?;
        tmp.write_all(bytes).map_err(io_at(&tmp_path))?;
        tmp.sync_all().map_err(io_at(&tmp_path))?;
        Ok(())
    })();
    if let Err(err) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(SightlineError::io(err, ErrorContext::path(path)));
    }
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), SightlineError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(io_at(dir))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), SightlineError> {
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SightlineError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, SightlineError> {
    let bytes = fs::read(path).map_err(io_at(path))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        SightlineError::corruption(format!("undecodable document: {}", e), ErrorContext::path(path))
    })
}

/// Split `body` into frames of at most `max_frame` bytes each.
pub fn encode_frames(body: &[u8], max_frame: usize) -> Vec<u8> {
    let max_frame = max_frame.clamp(1, MAX_FRAME_LEN);
    let chunk_count = body.len().div_ceil(max_frame).max(1);
    let mut out = Vec::with_capacity(body.len() + chunk_count * FRAME_HEADER_LEN);

    if body.is_empty() {
        out.extend_from_slice(&0u32.to_le_bytes());
        return out;
    }
    let mut chunks = body.chunks(max_frame).peekable();
    while let Some(chunk) = chunks.next() {
        let mut header = chunk.len() as u32;
        if chunks.peek().is_some() {
            header |= CONTINUATION_BIT;
        }
        out.extend_from_slice(&header.to_le_bytes());
        out.extend_from_slice(chunk);
    }
    out
}

/// Reassemble one record from its frames. `bytes` must hold exactly the
/// record's frames, nothing more.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let mut body = Vec::with_capacity(bytes.len());
    let mut pos = 0usize;
    loop {
        let header_end = pos + FRAME_HEADER_LEN;
        if header_end > bytes.len() {
            return Err(format!("truncated frame header at byte {}", pos));
        }
        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        header_bytes.copy_from_slice(&bytes[pos..header_end]);
        let header = u32::from_le_bytes(header_bytes);
        let len = (header & !CONTINUATION_BIT) as usize;
        let frame_end = header_end + len;
        if frame_end > bytes.len() {
            return Err(format!(
                "frame at byte {} declares {} bytes but only {} remain",
                pos,
                len,
                bytes.len() - header_end
            ));
        }
        body.extend_from_slice(&bytes[header_end..frame_end]);
        pos = frame_end;
        if header & CONTINUATION_BIT == 0 {
            break;
        }
    }
    if pos != bytes.len() {
        return Err(format!(
            "{} trailing bytes after final frame",
            bytes.len() - pos
        ));
    }
    Ok(body)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub offset: u64,
    pub length: u64,
    pub hash: String,
}

/// The published view of a segment: which log bytes are committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndex {
    pub committed_len: u64,
    pub entries: Vec<IndexEntry>,
}

impl SegmentIndex {
    /// Missing index means nothing has been committed yet.
    pub fn load(paths: &SegmentPaths) -> Result<Self, SightlineError> {
        let path = paths.index();
        if !path.exists() {
            return Ok(Self::default());
        }
        read_json(&path)
    }

    pub fn publish(&self, paths: &SegmentPaths) -> Result<(), SightlineError> {
        write_json(&paths.index(), self)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }
}

/// A record ready to be framed into the log.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub id: String,
    pub hash: String,
    pub body: Vec<u8>,
}

/// Log bytes that are durable but not yet referenced by a published index.
#[derive(Debug)]
#[must_use = "records stay invisible until the staged index is published"]
pub struct StagedCommit {
    index: SegmentIndex,
}

/// Single-writer handle on a segment's log and index.
///
/// Callers must hold the segment's writer lock for the lifetime of this value.
pub struct SegmentLog {
    paths: SegmentPaths,
    file: File,
    index: SegmentIndex,
    max_frame_bytes: usize,
}

impl SegmentLog {
    /// Open for appending, discarding any log tail the index does not reference.
    pub fn open(paths: &SegmentPaths, max_frame_bytes: usize) -> Result<Self, SightlineError> {
        let index = SegmentIndex::load(paths)?;
        let log_path = paths.log();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&log_path)
            .map_err(io_at(&log_path))?;
        let on_disk = file.metadata().map_err(io_at(&log_path))?.len();

        if on_disk < index.committed_len {
            return Err(SightlineError::corruption(
                format!(
                    "log is {} bytes but index commits {} bytes",
                    on_disk, index.committed_len
                ),
                ErrorContext::path(&log_path),
            ));
        }
        if on_disk > index.committed_len {
            tracing::warn!(
                path = %log_path.display(),
                committed = index.committed_len,
                on_disk,
                "truncating unreferenced log tail"
            );
            file.set_len(index.committed_len).map_err(io_at(&log_path))?;
            file.sync_all().map_err(io_at(&log_path))?;
        }

        Ok(Self {
            paths: paths.clone(),
            file,
            index,
            max_frame_bytes,
        })
    }

    pub fn index(&self) -> &SegmentIndex {
        &self.index
    }

    /// Append and fsync `records` without publishing them.
    pub fn stage(&mut self, records: &[PendingRecord]) -> Result<StagedCommit, SightlineError> {
        let log_path = self.paths.log();
        let mut next = self.index.clone();
        let mut offset = self
            .file
            .seek(SeekFrom::Start(self.index.committed_len))
            .map_err(io_at(&log_path))?;

        for record in records {
            let framed = encode_frames(&record.body, self.max_frame_bytes);
            self.file.write_all(&framed).map_err(io_at(&log_path))?;
            next.entries.push(IndexEntry {
                id: record.id.clone(),
                offset,
                length: framed.len() as u64,
                hash: record.hash.clone(),
            });
            offset += framed.len() as u64;
        }
        self.file.sync_data().map_err(io_at(&log_path))?;
        next.committed_len = offset;
        Ok(StagedCommit { index: next })
    }

    /// Make staged records visible by republishing the index.
    pub fn publish(&mut self, staged: StagedCommit) -> Result<(), SightlineError> {
        if let Err(err) = staged.index.publish(&self.paths) {
            let _ = self.file.set_len(self.index.committed_len);
            return Err(err);
        }
        self.index = staged.index;
        Ok(())
    }

    /// Stage and publish `records`. Refused if the published index no longer
    /// matches the one this handle opened with.
    pub fn commit(&mut self, records: &[PendingRecord]) -> Result<(), SightlineError> {
        if records.is_empty() {
            return Ok(());
        }
        let published = SegmentIndex::load(&self.paths)?;
        if published != self.index {
            return Err(SightlineError::corruption(
                format!(
                    "index was republished by another writer ({} committed bytes, expected {})",
                    published.committed_len, self.index.committed_len
                ),
                ErrorContext::path(&self.paths.index()),
            ));
        }
        let staged = self.stage(records)?;
        self.publish(staged)
    }
}

/// Validate an index entry's extent against the log length before anything
/// is allocated for it.
pub fn checked_extent(offset: u64, length: u64, log_len: u64) -> Result<usize, String> {
    let end = offset
        .checked_add(length)
        .ok_or_else(|| format!("entry extent {}+{} overflows", offset, length))?;
    if end > log_len {
        return Err(format!(
            "entry spans bytes {}..{} but log is {} bytes",
            offset, end, log_len
        ));
    }
    usize::try_from(length).map_err(|_| format!("entry length {} exceeds address space", length))
}

/// Random-access reader over committed log bytes.
pub struct SegmentReader {
    file: Option<File>,
    log_path: std::path::PathBuf,
}

impl SegmentReader {
    pub fn open(paths: &SegmentPaths) -> Result<Self, SightlineError> {
        let log_path = paths.log();
        let file = match File::open(&log_path) {
            Ok(f) => Some(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SightlineError::io(e, ErrorContext::path(&log_path))),
        };
        Ok(Self { file, log_path })
    }

    /// Read and reassemble the record an index entry points at.
    pub fn read_entry(&mut self, entry: &IndexEntry) -> Result<Vec<u8>, SightlineError> {
        let ctx = || ErrorContext::path(&self.log_path).with_record(&entry.id);
        let Some(file) = self.file.as_mut() else {
            return Err(SightlineError::corruption("log file missing", ctx()));
        };
        let log_len = file.metadata().map_err(io_at(&self.log_path))?.len();
        let length = checked_extent(entry.offset, entry.length, log_len)
            .map_err(|reason| SightlineError::corruption(reason, ctx()))?;
        file.seek(SeekFrom::Start(entry.offset)).map_err(io_at(&self.log_path))?;
        let mut raw = vec![0u8; length];
        if let Err(e) = file.read_exact(&mut raw) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(SightlineError::corruption("record extends past end of log", ctx()));
            }
            return Err(SightlineError::io(e, ctx()));
        }
        decode_frames(&raw).map_err(|reason| SightlineError::corruption(reason, ctx()))
    }
}
