//! Recording lookup for the file query and transfer commands
//!
//! Recordings are `.mp4` files anywhere under the record path, ordered by
//! modification time. A `.jpg` with the same stem is the recording's thumbnail.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::Engine;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use tracing::debug;

use super::protocol::FileMetadata;
use crate::error::{AppError, Result};

/// Most files a `BEFORE_FILE` query returns
pub const OLDER_FILES_LIMIT: usize = 8;

const RECORDING_EXT: &str = "mp4";

#[derive(Debug, Clone)]
struct Recording {
    path: PathBuf,
    modified: SystemTime,
}

/// Recordings under one directory
#[derive(Debug, Clone)]
pub struct RecordingIndex {
    root: PathBuf,
}

impl RecordingIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All recordings, newest first
    fn recordings(&self) -> Result<Vec<Recording>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file()
                    && path.extension().and_then(|ext| ext.to_str()) == Some(RECORDING_EXT)
                {
                    let modified = entry.metadata()?.modified()?;
                    found.push(Recording { path, modified });
                }
            }
        }
        found.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
        Ok(found)
    }

    /// The newest finished recording. The newest file is still being written,
    /// so this is the second newest.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.recordings()?.into_iter().nth(1).map(|r| r.path))
    }

    /// Up to `limit` recordings older than `file`, newest first
    pub fn older_than(&self, file: &str, limit: usize) -> Result<Vec<PathBuf>> {
        let reference = self.resolve(file)?;
        let pivot = fs::metadata(&reference)?.modified()?;
        Ok(self
            .recordings()?
            .into_iter()
            .filter(|r| r.modified < pivot)
            .take(limit)
            .map(|r| r.path)
            .collect())
    }

    /// Newest recording not newer than `time`
    pub fn newest_before(&self, time: SystemTime) -> Result<Option<PathBuf>> {
        Ok(self
            .recordings()?
            .into_iter()
            .find(|r| r.modified <= time)
            .map(|r| r.path))
    }

    /// Resolve a requested path, refusing anything outside the record path
    pub fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let requested = Path::new(requested);
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };
        let root = self.root.canonicalize()?;
        let resolved = candidate.canonicalize()?;
        if !resolved.starts_with(&root) {
            return Err(AppError::Protocol(format!(
                "{} is outside the record path",
                candidate.display()
            )));
        }
        Ok(resolved)
    }

    /// Response entry for one recording
    pub fn describe(&self, path: &Path) -> FileMetadata {
        let mut meta = FileMetadata::new();
        meta.filepath = path.to_string_lossy().into_owned();
        meta.duration_sec = mp4_duration_secs(path);
        if let Some(thumbnail) = thumbnail_data_url(path) {
            meta.thumbnail = thumbnail;
        }
        meta
    }
}

/// Parse a query time: `YYYYMMDD_HHMMSS` (local time) or RFC 3339
pub fn parse_query_time(value: &str) -> Option<SystemTime> {
    let value = value.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y%m%d_%H%M%S") {
        return Local
            .from_local_datetime(&naive)
            .earliest()
            .map(SystemTime::from);
    }
    DateTime::parse_from_rfc3339(value).ok().map(SystemTime::from)
}

/// `data:` URL of the sibling `.jpg`, if there is one
pub fn thumbnail_data_url(recording: &Path) -> Option<String> {
    let data = fs::read(recording.with_extension("jpg")).ok()?;
    if data.is_empty() {
        return None;
    }
    Some(format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(data)
    ))
}

/// Duration in whole seconds from the movie header, 0 when unreadable
pub fn mp4_duration_secs(path: &Path) -> u32 {
    match read_mvhd_duration(path) {
        Ok(Some(secs)) => secs,
        Ok(None) => {
            debug!("No mvhd box in {}", path.display());
            0
        }
        Err(e) => {
            debug!("Failed to read duration of {}: {}", path.display(), e);
            0
        }
    }
}

struct BoxHeader {
    kind: [u8; 4],
    /// Payload size, `None` when the box runs to the end of its parent
    payload: Option<u64>,
}

fn read_box_header<R: Read>(reader: &mut R) -> std::io::Result<Option<BoxHeader>> {
    let mut header = [0u8; 8];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
    let kind = [header[4], header[5], header[6], header[7]];
    let payload = match size {
        0 => None,
        1 => {
            let mut large = [0u8; 8];
            reader.read_exact(&mut large)?;
            Some(u64::from_be_bytes(large).saturating_sub(16))
        }
        n => Some(n.saturating_sub(8)),
    };
    Ok(Some(BoxHeader { kind, payload }))
}

/// Scan boxes until `kind`, leaving the reader at its payload
fn find_box<R: Read + Seek>(
    reader: &mut R,
    kind: &[u8; 4],
    end: Option<u64>,
) -> std::io::Result<Option<Option<u64>>> {
    loop {
        if let Some(end) = end {
            if reader.stream_position()? + 8 > end {
                return Ok(None);
            }
        }
        let Some(header) = read_box_header(reader)? else {
            return Ok(None);
        };
        if &header.kind == kind {
            return Ok(Some(header.payload));
        }
        match header.payload {
            Some(len) => {
                reader.seek(SeekFrom::Current(len as i64))?;
            }
            None => return Ok(None),
        }
    }
}

fn read_mvhd_duration(path: &Path) -> std::io::Result<Option<u32>> {
    let mut reader = BufReader::new(File::open(path)?);

    let Some(moov_len) = find_box(&mut reader, b"moov", None)? else {
        return Ok(None);
    };
    let moov_start = reader.stream_position()?;
    let moov_end = moov_len.map(|len| moov_start + len);
    if find_box(&mut reader, b"mvhd", moov_end)?.is_none() {
        return Ok(None);
    }

    let mut version = [0u8; 4];
    reader.read_exact(&mut version)?;
    let (timescale, duration) = if version[0] == 1 {
        let mut body = [0u8; 28];
        reader.read_exact(&mut body)?;
        let timescale = u32::from_be_bytes([body[16], body[17], body[18], body[19]]);
        let mut duration = [0u8; 8];
        duration.copy_from_slice(&body[20..28]);
        (timescale, u64::from_be_bytes(duration))
    } else {
        let mut body = [0u8; 16];
        reader.read_exact(&mut body)?;
        let timescale = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
        let duration = u32::from_be_bytes([body[12], body[13], body[14], body[15]]);
        (timescale, duration as u64)
    };

    if timescale == 0 {
        return Ok(Some(0));
    }
    Ok(Some((duration / timescale as u64).min(u32::MAX as u64) as u32))
}
