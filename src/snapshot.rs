//! The last lines of a file, read on demand.
//!
//! Unlike the tailers, a snapshot keeps no cursor: it reads fixed-size blocks
//! backwards from the end of the file until it has seen enough line breaks,
//! then decodes and splits what it collected.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use thiserror::Error;
use tracing::debug;

use crate::descriptor::{count_line_feeds, line_feed, resolve_encoding, LogId};
use crate::registry::Registry;

/// Block size used when walking backwards through a file.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Line count used when the caller does not ask for one.
pub const DEFAULT_LINES: usize = 500;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("log file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unknown log id {0}")]
    UnknownLog(LogId),
}

impl SnapshotError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            SnapshotError::NotFound(path.to_path_buf())
        } else {
            SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub block_size: usize,
    /// When set, return the trailing `line_cap` lines of whatever was read
    /// instead of exactly the requested count. Matches older deployments that
    /// always showed a fixed number of lines.
    pub line_cap: Option<usize>,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            line_cap: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// The last `max_lines` lines of a UTF-8 file, oldest first.
pub fn tail(path: &Path, max_lines: usize) -> Result<Vec<String>, SnapshotError> {
    tail_with(path, max_lines, encoding_rs::UTF_8, &SnapshotOptions::default())
}

/// The last `max_lines` lines of `path` decoded with `encoding`, oldest
/// first. Undecodable bytes are replaced rather than reported.
pub fn tail_with(
    path: &Path,
    max_lines: usize,
    encoding: &'static Encoding,
    options: &SnapshotOptions,
) -> Result<Vec<String>, SnapshotError> {
    let mut file = std::fs::File::open(path).map_err(|e| SnapshotError::from_io(path, e))?;

    let keep = options.line_cap.unwrap_or(max_lines);
    if keep == 0 {
        return Ok(Vec::new());
    }

    let data = read_tail_bytes(
        &mut file,
        max_lines,
        options.block_size.max(1),
        line_feed(encoding),
    )
    .map_err(|e| SnapshotError::from_io(path, e))?;

    let (text, _, had_errors) = encoding.decode(&data);
    if had_errors {
        debug!(path = %path.display(), "replaced undecodable bytes in snapshot");
    }

    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let start = lines.len().saturating_sub(keep);
    Ok(lines.split_off(start))
}

/// Collect trailing blocks until they hold more than `max_lines` line breaks
/// or the start of the file is reached. One break beyond the count is needed
/// so the oldest kept line is known to be complete.
///
/// Blocks start on a multiple of the line feed's length so line feeds are
/// counted per code unit.
fn read_tail_bytes<R: Read + Seek>(
    reader: &mut R,
    max_lines: usize,
    block_size: usize,
    line_feed: &[u8],
) -> io::Result<Vec<u8>> {
    let unit = line_feed.len() as u64;
    let mut remaining = reader.seek(SeekFrom::End(0))?;
    let mut data: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    while remaining > 0 && newlines <= max_lines {
        let mut start = remaining.saturating_sub(block_size as u64);
        start -= start % unit;
        let read_size = remaining - start;
        remaining = start;
        reader.seek(SeekFrom::Start(start))?;

        let mut block = vec![0u8; read_size as usize];
        reader.read_exact(&mut block)?;
        newlines += count_line_feeds(&block, line_feed);

        block.extend_from_slice(&data);
        data = block;
    }

    Ok(data)
}

// ---------------------------------------------------------------------------
// Query surface
// ---------------------------------------------------------------------------

/// Snapshot of a registered log, using its declared encoding.
pub fn snapshot_for(
    registry: &dyn Registry,
    id: LogId,
    max_lines: usize,
    options: &SnapshotOptions,
) -> Result<Vec<String>, SnapshotError> {
    let file = registry.get(id).ok_or(SnapshotError::UnknownLog(id))?;
    tail_with(&file.path, max_lines, resolve_encoding(&file.encoding), options)
}

/// A snapshot ready for display: either lines, or no lines and a notice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotView {
    pub lines: Vec<String>,
    pub notice: Option<String>,
}

/// Like [`snapshot_for`], but never fails: errors become a notice next to an
/// empty line list.
pub fn render_snapshot(
    registry: &dyn Registry,
    id: LogId,
    max_lines: usize,
    options: &SnapshotOptions,
) -> SnapshotView {
    match snapshot_for(registry, id, max_lines, options) {
        Ok(lines) => SnapshotView {
            lines,
            notice: None,
        },
        Err(SnapshotError::NotFound(_)) => SnapshotView {
            lines: Vec::new(),
            notice: Some("Log file not found".to_string()),
        },
        Err(e) => SnapshotView {
            lines: Vec::new(),
            notice: Some(format!("Error: {}", e)),
        },
    }
}
