//! Identity of a watched log file as handed to the engine by the registry.

use std::fmt;
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Encoding label used when a descriptor does not name one.
pub const DEFAULT_ENCODING: &str = "utf-8";

// ---------------------------------------------------------------------------
// LogId
// ---------------------------------------------------------------------------

/// Opaque identifier of a registered log file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub u64);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LogId {
    fn from(id: u64) -> Self {
        LogId(id)
    }
}

// ---------------------------------------------------------------------------
// WatchedFile
// ---------------------------------------------------------------------------

/// A registry record: one log file to watch.
///
/// Immutable once handed to the engine. A path change is expressed as the
/// removal of the old descriptor followed by the addition of a new one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedFile {
    pub id: LogId,
    pub path: PathBuf,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_encoding() -> String {
    DEFAULT_ENCODING.to_string()
}

impl WatchedFile {
    pub fn new(id: impl Into<LogId>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            encoding: default_encoding(),
        }
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory whose notifier subscription covers this file.
    pub fn directory(&self) -> PathBuf {
        directory_of(&self.path)
    }
}

/// Parent directory of `path`, with `.` standing in for a bare file name.
pub fn directory_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if parent != Path::new("") => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Resolve a WHATWG encoding label, falling back to UTF-8.
pub fn resolve_encoding(label: &str) -> &'static Encoding {
    match Encoding::for_label(label.trim().as_bytes()) {
        Some(encoding) => encoding,
        None => {
            warn!(label, "unknown encoding label, decoding as utf-8");
            encoding_rs::UTF_8
        }
    }
}

/// Byte layout of a line feed in `encoding`. Every supported encoding other
/// than UTF-16 leaves ASCII bytes unchanged.
pub fn line_feed(encoding: &'static Encoding) -> &'static [u8] {
    if encoding == encoding_rs::UTF_16LE {
        b"\n\0"
    } else if encoding == encoding_rs::UTF_16BE {
        b"\0\n"
    } else {
        b"\n"
    }
}

/// Offset just past the last `lf` in `bytes`. `bytes` must start on a code
/// unit boundary; a trailing incomplete unit is never matched.
pub fn end_of_last_line(bytes: &[u8], lf: &[u8]) -> Option<usize> {
    bytes
        .chunks_exact(lf.len())
        .rposition(|unit| unit == lf)
        .map(|i| (i + 1) * lf.len())
}

/// Number of `lf` code units in `bytes`, under the same alignment rule.
pub fn count_line_feeds(bytes: &[u8], lf: &[u8]) -> usize {
    bytes.chunks_exact(lf.len()).filter(|unit| *unit == lf).count()
}
