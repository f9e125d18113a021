//! Incremental reading of one watched file.
//!
//! A [`FileTailer`] owns the byte offset up to which its file has already
//! been forwarded. Every time the directory notifier reports a change,
//! [`FileTailer::process`] reads whatever was appended since, splits it into
//! lines and hands each line to the [`BroadcastSink`].
//!
//! Truncation and rotation are detected by size only: a file shorter than the
//! recorded offset is re-read from the start. A replacement file of equal or
//! greater size is therefore read from the old offset, which may skip or
//! re-deliver content.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use encoding_rs::Encoding;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastSink, LogMessage};
use crate::descriptor::{end_of_last_line, line_feed, resolve_encoding, LogId, WatchedFile};

/// Default cap on a single read pass (64 MB).
pub const DEFAULT_MAX_READ_BYTES: u64 = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Where a freshly started tailer begins reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Only lines appended after the watch started.
    #[default]
    End,
    /// The whole existing content is delivered on the first change.
    Beginning,
}

/// What happens to trailing bytes not yet terminated by a newline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PartialLines {
    /// Deliver the fragment as a line and move past it. The rest of that
    /// line arrives as a separate line on the next change.
    #[default]
    Emit,
    /// Leave the offset after the last complete line so the fragment is
    /// delivered once its terminator is written.
    Hold,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TailOptions {
    pub start_position: StartPosition,
    pub partial_lines: PartialLines,
    pub max_read_bytes: u64,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            start_position: StartPosition::default(),
            partial_lines: PartialLines::default(),
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }
}

// ---------------------------------------------------------------------------
// FileTailer
// ---------------------------------------------------------------------------

pub struct FileTailer {
    path: PathBuf,
    log_id: LogId,
    encoding: &'static Encoding,
    /// Encoded `\n`; every cut of the read stream lands on a multiple of
    /// its length so multi-byte code units are never split.
    line_feed: &'static [u8],
    partial_lines: PartialLines,
    max_read_bytes: u64,
    /// Held for the whole of `process` so overlapping calls for the same
    /// file deliver lines once and in order.
    read_offset: Mutex<u64>,
}

impl FileTailer {
    pub fn new(file: &WatchedFile, options: &TailOptions) -> Self {
        let encoding = resolve_encoding(&file.encoding);
        let line_feed = line_feed(encoding);
        let unit = line_feed.len() as u64;

        let read_offset = match options.start_position {
            StartPosition::Beginning => 0,
            StartPosition::End => {
                let len = std::fs::metadata(&file.path).map(|m| m.len()).unwrap_or(0);
                len - len % unit
            }
        };

        Self {
            path: file.path.clone(),
            log_id: file.id,
            encoding,
            line_feed,
            partial_lines: options.partial_lines,
            max_read_bytes: options.max_read_bytes.max(unit),
            read_offset: Mutex::new(read_offset),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    pub fn read_offset(&self) -> u64 {
        *self.read_offset.lock()
    }

    /// Forward everything appended since the last call. Returns the number of
    /// lines sent.
    pub fn process(&self, sink: &dyn BroadcastSink) -> usize {
        let mut offset = self.read_offset.lock();
        let lines = self.read_new_lines(&mut offset);
        let sent = lines.len();
        for line in lines {
            sink.send(self.log_id, LogMessage::new(line));
        }
        sent
    }

    /// Read new lines starting at `offset`, advancing it past what was
    /// consumed. Missing files and read errors end the cycle early and keep
    /// whatever offset was reached.
    fn read_new_lines(&self, offset: &mut u64) -> Vec<String> {
        let mut lines = Vec::new();

        let file_len = match std::fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(e) => {
                self.log_skip("stat", &e);
                return lines;
            }
        };

        if file_len < *offset {
            info!(
                log_id = %self.log_id,
                path = %self.path.display(),
                "file truncated, resetting offset"
            );
            *offset = 0;
        }

        if file_len == *offset {
            return lines;
        }

        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                self.log_skip("open", &e);
                return lines;
            }
        };

        if let Err(e) = file.seek(SeekFrom::Start(*offset)) {
            self.log_skip("seek", &e);
            return lines;
        }

        loop {
            let mut buf = Vec::new();
            let read = match (&mut file).take(self.max_read_bytes).read_to_end(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    self.log_skip("read", &e);
                    break;
                }
            };
            if read == 0 {
                break;
            }

            let more = read as u64 == self.max_read_bytes;
            let consumed = self.consumed_len(&buf, more);
            if consumed > 0 {
                self.decode_lines(&buf[..consumed], *offset == 0, &mut lines);
                *offset += consumed as u64;
            }

            if !more || consumed == 0 {
                break;
            }
            if consumed < read {
                if let Err(e) = file.seek(SeekFrom::Start(*offset)) {
                    self.log_skip("seek", &e);
                    break;
                }
            }
        }

        lines
    }

    /// How many bytes of `buf` this pass delivers.
    fn consumed_len(&self, buf: &[u8], more: bool) -> usize {
        let after_last_newline = end_of_last_line(buf, self.line_feed);
        let whole_units = buf.len() - buf.len() % self.line_feed.len();
        if more {
            // Cut intermediate passes at a line boundary unless a single
            // line is longer than the whole pass.
            return after_last_newline.unwrap_or(whole_units);
        }
        match self.partial_lines {
            PartialLines::Emit => whole_units,
            PartialLines::Hold => after_last_newline.unwrap_or(0),
        }
    }

    fn decode_lines(&self, bytes: &[u8], at_start: bool, lines: &mut Vec<String>) {
        let text = if at_start {
            self.encoding.decode_with_bom_removal(bytes).0
        } else {
            self.encoding.decode_without_bom_handling(bytes).0
        };
        lines.extend(text.lines().map(str::to_string));
    }

    fn log_skip(&self, op: &str, err: &io::Error) {
        if err.kind() == io::ErrorKind::NotFound {
            debug!(
                log_id = %self.log_id,
                path = %self.path.display(),
                "file missing during {}, skipping cycle", op
            );
        } else {
            warn!(
                log_id = %self.log_id,
                path = %self.path.display(),
                "could not {} file: {}", op, err
            );
        }
    }
}
