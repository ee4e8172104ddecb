//! Offset-keyed scanning of a log file that another process appends to.
//!
//! Every scan reopens the file, so a missing or recreated log is handled
//! without any watcher state. Only newline-terminated lines are consumed; a
//! trailing partial line stays unread until the writer finishes it.

use std::{io::ErrorKind, path::Path};

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMatch {
    /// Byte offset of the start of the line.
    pub offset: u64,
    pub line: String,
    /// Capture groups 1..n; `None` for groups that did not participate.
    pub groups: Vec<Option<String>>,
}

impl LogMatch {
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups
            .get(index.checked_sub(1)?)
            .and_then(|g| g.as_deref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogScan {
    pub matches: Vec<LogMatch>,
    /// Offset to pass to the next scan.
    pub next_offset: u64,
}

impl IntoIterator for LogScan {
    type Item = LogMatch;
    type IntoIter = std::vec::IntoIter<LogMatch>;

    fn into_iter(self) -> Self::IntoIter {
        self.matches.into_iter()
    }
}

/// Scan `path` from `start_offset` to its current end.
///
/// A missing file yields an empty scan at offset 0. If the file is shorter
/// than `start_offset` it was replaced, and the scan restarts from 0.
pub async fn find_pattern(
    path: &Path,
    pattern: &Regex,
    start_offset: u64,
) -> std::io::Result<LogScan> {
    let mut f = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LogScan::default()),
        Err(e) => return Err(e),
    };

    let size = f.metadata().await?.len();
    let cursor = if start_offset > size { 0 } else { start_offset };

    f.seek(std::io::SeekFrom::Start(cursor)).await?;
    let mut buf = Vec::with_capacity(size.saturating_sub(cursor) as usize);
    f.read_to_end(&mut buf).await?;

    // Only consume up to the last newline.
    let complete = match buf.iter().rposition(|b| *b == b'\n') {
        Some(i) => i + 1,
        None => 0,
    };

    let mut matches = Vec::new();
    let mut line_start = 0usize;
    for raw in buf[..complete].split_inclusive(|b| *b == b'\n') {
        let offset = cursor + line_start as u64;
        line_start += raw.len();

        // Best-effort UTF-8: servers occasionally log raw bytes.
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(['\n', '\r']);
        if let Some(caps) = pattern.captures(line) {
            matches.push(LogMatch {
                offset,
                line: line.to_string(),
                groups: caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()))
                    .collect(),
            });
        }
    }

    Ok(LogScan {
        matches,
        next_offset: cursor + complete as u64,
    })
}

/// A cursor over one log file for one pattern.
#[derive(Debug, Clone)]
pub struct LogWatch {
    pattern: Regex,
    position: u64,
}

impl LogWatch {
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Matches appended since the previous poll.
    pub async fn poll(&mut self, path: &Path) -> std::io::Result<Vec<LogMatch>> {
        let scan = find_pattern(path, &self.pattern, self.position).await?;
        self.position = scan.next_offset;
        Ok(scan.matches)
    }
}
