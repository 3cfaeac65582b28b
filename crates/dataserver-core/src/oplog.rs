//! Durable, append-only record of every file mutation.
//!
//! One entry per line:
//!
//! ```text
//! <uniqueId> <operation> [ID: <fileId>] <label> | <relativePath>
//! ```
//!
//! Scans are half-open, `(from, to]`, so chained windows never count a
//! boundary entry twice.

use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::{DataServerError, LogOperation, Result, UniqueId, UniqueIdGenerator};

const ID_OPEN: &str = "[ID: ";
const ID_CLOSE: &str = "] ";
const PATH_SEPARATOR: &str = " | ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub unique_id: UniqueId,
    pub operation: LogOperation,
    pub file_id: String,
    pub label: String,
    pub relative_path: String,
}

impl LogEntry {
    /// Builds an entry whose fields are safe to serialise into a single line.
    pub fn new(
        unique_id: UniqueId,
        operation: LogOperation,
        file_id: impl Into<String>,
        label: impl Into<String>,
        relative_path: impl Into<String>,
    ) -> Self {
        let unique_id = UniqueId::from_raw(
            unique_id
                .as_str()
                .chars()
                .map(|c| if c.is_whitespace() { '_' } else { c })
                .collect::<String>(),
        );
        Self {
            unique_id,
            operation,
            file_id: single_line(&file_id.into()).replace(']', ")"),
            label: single_line(&label.into()).replace('|', "/"),
            relative_path: single_line(&relative_path.into()),
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {} {}{}{}{}{}{}",
            self.unique_id,
            self.operation,
            ID_OPEN,
            self.file_id,
            ID_CLOSE,
            self.label,
            PATH_SEPARATOR,
            self.relative_path
        )
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let malformed = |what: &str| DataServerError::Log(format!("{}: '{}'", what, line));

        let (id, rest) = line.split_once(' ').ok_or_else(|| malformed("missing unique id"))?;
        if id.is_empty() {
            return Err(malformed("empty unique id"));
        }
        let (op, rest) = rest.split_once(' ').ok_or_else(|| malformed("missing operation"))?;
        let operation = LogOperation::from_str(op)?;
        let rest = rest
            .strip_prefix(ID_OPEN)
            .ok_or_else(|| malformed("missing file id"))?;
        let (file_id, rest) = rest
            .split_once(ID_CLOSE)
            .ok_or_else(|| malformed("unterminated file id"))?;
        let (label, relative_path) = rest
            .split_once(PATH_SEPARATOR)
            .ok_or_else(|| malformed("missing relative path"))?;

        Ok(Self {
            unique_id: UniqueId::from_raw(id),
            operation,
            file_id: file_id.to_string(),
            label: label.to_string(),
            relative_path: relative_path.to_string(),
        })
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

impl FromStr for LogEntry {
    type Err = DataServerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_line(s)
    }
}

fn single_line(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

/// Input for [`OperationLog::append_batch`].
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub operation: LogOperation,
    pub file_id: String,
    pub label: String,
    pub relative_path: String,
}

impl LogRecord {
    pub fn new(
        operation: LogOperation,
        file_id: impl Into<String>,
        label: impl Into<String>,
        relative_path: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            file_id: file_id.into(),
            label: label.into(),
            relative_path: relative_path.into(),
        }
    }
}

pub struct OperationLog {
    path: PathBuf,
    ids: UniqueIdGenerator,
    /// Serialises writers and tracks the newest id on disk.
    head: Mutex<Option<UniqueId>>,
}

impl OperationLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let head = read_entries(&path).into_iter().map(|e| e.unique_id).max();
        debug!("Opened operation log {:?} (head: {:?})", path, head);
        Ok(Self {
            ids: UniqueIdGenerator::resume_after(head.as_ref()),
            head: Mutex::new(head),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        operation: LogOperation,
        file_id: &str,
        label: &str,
        relative_path: &str,
    ) -> Result<UniqueId> {
        let mut entries =
            self.append_batch(vec![LogRecord::new(operation, file_id, label, relative_path)])?;
        entries
            .pop()
            .map(|e| e.unique_id)
            .ok_or_else(|| DataServerError::Log("append produced no entry".into()))
    }

    /// Appends every record with a single write so a cycle's entries land together.
    pub fn append_batch(&self, records: Vec<LogRecord>) -> Result<Vec<LogEntry>> {
        let mut head = self.head.lock();
        let entries: Vec<LogEntry> = records
            .into_iter()
            .map(|r| {
                LogEntry::new(
                    self.ids.next(),
                    r.operation,
                    r.file_id,
                    r.label,
                    r.relative_path,
                )
            })
            .collect();
        self.write_locked(&mut head, &entries)?;
        Ok(entries)
    }

    /// Writes entries carrying already assigned ids, e.g. when importing a log.
    pub fn write_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut head = self.head.lock();
        self.write_locked(&mut head, entries)
    }

    fn write_locked(&self, head: &mut Option<UniqueId>, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&entry.to_line());
            buf.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        file.flush()?;

        if let Some(max) = entries.iter().map(|e| &e.unique_id).max() {
            if head.as_ref().map_or(true, |h| max > h) {
                *head = Some(max.clone());
            }
        }
        Ok(())
    }

    /// Entries with `from < id <= to`, ordered by id. `None` leaves a side open.
    pub fn scan(&self, from: Option<&UniqueId>, to: Option<&UniqueId>) -> Vec<LogEntry> {
        let _guard = self.head.lock();
        let mut entries: Vec<LogEntry> = read_entries(&self.path)
            .into_iter()
            .filter(|e| from.map_or(true, |f| &e.unique_id > f))
            .filter(|e| to.map_or(true, |t| &e.unique_id <= t))
            .collect();
        entries.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        entries
    }

    pub fn last_unique_id(&self) -> Option<UniqueId> {
        self.head.lock().clone()
    }
}

fn read_entries(path: &Path) -> Vec<LogEntry> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            debug!("Operation log {:?} not readable ({}), treating as empty", path, e);
            return Vec::new();
        }
    };

    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut line_no = 0usize;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                line_no += 1;
                let line = String::from_utf8_lossy(&buf);
                if line.trim().is_empty() {
                    continue;
                }
                match LogEntry::parse_line(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!("Skipping operation log line {} in {:?}: {}", line_no, path, e),
                }
            }
            Err(e) => {
                warn!("Stopped reading operation log {:?} at line {}: {}", path, line_no, e);
                break;
            }
        }
    }
    entries
}
