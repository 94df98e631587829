//! Persistent consumer cursors, one file per consumer in each queue directory.
//!
//! The unnamed default consumer uses `head.cursor`; a named consumer `c`
//! uses `head.c.cursor`. Each file is twelve bytes: a big-endian `u32`
//! segment id followed by a big-endian `u64` byte offset within that
//! segment. Files are replaced atomically with write-to-temp, fsync,
//! rename, fsync dir.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use super::segment::fsync_dir;

pub(crate) const CURSOR_FILE: &str = "head.cursor";
const CURSOR_PREFIX: &str = "head.";
const CURSOR_SUFFIX: &str = ".cursor";
const TMP_SUFFIX: &str = ".tmp";
const CURSOR_LEN: usize = 12;

/// Position of the next record to deliver. Orders by segment, then offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Cursor {
    pub segment: u32,
    pub offset: u64,
}

impl Cursor {
    pub fn new(segment: u32, offset: u64) -> Self {
        Self { segment, offset }
    }

    fn encode(self) -> [u8; CURSOR_LEN] {
        let mut buf = [0u8; CURSOR_LEN];
        buf[..4].copy_from_slice(&self.segment.to_be_bytes());
        buf[4..].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != CURSOR_LEN {
            return None;
        }
        let segment = u32::from_be_bytes(buf[..4].try_into().ok()?);
        let offset = u64::from_be_bytes(buf[4..].try_into().ok()?);
        Some(Self { segment, offset })
    }
}

/// File name holding `consumer`'s cursor.
pub(crate) fn cursor_file_name(consumer: &str) -> String {
    if consumer.is_empty() {
        CURSOR_FILE.to_string()
    } else {
        format!("{CURSOR_PREFIX}{consumer}{CURSOR_SUFFIX}")
    }
}

/// Consumer a cursor file belongs to, if `name` is a cursor file at all.
pub(crate) fn consumer_of(name: &str) -> Option<&str> {
    if name == CURSOR_FILE {
        return Some("");
    }
    name.strip_prefix(CURSOR_PREFIX)?
        .strip_suffix(CURSOR_SUFFIX)
        .filter(|consumer| !consumer.is_empty())
}

fn read_file(path: &Path) -> io::Result<Option<Cursor>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    Cursor::decode(&bytes).map(Some).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{} is {} bytes, expected {CURSOR_LEN}",
                path.display(),
                bytes.len()
            ),
        )
    })
}

/// Read one consumer's cursor.
///
/// `Ok(None)` means no cursor has been written yet. A file of the wrong size
/// is reported as `InvalidData`.
pub(crate) fn read_cursor(dir: &Path, consumer: &str) -> io::Result<Option<Cursor>> {
    read_file(&dir.join(cursor_file_name(consumer)))
}

/// Every cursor present in `dir`, keyed by consumer.
pub(crate) fn read_cursors(dir: &Path) -> io::Result<BTreeMap<String, Cursor>> {
    let mut cursors = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(consumer) = consumer_of(&file_name.to_string_lossy()).map(str::to_string) else {
            continue;
        };
        if let Some(cursor) = read_file(&entry.path())? {
            cursors.insert(consumer, cursor);
        }
    }
    Ok(cursors)
}

/// Durably replace one consumer's cursor.
pub(crate) fn write_cursor(dir: &Path, consumer: &str, cursor: Cursor) -> io::Result<()> {
    let name = cursor_file_name(consumer);
    let tmp = dir.join(format!("{name}{TMP_SUFFIX}"));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&cursor.encode())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(name))?;
    fsync_dir(dir)
}

/// Delete a consumer's cursor. A missing file is not an error.
pub(crate) fn remove_cursor(dir: &Path, consumer: &str) -> io::Result<()> {
    match fs::remove_file(dir.join(cursor_file_name(consumer))) {
        Ok(()) => fsync_dir(dir),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
