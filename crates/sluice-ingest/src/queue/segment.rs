//! Segment file naming, framing and recovery scanning.
//!
//! # Segment Format
//!
//! ```text
//! [u32 big-endian length][JSON payload]
//! [u32 big-endian length][JSON payload]
//! ...
//! ```
//!
//! Segments are named `seg-NNNNNNNN.q`, numbered from 1 with 8-digit zero
//! padding so lexicographic order matches numeric order.

use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Size of the length prefix in front of every record.
pub(crate) const FRAME_HEADER_LEN: u64 = 4;

const SEGMENT_PREFIX: &str = "seg-";
const SEGMENT_SUFFIX: &str = ".q";

/// File name for a segment id.
pub(crate) fn segment_file_name(id: u32) -> String {
    format!("{SEGMENT_PREFIX}{id:08}{SEGMENT_SUFFIX}")
}

pub(crate) fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(segment_file_name(id))
}

/// Parse `seg-NNNNNNNN.q` back into its id.
pub(crate) fn parse_segment_file_name(name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// List segment ids present in `dir`, ascending.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = parse_segment_file_name(&entry.file_name().to_string_lossy()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Frame a payload: big-endian length prefix followed by the bytes.
pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// How a segment scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScanEnd {
    /// Every byte belongs to a complete, decodable record.
    Clean,
    /// The final record is incomplete or undecodable and runs to end of file.
    Torn { offset: u64, reason: String },
    /// A complete record in the middle of the file fails to decode.
    Corrupt { offset: u64, reason: String },
}

/// Result of scanning one segment file.
#[derive(Debug, Clone)]
pub(crate) struct SegmentScan {
    /// Byte offset of every valid record, in order.
    pub offsets: Vec<u64>,
    /// Offset one past the last valid record.
    pub valid_len: u64,
    pub end: ScanEnd,
}

impl SegmentScan {
    pub fn records(&self) -> usize {
        self.offsets.len()
    }

    /// Whether `offset` sits on a record boundary (including end of data).
    pub fn is_boundary(&self, offset: u64) -> bool {
        offset == self.valid_len || self.offsets.binary_search(&offset).is_ok()
    }

    /// Number of records before `offset`. Only meaningful on a boundary.
    pub fn records_before(&self, offset: u64) -> usize {
        self.offsets.partition_point(|&o| o < offset)
    }
}

/// Scan a segment, decoding each payload as `T`.
pub(crate) fn scan_segment<T: DeserializeOwned>(path: &Path) -> io::Result<SegmentScan> {
    let data = fs::read(path)?;
    let total = data.len() as u64;
    let mut offsets = Vec::new();
    let mut pos = 0u64;

    let end = loop {
        let remaining = total - pos;
        if remaining == 0 {
            break ScanEnd::Clean;
        }
        if remaining < FRAME_HEADER_LEN {
            break ScanEnd::Torn {
                offset: pos,
                reason: format!("{remaining} trailing bytes, shorter than a length prefix"),
            };
        }

        let start = pos as usize;
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&data[start..start + 4]);
        let len = u32::from_be_bytes(len_buf) as u64;

        if len > remaining - FRAME_HEADER_LEN {
            break ScanEnd::Torn {
                offset: pos,
                reason: format!(
                    "length prefix {len} exceeds the {} bytes remaining",
                    remaining - FRAME_HEADER_LEN
                ),
            };
        }

        let payload_start = start + FRAME_HEADER_LEN as usize;
        let payload = &data[payload_start..payload_start + len as usize];
        let record_end = pos + FRAME_HEADER_LEN + len;

        if let Err(e) = serde_json::from_slice::<T>(payload) {
            let reason = format!("payload does not decode: {e}");
            break if record_end == total {
                ScanEnd::Torn { offset: pos, reason }
            } else {
                ScanEnd::Corrupt { offset: pos, reason }
            };
        }

        offsets.push(pos);
        pos = record_end;
    };

    Ok(SegmentScan {
        offsets,
        valid_len: pos,
        end,
    })
}

/// Read up to `limit` records starting at `offset`, returning each decoded
/// item with its frame length.
pub(crate) fn read_records<T: DeserializeOwned>(
    path: &Path,
    offset: u64,
    limit: usize,
) -> io::Result<Vec<(T, u64)>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut out = Vec::with_capacity(limit);
    for _ in 0..limit {
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        let item = serde_json::from_slice(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        out.push((item, FRAME_HEADER_LEN + len as u64));
    }

    Ok(out)
}

/// Cut a segment back to `len` bytes and make the truncation durable.
pub(crate) fn truncate_segment(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

/// Syncs a directory so that created, renamed and deleted entries survive a
/// power loss.
pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
