//! Segmented durable FIFO queues, one per object type.
//!
//! Each queue lives in its own directory:
//!
//! ```text
//! <queue-dir>/<object>/
//!   seg-00000001.q       sealed
//!   seg-00000002.q       tail (open for append)
//!   head.cursor          next record for the default consumer
//!   head.warehouse.cursor
//! ```
//!
//! Appends go to the tail segment. When the tail holds `segment_size`
//! records it is sealed (fsynced and never written again) and the next
//! append creates a segment numbered one higher.
//!
//! A queue is read by one or more named consumers, each with its own
//! persisted cursor. Every consumer sees every record in order. A sealed
//! segment is deleted once all consumers have moved past it, so the
//! slowest consumer decides how much stays on disk.
//!
//! All operations on one queue serialize on a single mutex.

mod cursor;
mod segment;
mod set;

pub use set::QueueSet;

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use cursor::{Cursor, read_cursors, remove_cursor, write_cursor};
use segment::{
    ScanEnd, SegmentScan, encode_frame, fsync_dir, list_segments, read_records, scan_segment,
    segment_path, truncate_segment,
};

/// Default number of records per segment.
pub const DEFAULT_SEGMENT_SIZE: usize = 100;

/// Consumer used by [`Queue::open`] and the unqualified read methods.
pub const DEFAULT_CONSUMER: &str = "";

/// When appends are forced to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Durability {
    /// Every append is handed to the OS; the tail is fsynced on rotation
    /// and on close.
    #[default]
    OnRotation,
    /// The tail is fsynced after every append.
    EveryWrite,
}

/// Options for opening a queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Records per segment before it is sealed.
    pub segment_size: usize,
    pub durability: Durability,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            durability: Durability::default(),
        }
    }
}

impl QueueOptions {
    pub fn with_segment_size(segment_size: usize) -> Self {
        Self {
            segment_size,
            ..Self::default()
        }
    }
}

/// Queue failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue directory or one of its files could not be opened.
    #[error("queue '{name}' unavailable: {source}")]
    Unavailable {
        name: String,
        #[source]
        source: io::Error,
    },

    /// On-disk state is inconsistent and cannot be recovered automatically.
    #[error("queue '{name}' corrupt at segment {segment} offset {offset}: {reason}")]
    Corrupt {
        name: String,
        segment: u32,
        offset: u64,
        reason: String,
    },

    /// I/O failure on an open queue.
    #[error("queue '{name}' I/O error: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("queue '{name}' failed to encode item: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("queue '{name}' item of {size} bytes exceeds the 4 GiB record limit")]
    TooLarge { name: String, size: usize },

    #[error("queue '{name}' has no consumer '{consumer}'")]
    UnknownConsumer { name: String, consumer: String },

    #[error("queue '{name}' is closed")]
    Closed { name: String },
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// One segment file that still holds records some consumer has not read
/// (or is the tail).
#[derive(Debug, Clone, Copy)]
struct SegmentMeta {
    id: u32,
    records: usize,
}

/// Append handle for the tail segment.
struct Tail {
    file: File,
    bytes: u64,
}

/// Read position of one consumer.
#[derive(Debug, Clone, Copy)]
struct Reader {
    head: Cursor,
    /// Records of the head segment already delivered.
    consumed: usize,
    pending: usize,
}

struct State {
    /// Live segments, oldest first. Every reader points into one of them or
    /// at `next_id`.
    segments: VecDeque<SegmentMeta>,
    readers: BTreeMap<String, Reader>,
    /// Present while the back segment is still open for append.
    tail: Option<Tail>,
    next_id: u32,
    closed: bool,
}

impl State {
    /// Whether the segment at `index` will never be appended to again.
    fn is_sealed(&self, index: usize) -> bool {
        index + 1 < self.segments.len() || self.tail.is_none()
    }

    /// Position in `segments` of the segment a cursor points into.
    fn index_of(&self, head: Cursor) -> usize {
        let Some(front) = self.segments.front() else {
            return 0;
        };
        (head.segment.saturating_sub(front.id) as usize).min(self.segments.len())
    }

    /// Backlog of the slowest consumer.
    fn lag(&self) -> usize {
        self.readers.values().map(|r| r.pending).max().unwrap_or(0)
    }

    /// Move `reader` past every sealed segment it has read to the end.
    fn skip_consumed(&self, reader: &mut Reader, index: &mut usize) {
        while *index < self.segments.len()
            && reader.consumed == self.segments[*index].records
            && self.is_sealed(*index)
        {
            *index += 1;
            let next = self.segments.get(*index).map_or(self.next_id, |s| s.id);
            reader.head = Cursor::new(next, 0);
            reader.consumed = 0;
        }
    }
}

/// A persistent FIFO of `T` items.
pub struct Queue<T> {
    name: String,
    dir: PathBuf,
    options: QueueOptions,
    state: Mutex<State>,
    _item: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<T: Serialize + DeserializeOwned> Queue<T> {
    /// Open or create the queue stored at `dir/name` with only the default
    /// consumer, recovering from any interrupted append.
    pub fn open(dir: &Path, name: &str, options: QueueOptions) -> QueueResult<Self> {
        Self::open_with_consumers(dir, name, options, &[DEFAULT_CONSUMER])
    }

    /// Open or create the queue stored at `dir/name`, read by `consumers`.
    ///
    /// A consumer without a cursor on disk starts at the oldest position any
    /// cursor in the directory still holds, so it sees everything that is
    /// retained. Cursors of consumers not listed are removed, releasing the
    /// segments they were holding back.
    pub fn open_with_consumers<S: AsRef<str>>(
        dir: &Path,
        name: &str,
        options: QueueOptions,
        consumers: &[S],
    ) -> QueueResult<Self> {
        let qdir = dir.join(name);
        let unavailable = |source: io::Error| QueueError::Unavailable {
            name: name.to_string(),
            source,
        };
        let corrupt = |segment: u32, offset: u64, reason: String| QueueError::Corrupt {
            name: name.to_string(),
            segment,
            offset,
            reason,
        };
        let invalid = |reason: String| unavailable(io::Error::new(io::ErrorKind::InvalidInput, reason));

        if options.segment_size == 0 {
            return Err(invalid("segment size must be at least 1".to_string()));
        }

        let mut consumers: Vec<String> = consumers.iter().map(|c| c.as_ref().to_string()).collect();
        consumers.sort();
        consumers.dedup();
        if consumers.is_empty() {
            consumers.push(DEFAULT_CONSUMER.to_string());
        }
        if let Some(bad) = consumers
            .iter()
            .find(|c| c.contains(['/', '\\', '\0']) || c.as_str() == "." || c.as_str() == "..")
        {
            return Err(invalid(format!("consumer name '{bad}' is not a valid file name part")));
        }

        fs::create_dir_all(&qdir).map_err(unavailable)?;
        let ids = list_segments(&qdir).map_err(unavailable)?;
        let on_disk = read_cursors(&qdir).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                corrupt(0, 0, e.to_string())
            } else {
                unavailable(e)
            }
        })?;

        let start = on_disk
            .values()
            .min()
            .copied()
            .unwrap_or_else(|| Cursor::new(ids.first().copied().unwrap_or(1), 0));

        let mut fresh = Vec::new();
        let heads: BTreeMap<String, Cursor> = consumers
            .iter()
            .map(|consumer| {
                let head = on_disk.get(consumer).copied().unwrap_or_else(|| {
                    fresh.push(consumer.clone());
                    start
                });
                (consumer.clone(), head)
            })
            .collect();

        let retired: Vec<&String> = on_disk.keys().filter(|c| !heads.contains_key(*c)).collect();
        for consumer in &retired {
            remove_cursor(&qdir, consumer).map_err(unavailable)?;
            info!(queue = %name, consumer = %consumer, "removed cursor of a consumer no longer configured");
        }

        // Segments behind every cursor were fully delivered; a crash can
        // leave them behind between the cursor write and the unlink.
        let oldest = heads.values().map(|c| c.segment).min().unwrap_or(start.segment);
        let (stale, live): (Vec<u32>, Vec<u32>) = ids.into_iter().partition(|&id| id < oldest);
        for id in &stale {
            fs::remove_file(segment_path(&qdir, *id)).map_err(unavailable)?;
            debug!(queue = %name, segment = *id, "removed consumed segment left by a previous run");
        }
        if !stale.is_empty() {
            fsync_dir(&qdir).map_err(unavailable)?;
        }

        for pair in live.windows(2) {
            if pair[1] != pair[0] + 1 {
                return Err(corrupt(
                    pair[1],
                    0,
                    format!("segment {} follows segment {}", pair[1], pair[0]),
                ));
            }
        }

        let mut scans: Vec<SegmentScan> = Vec::with_capacity(live.len());
        for (i, &id) in live.iter().enumerate() {
            let path = segment_path(&qdir, id);
            let scan = scan_segment::<T>(&path).map_err(unavailable)?;

            match &scan.end {
                ScanEnd::Clean => {}
                ScanEnd::Torn { offset, reason } if i + 1 == live.len() => {
                    warn!(
                        queue = %name,
                        segment = id,
                        offset,
                        reason = %reason,
                        "truncating uncommitted record at queue tail"
                    );
                    truncate_segment(&path, scan.valid_len).map_err(unavailable)?;
                }
                ScanEnd::Torn { offset, reason } | ScanEnd::Corrupt { offset, reason } => {
                    return Err(corrupt(id, *offset, reason.clone()));
                }
            }
            scans.push(scan);
        }

        let first_id = live.first().copied().unwrap_or(oldest);
        let next_id = live.last().map_or(oldest, |id| id + 1);
        let counts: Vec<usize> = scans.iter().map(SegmentScan::records).collect();

        let mut readers = BTreeMap::new();
        for (consumer, head) in heads {
            let consumed = if head.segment == next_id {
                if head.offset != 0 {
                    return Err(corrupt(
                        head.segment,
                        head.offset,
                        format!("cursor of consumer '{consumer}' points into a missing segment"),
                    ));
                }
                0
            } else if head.segment >= first_id && head.segment < next_id {
                let scan = &scans[(head.segment - first_id) as usize];
                if !scan.is_boundary(head.offset) {
                    return Err(corrupt(
                        head.segment,
                        head.offset,
                        format!("cursor of consumer '{consumer}' does not sit on a record boundary"),
                    ));
                }
                scan.records_before(head.offset)
            } else {
                return Err(corrupt(
                    head.segment,
                    head.offset,
                    format!(
                        "cursor of consumer '{consumer}' names a missing segment; present are {first_id}..{next_id}"
                    ),
                ));
            };

            let index = head.segment.saturating_sub(first_id) as usize;
            let pending = counts.iter().skip(index).sum::<usize>() - consumed;
            readers.insert(
                consumer,
                Reader {
                    head,
                    consumed,
                    pending,
                },
            );
        }

        let segments: VecDeque<SegmentMeta> = live
            .iter()
            .zip(&counts)
            .map(|(&id, &records)| SegmentMeta { id, records })
            .collect();

        let tail = match (segments.back(), scans.last()) {
            (Some(back), Some(scan)) if back.records < options.segment_size => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(segment_path(&qdir, back.id))
                    .map_err(unavailable)?;
                Some(Tail {
                    file,
                    bytes: scan.valid_len,
                })
            }
            _ => None,
        };

        let state = State {
            segments,
            readers,
            tail,
            next_id,
            closed: false,
        };

        let queue = Self {
            name: name.to_string(),
            dir: qdir,
            options,
            state: Mutex::new(state),
            _item: PhantomData,
        };

        let (lag, segment_count) = {
            let mut state = queue.state.lock();
            for consumer in &fresh {
                if let Some(reader) = state.readers.get(consumer) {
                    write_cursor(&queue.dir, consumer, reader.head).map_err(unavailable)?;
                }
            }
            queue.settle_readers(&mut state)?;
            (state.lag(), state.segments.len())
        };

        sluice_core::metrics::set_queue_length(&queue.name, lag);
        info!(
            queue = %queue.name,
            segments = segment_count,
            consumers = consumers.len(),
            pending = lag,
            "queue opened"
        );

        Ok(queue)
    }

    /// Append one item. On error nothing is appended.
    pub fn enqueue(&self, item: &T) -> QueueResult<()> {
        let payload = serde_json::to_vec(item).map_err(|source| QueueError::Encode {
            name: self.name.clone(),
            source,
        })?;
        if payload.len() > u32::MAX as usize {
            return Err(QueueError::TooLarge {
                name: self.name.clone(),
                size: payload.len(),
            });
        }
        let frame = encode_frame(&payload);

        let mut state = self.state.lock();
        self.ensure_open(&state)?;

        let mut tail = match state.tail.take() {
            Some(tail) => tail,
            None => self.create_tail(&mut state)?,
        };

        if let Err(e) = self.append_frame(&mut tail, &frame) {
            state.tail = Some(tail);
            return Err(self.io_error(e));
        }
        tail.bytes += frame.len() as u64;
        for reader in state.readers.values_mut() {
            reader.pending += 1;
        }

        let (id, records) = match state.segments.back_mut() {
            Some(back) => {
                back.records += 1;
                (back.id, back.records)
            }
            None => (0, 0),
        };

        if records >= self.options.segment_size {
            self.seal(tail, id);
        } else {
            state.tail = Some(tail);
        }

        sluice_core::metrics::set_queue_length(&self.name, state.lag());
        Ok(())
    }

    /// Head item of the default consumer without advancing.
    pub fn peek(&self) -> QueueResult<Option<T>> {
        Ok(self.peek_batch(1)?.into_iter().next())
    }

    /// Up to `n` items from the default consumer's head without advancing.
    pub fn peek_batch(&self, n: usize) -> QueueResult<Vec<T>> {
        self.peek_batch_as(DEFAULT_CONSUMER, n)
    }

    /// Up to `n` items from `consumer`'s head without advancing.
    pub fn peek_batch_as(&self, consumer: &str, n: usize) -> QueueResult<Vec<T>> {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        let reader = self.reader(&state, consumer)?;
        Ok(self
            .read_from(&state, &reader, n)?
            .into_iter()
            .map(|(item, _)| item)
            .collect())
    }

    /// Remove and return the default consumer's head item.
    pub fn dequeue(&self) -> QueueResult<Option<T>> {
        Ok(self.dequeue_batch(1)?.into_iter().next())
    }

    /// Remove and return up to `n` items for the default consumer.
    pub fn dequeue_batch(&self, n: usize) -> QueueResult<Vec<T>> {
        self.dequeue_batch_as(DEFAULT_CONSUMER, n)
    }

    /// Advance `consumer` past up to `n` items and return them.
    ///
    /// The consumer's cursor is persisted once for the whole batch before
    /// any segment every consumer has finished with is deleted. Other
    /// consumers still see the items.
    pub fn dequeue_batch_as(&self, consumer: &str, n: usize) -> QueueResult<Vec<T>> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        let mut reader = self.reader(&state, consumer)?;

        let records = self.read_from(&state, &reader, n)?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut index = state.index_of(reader.head);
        for (_, frame_len) in &records {
            reader.head.offset += frame_len;
            reader.consumed += 1;
            reader.pending -= 1;
            state.skip_consumed(&mut reader, &mut index);
        }

        write_cursor(&self.dir, consumer, reader.head).map_err(|e| self.io_error(e))?;
        state.readers.insert(consumer.to_string(), reader);
        self.retire_segments(&mut state);

        sluice_core::metrics::set_queue_length(&self.name, state.lag());
        Ok(records.into_iter().map(|(item, _)| item).collect())
    }

    fn read_from(&self, state: &State, reader: &Reader, n: usize) -> QueueResult<Vec<(T, u64)>> {
        let mut remaining = n.min(reader.pending);
        let mut out = Vec::with_capacity(remaining);
        let start = state.index_of(reader.head);

        for (i, seg) in state.segments.iter().enumerate().skip(start) {
            if remaining == 0 {
                break;
            }
            let (offset, available) = if i == start {
                (reader.head.offset, seg.records - reader.consumed)
            } else {
                (0, seg.records)
            };
            let take = available.min(remaining);
            if take == 0 {
                continue;
            }

            let records =
                read_records(&segment_path(&self.dir, seg.id), offset, take).map_err(|e| {
                    if e.kind() == io::ErrorKind::InvalidData {
                        QueueError::Corrupt {
                            name: self.name.clone(),
                            segment: seg.id,
                            offset,
                            reason: e.to_string(),
                        }
                    } else {
                        self.io_error(e)
                    }
                })?;
            remaining -= records.len();
            out.extend(records);
        }

        Ok(out)
    }

    /// Move every reader past sealed segments it has already finished,
    /// persisting the cursors that changed, then drop what nobody needs.
    fn settle_readers(&self, state: &mut State) -> QueueResult<()> {
        let names: Vec<String> = state.readers.keys().cloned().collect();
        for consumer in names {
            let Some(mut reader) = state.readers.get(&consumer).copied() else {
                continue;
            };
            let before = reader.head;
            let mut index = state.index_of(reader.head);
            state.skip_consumed(&mut reader, &mut index);
            if reader.head != before {
                write_cursor(&self.dir, &consumer, reader.head).map_err(|e| self.io_error(e))?;
                state.readers.insert(consumer, reader);
            }
        }
        self.retire_segments(state);
        Ok(())
    }

    /// Delete the front segments every reader has moved past.
    fn retire_segments(&self, state: &mut State) {
        let keep_from = state
            .readers
            .values()
            .map(|r| state.index_of(r.head))
            .min()
            .unwrap_or(0);
        let gone: Vec<u32> = state.segments.drain(..keep_from).map(|s| s.id).collect();
        self.delete_segments(&gone);
    }

    fn create_tail(&self, state: &mut State) -> QueueResult<Tail> {
        let id = state.next_id;
        let next_id = id.checked_add(1).ok_or_else(|| {
            self.io_error(io::Error::other("segment ids exhausted"))
        })?;

        let path = segment_path(&self.dir, id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| self.io_error(e))?;
        fsync_dir(&self.dir).map_err(|e| self.io_error(e))?;

        state.segments.push_back(SegmentMeta { id, records: 0 });
        state.next_id = next_id;
        debug!(queue = %self.name, segment = id, "created segment");

        Ok(Tail { file, bytes: 0 })
    }

    /// Write one frame, rolling the file back to its previous length if the
    /// write or the optional fsync fails.
    fn append_frame(&self, tail: &mut Tail, frame: &[u8]) -> io::Result<()> {
        let result = tail.file.write_all(frame).and_then(|()| match self.options.durability {
            Durability::EveryWrite => tail.file.sync_data(),
            Durability::OnRotation => Ok(()),
        });

        if let Err(e) = result {
            if let Err(rollback) = tail.file.set_len(tail.bytes) {
                error!(
                    queue = %self.name,
                    error = %rollback,
                    "failed to roll back partial append"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    fn seal(&self, tail: Tail, id: u32) {
        // The record is already written; a failed fsync leaves it in the page
        // cache, which is no worse than an unsealed tail.
        if let Err(e) = tail.file.sync_all() {
            error!(queue = %self.name, segment = id, error = %e, "failed to fsync sealed segment");
        }
        metrics::counter!("queue_segments_sealed_total").increment(1);
        debug!(queue = %self.name, segment = id, bytes = tail.bytes, "sealed segment");
    }
}

impl<T> Queue<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding this queue's segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Items the slowest consumer has yet to read.
    pub fn len(&self) -> usize {
        self.state.lock().lag()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items `consumer` has yet to read, or `None` for an unknown consumer.
    pub fn pending_for(&self, consumer: &str) -> Option<usize> {
        self.state.lock().readers.get(consumer).map(|r| r.pending)
    }

    pub fn consumers(&self) -> Vec<String> {
        self.state.lock().readers.keys().cloned().collect()
    }

    /// Fsync the tail and release it. Later operations fail with
    /// [`QueueError::Closed`]; closing twice is a no-op.
    pub fn close(&self) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        if let Some(tail) = state.tail.take() {
            tail.file.sync_all().map_err(|e| self.io_error(e))?;
        }
        debug!(queue = %self.name, pending = state.lag(), "queue closed");
        Ok(())
    }

    fn reader(&self, state: &State, consumer: &str) -> QueueResult<Reader> {
        state
            .readers
            .get(consumer)
            .copied()
            .ok_or_else(|| QueueError::UnknownConsumer {
                name: self.name.clone(),
                consumer: consumer.to_string(),
            })
    }

    fn ensure_open(&self, state: &State) -> QueueResult<()> {
        if state.closed {
            return Err(QueueError::Closed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> QueueError {
        QueueError::Io {
            name: self.name.clone(),
            source,
        }
    }

    fn delete_segments(&self, ids: &[u32]) {
        if ids.is_empty() {
            return;
        }
        for id in ids {
            match fs::remove_file(segment_path(&self.dir, *id)) {
                Ok(()) => {
                    metrics::counter!("queue_segments_deleted_total").increment(1);
                    debug!(queue = %self.name, segment = id, "deleted consumed segment");
                }
                // Left for the next open to collect.
                Err(e) => warn!(queue = %self.name, segment = id, error = %e, "failed to delete consumed segment"),
            }
        }
        if let Err(e) = fsync_dir(&self.dir) {
            warn!(queue = %self.name, error = %e, "failed to fsync queue directory");
        }
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(queue = %self.name, error = %e, "failed to close queue on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn open(dir: &Path, segment_size: usize) -> Queue<u32> {
        Queue::open(dir, "q", QueueOptions::with_segment_size(segment_size)).unwrap()
    }

    fn segment_ids(dir: &Path) -> Vec<u32> {
        list_segments(&dir.join("q")).unwrap()
    }

    /// Abandon a queue without closing it, as a killed process would.
    fn crash(queue: Queue<u32>) {
        std::mem::forget(queue);
    }

    #[test]
    fn test_open_empty_creates_no_segments() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 3);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.peek().unwrap(), None);
        assert_eq!(queue.dequeue().unwrap(), None);
        assert!(segment_ids(tmp.path()).is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 3);
        for i in 1..=5 {
            queue.enqueue(&i).unwrap();
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.peek().unwrap(), Some(1));
        assert_eq!(queue.peek_batch(10).unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(queue.dequeue_batch(2).unwrap(), vec![1, 2]);
        assert_eq!(queue.dequeue().unwrap(), Some(3));
        assert_eq!(queue.dequeue_batch(10).unwrap(), vec![4, 5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rotation_three_three_one() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 3);
        for _ in 0..7 {
            queue.enqueue(&42).unwrap();
        }
        assert_eq!(queue.len(), 7);
        assert_eq!(segment_ids(tmp.path()), vec![1, 2, 3]);

        let qdir = tmp.path().join("q");
        let counts: Vec<usize> = [1, 2, 3]
            .iter()
            .map(|&id| scan_segment::<u32>(&segment_path(&qdir, id)).unwrap().records())
            .collect();
        assert_eq!(counts, vec![3, 3, 1]);
    }

    #[test]
    fn test_seal_happens_on_the_filling_append() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 2);
        queue.enqueue(&1).unwrap();
        queue.enqueue(&2).unwrap();
        assert_eq!(segment_ids(tmp.path()), vec![1]);
        queue.enqueue(&3).unwrap();
        assert_eq!(segment_ids(tmp.path()), vec![1, 2]);
    }

    #[test]
    fn test_crash_recovery() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 3);
        for i in 1..=5 {
            queue.enqueue(&i).unwrap();
        }
        crash(queue);

        let queue = open(tmp.path(), 3);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.peek().unwrap(), Some(1));
        assert_eq!(queue.dequeue().unwrap(), Some(1));
        assert_eq!(queue.peek().unwrap(), Some(2));
    }

    #[test]
    fn test_cursor_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 2);
        for i in 1..=5 {
            queue.enqueue(&i).unwrap();
        }
        assert_eq!(queue.dequeue_batch(3).unwrap(), vec![1, 2, 3]);
        crash(queue);

        let queue = open(tmp.path(), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue_batch(5).unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 10);
        for i in 1..=3 {
            queue.enqueue(&i).unwrap();
        }
        crash(queue);

        let path = segment_path(&tmp.path().join("q"), 1);
        let committed = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[0, 0, 0, 50, b'1'])
            .unwrap();

        let queue = open(tmp.path(), 10);
        assert_eq!(queue.len(), 3);
        assert_eq!(fs::metadata(&path).unwrap().len(), committed);
        queue.enqueue(&4).unwrap();
        assert_eq!(queue.dequeue_batch(10).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_corrupt_sealed_segment_fails_open() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 2);
        for i in 1..=3 {
            queue.enqueue(&i).unwrap();
        }
        drop(queue);

        let path = segment_path(&tmp.path().join("q"), 1);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = b'x';
        fs::write(&path, bytes).unwrap();

        let err = Queue::<u32>::open(tmp.path(), "q", QueueOptions::with_segment_size(2)).unwrap_err();
        assert!(matches!(err, QueueError::Corrupt { segment: 1, .. }));
    }

    #[test]
    fn test_cursor_off_boundary_fails_open() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 5);
        queue.enqueue(&1).unwrap();
        drop(queue);

        write_cursor(&tmp.path().join("q"), "", Cursor::new(1, 2)).unwrap();
        let err = Queue::<u32>::open(tmp.path(), "q", QueueOptions::with_segment_size(5)).unwrap_err();
        assert!(matches!(err, QueueError::Corrupt { .. }));
    }

    #[test]
    fn test_consumed_segments_are_deleted() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 2);
        for i in 1..=4 {
            queue.enqueue(&i).unwrap();
        }
        assert_eq!(segment_ids(tmp.path()), vec![1, 2]);

        queue.dequeue().unwrap();
        assert_eq!(segment_ids(tmp.path()), vec![1, 2]);
        queue.dequeue().unwrap();
        assert_eq!(segment_ids(tmp.path()), vec![2]);
        queue.dequeue_batch(2).unwrap();
        assert!(segment_ids(tmp.path()).is_empty());

        queue.enqueue(&5).unwrap();
        assert_eq!(segment_ids(tmp.path()), vec![3]);
        assert_eq!(queue.peek().unwrap(), Some(5));
    }

    #[test]
    fn test_open_tail_is_kept_when_drained() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 3);
        queue.enqueue(&1).unwrap();
        queue.dequeue().unwrap();
        assert_eq!(segment_ids(tmp.path()), vec![1]);

        queue.enqueue(&2).unwrap();
        queue.enqueue(&3).unwrap();
        assert_eq!(queue.dequeue_batch(5).unwrap(), vec![2, 3]);
        assert!(segment_ids(tmp.path()).is_empty());
    }

    #[test]
    fn test_stale_segment_behind_cursor_is_removed() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 1);
        queue.enqueue(&1).unwrap();
        queue.enqueue(&2).unwrap();
        drop(queue);

        // Cursor already moved past segment 1 but the unlink never happened.
        write_cursor(&tmp.path().join("q"), "", Cursor::new(2, 0)).unwrap();

        let queue = open(tmp.path(), 1);
        assert_eq!(segment_ids(tmp.path()), vec![2]);
        assert_eq!(queue.dequeue().unwrap(), Some(2));
    }

    #[test]
    fn test_close_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 3);
        queue.enqueue(&1).unwrap();
        queue.close().unwrap();
        queue.close().unwrap();

        assert!(matches!(queue.enqueue(&2), Err(QueueError::Closed { .. })));
        assert!(matches!(queue.peek(), Err(QueueError::Closed { .. })));
        drop(queue);

        let queue = open(tmp.path(), 3);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_every_write_durability() {
        let tmp = TempDir::new().unwrap();
        let options = QueueOptions {
            segment_size: 4,
            durability: Durability::EveryWrite,
        };
        let queue: Queue<String> = Queue::open(tmp.path(), "q", options).unwrap();
        queue.enqueue(&"a".to_string()).unwrap();
        std::mem::forget(queue);

        let queue: Queue<String> = Queue::open(tmp.path(), "q", options).unwrap();
        assert_eq!(queue.peek().unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn test_zero_segment_size_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = Queue::<u32>::open(tmp.path(), "q", QueueOptions::with_segment_size(0)).unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { .. }));
    }

    fn open_for(dir: &Path, segment_size: usize, consumers: &[&str]) -> Queue<u32> {
        Queue::open_with_consumers(dir, "q", QueueOptions::with_segment_size(segment_size), consumers)
            .unwrap()
    }

    #[test]
    fn test_consumers_read_independently() {
        let tmp = TempDir::new().unwrap();
        let queue = open_for(tmp.path(), 2, &["lake", "warehouse"]);
        for i in 1..=5 {
            queue.enqueue(&i).unwrap();
        }
        assert_eq!(queue.consumers(), vec!["lake", "warehouse"]);

        assert_eq!(queue.dequeue_batch_as("warehouse", 10).unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(queue.pending_for("warehouse"), Some(0));
        assert_eq!(queue.pending_for("lake"), Some(5));
        assert_eq!(queue.len(), 5);
        assert_eq!(segment_ids(tmp.path()), vec![1, 2, 3]);

        assert_eq!(queue.peek_batch_as("lake", 1).unwrap(), vec![1]);
        assert_eq!(queue.dequeue_batch_as("lake", 2).unwrap(), vec![1, 2]);
        assert_eq!(segment_ids(tmp.path()), vec![2, 3]);
        assert_eq!(queue.dequeue_batch_as("lake", 3).unwrap(), vec![3, 4, 5]);
        assert_eq!(segment_ids(tmp.path()), vec![3]);
        assert!(queue.is_empty());

        queue.enqueue(&6).unwrap();
        assert_eq!(queue.pending_for("lake"), Some(1));
        assert_eq!(queue.dequeue_batch_as("lake", 10).unwrap(), vec![6]);
        assert_eq!(segment_ids(tmp.path()), vec![3]);
        assert_eq!(queue.dequeue_batch_as("warehouse", 10).unwrap(), vec![6]);
        assert!(segment_ids(tmp.path()).is_empty());
    }

    #[test]
    fn test_segment_kept_until_every_consumer_passes() {
        let tmp = TempDir::new().unwrap();
        let queue = open_for(tmp.path(), 1, &["lake", "warehouse"]);
        for i in 1..=3 {
            queue.enqueue(&i).unwrap();
        }

        queue.dequeue_batch_as("warehouse", 3).unwrap();
        assert_eq!(segment_ids(tmp.path()), vec![1, 2, 3]);
        queue.dequeue_batch_as("lake", 2).unwrap();
        assert_eq!(segment_ids(tmp.path()), vec![3]);
        queue.dequeue_batch_as("lake", 1).unwrap();
        assert!(segment_ids(tmp.path()).is_empty());
    }

    #[test]
    fn test_consumer_cursors_survive_restart() {
        let tmp = TempDir::new().unwrap();
        let queue = open_for(tmp.path(), 2, &["lake", "warehouse"]);
        for i in 1..=5 {
            queue.enqueue(&i).unwrap();
        }
        queue.dequeue_batch_as("warehouse", 3).unwrap();
        queue.dequeue_batch_as("lake", 1).unwrap();
        crash(queue);

        let qdir = tmp.path().join("q");
        assert!(qdir.join("head.lake.cursor").exists());
        assert!(qdir.join("head.warehouse.cursor").exists());
        assert!(!qdir.join("head.cursor").exists());

        let queue = open_for(tmp.path(), 2, &["warehouse", "lake"]);
        assert_eq!(queue.pending_for("lake"), Some(4));
        assert_eq!(queue.pending_for("warehouse"), Some(2));
        assert_eq!(queue.dequeue_batch_as("warehouse", 10).unwrap(), vec![4, 5]);
        assert_eq!(queue.dequeue_batch_as("lake", 10).unwrap(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_removed_consumer_releases_segments() {
        let tmp = TempDir::new().unwrap();
        let queue = open_for(tmp.path(), 1, &["lake", "warehouse"]);
        for i in 1..=3 {
            queue.enqueue(&i).unwrap();
        }
        queue.dequeue_batch_as("warehouse", 3).unwrap();
        drop(queue);
        assert_eq!(segment_ids(tmp.path()), vec![1, 2, 3]);

        let queue = open_for(tmp.path(), 1, &["warehouse"]);
        assert!(segment_ids(tmp.path()).is_empty());
        assert!(!tmp.path().join("q").join("head.lake.cursor").exists());
        assert!(queue.is_empty());
        assert!(matches!(
            queue.peek_batch_as("lake", 1),
            Err(QueueError::UnknownConsumer { .. })
        ));
    }

    #[test]
    fn test_added_consumer_starts_at_oldest_cursor() {
        let tmp = TempDir::new().unwrap();
        let queue = open(tmp.path(), 2);
        for i in 1..=4 {
            queue.enqueue(&i).unwrap();
        }
        queue.dequeue().unwrap();
        drop(queue);

        let queue = open_for(tmp.path(), 2, &["warehouse"]);
        assert!(!tmp.path().join("q").join("head.cursor").exists());
        assert_eq!(queue.dequeue_batch_as("warehouse", 2).unwrap(), vec![2, 3]);
        drop(queue);

        let queue = open_for(tmp.path(), 2, &["lake", "warehouse"]);
        assert_eq!(queue.pending_for("lake"), Some(1));
        assert_eq!(queue.dequeue_batch_as("lake", 10).unwrap(), vec![4]);
        crash(queue);

        let queue = open_for(tmp.path(), 2, &["lake", "warehouse"]);
        assert_eq!(queue.pending_for("lake"), Some(0));
        assert_eq!(queue.pending_for("warehouse"), Some(1));
    }

    #[test]
    fn test_default_reads_fail_without_default_consumer() {
        let tmp = TempDir::new().unwrap();
        let queue = open_for(tmp.path(), 2, &["warehouse"]);
        queue.enqueue(&1).unwrap();
        assert!(matches!(queue.peek(), Err(QueueError::UnknownConsumer { .. })));
        assert_eq!(queue.pending_for(""), None);
    }

    #[test]
    fn test_consumer_name_with_separator_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = Queue::<u32>::open_with_consumers(
            tmp.path(),
            "q",
            QueueOptions::default(),
            &["../escape"],
        )
        .unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { .. }));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(u32),
        Dequeue(usize),
        Crash,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => any::<u32>().prop_map(Op::Enqueue),
            2 => (1usize..4).prop_map(Op::Dequeue),
            1 => Just(Op::Crash),
        ]
    }

    /// Reference model: pending items tagged with the segment they landed in.
    #[derive(Default)]
    struct Model {
        items: VecDeque<(u32, u32)>,
        open_tail: Option<(u32, usize)>,
        next_id: u32,
    }

    impl Model {
        fn enqueue(&mut self, value: u32, segment_size: usize) {
            let (id, count) = match self.open_tail.take() {
                Some(tail) => tail,
                None => {
                    self.next_id += 1;
                    (self.next_id, 0)
                }
            };
            self.items.push_back((id, value));
            if count + 1 < segment_size {
                self.open_tail = Some((id, count + 1));
            }
        }

        fn expected_segments(&self) -> Vec<u32> {
            let mut ids: BTreeSet<u32> = self.items.iter().map(|(id, _)| *id).collect();
            if let Some((id, _)) = self.open_tail {
                ids.insert(id);
            }
            ids.into_iter().collect()
        }
    }

    proptest! {
        #[test]
        fn prop_queue_matches_model(
            segment_size in 1usize..5,
            ops in prop::collection::vec(op_strategy(), 0..60),
        ) {
            let tmp = TempDir::new().unwrap();
            let mut queue = open(tmp.path(), segment_size);
            let mut model = Model::default();

            for op in ops {
                match op {
                    Op::Enqueue(v) => {
                        queue.enqueue(&v).unwrap();
                        model.enqueue(v, segment_size);
                    }
                    Op::Dequeue(n) => {
                        let got = queue.dequeue_batch(n).unwrap();
                        let want: Vec<u32> = (0..n)
                            .filter_map(|_| model.items.pop_front().map(|(_, v)| v))
                            .collect();
                        prop_assert_eq!(got, want);
                    }
                    Op::Crash => {
                        crash(queue);
                        queue = open(tmp.path(), segment_size);
                    }
                }

                prop_assert_eq!(queue.len(), model.items.len());
                prop_assert_eq!(segment_ids(tmp.path()), model.expected_segments());
            }

            crash(queue);
            let queue = open(tmp.path(), segment_size);
            let want: Vec<u32> = model.items.iter().map(|(_, v)| *v).collect();
            prop_assert_eq!(queue.peek_batch(usize::MAX).unwrap(), want);
        }

        #[test]
        fn prop_rotation_seals_exactly_one_segment(segment_size in 1usize..8) {
            let tmp = TempDir::new().unwrap();
            let queue = open(tmp.path(), segment_size);
            for i in 0..segment_size as u32 {
                queue.enqueue(&i).unwrap();
            }
            prop_assert_eq!(segment_ids(tmp.path()), vec![1]);
            queue.enqueue(&0).unwrap();
            prop_assert_eq!(segment_ids(tmp.path()), vec![1, 2]);
        }
    }
}
