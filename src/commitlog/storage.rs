use crate::commitlog::log::clip_range;
use crate::commitlog::segment::{self, RecordError, SegmentName};
use crate::commitlog::{Entry, Index, Log, LogError, LogReader};
use parking_lot::RwLock;
use slog::Logger;
use std::convert::TryFrom;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Generic config for initializing a disk-based commit log, independent of data model and
/// algorithm.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub directory: PathBuf,
    /// The active segment is rotated once it holds at least this many bytes.
    pub max_segment_bytes: u64,
    /// The active segment is rotated once it holds at least this many entries.
    pub max_segment_entries: u64,
}

/// Durable log made of append-only segment files. See `segment` for the file format.
///
/// The writer owns the active segment's file handle. Record positions live in a segment table
/// shared with readers; a record's bytes are always written before its position is published.
pub struct SegmentedDiskLog<E: Entry> {
    logger: Logger,
    directory: PathBuf,
    max_segment_bytes: u64,
    max_segment_entries: u64,
    shared: Arc<RwLock<SegmentTable>>,
    active_file: File,
    _pd: PhantomData<E>,
}

pub struct SegmentedDiskLogReader<E: Entry> {
    shared: Arc<RwLock<SegmentTable>>,
    _pd: PhantomData<E>,
}

struct SegmentMeta {
    name: SegmentName,
    path: PathBuf,
    // Byte offset of each record. Entry `base_index + i` starts at `offsets[i]`.
    offsets: Vec<u64>,
    len_bytes: u64,
}

impl SegmentMeta {
    fn next_index(&self) -> Index {
        self.name.base_index.plus(self.offsets.len() as u64)
    }
}

// Never empty. The last segment is the active one.
struct SegmentTable {
    segments: Vec<SegmentMeta>,
}

struct ReadPlan {
    path: PathBuf,
    first: Index,
    count: usize,
    start: u64,
    end: u64,
}

impl SegmentTable {
    fn first_index(&self) -> Index {
        self.segments[0].name.base_index
    }

    fn next_index(&self) -> Index {
        self.active().next_index()
    }

    fn active(&self) -> &SegmentMeta {
        &self.segments[self.segments.len() - 1]
    }

    fn active_mut(&mut self) -> &mut SegmentMeta {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    fn segment_position(&self, index: Index) -> Option<usize> {
        if index < self.first_index() || index >= self.next_index() {
            return None;
        }

        let after = self
            .segments
            .partition_point(|segment| segment.name.base_index <= index);
        Some(after - 1)
    }

    // Caller must have clipped the range to retained entries.
    fn plan(&self, from: Index, to_inclusive: Index) -> Vec<ReadPlan> {
        let mut plans = Vec::new();
        let mut cursor = from;
        while cursor <= to_inclusive {
            let position = match self.segment_position(cursor) {
                Some(p) => p,
                None => break,
            };
            let segment = &self.segments[position];
            let first_slot = segment.name.base_index.distance_to(cursor) as usize;
            let last_slot = std::cmp::min(
                segment.name.base_index.distance_to(to_inclusive) as usize,
                segment.offsets.len() - 1,
            );
            let end = match segment.offsets.get(last_slot + 1) {
                Some(offset) => *offset,
                None => segment.len_bytes,
            };

            plans.push(ReadPlan {
                path: segment.path.clone(),
                first: cursor,
                count: last_slot - first_slot + 1,
                start: segment.offsets[first_slot],
                end,
            });
            cursor = segment.name.base_index.plus(last_slot as u64 + 1);
        }

        plans
    }
}

impl<E: Entry> SegmentedDiskLog<E> {
    /// Opens the log in `config.directory`, creating it if needed, and recovers whatever a
    /// previous process left behind.
    pub fn open(config: StorageConfig, logger: Logger) -> Result<Self, LogError> {
        fs::create_dir_all(&config.directory)?;
        let names = segment::list_segments(&config.directory)?;

        let mut segments: Vec<SegmentMeta> = Vec::with_capacity(names.len());
        let mut discarded = Vec::new();
        for (position, name) in names.iter().enumerate() {
            if !discarded.is_empty() {
                discarded.push(*name);
                continue;
            }
            if let Some(previous) = segments.last() {
                if previous.next_index() != name.base_index {
                    // Leftover of an interrupted truncation.
                    slog::warn!(
                        logger,
                        "Segment does not continue its predecessor. Expected base {:?}, found {:?}. Discarding it and everything after.",
                        previous.next_index(),
                        name.base_index;
                        "Segment" => name.seq
                    );
                    discarded.push(*name);
                    continue;
                }
            }

            let path = name.path_in(&config.directory);
            let scan = segment::scan_segment(&path, name.base_index)?;
            if let Some(tail_error) = scan.tail_error {
                if position != names.len() - 1 {
                    return Err(LogError::Corrupted(format!(
                        "{:?} in sealed segment {} at byte {}",
                        tail_error,
                        path.display(),
                        scan.valid_len
                    )));
                }

                slog::warn!(
                    logger,
                    "Cutting {:?} tail of {} bytes off the last segment",
                    tail_error,
                    scan.file_len - scan.valid_len;
                    "Segment" => name.seq
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }

            segments.push(SegmentMeta {
                name: *name,
                path,
                offsets: scan.offsets,
                len_bytes: scan.valid_len,
            });
        }

        if !discarded.is_empty() {
            remove_segment_files(&config.directory, &discarded)?;
        }

        if segments.is_empty() {
            let name = SegmentName {
                seq: 0,
                base_index: Index::start_index(),
            };
            let path = name.path_in(&config.directory);
            create_segment_file(&path)?;
            segment::sync_directory(&config.directory)?;
            segments.push(SegmentMeta {
                name,
                path,
                offsets: Vec::new(),
                len_bytes: 0,
            });
        }

        let table = SegmentTable { segments };
        let active_file = open_for_append(&table.active().path)?;
        slog::info!(
            logger,
            "Opened log with {} segment(s), entries [{:?}, {:?})",
            table.segments.len(),
            table.first_index(),
            table.next_index()
        );

        Ok(SegmentedDiskLog {
            logger,
            directory: config.directory,
            max_segment_bytes: config.max_segment_bytes,
            max_segment_entries: config.max_segment_entries,
            shared: Arc::new(RwLock::new(table)),
            active_file,
            _pd: PhantomData::default(),
        })
    }

    pub fn segment_count(&self) -> usize {
        self.shared.read().segments.len()
    }

    fn rotate_if_full(&mut self) -> Result<(), LogError> {
        let (current, next_index) = {
            let table = self.shared.read();
            let active = table.active();
            let full = active.offsets.len() as u64 >= self.max_segment_entries
                || active.len_bytes >= self.max_segment_bytes;
            if !full || active.offsets.is_empty() {
                return Ok(());
            }
            (active.name, active.next_index())
        };

        // Seal the old segment before anything lands in the new one.
        self.active_file.sync_data()?;

        let name = SegmentName {
            seq: current.seq + 1,
            base_index: next_index,
        };
        let path = name.path_in(&self.directory);
        let file = create_segment_file(&path)?;
        segment::sync_directory(&self.directory)?;

        slog::debug!(self.logger, "Rotated to new segment starting at {:?}", next_index; "Segment" => name.seq);
        self.active_file = file;
        self.shared.write().segments.push(SegmentMeta {
            name,
            path,
            offsets: Vec::new(),
            len_bytes: 0,
        });

        Ok(())
    }
}

impl<E: Entry> Log<E> for SegmentedDiskLog<E> {
    type Reader = SegmentedDiskLogReader<E>;

    fn append(&mut self, index: Index, entry: E) -> Result<Index, LogError> {
        let expected = self.shared.read().next_index();
        if index != expected {
            return Err(LogError::NonContiguous {
                expected,
                actual: index,
            });
        }

        let payload: Vec<u8> = entry.into();
        let record = segment::encode_record(index, &payload)?;
        self.rotate_if_full()?;

        let offset = self.shared.read().active().len_bytes;
        if let Err(e) = self.active_file.write_all(&record) {
            // Don't leave a partial record behind for the next append to build on.
            let _ = self.active_file.set_len(offset);
            return Err(e.into());
        }

        let mut table = self.shared.write();
        let active = table.active_mut();
        active.offsets.push(offset);
        active.len_bytes = offset + record.len() as u64;

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, LogError> {
        read_one(&self.shared, index)
    }

    fn read_range(&self, from: Index, to_inclusive: Index) -> Result<Vec<E>, LogError> {
        read_range(&self.shared, from, to_inclusive)
    }

    fn truncate(&mut self, index: Index) -> Result<(), LogError> {
        let (position, new_len, removed) = {
            let table = self.shared.read();
            if index < table.first_index() {
                return Err(LogError::Pruned {
                    requested: index,
                    first_retained: table.first_index(),
                });
            }
            let position = match table.segment_position(index) {
                Some(p) => p,
                None => return Ok(()),
            };
            let segment = &table.segments[position];
            let slot = segment.name.base_index.distance_to(index) as usize;
            let removed: Vec<SegmentName> = table.segments[position + 1..]
                .iter()
                .map(|s| s.name)
                .collect();
            (position, segment.offsets[slot], removed)
        };

        // Cut the containing segment durably before touching any later segment. If we crash in
        // between, recovery sees the later segments no longer line up and drops them.
        let is_active = removed.is_empty();
        let new_active_file = if is_active {
            self.active_file.set_len(new_len)?;
            self.active_file.sync_all()?;
            None
        } else {
            let path = self.shared.read().segments[position].path.clone();
            let file = open_for_append(&path)?;
            file.set_len(new_len)?;
            file.sync_all()?;
            Some(file)
        };

        {
            let mut table = self.shared.write();
            table.segments.truncate(position + 1);
            let active = table.active_mut();
            let slot = active.name.base_index.distance_to(index) as usize;
            active.offsets.truncate(slot);
            active.len_bytes = new_len;
        }

        if let Some(file) = new_active_file {
            self.active_file = file;
            // Leftover files no longer line up with the cut segment, so recovery drops them.
            if let Err(e) = remove_segment_files(&self.directory, &removed) {
                slog::warn!(
                    self.logger,
                    "Failed to remove {} truncated segment(s): {:?}",
                    removed.len(),
                    e
                );
            }
        }

        slog::debug!(self.logger, "Truncated log from {:?}", index; "Segment" => position);
        Ok(())
    }

    fn prune(&mut self, up_to: Index) -> Result<Index, LogError> {
        let (removed, first_index) = {
            let mut table = self.shared.write();
            let mut count = 0;
            // Segment `count` is prunable when its successor starts at or before `up_to + 1`.
            while count + 1 < table.segments.len()
                && table.segments[count + 1].name.base_index <= up_to.plus(1)
            {
                count += 1;
            }
            let removed: Vec<SegmentName> = table.segments.drain(..count).map(|s| s.name).collect();
            (removed, table.first_index())
        };

        if !removed.is_empty() {
            remove_segment_files(&self.directory, &removed)?;
            slog::info!(
                self.logger,
                "Pruned {} segment(s). First retained index is now {:?}",
                removed.len(),
                first_index
            );
        }

        Ok(first_index)
    }

    fn sync(&mut self) -> Result<(), LogError> {
        self.active_file.sync_data()?;
        Ok(())
    }

    fn first_index(&self) -> Index {
        self.shared.read().first_index()
    }

    fn next_index(&self) -> Index {
        self.shared.read().next_index()
    }

    fn reader(&self) -> Self::Reader {
        SegmentedDiskLogReader {
            shared: self.shared.clone(),
            _pd: PhantomData::default(),
        }
    }
}

impl<E: Entry> Clone for SegmentedDiskLogReader<E> {
    fn clone(&self) -> Self {
        SegmentedDiskLogReader {
            shared: self.shared.clone(),
            _pd: PhantomData::default(),
        }
    }
}

impl<E: Entry> LogReader<E> for SegmentedDiskLogReader<E> {
    fn read(&self, index: Index) -> Result<Option<E>, LogError> {
        read_one(&self.shared, index)
    }

    fn read_range(&self, from: Index, to_inclusive: Index) -> Result<Vec<E>, LogError> {
        read_range(&self.shared, from, to_inclusive)
    }

    fn first_index(&self) -> Index {
        self.shared.read().first_index()
    }

    fn next_index(&self) -> Index {
        self.shared.read().next_index()
    }
}

fn read_one<E: Entry>(shared: &RwLock<SegmentTable>, index: Index) -> Result<Option<E>, LogError> {
    match read_range(shared, index, index) {
        Ok(mut entries) => Ok(entries.pop()),
        Err(LogError::Pruned { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_range<E: Entry>(
    shared: &RwLock<SegmentTable>,
    from: Index,
    to_inclusive: Index,
) -> Result<Vec<E>, LogError> {
    let plans = {
        let table = shared.read();
        match clip_range(from, to_inclusive, table.first_index(), table.next_index())? {
            None => return Ok(Vec::new()),
            Some((from, to_inclusive)) => table.plan(from, to_inclusive),
        }
    };

    // File reads happen outside the lock. A concurrent prune or truncate can pull the file out
    // from under us, in which case the table tells us what happened.
    let raw = match plans.iter().map(execute_plan).collect::<Result<Vec<_>, _>>() {
        Ok(raw) => raw,
        Err(e) => {
            let table = shared.read();
            if from < table.first_index() {
                return Err(LogError::Pruned {
                    requested: from,
                    first_retained: table.first_index(),
                });
            }
            if from >= table.next_index() {
                return Ok(Vec::new());
            }
            return Err(e);
        }
    };

    let mut entries = Vec::new();
    for payload in raw.into_iter().flatten() {
        entries.push(E::try_from(payload)?);
    }
    Ok(entries)
}

fn execute_plan(plan: &ReadPlan) -> Result<Vec<Vec<u8>>, LogError> {
    let mut file = File::open(&plan.path)?;
    file.seek(SeekFrom::Start(plan.start))?;
    let mut bytes = vec![0u8; (plan.end - plan.start) as usize];
    file.read_exact(&mut bytes)?;

    let mut payloads = Vec::with_capacity(plan.count);
    let mut position = 0usize;
    for i in 0..plan.count {
        let expected = plan.first.plus(i as u64);
        let (index, payload, record_len) = segment::decode_record(&bytes[position..])
            .map_err(|e| corrupted_record(&plan.path, expected, e))?;
        if index != expected {
            return Err(LogError::Corrupted(format!(
                "{}: expected record {:?}, found {:?}",
                plan.path.display(),
                expected,
                index
            )));
        }
        payloads.push(payload);
        position += record_len;
    }

    Ok(payloads)
}

fn corrupted_record(path: &Path, index: Index, e: RecordError) -> LogError {
    LogError::Corrupted(format!("{}: record {:?} is unreadable ({:?})", path.display(), index, e))
}

fn create_segment_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create_new(true)
        .open(path)
}

fn open_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).append(true).open(path)
}

// Removes files in ascending order so an interrupted removal only ever leaves a suffix or a
// prefix-less run behind, both of which recovery handles.
fn remove_segment_files(directory: &Path, names: &[SegmentName]) -> io::Result<()> {
    for name in names {
        match fs::remove_file(name.path_in(directory)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    segment::sync_directory(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::in_memory::tests::{entry, TestEntry};
    use tempfile::TempDir;

    // 16 byte header + 8 byte payload.
    const RECORD_LEN: u64 = 24;

    fn config(dir: &TempDir, max_segment_entries: u64) -> StorageConfig {
        StorageConfig {
            directory: dir.path().to_path_buf(),
            max_segment_bytes: 64 * 1024 * 1024,
            max_segment_entries,
        }
    }

    fn open(dir: &TempDir, max_segment_entries: u64) -> SegmentedDiskLog<TestEntry> {
        let logger = Logger::root(slog::Discard, slog::o!());
        SegmentedDiskLog::open(config(dir, max_segment_entries), logger).unwrap()
    }

    fn append_range(log: &mut SegmentedDiskLog<TestEntry>, from: u64, to_inclusive: u64) {
        for i in from..=to_inclusive {
            log.append(Index::new(i), entry(i)).unwrap();
        }
    }

    fn segment_paths(dir: &TempDir) -> Vec<PathBuf> {
        segment::list_segments(dir.path())
            .unwrap()
            .iter()
            .map(|name| name.path_in(dir.path()))
            .collect()
    }

    #[test]
    fn rotation_keeps_sealed_segment_readable_for_catch_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open(&dir, 1000);

        append_range(&mut log, 1, 1000);
        assert_eq!(log.segment_count(), 1);

        append_range(&mut log, 1001, 1001);
        assert_eq!(log.segment_count(), 2);
        let names = segment::list_segments(dir.path()).unwrap();
        assert_eq!(names[1].base_index, Index::new(1001));

        let reader = log.reader();
        let entries = reader.read_range(Index::new(500), Index::new(5000)).unwrap();
        assert_eq!(entries.len(), 502);
        assert_eq!(entries[0], entry(500));
        assert_eq!(entries[501], entry(1001));
    }

    #[test]
    fn reopen_recovers_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(&dir, 10);
            append_range(&mut log, 1, 25);
            log.sync().unwrap();
        }

        let mut log = open(&dir, 10);
        assert_eq!(log.first_index(), Index::new(1));
        assert_eq!(log.next_index(), Index::new(26));
        assert_eq!(log.segment_count(), 3);
        assert_eq!(log.read(Index::new(17)).unwrap(), Some(entry(17)));

        log.append(Index::new(26), entry(26)).unwrap();
        assert_eq!(log.read(Index::new(26)).unwrap(), Some(entry(26)));
    }

    #[test]
    fn truncate_across_segments_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(&dir, 10);
            append_range(&mut log, 1, 35);
            log.truncate(Index::new(15)).unwrap();
            assert_eq!(log.next_index(), Index::new(15));
            assert_eq!(log.segment_count(), 2);

            log.append(Index::new(15), entry(1500)).unwrap();
            log.sync().unwrap();
        }

        let log = open(&dir, 10);
        assert_eq!(log.next_index(), Index::new(16));
        assert_eq!(log.read(Index::new(14)).unwrap(), Some(entry(14)));
        assert_eq!(log.read(Index::new(15)).unwrap(), Some(entry(1500)));
        assert_eq!(log.read(Index::new(16)).unwrap(), None);
    }

    #[test]
    fn interrupted_truncation_does_not_resurrect_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(&dir, 10);
            append_range(&mut log, 1, 25);
            log.sync().unwrap();
        }

        // -- setup --
        // Crash after the containing segment was cut at index 13, before later segments were removed.
        let paths = segment_paths(&dir);
        assert_eq!(paths.len(), 3);
        let file = OpenOptions::new().write(true).open(&paths[1]).unwrap();
        file.set_len(2 * RECORD_LEN).unwrap();

        // -- execute --
        let log = open(&dir, 10);

        // -- verify --
        assert_eq!(log.next_index(), Index::new(13));
        assert_eq!(log.read(Index::new(21)).unwrap(), None);
        assert_eq!(segment_paths(&dir).len(), 2);
    }

    #[test]
    fn truncation_keeps_writing_when_a_later_segment_cannot_be_removed() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        let mut log = open(&dir, 10);
        append_range(&mut log, 1, 35);
        let paths = segment_paths(&dir);
        assert_eq!(paths.len(), 4);
        // A non-empty directory in place of the last segment makes its removal fail.
        fs::remove_file(&paths[3]).unwrap();
        fs::create_dir(&paths[3]).unwrap();
        File::create(paths[3].join("pinned")).unwrap();

        // -- execute --
        log.truncate(Index::new(15)).unwrap();
        log.append(Index::new(15), entry(1500)).unwrap();
        log.append(Index::new(16), entry(1600)).unwrap();
        log.sync().unwrap();

        // -- verify --
        assert_eq!(log.segment_count(), 2);
        assert_eq!(log.next_index(), Index::new(17));
        assert_eq!(log.read(Index::new(15)).unwrap(), Some(entry(1500)));
        assert_eq!(log.read(Index::new(16)).unwrap(), Some(entry(1600)));
        assert!(!paths[2].exists());
        let on_disk = fs::metadata(&paths[1]).unwrap().len();
        assert_eq!(on_disk, 6 * RECORD_LEN);
    }

    #[test]
    fn torn_tail_is_cut_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(&dir, 10);
            append_range(&mut log, 1, 5);
            log.sync().unwrap();
        }

        let paths = segment_paths(&dir);
        let torn = segment::encode_record(Index::new(6), &entry(6).0).unwrap();
        let mut file = OpenOptions::new().append(true).open(&paths[0]).unwrap();
        file.write_all(&torn[..10]).unwrap();
        drop(file);

        {
            let mut log = open(&dir, 10);
            assert_eq!(log.next_index(), Index::new(6));
            log.append(Index::new(6), entry(6)).unwrap();
            log.sync().unwrap();
        }

        let log = open(&dir, 10);
        assert_eq!(log.read(Index::new(6)).unwrap(), Some(entry(6)));
        assert_eq!(log.next_index(), Index::new(7));
    }

    #[test]
    fn corruption_in_sealed_segment_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(&dir, 10);
            append_range(&mut log, 1, 25);
            log.sync().unwrap();
        }

        let paths = segment_paths(&dir);
        let mut bytes = fs::read(&paths[0]).unwrap();
        bytes[(3 * RECORD_LEN + 20) as usize] ^= 0xFF;
        fs::write(&paths[0], bytes).unwrap();

        let logger = Logger::root(slog::Discard, slog::o!());
        let result = SegmentedDiskLog::<TestEntry>::open(config(&dir, 10), logger);
        assert!(matches!(result, Err(LogError::Corrupted(_))));
    }

    #[test]
    fn prune_removes_whole_segments_only() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = open(&dir, 10);
            append_range(&mut log, 1, 35);

            assert_eq!(log.prune(Index::new(15)).unwrap(), Index::new(11));
            assert_eq!(log.read(Index::new(5)).unwrap(), None);
            assert!(matches!(
                log.read_range(Index::new(5), Index::new(12)),
                Err(LogError::Pruned { first_retained, .. }) if first_retained == Index::new(11)
            ));

            // The active segment is never pruned.
            assert_eq!(log.prune(Index::new(100)).unwrap(), Index::new(31));
            assert_eq!(log.segment_count(), 1);
            log.sync().unwrap();
        }

        let log = open(&dir, 10);
        assert_eq!(log.first_index(), Index::new(31));
        assert_eq!(log.next_index(), Index::new(36));
        assert_eq!(
            log.read_range(Index::new(31), Index::new(35)).unwrap(),
            (31..=35).map(entry).collect::<Vec<_>>()
        );
    }
}
