use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_WAL_RECORD_BYTES;
use crate::model::Event;

/// Frame one event as `[u32 len][bincode Event][u32 crc32]`, little-endian.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_WAL_RECORD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("WAL record of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one frame.
enum Frame {
    Record(Event, u64),
    /// Clean end of file.
    End,
    /// Short, oversized, CRC-failing or undecodable frame. Everything from
    /// here on is a write that never completed.
    Torn,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    let mut first = [0u8; 1];
    // Distinguish a clean EOF from a length prefix cut short.
    if !read_exact_or_eof(reader, &mut first)? {
        return Ok(Frame::End);
    }
    len_buf[0] = first[0];
    if !read_exact_or_eof(reader, &mut len_buf[1..])? {
        return Ok(Frame::Torn);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_WAL_RECORD_BYTES {
        return Ok(Frame::Torn);
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut payload)? || !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Record(event, (len + 8) as u64)),
        Err(_) => Ok(Frame::Torn),
    }
}

/// Every intact record of a log file, plus the byte length they span.
pub struct Recovered {
    pub events: Vec<Event>,
    pub valid_len: u64,
    /// Bytes past `valid_len` that did not form a complete record.
    pub discarded: u64,
}

/// Read a log file. A missing file is an empty log.
pub fn read_log(path: &Path) -> io::Result<Recovered> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Recovered { events: Vec::new(), valid_len: 0, discarded: 0 });
        }
        Err(e) => return Err(e),
    };
    let total = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;
    while let Frame::Record(event, size) = read_frame(&mut reader)? {
        events.push(event);
        valid_len += size;
    }
    Ok(Recovered {
        events,
        valid_len,
        discarded: total - valid_len,
    })
}

/// Append-only write-ahead log of one tenant.
///
/// Every timetable commit or revert is a single record, so a record is the
/// unit of atomicity: replay either sees all of it or, if the process died
/// mid-write, none of it.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path` and open it for appending. A torn tail left
    /// by a crash is cut off first, so new records never land behind it.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let recovered = read_log(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if recovered.discarded > 0 {
            tracing::warn!(
                "{}: discarding {} bytes of incomplete WAL tail after {} records",
                path.display(),
                recovered.discarded,
                recovered.events.len()
            );
            file.set_len(recovered.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        };
        Ok((wal, recovered.events))
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one record. Nothing is durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    fn compact_path(&self) -> PathBuf {
        self.path.with_extension("wal.compact")
    }

    /// Replace the log with `events`: write them to a sibling file, fsync,
    /// rename over the log and reopen. A crash before the rename leaves the
    /// old log in place.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        self.flush_sync()?;
        let tmp = self.compact_path();
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for event in events {
                encode_record(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        if let Some(dir) = self.path.parent()
            && let Ok(dir) = File::open(dir)
        {
            let _ = dir.sync_all();
        }
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("gridlock_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn schedule_created() -> Event {
        Event::ScheduleCreated {
            id: Ulid::new(),
            name: Some("Fall".into()),
            days: Some(5),
            slots: None,
        }
    }

    fn committed() -> Event {
        let f = Ulid::new();
        let mut availability = Availability::zeroed(40);
        for idx in [2, 9] {
            availability.set(idx);
            availability.claim(idx);
        }
        Event::TimetableCommitted {
            schedule_id: Ulid::new(),
            entries: vec![ScheduleEntry {
                id: Ulid::new(),
                schedule_id: Ulid::new(),
                section_id: "S1".into(),
                course_id: "C1".into(),
                faculty_ids: vec![f],
                room_ids: vec![],
                day: 0,
                slot: 2,
                duration: 1,
                kind: SessionKind::Practical,
                slot_index: Some(3),
            }],
            snapshot_claims: vec![SnapshotClaim {
                key: ResourceKey::faculty(f),
                cells: vec![9],
            }],
            writes: vec![AvailabilityWrite {
                key: ResourceKey::faculty(f),
                availability,
            }],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![schedule_created(), committed()];
        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert!(replayed.is_empty());
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let (_, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, events);
    }

    #[test]
    fn torn_tail_discarded_and_truncated() {
        let path = tmp_path("torn_tail.wal");
        let event = committed();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0]).unwrap();
        }

        let recovered = read_log(&path).unwrap();
        assert_eq!(recovered.events, vec![event.clone()]);
        assert_eq!(recovered.discarded, 3);

        // Reopening cuts the tail so the next record is readable.
        let next = schedule_created();
        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert_eq!(replayed.len(), 1);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);
            wal.append(&next).unwrap();
        }
        assert_eq!(read_log(&path).unwrap().events, vec![event, next]);
    }

    #[test]
    fn crc_mismatch_stops_replay() {
        let path = tmp_path("crc_mismatch.wal");
        let good = schedule_created();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&committed()).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(read_log(&path).unwrap().events, vec![good]);
    }

    #[test]
    fn oversized_length_prefix_is_torn() {
        let path = tmp_path("oversized_prefix.wal");
        fs::write(&path, u32::MAX.to_le_bytes()).unwrap();
        let recovered = read_log(&path).unwrap();
        assert!(recovered.events.is_empty());
        assert_eq!(recovered.discarded, 4);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        let recovered = read_log(&path).unwrap();
        assert!(recovered.events.is_empty());
        assert_eq!(recovered.valid_len, 0);
    }

    #[test]
    fn compact_replaces_contents_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let snapshot = vec![schedule_created()];
        let after = committed();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&committed()).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert!(fs::metadata(&path).unwrap().len() < before);
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&after).unwrap();
        }
        let (_, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, vec![snapshot[0].clone(), after]);
    }

    #[test]
    fn buffered_appends_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|_| schedule_created()).collect();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(read_log(&path).unwrap().events, events);
    }
}
