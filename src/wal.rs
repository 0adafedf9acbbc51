use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_RECORD_BYTES;
use crate::model::Event;

/// Largest payload a frame may declare. Anything bigger is a torn or corrupt length.
const MAX_FRAME_PAYLOAD: usize = MAX_RECORD_BYTES * 2 + 64;

/// Write one frame: `[u32 len][bincode Event][u32 crc32(payload)]`, little-endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum Frame {
    Event { event: Event, bytes: u64 },
    /// Clean end of file.
    End,
    /// Short read, bad CRC or undecodable payload: the tail from here on is garbage.
    Torn,
}

/// `read_exact` that reports a clean EOF as `Ok(false)`.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    // A zero-byte read here is a clean end; a partial length word is torn.
    let mut first = [0u8; 1];
    if reader.read(&mut first)? == 0 {
        return Ok(Frame::End);
    }
    word[0] = first[0];
    if !fill(reader, &mut word[1..])? {
        return Ok(Frame::Torn);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Ok(Frame::Torn);
    }

    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event {
            event,
            bytes: (len + 8) as u64,
        }),
        Err(_) => Ok(Frame::Torn),
    }
}

/// Result of reading a log from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
    /// Bytes after the intact prefix (crash debris).
    pub discarded: u64,
}

/// Read every intact frame. A missing file is an empty log.
pub fn replay(path: &Path) -> io::Result<Replay> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
        Err(e) => return Err(e),
    };
    let total = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut out = Replay::default();
    while let Frame::Event { event, bytes } = read_frame(&mut reader)? {
        out.events.push(event);
        out.valid_len += bytes;
    }
    out.discarded = total - out.valid_len;
    Ok(out)
}

/// Append-only write-ahead log of record events.
///
/// A batch of events is encoded in memory and written with a single write + fsync.
/// If the write fails the file is cut back to its previous length, so a failed batch
/// never leaves debris in front of later appends.
pub struct Wal {
    file: File,
    path: PathBuf,
    len: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path`, cut off any torn tail, and open it for appending.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replayed = replay(path)?;
        if replayed.discarded > 0 {
            tracing::warn!(
                "{}: discarding {} trailing byte(s) after the last intact entry",
                path.display(),
                replayed.discarded
            );
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(replayed.valid_len)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let wal = Self {
            file,
            path: path.to_path_buf(),
            len: replayed.valid_len,
            appends_since_compact: replayed.events.len() as u64,
        };
        Ok((wal, replayed.events))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Durably append `events` as one unit: all of them or none.
    pub fn append_batch(&mut self, events: &[Event]) -> io::Result<()> {
        let mut buf = Vec::new();
        for event in events {
            write_frame(&mut buf, event)?;
        }
        let written = self
            .file
            .write_all(&buf)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            // Best effort: drop whatever part of the batch reached the file.
            let _ = self.file.set_len(self.len);
            return Err(e);
        }
        self.len += buf.len() as u64;
        self.appends_since_compact += events.len() as u64;
        Ok(())
    }

    /// Replace the whole log with `events`: write a temp file, fsync, rename over.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let len = {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                write_frame(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
            tmp.get_ref().metadata()?.len()
        };
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.len = len;
        self.appends_since_compact = 0;
        Ok(())
    }
}
