use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Upper bound on one commit's payload. A length prefix above it can only come
/// from corruption.
pub const MAX_COMMIT_BYTES: usize = 16 * 1024 * 1024;

/// Frame header plus trailer: `u32` length and `u32` crc.
const FRAME_OVERHEAD: u64 = 8;

/// Append one commit as a single `[len][bincode: Vec<Event>][crc32]` frame.
/// Nothing is written to `buf` when encoding fails.
pub fn encode_commit(buf: &mut Vec<u8>, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_COMMIT_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "commit too large"));
    }
    let len = payload.len() as u32;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(())
}

/// Outcome of reading one framed entry.
enum Entry {
    Commit { events: Vec<Event>, bytes: u64 },
    /// Clean end of file.
    End,
    /// Truncated or corrupt tail (crash mid-write).
    Torn,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn decode_entry(reader: &mut impl Read) -> io::Result<Entry> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(Entry::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_COMMIT_BYTES {
        return Ok(Entry::Torn);
    }

    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(Entry::Torn);
    }
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(Entry::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Entry::Torn);
    }
    match bincode::deserialize::<Vec<Event>>(&payload) {
        Ok(events) => Ok(Entry::Commit {
            events,
            bytes: len as u64 + FRAME_OVERHEAD,
        }),
        Err(_) => Ok(Entry::Torn),
    }
}

/// Intact events and the byte length of the intact prefix.
fn read_commits(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;
    loop {
        match decode_entry(&mut reader)? {
            Entry::Commit { events: commit, bytes } => {
                events.extend(commit);
                valid_len += bytes;
            }
            Entry::End => break,
            Entry::Torn => {
                warn!(path = %path.display(), replayed = events.len(), "discarding torn WAL tail");
                break;
            }
        }
    }
    Ok((events, valid_len))
}

/// Append-only log backing `MemoryStore`.
///
/// Each entry holds every event of one unit of work, so a commit replays whole
/// or not at all. A batch of commits is written and fsynced together; if that
/// fails the file is cut back to where the batch began.
pub struct Wal {
    file: File,
    path: PathBuf,
    len: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
            appends_since_compact: 0,
        })
    }

    /// Replay the log, drop any torn tail from disk, and open it for appends.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = read_commits(path)?;
        let wal = Self::open(path)?;
        if wal.len > valid_len {
            wal.file.set_len(valid_len)?;
            wal.file.sync_all()?;
        }
        Ok((
            Self {
                len: valid_len,
                ..wal
            },
            events,
        ))
    }

    /// Encode and fsync a single commit.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        let mut frame = Vec::new();
        encode_commit(&mut frame, events)?;
        self.append_commits(&frame, 1)
    }

    /// Write `commits` frames produced by [`encode_commit`] and fsync them.
    pub fn append_commits(&mut self, frames: &[u8], commits: u64) -> io::Result<()> {
        let written = self
            .file
            .write_all(frames)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = written {
            if let Err(cut) = self.file.set_len(self.len).and_then(|()| self.file.sync_all()) {
                warn!(path = %self.path.display(), "failed to cut back WAL after write error: {cut}");
            }
            return Err(e);
        }
        self.len += frames.len() as u64;
        self.appends_since_compact += commits;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a temp file next to the log and fsync it. Each event
    /// gets its own frame; the file is only renamed into place once complete.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        let mut frame = Vec::new();
        for event in events {
            frame.clear();
            encode_commit(&mut frame, std::slice::from_ref(event))?;
            writer.write_all(&frame)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the snapshot over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.len = file.metadata()?.len();
        self.file = file;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Commits appended since the last compaction.
    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every event of every intact commit. A torn tail ends the replay
    /// without error.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(read_commits(path)?.0)
    }
}
