//! Append-only mutation journal.
//!
//! Every keyspace mutation is framed and appended before it is applied, so
//! reopening the journal and replaying its frames rebuilds the store.
//!
//! Layout: `magic (4) | version (1)` followed by frames of
//! `len (u32 le) | MessagePack mutation | crc32 (u32 le)`.

use super::keyspace::Mutation;
use crate::error::{BusError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for journal files.
const JOURNAL_MAGIC: &[u8; 4] = b"TMJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Largest frame accepted on read.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Append-only journal of keyspace mutations.
pub(crate) struct Journal {
    /// Path to the journal file.
    path: PathBuf,

    /// Buffered append handle.
    writer: BufWriter<File>,

    /// Frames appended since the last fsync.
    writes_since_sync: u64,

    /// Fsync every N frames (1 = every frame).
    sync_interval: u64,
}

impl Journal {
    /// Open or create a journal, returning it together with every intact
    /// mutation it holds.
    ///
    /// A torn final frame (crash mid-append) is truncated away. A complete
    /// frame failing its checksum is reported as corruption.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<(Self, Vec<Mutation>)> {
        let path = path.as_ref().to_path_buf();

        let mutations = if path.exists() {
            let (mutations, valid_len) = Self::replay(&path)?;
            let file = OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() > valid_len {
                tracing::warn!(
                    path = %path.display(),
                    valid_len,
                    "truncating torn journal tail"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            mutations
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;
            Vec::new()
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok((
            Self {
                path,
                writer: BufWriter::new(file),
                writes_since_sync: 0,
                sync_interval: sync_interval.max(1),
            },
            mutations,
        ))
    }

    /// Append a mutation.
    pub fn append(&mut self, mutation: &Mutation) -> Result<()> {
        Self::write_frame(&mut self.writer, mutation)?;
        self.writer.flush()?;

        self.writes_since_sync += 1;
        if self.writes_since_sync >= self.sync_interval {
            self.writer.get_ref().sync_all()?;
            self.writes_since_sync = 0;
        }
        Ok(())
    }

    /// Force all appended frames to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Replace the journal contents with `mutations`.
    ///
    /// Written to a sibling file first and renamed over the journal, so a
    /// crash leaves either the old or the new journal intact.
    pub fn rewrite(&mut self, mutations: &[Mutation]) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut writer = BufWriter::new(
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            writer.write_all(JOURNAL_MAGIC)?;
            writer.write_all(&[JOURNAL_VERSION])?;
            for mutation in mutations {
                Self::write_frame(&mut writer, mutation)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Current size of the journal file in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Read every intact frame; returns the mutations and the byte length of
    /// the valid prefix.
    fn replay(path: &Path) -> Result<(Vec<Mutation>, u64)> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(BusError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(BusError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut reader = BufReader::new(file);
        let mut mutations = Vec::new();
        let mut valid_len = HEADER_SIZE;

        loop {
            match Self::read_frame(&mut reader) {
                Ok(Some((mutation, frame_len))) => {
                    mutations.push(mutation);
                    valid_len += frame_len;
                }
                Ok(None) => break,
                Err(BusError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }

        Ok((mutations, valid_len))
    }

    fn write_frame<W: Write>(writer: &mut W, mutation: &Mutation) -> Result<()> {
        let encoded = rmp_serde::to_vec(mutation)?;

        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    /// Read one frame; `Ok(None)` at a clean end of file.
    fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(Mutation, u64)>> {
        let mut len_bytes = [0u8; 4];
        match reader.read(&mut len_bytes[..1])? {
            0 => return Ok(None),
            _ => reader.read_exact(&mut len_bytes[1..])?,
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(BusError::Corruption("Journal frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(BusError::Corruption("Journal checksum mismatch".into()));
        }

        let mutation = rmp_serde::from_slice(&encoded)?;
        Ok(Some((mutation, (4 + len + 4) as u64)))
    }
}
