use super::{Engine, Status};
use crate::errdata;
use crate::error::Result;

use log::warn;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

/// A value length marking a tombstone (deleted key, no value bytes).
const TOMBSTONE: u32 = u32::MAX;

/// The maximum length of a record key or value. Lengths beyond this indicate
/// a corrupt file.
const MAX_RECORD_LEN: u32 = 1 << 30;

/// A log-structured key/value storage engine in a single append-only file,
/// with an in-memory key directory pointing at the latest value position for
/// each live key.
///
/// The file contains sequential records of the form:
///
/// +---------------+-----------------+-----------+-------------+
/// | key len (u32) | value len (u32) | key bytes | value bytes |
/// +---------------+-----------------+-----------+-------------+
///
/// Lengths are big-endian, and a value length of u32::MAX marks a tombstone.
/// The key directory is rebuilt by scanning the file on startup; maintaining
/// it on disk would require extra fsyncs, and Raft logs are small enough that
/// the startup scan is cheap.
///
/// Writes become durable when flush() fsyncs the file. An incomplete record
/// at the tail of the file (from a crash mid-write) was never flushed nor
/// acknowledged, so it is discarded on startup, which keeps appends atomic as
/// observed across restarts. A malformed record elsewhere in the file is
/// corruption and a fatal error.
///
/// There is no garbage collection of superseded records. The Raft log
/// overwrites little (term/vote metadata and truncated entry suffixes), so
/// garbage accumulation is negligible without snapshotting.
pub struct Disk {
    /// The append-only data file.
    file: File,
    /// Maps live keys to the file position and length of their value.
    index: BTreeMap<Vec<u8>, (u64, u32)>,
    /// The file path, for status reporting.
    path: PathBuf,
}

/// A record read while rebuilding the key directory.
enum Record {
    /// A key/value write. value_pos addresses the value bytes in the file.
    Put { key: Vec<u8>, value_pos: u64, value_len: u32 },
    /// A key deletion. next_pos addresses the following record.
    Delete { key: Vec<u8>, next_pos: u64 },
    /// An incomplete record at the end of the file.
    Torn,
}

impl Disk {
    /// Creates or opens a disk engine with the given data file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let index = Self::build_index(&mut file)?;
        Ok(Self { file, index, path })
    }

    /// Builds the key directory by scanning the data file, truncating any
    /// incomplete record at the tail.
    fn build_index(file: &mut File) -> Result<BTreeMap<Vec<u8>, (u64, u32)>> {
        let file_size = file.metadata()?.len();
        let mut index = BTreeMap::new();
        let mut pos: u64 = 0;
        let mut valid_size = file_size;

        let mut reader = BufReader::new(&mut *file);
        while pos < file_size {
            match Self::read_record(&mut reader, pos)? {
                Record::Put { key, value_pos, value_len } => {
                    index.insert(key, (value_pos, value_len));
                    pos = value_pos + value_len as u64;
                }
                Record::Delete { key, next_pos } => {
                    index.remove(&key);
                    pos = next_pos;
                }
                Record::Torn => {
                    valid_size = pos;
                    break;
                }
            }
        }
        drop(reader);

        if valid_size < file_size {
            warn!("Discarding incomplete record at offset {valid_size}");
            file.set_len(valid_size)?;
        }
        Ok(index)
    }

    /// Reads a single record starting at the given file position, detecting a
    /// truncated record at the end of the file.
    fn read_record(reader: &mut impl Read, pos: u64) -> Result<Record> {
        let mut lenbuf = [0u8; 4];
        if Self::hit_eof(reader.read_exact(&mut lenbuf))? {
            return Ok(Record::Torn);
        }
        let key_len = u32::from_be_bytes(lenbuf);
        if Self::hit_eof(reader.read_exact(&mut lenbuf))? {
            return Ok(Record::Torn);
        }
        let value_len = u32::from_be_bytes(lenbuf);
        if key_len > MAX_RECORD_LEN || (value_len != TOMBSTONE && value_len > MAX_RECORD_LEN) {
            return errdata!("corrupt record at offset {pos}");
        }

        let mut key = vec![0; key_len as usize];
        if Self::hit_eof(reader.read_exact(&mut key))? {
            return Ok(Record::Torn);
        }
        let value_pos = pos + 8 + key_len as u64;
        if value_len == TOMBSTONE {
            return Ok(Record::Delete { key, next_pos: value_pos });
        }
        let mut value = vec![0; value_len as usize];
        if Self::hit_eof(reader.read_exact(&mut value))? {
            return Ok(Record::Torn);
        }
        Ok(Record::Put { key, value_pos, value_len })
    }

    /// Returns true if the IO result failed with an unexpected EOF, and
    /// propagates any other error.
    fn hit_eof(result: std::io::Result<()>) -> Result<bool> {
        match result {
            Ok(()) => Ok(false),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    /// Appends a record to the data file, returning the value position.
    fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        let pos = self.file.seek(SeekFrom::End(0))?;
        let value_len = value.map_or(TOMBSTONE, |v| v.len() as u32);
        self.file.write_all(&(key.len() as u32).to_be_bytes())?;
        self.file.write_all(&value_len.to_be_bytes())?;
        self.file.write_all(key)?;
        if let Some(value) = value {
            self.file.write_all(value)?;
        }
        Ok(pos + 8 + key.len() as u64)
    }
}

impl Engine for Disk {
    fn delete(&mut self, key: &[u8]) -> Result<()> {
        if self.index.remove(key).is_some() {
            self.append(key, None)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.file.sync_data()?)
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(&(pos, len)) = self.index.get(key) else {
            return Ok(None);
        };
        let mut value = vec![0; len as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut value)?;
        Ok(Some(value))
    }

    fn scan(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn super::ScanIterator + '_> {
        let file = &mut self.file;
        Box::new(self.index.range(range).map(move |(key, &(pos, len))| {
            let mut value = vec![0; len as usize];
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut value)?;
            Ok((key.clone(), value))
        }))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let pos = self.append(key, Some(&value))?;
        self.index.insert(key.to_vec(), (pos, value.len() as u32));
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: format!("disk:{}", self.path.display()),
            keys: self.index.len() as u64,
            size: self
                .index
                .iter()
                .fold(0, |size, (k, &(_, len))| size + k.len() as u64 + len as u64),
            disk_size: self.file.metadata()?.len(),
        })
    }
}

impl Drop for Disk {
    /// Attempt to fsync data on drop, in case the caller didn't flush.
    fn drop(&mut self) {
        self.file.sync_all().ok();
    }
}
