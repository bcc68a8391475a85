//! File-backed uid store
//!
//! The tables live in a [`MemoryUidStore`]; every change is first appended
//! to a log file and synced, and the log is replayed on open.
//!
//! Record format:
//! - 4 bytes: record length (excluding this field)
//! - 1 byte: record type
//! - N bytes: record body
//! - 4 bytes: CRC32 of type and body

use super::{MemoryUidStore, Uid, UidStore};
use crate::{Result, StatsError};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum UidRecord {
    Sequence(u64),
    Forward { name: String, id: Uid },
    Reverse { id: Uid, name: String },
    DeleteReverse { id: Uid },
}

impl UidRecord {
    fn type_byte(&self) -> u8 {
        match self {
            UidRecord::Sequence(_) => 1,
            UidRecord::Forward { .. } => 2,
            UidRecord::Reverse { .. } => 3,
            UidRecord::DeleteReverse { .. } => 4,
        }
    }

    fn serialize_with_checksum(&self) -> Bytes {
        let mut buf = BytesMut::new();

        // Reserve space for length prefix
        buf.put_u32_le(0);
        buf.put_u8(self.type_byte());

        match self {
            UidRecord::Sequence(value) => buf.put_u64_le(*value),
            UidRecord::Forward { name, id } | UidRecord::Reverse { id, name } => {
                buf.put_u8(id.width() as u8);
                id.put(&mut buf);
                buf.put_u32_le(name.len() as u32);
                buf.put_slice(name.as_bytes());
            }
            UidRecord::DeleteReverse { id } => {
                buf.put_u8(id.width() as u8);
                id.put(&mut buf);
            }
        }

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Parse one record, returning it and the bytes consumed
    fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(StatsError::InvalidFormat("Record too short".into()));
        }
        let len = (&data[..4]).get_u32_le() as usize;
        if len < 5 || data.len() < 4 + len {
            return Err(StatsError::InvalidFormat("Incomplete record".into()));
        }

        let record = &data[4..4 + len];
        let (body, crc) = record.split_at(len - 4);
        let expected = (&crc[..]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StatsError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let parsed = match cursor.get_u8() {
            1 => UidRecord::Sequence(take_u64(&mut cursor)?),
            2 => {
                let id = take_uid(&mut cursor)?;
                UidRecord::Forward {
                    name: take_string(&mut cursor)?,
                    id,
                }
            }
            3 => {
                let id = take_uid(&mut cursor)?;
                UidRecord::Reverse {
                    id,
                    name: take_string(&mut cursor)?,
                }
            }
            4 => UidRecord::DeleteReverse {
                id: take_uid(&mut cursor)?,
            },
            other => {
                return Err(StatsError::InvalidFormat(format!(
                    "Invalid uid record type: {}",
                    other
                )))
            }
        };

        Ok((parsed, 4 + len))
    }
}

fn take_u64(cursor: &mut &[u8]) -> Result<u64> {
    if cursor.remaining() < 8 {
        return Err(StatsError::InvalidFormat("Truncated sequence".into()));
    }
    Ok(cursor.get_u64_le())
}

fn take_uid(cursor: &mut &[u8]) -> Result<Uid> {
    if !cursor.has_remaining() {
        return Err(StatsError::InvalidFormat("Truncated uid".into()));
    }
    let width = cursor.get_u8() as usize;
    if cursor.remaining() < width {
        return Err(StatsError::InvalidFormat("Truncated uid".into()));
    }
    let id = Uid::from_bytes(&cursor[..width])?;
    cursor.advance(width);
    Ok(id)
}

fn take_string(cursor: &mut &[u8]) -> Result<String> {
    if cursor.remaining() < 4 {
        return Err(StatsError::InvalidFormat("Truncated name".into()));
    }
    let len = cursor.get_u32_le() as usize;
    if cursor.remaining() < len {
        return Err(StatsError::InvalidFormat("Truncated name".into()));
    }
    let name = String::from_utf8(cursor[..len].to_vec())
        .map_err(|e| StatsError::InvalidFormat(e.to_string()))?;
    cursor.advance(len);
    Ok(name)
}

/// Uid store persisted to an append-only log
///
/// Log writes are synced to disk, so they run on the blocking thread pool.
pub struct FileUidStore {
    path: PathBuf,
    state: Arc<LogState>,
}

struct LogState {
    tables: MemoryUidStore,
    /// Serializes appends, and the check-then-append of forward mappings
    log: Mutex<BufWriter<File>>,
}

impl FileUidStore {
    /// Open or create the log at `path` and replay it
    ///
    /// Fails with `Config` if the log holds identifiers of another width.
    pub fn open(path: impl AsRef<Path>, width: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tables = MemoryUidStore::new(width);
        let valid_len = Self::replay(&path, &tables)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        // Drop a torn tail so later appends stay readable
        file.set_len(valid_len)?;
        let mut writer = BufWriter::new(file);
        std::io::Seek::seek(writer.get_mut(), std::io::SeekFrom::End(0))?;

        info!(
            path = ?path,
            names = tables.forward_len(),
            sequence = tables.sequence(),
            "Opened uid log"
        );

        Ok(Self {
            path,
            state: Arc::new(LogState {
                tables,
                log: Mutex::new(writer),
            }),
        })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of names mapped
    pub fn len(&self) -> usize {
        self.state.tables.forward_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn replay(path: &Path, tables: &MemoryUidStore) -> Result<u64> {
        let mut data = Vec::new();
        match File::open(path) {
            Ok(mut file) => {
                file.read_to_end(&mut data)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let mut offset = 0;
        while offset < data.len() {
            match UidRecord::deserialize_with_checksum(&data[offset..]) {
                Ok((record, consumed)) => {
                    check_width(&record, tables.width(), path)?;
                    LogState::apply(tables, &record);
                    offset += consumed;
                }
                Err(e) => {
                    warn!(
                        path = ?path,
                        offset,
                        error = %e,
                        "Ignoring unreadable tail of uid log"
                    );
                    break;
                }
            }
        }
        Ok(offset as u64)
    }

    /// Run a log operation off the async runtime
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&LogState) -> Result<T> + Send + 'static,
    {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || op(&state))
            .await
            .map_err(|e| StatsError::Internal(format!("uid log task failed: {}", e)))?
    }
}

fn check_width(record: &UidRecord, width: usize, path: &Path) -> Result<()> {
    let id = match record {
        UidRecord::Sequence(_) => return Ok(()),
        UidRecord::Forward { id, .. }
        | UidRecord::Reverse { id, .. }
        | UidRecord::DeleteReverse { id } => id,
    };
    if id.width() != width {
        return Err(StatsError::Config(format!(
            "uid log {:?} holds {}-byte identifiers but uid_width is {}",
            path,
            id.width(),
            width
        )));
    }
    Ok(())
}

impl LogState {
    fn apply(tables: &MemoryUidStore, record: &UidRecord) {
        match record {
            UidRecord::Sequence(value) => tables.raise_sequence(*value),
            UidRecord::Forward { name, id } => {
                tables.insert_forward(name, *id);
            }
            UidRecord::Reverse { id, name } => tables.insert_reverse(*id, name),
            UidRecord::DeleteReverse { id } => tables.remove_reverse(*id),
        }
    }

    fn append(writer: &mut BufWriter<File>, record: &UidRecord) -> Result<()> {
        writer.write_all(&record.serialize_with_checksum())?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn log_and_apply(&self, record: UidRecord) -> Result<()> {
        let mut writer = self.log.lock();
        Self::append(&mut writer, &record)?;
        Self::apply(&self.tables, &record);
        Ok(())
    }

    fn next_sequence(&self) -> Result<u64> {
        let mut writer = self.log.lock();
        let next = self.tables.sequence() + 1;
        Self::append(&mut writer, &UidRecord::Sequence(next))?;
        self.tables.raise_sequence(next);
        Ok(next)
    }

    fn create_forward_if_absent(&self, name: String, id: Uid) -> Result<Uid> {
        let mut writer = self.log.lock();
        if let Some(existing) = self.tables.lookup_forward(&name) {
            return Ok(existing);
        }
        Self::append(&mut writer, &UidRecord::Forward { name: name.clone(), id })?;
        Ok(self.tables.insert_forward(&name, id))
    }
}

#[async_trait]
impl UidStore for FileUidStore {
    fn width(&self) -> usize {
        self.state.tables.width()
    }

    async fn get_id(&self, name: &str) -> Result<Option<Uid>> {
        self.state.tables.get_id(name).await
    }

    async fn get_name(&self, id: Uid) -> Result<Option<String>> {
        self.state.tables.get_name(id).await
    }

    async fn next_sequence(&self) -> Result<u64> {
        self.blocking(LogState::next_sequence).await
    }

    async fn put_reverse(&self, id: Uid, name: &str) -> Result<()> {
        let record = UidRecord::Reverse {
            id,
            name: name.to_string(),
        };
        self.blocking(move |state| state.log_and_apply(record)).await
    }

    async fn delete_reverse(&self, id: Uid) -> Result<()> {
        self.blocking(move |state| state.log_and_apply(UidRecord::DeleteReverse { id }))
            .await
    }

    async fn create_forward_if_absent(&self, name: &str, id: Uid) -> Result<Uid> {
        if let Some(existing) = self.state.tables.lookup_forward(name) {
            return Ok(existing);
        }
        let name = name.to_string();
        self.blocking(move |state| state.create_forward_if_absent(name, id))
            .await
    }

    async fn load_all(&self) -> Result<Vec<(String, Uid)>> {
        self.state.tables.load_all().await
    }
}
