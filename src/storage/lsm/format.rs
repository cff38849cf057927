//! On-disk layout of sorted runs
//!
//! ```text
//! sstable_{store}_{n}.sst   MAGIC || record*
//! sstable_{store}_{n}.idx   MAGIC || u32 offset per record
//! sstable_{store}_{n}.meta  JSON run metadata (written last)
//! ```
//!
//! Record layout (big-endian):
//! `key_len:u16 | box_len:u32 | data_len:u32 | version:u64 | key | box | data`.
//! Tombstones store `data_len = u32::MAX` and no data bytes.

use crate::types::{Hyperrectangle, Tuple, TupleKind};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MAGIC_BYTES: &[u8] = b"geostore";

pub const SST_FILE_PREFIX: &str = "sstable";
pub const SST_FILE_SUFFIX: &str = "sst";
pub const SST_INDEX_SUFFIX: &str = "idx";
pub const SST_META_SUFFIX: &str = "meta";

/// Fixed part of a record
pub const RECORD_HEADER_SIZE: usize = 2 + 4 + 4 + 8;

/// Size of one index entry
pub const INDEX_ENTRY_SIZE: usize = 4;

const TOMBSTONE_DATA_LEN: u32 = u32::MAX;

/// Summary stored next to each run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub tuples: u64,
    pub min_key: Option<String>,
    pub max_key: Option<String>,
    pub oldest_version: i64,
    pub newest_version: i64,
    pub data_size: u64,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            tuples: 0,
            min_key: None,
            max_key: None,
            oldest_version: i64::MAX,
            newest_version: i64::MIN,
            data_size: 0,
        }
    }
}

impl RunMetadata {
    pub fn record(&mut self, tuple: &Tuple) {
        if self.min_key.is_none() {
            self.min_key = Some(tuple.key().to_string());
        }
        self.max_key = Some(tuple.key().to_string());
        self.tuples += 1;
        self.oldest_version = self.oldest_version.min(tuple.version());
        self.newest_version = self.newest_version.max(tuple.version());
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// File prefix of all runs of one store
pub fn table_prefix(store: &str) -> String {
    format!("{}_{}", SST_FILE_PREFIX, store)
}

pub fn run_file(dir: &Path, prefix: &str, table_number: u64, suffix: &str) -> PathBuf {
    dir.join(format!("{}_{}.{}", prefix, table_number, suffix))
}

/// Extract the table number from `{prefix}_{n}.{suffix}`
pub fn parse_table_number(file_name: &str, prefix: &str, suffix: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(prefix)?.strip_prefix('_')?;
    let number = rest.strip_suffix(suffix)?.strip_suffix('.')?;
    number.parse::<u64>().ok()
}

/// Append the binary record for `tuple` to `buf`
pub fn encode_record(tuple: &Tuple, buf: &mut Vec<u8>) -> Result<()> {
    let key = tuple.key().as_bytes();
    if key.len() > u16::MAX as usize {
        return Err(StorageError::InvalidArgument(format!(
            "key too long: {} bytes",
            key.len()
        )));
    }

    let bbox = tuple.bounding_box().to_bytes();
    let data_len = match tuple.kind() {
        TupleKind::Deleted => TOMBSTONE_DATA_LEN,
        TupleKind::Normal => {
            if tuple.value().len() >= TOMBSTONE_DATA_LEN as usize {
                return Err(StorageError::InvalidArgument("value too large".into()));
            }
            tuple.value().len() as u32
        }
    };

    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(bbox.len() as u32).to_be_bytes());
    buf.extend_from_slice(&data_len.to_be_bytes());
    buf.extend_from_slice(&(tuple.version() as u64).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&bbox);
    if tuple.kind() == TupleKind::Normal {
        buf.extend_from_slice(tuple.value());
    }
    Ok(())
}

struct RecordHeader {
    key_len: usize,
    box_len: usize,
    data_len: u32,
    version: i64,
}

impl RecordHeader {
    fn value_len(&self) -> usize {
        if self.data_len == TOMBSTONE_DATA_LEN {
            0
        } else {
            self.data_len as usize
        }
    }

    fn total_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.key_len + self.box_len + self.value_len()
    }
}

fn read_header(buf: &[u8], offset: usize) -> Result<RecordHeader> {
    let header = buf.get(offset..offset + RECORD_HEADER_SIZE).ok_or_else(|| {
        StorageError::Corruption(format!("truncated record header at offset {}", offset))
    })?;

    let key_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let box_len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    let data_len = u32::from_be_bytes([header[6], header[7], header[8], header[9]]);
    let mut version = [0u8; 8];
    version.copy_from_slice(&header[10..18]);

    let header = RecordHeader {
        key_len,
        box_len,
        data_len,
        version: u64::from_be_bytes(version) as i64,
    };

    if offset + header.total_len() > buf.len() {
        return Err(StorageError::Corruption(format!(
            "record at offset {} exceeds file length",
            offset
        )));
    }
    Ok(header)
}

fn decode_key_bytes(buf: &[u8], offset: usize, key_len: usize) -> Result<&str> {
    let start = offset + RECORD_HEADER_SIZE;
    std::str::from_utf8(&buf[start..start + key_len])
        .map_err(|_| StorageError::Corruption(format!("invalid utf-8 key at offset {}", offset)))
}

/// Decode only the key of the record at `offset`
pub fn decode_key(buf: &[u8], offset: usize) -> Result<&str> {
    let header = read_header(buf, offset)?;
    decode_key_bytes(buf, offset, header.key_len)
}

/// Decode the record at `offset`, returning the tuple and the next offset
pub fn decode_record(buf: &[u8], offset: usize) -> Result<(Tuple, usize)> {
    let header = read_header(buf, offset)?;
    let key = decode_key_bytes(buf, offset, header.key_len)?;

    let box_start = offset + RECORD_HEADER_SIZE + header.key_len;
    let value_start = box_start + header.box_len;
    let bbox = Hyperrectangle::from_bytes(&buf[box_start..value_start])?;

    let tuple = if header.data_len == TOMBSTONE_DATA_LEN {
        Tuple::tombstone(key, header.version)
    } else {
        let value = buf[value_start..value_start + header.value_len()].to_vec();
        Tuple::with_version(key, bbox, value, header.version)
    };

    Ok((tuple, offset + header.total_len()))
}

/// Verify that `buf` starts with the magic header
pub fn check_magic(buf: &[u8], path: &Path) -> Result<()> {
    if buf.len() < MAGIC_BYTES.len() || &buf[..MAGIC_BYTES.len()] != MAGIC_BYTES {
        return Err(StorageError::Corruption(format!(
            "missing magic bytes in {}",
            path.display()
        )));
    }
    Ok(())
}
