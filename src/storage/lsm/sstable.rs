//! SSTable writer and reader
//!
//! The writer streams records into the data file and their offsets into the
//! index file, then commits the run by writing the metadata file. The reader
//! memory-maps both files and binary-searches the index, decoding only keys
//! while probing.

use super::format::{
    self, RunMetadata, INDEX_ENTRY_SIZE, MAGIC_BYTES, SST_FILE_SUFFIX, SST_INDEX_SUFFIX,
    SST_META_SUFFIX,
};
use crate::types::Tuple;
use crate::{Result, StorageError};
use lru::LruCache;
use memmap2::Mmap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Paths belonging to one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    pub data: PathBuf,
    pub index: PathBuf,
    pub meta: PathBuf,
}

impl RunFiles {
    pub fn new(dir: &Path, prefix: &str, table_number: u64) -> Self {
        Self {
            data: format::run_file(dir, prefix, table_number, SST_FILE_SUFFIX),
            index: format::run_file(dir, prefix, table_number, SST_INDEX_SUFFIX),
            meta: format::run_file(dir, prefix, table_number, SST_META_SUFFIX),
        }
    }

    /// Remove all files of the run (missing files are ignored)
    pub fn delete(&self) -> Result<()> {
        for path in [&self.meta, &self.index, &self.data] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// SSTable writer (write-only)
pub struct SSTableWriter {
    files: RunFiles,
    data: BufWriter<File>,
    index: BufWriter<File>,
    metadata: RunMetadata,
    offset: u64,
    last: Option<Tuple>,
    record_buf: Vec<u8>,
}

impl SSTableWriter {
    /// Create the data and index files; existing files are an error
    pub fn new(files: RunFiles) -> Result<Self> {
        let open = |path: &Path| OpenOptions::new().write(true).create_new(true).open(path);

        let data_file = open(&files.data)?;
        let index_file = match open(&files.index) {
            Ok(file) => file,
            Err(e) => {
                let _ = std::fs::remove_file(&files.data);
                return Err(e.into());
            }
        };

        let mut writer = Self {
            files,
            data: BufWriter::with_capacity(64 * 1024, data_file),
            index: BufWriter::with_capacity(16 * 1024, index_file),
            metadata: RunMetadata::default(),
            offset: MAGIC_BYTES.len() as u64,
            last: None,
            record_buf: Vec::with_capacity(1024),
        };

        if let Err(e) = writer.write_headers() {
            writer.abort();
            return Err(e);
        }
        Ok(writer)
    }

    fn write_headers(&mut self) -> Result<()> {
        self.data.write_all(MAGIC_BYTES)?;
        self.index.write_all(MAGIC_BYTES)?;
        Ok(())
    }

    /// Append a tuple; tuples must arrive in storage order
    pub fn add(&mut self, tuple: &Tuple) -> Result<()> {
        if let Some(last) = &self.last {
            if last.storage_order(tuple) == Ordering::Greater {
                return Err(StorageError::InvalidArgument(format!(
                    "tuple ({}, {}) written after ({}, {})",
                    tuple.key(),
                    tuple.version(),
                    last.key(),
                    last.version()
                )));
            }
        }

        if self.offset > u32::MAX as u64 {
            return Err(StorageError::ResourceExhausted(format!(
                "sstable {} exceeds 4 GiB",
                self.files.data.display()
            )));
        }

        self.record_buf.clear();
        format::encode_record(tuple, &mut self.record_buf)?;

        self.index.write_all(&(self.offset as u32).to_be_bytes())?;
        self.data.write_all(&self.record_buf)?;
        self.offset += self.record_buf.len() as u64;

        self.metadata.record(tuple);
        self.last = Some(tuple.clone());
        Ok(())
    }

    /// Bytes written to the data file so far
    pub fn written_bytes(&self) -> u64 {
        self.offset
    }

    pub fn tuple_count(&self) -> u64 {
        self.metadata.tuples
    }

    pub fn files(&self) -> &RunFiles {
        &self.files
    }

    /// Sync both files and commit the run by writing its metadata
    pub fn finish(mut self) -> Result<(RunFiles, RunMetadata)> {
        match self.finish_inner() {
            Ok(metadata) => Ok((self.files.clone(), metadata)),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn finish_inner(&mut self) -> Result<RunMetadata> {
        self.data.flush()?;
        self.data.get_mut().sync_data()?;
        self.index.flush()?;
        self.index.get_mut().sync_data()?;

        let mut metadata = self.metadata.clone();
        metadata.data_size = self.offset;
        metadata.write_to(&self.files.meta)?;
        Ok(metadata)
    }

    /// Drop all partially written files
    pub fn abort(&mut self) {
        if let Err(e) = self.files.delete() {
            tracing::warn!(file = %self.files.data.display(), error = %e, "failed to remove aborted sstable");
        }
    }
}

/// SSTable reader (read-only, memory mapped)
pub struct SSTableReader {
    files: RunFiles,
    data: Mmap,
    index: Mmap,
    key_cache: Mutex<LruCache<String, usize>>,
}

impl SSTableReader {
    pub fn open(files: RunFiles, key_cache_entries: usize) -> Result<Self> {
        let data_file = File::open(&files.data)?;
        let index_file = File::open(&files.index)?;

        // SAFETY: runs are immutable once committed; files are only removed
        // after every reader released them.
        let data = unsafe { Mmap::map(&data_file)? };
        let index = unsafe { Mmap::map(&index_file)? };

        format::check_magic(&data, &files.data)?;
        format::check_magic(&index, &files.index)?;

        if (index.len() - MAGIC_BYTES.len()) % INDEX_ENTRY_SIZE != 0 {
            return Err(StorageError::Corruption(format!(
                "index file {} has a partial entry",
                files.index.display()
            )));
        }

        let cache_size = NonZeroUsize::new(key_cache_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            files,
            data,
            index,
            key_cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    pub fn files(&self) -> &RunFiles {
        &self.files
    }

    /// Number of records according to the index
    pub fn tuple_count(&self) -> usize {
        (self.index.len() - MAGIC_BYTES.len()) / INDEX_ENTRY_SIZE
    }

    pub fn data_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn offset_at(&self, position: usize) -> usize {
        let start = MAGIC_BYTES.len() + position * INDEX_ENTRY_SIZE;
        let entry = &self.index[start..start + INDEX_ENTRY_SIZE];
        u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]) as usize
    }

    pub fn key_at(&self, position: usize) -> Result<&str> {
        format::decode_key(&self.data, self.offset_at(position))
    }

    pub fn tuple_at(&self, position: usize) -> Result<Tuple> {
        format::decode_record(&self.data, self.offset_at(position)).map(|(tuple, _)| tuple)
    }

    /// Index position of the first record with `key`
    pub fn first_position_of(&self, key: &str) -> Result<Option<usize>> {
        if let Some(position) = self.key_cache.lock().get(key) {
            return Ok(Some(*position));
        }

        let mut low = 0usize;
        let mut high = self.tuple_count();
        while low < high {
            let mid = low + (high - low) / 2;
            if self.key_at(mid)? < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        if low < self.tuple_count() && self.key_at(low)? == key {
            self.key_cache.lock().put(key.to_string(), low);
            Ok(Some(low))
        } else {
            Ok(None)
        }
    }

    /// All versions of `key` stored in this run, newest first
    pub fn get(&self, key: &str) -> Result<Vec<Tuple>> {
        let mut result = Vec::new();
        let Some(mut position) = self.first_position_of(key)? else {
            return Ok(result);
        };

        while position < self.tuple_count() && self.key_at(position)? == key {
            result.push(self.tuple_at(position)?);
            position += 1;
        }
        Ok(result)
    }

    /// Iterate over all records in storage order
    pub fn iter(self: &Arc<Self>) -> SSTableIterator {
        SSTableIterator {
            reader: Arc::clone(self),
            offset: MAGIC_BYTES.len(),
            failed: false,
        }
    }
}

/// Sequential scan over the data file
pub struct SSTableIterator {
    reader: Arc<SSTableReader>,
    offset: usize,
    failed: bool,
}

impl Iterator for SSTableIterator {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.reader.data.len() {
            return None;
        }

        match format::decode_record(&self.reader.data, self.offset) {
            Ok((tuple, next)) => {
                self.offset = next;
                Some(Ok(tuple))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hyperrectangle;
    use tempfile::TempDir;

    fn tuple(key: &str, version: i64, value: &str) -> Tuple {
        Tuple::with_version(key, Hyperrectangle::from_bounds(&[0.0, 1.0]).unwrap(), value.as_bytes().to_vec(), version)
    }

    fn write_run(dir: &Path, number: u64, tuples: &[Tuple]) -> RunFiles {
        let mut writer = SSTableWriter::new(RunFiles::new(dir, "sstable_t", number)).unwrap();
        for t in tuples {
            writer.add(t).unwrap();
        }
        writer.finish().unwrap().0
    }

    #[test]
    fn test_write_and_get() {
        let dir = TempDir::new().unwrap();
        let files = write_run(
            dir.path(),
            1,
            &[tuple("a", 1, "a1"), tuple("b", 3, "b3"), tuple("b", 2, "b2"), tuple("c", 1, "c1")],
        );

        let meta = RunMetadata::read_from(&files.meta).unwrap();
        assert_eq!(meta.tuples, 4);
        assert_eq!(meta.min_key.as_deref(), Some("a"));
        assert_eq!(meta.max_key.as_deref(), Some("c"));

        let reader = SSTableReader::open(files, 16).unwrap();
        assert_eq!(reader.tuple_count(), 4);

        let versions: Vec<i64> = reader.get("b").unwrap().iter().map(|t| t.version()).collect();
        assert_eq!(versions, vec![3, 2]);
        assert!(reader.get("bb").unwrap().is_empty());
        assert!(reader.get("0").unwrap().is_empty());
        assert!(reader.get("z").unwrap().is_empty());

        // cached lookup gives the same answer
        assert_eq!(reader.get("b").unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_unsorted_input() {
        let dir = TempDir::new().unwrap();
        let mut writer = SSTableWriter::new(RunFiles::new(dir.path(), "sstable_t", 1)).unwrap();
        writer.add(&tuple("b", 1, "x")).unwrap();
        assert!(writer.add(&tuple("a", 1, "x")).is_err());
        // same key, older after newer is fine; newer after older is not
        writer.add(&tuple("c", 5, "x")).unwrap();
        assert!(writer.add(&tuple("c", 6, "x")).is_err());
    }

    #[test]
    fn test_abort_removes_files() {
        let dir = TempDir::new().unwrap();
        let files = RunFiles::new(dir.path(), "sstable_t", 7);
        let mut writer = SSTableWriter::new(files.clone()).unwrap();
        writer.add(&tuple("a", 1, "x")).unwrap();
        writer.abort();
        assert!(!files.data.exists());
        assert!(!files.index.exists());
        assert!(!files.meta.exists());
    }

    #[test]
    fn test_iterator_order() {
        let dir = TempDir::new().unwrap();
        let input = vec![tuple("a", 2, "x"), tuple("a", 1, "y"), tuple("b", 1, "z")];
        let files = write_run(dir.path(), 1, &input);
        let reader = Arc::new(SSTableReader::open(files, 4).unwrap());

        let output: Vec<Tuple> = reader.iter().map(|r| r.unwrap()).collect();
        assert_eq!(output, input);
    }

    #[test]
    fn test_corrupt_magic() {
        let dir = TempDir::new().unwrap();
        let files = write_run(dir.path(), 1, &[tuple("a", 1, "x")]);
        std::fs::write(&files.data, b"garbage!").unwrap();
        assert!(SSTableReader::open(files, 4).is_err());
    }
}
