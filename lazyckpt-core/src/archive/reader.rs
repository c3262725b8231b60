//! Read side of the checkpoint archive: a record index built once at open,
//! then bounded reads of individual records.

use crate::dtype::{ByteOrder, DType};
use crate::error::{CheckpointError, Result};
use crate::tensor::Storage;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use zip::ZipArchive;

/// Upper bound on buffer space reserved up front from a record's declared size.
/// Larger records still read fully; the buffer grows as data arrives.
const PREALLOC_LIMIT: u64 = 64 * 1024 * 1024;

fn preallocate(declared: u64) -> Vec<u8> {
    Vec::with_capacity(declared.min(PREALLOC_LIMIT) as usize)
}

/// Indexed, read-on-demand view of a checkpoint archive.
///
/// Record names are relative to the archive's top-level directory, so
/// `data.pkl` addresses `<archive>/data.pkl` whatever the directory is called.
pub struct ArchiveReader {
    path: PathBuf,
    prefix: String,
    records: BTreeMap<String, u64>,
    byte_order: ByteOrder,
    zip: Mutex<ZipArchive<BufReader<File>>>,
    storage_reads: AtomicUsize,
}

impl ArchiveReader {
    /// Open `path` and index its records. No record contents are read except `byteorder`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut zip = ZipArchive::new(BufReader::new(file))?;

        let mut names = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let entry = zip.by_index(i)?;
            if !entry.is_dir() {
                names.push((entry.name().to_string(), entry.size()));
            }
        }

        let prefix = names
            .first()
            .and_then(|(name, _)| name.split_once('/'))
            .map(|(dir, _)| dir.to_string())
            .ok_or_else(|| {
                CheckpointError::structure(format!(
                    "{} is not a checkpoint archive: records must live under a top-level directory",
                    path.display()
                ))
            })?;

        let records: BTreeMap<String, u64> = names
            .into_iter()
            .filter_map(|(name, size)| {
                name.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_prefix('/'))
                    .map(|rest| (rest.to_string(), size))
            })
            .collect();

        let mut reader = Self {
            path,
            prefix,
            records,
            byte_order: ByteOrder::Little,
            zip: Mutex::new(zip),
            storage_reads: AtomicUsize::new(0),
        };
        if reader.has_record("byteorder") {
            let raw = reader.record("byteorder")?;
            reader.byte_order = match String::from_utf8_lossy(&raw).trim() {
                "big" => ByteOrder::Big,
                "little" => ByteOrder::Little,
                other => {
                    return Err(CheckpointError::structure(format!(
                        "unknown byteorder record {other:?}"
                    )));
                }
            };
        }

        debug!(
            path = %reader.path.display(),
            archive = %reader.prefix,
            records = reader.records.len(),
            "Indexed checkpoint archive"
        );
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the archive's top-level directory.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn record_names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn has_record(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn record_size(&self, name: &str) -> Option<u64> {
        self.records.get(name).copied()
    }

    /// Number of storage reads served so far.
    pub fn storage_reads(&self) -> usize {
        self.storage_reads.load(Ordering::Relaxed)
    }

    /// Read a whole record.
    pub fn record(&self, name: &str) -> Result<Vec<u8>> {
        let size = self
            .record_size(name)
            .ok_or_else(|| CheckpointError::RecordNotFound(name.to_string()))?;
        let mut buf = preallocate(size);
        self.read_into(name, size, &mut buf)?;
        Ok(buf)
    }

    /// Read the first `nbytes` of record `name` as a CPU storage of `dtype`,
    /// converted to little-endian element order.
    pub fn storage_from_record(&self, name: &str, nbytes: usize, dtype: DType) -> Result<Storage> {
        let size = self
            .record_size(name)
            .ok_or_else(|| CheckpointError::RecordNotFound(name.to_string()))?;
        if size < nbytes as u64 {
            return Err(CheckpointError::ShortRead {
                record: name.to_string(),
                expected: nbytes as u64,
                actual: size,
            });
        }
        let mut buf = preallocate(nbytes as u64);
        self.read_into(name, nbytes as u64, &mut buf)?;
        self.storage_reads.fetch_add(1, Ordering::Relaxed);
        debug!(record = %name, bytes = nbytes, dtype = %dtype, "Read storage record");

        self.byte_order.to_little_endian(&mut buf, dtype.element_size());
        Storage::from_bytes(dtype, buf.into())
    }

    fn read_into(&self, name: &str, limit: u64, buf: &mut Vec<u8>) -> Result<()> {
        let full = format!("{}/{}", self.prefix, name);
        let mut zip = self
            .zip
            .lock()
            .map_err(|_| std::io::Error::other("archive handle poisoned"))?;
        let entry = zip.by_name(&full).map_err(|e| match e {
            zip::result::ZipError::FileNotFound => CheckpointError::RecordNotFound(name.to_string()),
            other => CheckpointError::Zip(other),
        })?;
        let read = entry.take(limit).read_to_end(buf)?;
        if (read as u64) < limit {
            return Err(CheckpointError::ShortRead {
                record: name.to_string(),
                expected: limit,
                actual: read as u64,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("path", &self.path)
            .field("prefix", &self.prefix)
            .field("records", &self.records.len())
            .field("byte_order", &self.byte_order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use tempfile::TempDir;

    fn write_archive(dir: &TempDir, records: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.path().join("ckpt.pt");
        let mut writer = ArchiveWriter::create(&path, "ckpt").unwrap();
        for (name, bytes) in records {
            writer.write_record(name, bytes).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_index_strips_archive_directory() {
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &[("data.pkl", b"x"), ("data/0", &[0u8; 8])]);
        let reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.prefix(), "ckpt");
        assert!(reader.has_record("data.pkl"));
        assert_eq!(reader.record_size("data/0"), Some(8));
        assert_eq!(reader.record("data.pkl").unwrap(), b"x");
    }

    #[test]
    fn test_storage_read_is_range_bounded() {
        let dir = TempDir::new().unwrap();
        let bytes: Vec<u8> = [1.0f32, 2.0, 3.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let path = write_archive(&dir, &[("data/0", &bytes)]);
        let reader = ArchiveReader::open(&path).unwrap();
        let storage = reader.storage_from_record("data/0", 8, DType::F32).unwrap();
        assert_eq!(storage.numel(), 2);
        assert_eq!(reader.storage_reads(), 1);
    }

    #[test]
    fn test_short_and_missing_records() {
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir, &[("data/0", &[0u8; 4])]);
        let reader = ArchiveReader::open(&path).unwrap();
        assert!(matches!(
            reader.storage_from_record("data/0", 8, DType::F32),
            Err(CheckpointError::ShortRead { expected: 8, actual: 4, .. })
        ));
        assert!(matches!(
            reader.record("data/9"),
            Err(CheckpointError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_big_endian_archive_is_swapped() {
        let dir = TempDir::new().unwrap();
        let bytes = 258i16.to_be_bytes();
        let path = write_archive(&dir, &[("byteorder", b"big"), ("data/0", &bytes)]);
        let reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.byte_order(), ByteOrder::Big);
        let storage = reader.storage_from_record("data/0", 2, DType::I16).unwrap();
        assert_eq!(DType::I16.decode(storage.bytes().unwrap()), 258.0);
    }

    #[test]
    fn test_declared_size_does_not_drive_allocation() {
        assert!(preallocate(16).capacity() >= 16);
        let capped = preallocate(u64::MAX);
        assert!(capped.capacity() >= PREALLOC_LIMIT as usize);
        assert!(capped.capacity() < 2 * PREALLOC_LIMIT as usize);
    }

    #[test]
    fn test_flat_zip_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flat.zip");
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        zip.start_file("data.pkl", zip::write::SimpleFileOptions::default())
            .unwrap();
        std::io::Write::write_all(&mut zip, b".").unwrap();
        zip.finish().unwrap();
        assert!(matches!(
            ArchiveReader::open(&path),
            Err(CheckpointError::Structure(_))
        ));
    }
}
