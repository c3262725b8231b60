//! Write side of the checkpoint archive.

use crate::error::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Writes records under a single top-level directory, uncompressed so that
/// storage records can be read back by range.
pub struct ArchiveWriter {
    zip: ZipWriter<BufWriter<File>>,
    prefix: String,
}

impl ArchiveWriter {
    pub fn create(path: impl AsRef<Path>, archive_name: &str) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            zip: ZipWriter::new(BufWriter::new(file)),
            prefix: archive_name.to_string(),
        })
    }

    pub fn write_record(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .large_file(bytes.len() as u64 >= u32::MAX as u64);
        self.zip
            .start_file(format!("{}/{}", self.prefix, name), options)?;
        self.zip.write_all(bytes)?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        let mut inner = self.zip.finish()?;
        inner.flush()?;
        Ok(())
    }
}
