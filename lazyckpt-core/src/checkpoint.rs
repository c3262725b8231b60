//! Public entry points: load lazily or eagerly, materialize, save.

use crate::archive::{ArchiveReader, ArchiveWriter, FORMAT_VERSION};
use crate::collection::apply_to_collection;
use crate::config::LoaderConfig;
use crate::error::Result;
use crate::lazy::{ArchiveUnpickler, LoadMode};
use crate::pickle::{Pickler, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Load a checkpoint without reading any tensor storage.
///
/// Tensors come back as [`Value::Lazy`] placeholders bound to the archive.
pub fn lazy_load(path: impl AsRef<Path>) -> Result<Value> {
    lazy_load_with(path, &LoaderConfig::default())
}

pub fn lazy_load_with(path: impl AsRef<Path>, config: &LoaderConfig) -> Result<Value> {
    load_mode(path.as_ref(), config, LoadMode::Lazy)
}

/// Load a checkpoint, reading every storage up front.
pub fn load(path: impl AsRef<Path>) -> Result<Value> {
    load_with(path, &LoaderConfig::default())
}

pub fn load_with(path: impl AsRef<Path>, config: &LoaderConfig) -> Result<Value> {
    load_mode(path.as_ref(), config, LoadMode::Eager)
}

fn load_mode(path: &Path, config: &LoaderConfig, mode: LoadMode) -> Result<Value> {
    let start = Instant::now();
    let archive = Arc::new(ArchiveReader::open(path)?);
    let value = ArchiveUnpickler::new(Arc::clone(&archive), mode)
        .strict(config.strict_globals)
        .load(&config.pickle_record)?;
    info!(
        path = %path.display(),
        mode = ?mode,
        placeholders = value.lazy_count(),
        resident_bytes = value.resident_bytes(),
        storage_reads = archive.storage_reads(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Loaded checkpoint"
    );
    Ok(value)
}

/// Replace every placeholder in `value` with its materialized tensor.
pub fn materialize_all(value: Value) -> Result<Value> {
    apply_to_collection(
        value,
        &|v: &Value| matches!(v, Value::Lazy(_)),
        &mut |v| match v {
            Value::Lazy(lazy) => lazy.materialize().map(Value::Tensor),
            other => Ok(other),
        },
    )
}

/// Write `value` as a checkpoint archive.
///
/// Placeholders are materialized on the way out.
pub fn save(value: &Value, path: impl AsRef<Path>) -> Result<()> {
    save_with(value, path, &LoaderConfig::default())
}

pub fn save_with(value: &Value, path: impl AsRef<Path>, config: &LoaderConfig) -> Result<()> {
    let path = path.as_ref();
    let archive_name = config.archive_name.clone().unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "archive".to_string())
    });

    let mut pickler = Pickler::new(Vec::new());
    pickler.dump(value)?;
    // dump first: the graph decides which storages get written
    let (graph, storages) = pickler.into_parts();

    let mut writer = ArchiveWriter::create(path, &archive_name)?;
    writer.write_record(&config.pickle_record, &graph)?;
    writer.write_record("byteorder", b"little")?;
    for storage in &storages {
        debug!(key = %storage.key, bytes = storage.bytes.len(), "Writing storage record");
        writer.write_record(&format!("data/{}", storage.key), &storage.bytes)?;
    }
    writer.write_record("version", FORMAT_VERSION.as_bytes())?;
    writer.finish()?;

    info!(
        path = %path.display(),
        storages = storages.len(),
        "Saved checkpoint"
    );
    Ok(())
}
