//! Archive-aware resolver: rebuild globals go through the registry and
//! storage persistent ids become lazy or eagerly read storages.

use super::registry::{LoadMode, RebuildRegistry};
use crate::archive::ArchiveReader;
use crate::dtype::DType;
use crate::error::{CheckpointError, Result};
use crate::pickle::{Resolve, Unpickler, Value, find_builtin};
use crate::tensor::{Storage, StorageKey};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Resolver that knows about the archive a stream was read from.
///
/// Rebuild globals are redirected through a [`RebuildRegistry`]. Storage
/// persistent ids become meta storages in lazy mode and are read (once per
/// record) in eager mode.
pub struct ArchiveUnpickler {
    archive: Arc<ArchiveReader>,
    registry: RebuildRegistry,
    strict: bool,
    storages: HashMap<String, Storage>,
}

impl ArchiveUnpickler {
    pub fn new(archive: Arc<ArchiveReader>, mode: LoadMode) -> Self {
        Self {
            archive,
            registry: RebuildRegistry::new(mode),
            strict: false,
            storages: HashMap::new(),
        }
    }

    /// Reject globals that are neither builtins nor rebuild functions.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn archive(&self) -> &Arc<ArchiveReader> {
        &self.archive
    }

    pub fn mode(&self) -> LoadMode {
        self.registry.mode()
    }

    /// Deserialize the object graph stored in `record`.
    pub fn load(self, record: &str) -> Result<Value> {
        let bytes = self.archive.record(record)?;
        Unpickler::new(Cursor::new(bytes), self).load()
    }
}

/// Parse `("storage", storage_class, record, device, numel)`.
pub fn parse_storage_pid(pid: &Value) -> Result<StorageKey> {
    let unsupported = || {
        CheckpointError::structure(format!("unsupported persistent id {pid:?}"))
    };
    let items = match pid {
        Value::Tuple(items) if items.len() == 5 => items,
        _ => return Err(unsupported()),
    };
    if items[0].as_str() != Some("storage") {
        return Err(CheckpointError::structure(format!(
            "unknown persistent id type {:?}",
            items[0]
        )));
    }
    let storage_class = match &items[1] {
        Value::Callable(c) => c.symbol().name.clone(),
        Value::Str(s) => s.clone(),
        _ => return Err(unsupported()),
    };
    let record = match &items[2] {
        Value::Str(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        _ => return Err(unsupported()),
    };
    let device = items[3].as_str().ok_or_else(unsupported)?.to_string();
    let numel = items[4]
        .as_int()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(unsupported)?;
    Ok(StorageKey {
        name: "storage".to_string(),
        storage_class,
        record,
        device,
        numel,
    })
}

impl Resolve for ArchiveUnpickler {
    fn find_class(&mut self, module: &str, name: &str) -> Result<Value> {
        if let Some(callable) = self.registry.bind(module, name, &self.archive) {
            debug!(
                symbol = %callable.symbol(),
                mode = ?self.registry.mode(),
                "Redirecting rebuild symbol"
            );
            return Ok(Value::Callable(callable));
        }
        find_builtin(module, name, self.strict)
    }

    fn persistent_load(&mut self, pid: Value) -> Result<Value> {
        let key = parse_storage_pid(&pid)?;
        let dtype = DType::from_storage_class(&key.storage_class).ok_or_else(|| {
            CheckpointError::structure(format!("unknown storage class {}", key.storage_class))
        })?;

        match self.registry.mode() {
            LoadMode::Lazy => Ok(Value::Storage(Storage::meta(dtype, key.numel).with_key(key))),
            LoadMode::Eager => {
                if let Some(storage) = self.storages.get(&key.record) {
                    return Ok(Value::Storage(storage.clone()));
                }
                let nbytes = key.nbytes(dtype)?;
                let record = key.record.clone();
                let storage = self
                    .archive
                    .storage_from_record(&key.record_name(), nbytes, dtype)?
                    .with_key(key);
                self.storages.insert(record, storage.clone());
                Ok(Value::Storage(storage))
            }
        }
    }
}
