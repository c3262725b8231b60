//! Error types for the lazyckpt core library.
//!
//! Uses `thiserror` for the public API. Loading and materialization share
//! [`CheckpointError`]; the model-parallel setup path reports [`StrategyError`].

use std::time::Duration;

/// Errors raised while reading, deserializing or materializing a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The object-graph stream is corrupt, truncated or uses an unsupported opcode.
    #[error("Unpickling error at byte {position}: {message}")]
    Format { position: u64, message: String },

    /// The stream is well formed but its contents do not have the expected shape.
    #[error("Malformed checkpoint structure: {0}")]
    Structure(String),

    /// A global could not be resolved (strict mode only).
    #[error("Cannot resolve global {module}.{name}")]
    UnknownSymbol { module: String, name: String },

    #[error("Record not found in archive: {0}")]
    RecordNotFound(String),

    #[error("Short read from record {record}: expected {expected} bytes, found {actual}")]
    ShortRead {
        record: String,
        expected: u64,
        actual: u64,
    },

    /// Name-based access to a placeholder attribute outside its allow-list.
    #[error("{type_name} does not have {name}")]
    AttributeNotFound {
        type_name: &'static str,
        name: String,
    },

    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    pub fn format(position: u64, msg: impl Into<String>) -> Self {
        Self::Format {
            position,
            message: msg.into(),
        }
    }

    pub fn structure(msg: impl Into<String>) -> Self {
        Self::Structure(msg.into())
    }

    pub fn tensor(msg: impl Into<String>) -> Self {
        Self::Tensor(msg.into())
    }

    pub fn attribute_not_found(type_name: &'static str, name: impl Into<String>) -> Self {
        Self::AttributeNotFound {
            type_name,
            name: name.into(),
        }
    }
}

/// Errors from the model-parallel strategy setup path.
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error(
        "Accessing the device mesh before processes have initialized is not allowed."
    )]
    MeshNotInitialized,

    #[error(
        "The sizes `data_parallel_size={data_parallel}` and `tensor_parallel_size={tensor_parallel}` multiplied should equal the world size ({world_size})."
    )]
    InvalidMeshDimensions {
        data_parallel: usize,
        tensor_parallel: usize,
        world_size: usize,
    },

    #[error("The `ModelParallelStrategy` does not use the `CheckpointIO` plugin.")]
    CheckpointIoUnused,

    #[error("The `ModelParallelStrategy` does not support setting a `CheckpointIO` plugin.")]
    CheckpointIoUnsupported,

    #[error(
        "Found modules that are wrapped with the legacy FSDP API: {0}. The `ModelParallelStrategy` only supports the new FSDP2 APIs."
    )]
    LegacyFsdpModule(String),

    #[error(
        "When using the `ModelParallelStrategy`, you are required to override the `configure_model()` hook in the module {0} and apply parallelization there."
    )]
    ConfigureModelRequired(String),

    #[error(
        "`ModelParallelStrategy.save_checkpoint(..., storage_options=...)` is not supported because `ModelParallelStrategy` does not use the `CheckpointIO`."
    )]
    StorageOptionsUnsupported,

    #[error("Process group initialization failed (timeout {timeout:?}): {message}")]
    ProcessGroup { message: String, timeout: Duration },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_error_names_type() {
        let err = CheckpointError::attribute_not_found("LazyTensor", "tolist");
        assert_eq!(err.to_string(), "LazyTensor does not have tolist");
    }

    #[test]
    fn test_mesh_error_message() {
        let err = StrategyError::InvalidMeshDimensions {
            data_parallel: 2,
            tensor_parallel: 3,
            world_size: 4,
        };
        assert!(err.to_string().contains("multiplied should equal the world size (4)"));
    }
}
