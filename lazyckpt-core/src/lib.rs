//! # lazyckpt Core
//!
//! Reads and writes tensor checkpoints in the `torch.save` archive layout.
//! [`lazy_load`] replays the archive's object graph without reading tensor
//! storage: tensors come back as [`LazyTensor`] placeholders that answer
//! shape and dtype queries from metadata and read their record only when
//! materialized. Also provides the setup path of a data-parallel x
//! tensor-parallel training strategy.

pub mod archive;
pub mod checkpoint;
pub mod collection;
pub mod config;
pub mod dtype;
pub mod error;
pub mod lazy;
pub mod pickle;
pub mod strategy;
pub mod tensor;

// Re-export commonly used types at the crate root.
pub use archive::{ArchiveReader, ArchiveWriter};
pub use checkpoint::{lazy_load, lazy_load_with, load, load_with, materialize_all, save, save_with};
pub use collection::apply_to_collection;
pub use config::{LazyckptConfig, LoaderConfig, MeshSize, StrategyConfig, load_config};
pub use dtype::{ByteOrder, DType};
pub use error::{CheckpointError, Result, StrategyError};
pub use lazy::{LazyTensor, TensorAttr};
pub use pickle::{Object, Symbol, Value};
pub use strategy::ModelParallelStrategy;
pub use tensor::{Device, Storage, StorageKey, Tensor};
