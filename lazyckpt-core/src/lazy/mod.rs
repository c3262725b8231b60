//! Lazy loading: placeholder tensors, the rebuild redirect table and the
//! archive-aware resolver that ties them to an archive.

pub mod dispatch;
mod placeholder;
mod registry;
mod unpickler;

pub use placeholder::{Deferred, LazyTensor, RebuildArgs, TensorAttr, Transform};
pub use registry::{LoadMode, RebuildRegistry};
pub use unpickler::{ArchiveUnpickler, parse_storage_pid};
