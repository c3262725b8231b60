//! Placeholder tensors: metadata now, storage bytes on demand.

use crate::archive::ArchiveReader;
use crate::dtype::DType;
use crate::error::{CheckpointError, Result};
use crate::pickle::{Symbol, Value};
use crate::tensor::{Storage, StorageKey, Tensor};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Arguments of `torch._utils._rebuild_tensor_v2` after the storage.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildArgs {
    pub storage_offset: usize,
    pub size: Vec<usize>,
    pub stride: Vec<usize>,
    pub requires_grad: bool,
    pub backward_hooks: Value,
    pub metadata: Option<Value>,
}

impl RebuildArgs {
    /// Split `(storage, offset, size, stride, requires_grad, hooks[, metadata])`.
    pub fn parse(args: Vec<Value>) -> Result<(Storage, Self)> {
        if !(6..=7).contains(&args.len()) {
            return Err(CheckpointError::structure(format!(
                "_rebuild_tensor_v2 takes 6 or 7 arguments, got {}",
                args.len()
            )));
        }
        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or(Value::None);

        let storage = match next() {
            Value::Storage(s) => s,
            other => {
                return Err(CheckpointError::structure(format!(
                    "_rebuild_tensor_v2 expected a storage, got {}",
                    other.type_name()
                )));
            }
        };
        let storage_offset = to_usize(&next(), "storage_offset")?;
        let size = to_dims(&next(), "size")?;
        let stride = to_dims(&next(), "stride")?;
        let requires_grad = next().as_bool().unwrap_or(false);
        let backward_hooks = next();
        let metadata = match next() {
            Value::None => None,
            m => Some(m),
        };
        Ok((
            storage,
            Self {
                storage_offset,
                size,
                stride,
                requires_grad,
                backward_hooks,
                metadata,
            },
        ))
    }

    /// View `storage` with these arguments.
    pub fn rebuild(&self, storage: Storage) -> Result<Tensor> {
        Tensor::from_storage(
            storage,
            self.storage_offset,
            self.size.clone(),
            self.stride.clone(),
            self.requires_grad,
        )
    }
}

fn to_usize(v: &Value, what: &str) -> Result<usize> {
    v.as_int()
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| {
            CheckpointError::structure(format!("{what} must be a non-negative int, got {}", v.type_name()))
        })
}

fn to_dims(v: &Value, what: &str) -> Result<Vec<usize>> {
    // torch.Size pickles as a plain tuple
    let items = v
        .as_seq()
        .ok_or_else(|| CheckpointError::structure(format!("{what} must be a tuple, got {}", v.type_name())))?;
    items.iter().map(|d| to_usize(d, what)).collect()
}

/// A reconstruction step applied after the storage read.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// `_rebuild_from_type_v2`: re-tag as `class`, carrying `state`.
    FromType { class: Symbol, state: Value },
    /// `_rebuild_parameter`: wrap as a learnable parameter.
    Parameter {
        requires_grad: bool,
        backward_hooks: Value,
    },
}

impl Transform {
    pub fn apply(&self, tensor: Tensor) -> Tensor {
        match self {
            Transform::FromType { class, state } => {
                if class.is("torch", "Tensor") {
                    tensor
                } else {
                    tensor.into_subclass(class.clone(), state.clone())
                }
            }
            Transform::Parameter { requires_grad, .. } => tensor.into_parameter(*requires_grad),
        }
    }
}

/// How a placeholder turns into a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Deferred {
    /// Read the storage record and rebuild the view.
    Read,
    /// Run the inner step, then apply a transform to its result.
    Chained(Box<Deferred>, Transform),
}

impl Deferred {
    fn run(&self, base: Tensor) -> Tensor {
        match self {
            Deferred::Read => base,
            Deferred::Chained(inner, transform) => transform.apply(inner.run(base)),
        }
    }

    /// Transforms in the order they are applied.
    pub fn transforms(&self) -> Vec<&Transform> {
        match self {
            Deferred::Read => Vec::new(),
            Deferred::Chained(inner, transform) => {
                let mut out = inner.transforms();
                out.push(transform);
                out
            }
        }
    }
}

/// Value of a named tensor attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorAttr {
    None,
    Bool(bool),
    Int(usize),
    Str(&'static str),
    DType(DType),
    Dims(Vec<usize>),
    Names(Vec<Option<String>>),
    Tensor(Tensor),
}

impl fmt::Display for TensorAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorAttr::None => f.write_str("None"),
            TensorAttr::Bool(true) => f.write_str("True"),
            TensorAttr::Bool(false) => f.write_str("False"),
            TensorAttr::Int(i) => write!(f, "{i}"),
            TensorAttr::Str(s) => f.write_str(s),
            TensorAttr::DType(d) => write!(f, "{d}"),
            TensorAttr::Dims(dims) => {
                let dims: Vec<String> = dims.iter().map(usize::to_string).collect();
                write!(f, "torch.Size([{}])", dims.join(", "))
            }
            TensorAttr::Names(names) => {
                let names: Vec<&str> = names
                    .iter()
                    .map(|n| n.as_deref().unwrap_or("None"))
                    .collect();
                write!(f, "({})", names.join(", "))
            }
            TensorAttr::Tensor(t) => write!(f, "{t:?}"),
        }
    }
}

/// A tensor whose storage has not been read yet.
///
/// Metadata accessors are answered from a meta-device descriptor and never
/// touch the archive. [`LazyTensor::materialize`] performs one record read per
/// call and returns a new tensor; the placeholder itself never changes.
#[derive(Clone)]
pub struct LazyTensor {
    meta: Tensor,
    archive: Arc<ArchiveReader>,
    storage_key: StorageKey,
    rebuild: Box<RebuildArgs>,
    deferred: Box<Deferred>,
}

impl LazyTensor {
    pub fn new(
        meta: Tensor,
        archive: Arc<ArchiveReader>,
        storage_key: StorageKey,
        rebuild: RebuildArgs,
    ) -> Self {
        Self {
            meta,
            archive,
            storage_key,
            rebuild: Box::new(rebuild),
            deferred: Box::new(Deferred::Read),
        }
    }

    /// New placeholder that applies `transform` after everything already deferred.
    ///
    /// The meta descriptor is updated too, so `is_parameter` and
    /// `requires_grad` describe the tensor materialization will produce.
    pub fn chain(self, transform: Transform) -> Self {
        Self {
            meta: transform.apply(self.meta),
            deferred: Box::new(Deferred::Chained(self.deferred, transform)),
            ..self
        }
    }

    pub fn meta(&self) -> &Tensor {
        &self.meta
    }

    pub fn archive(&self) -> &Arc<ArchiveReader> {
        &self.archive
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    pub fn rebuild_args(&self) -> &RebuildArgs {
        &self.rebuild
    }

    pub fn deferred(&self) -> &Deferred {
        &self.deferred
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    pub fn size(&self) -> &[usize] {
        self.meta.shape()
    }

    pub fn stride(&self) -> &[usize] {
        self.meta.stride()
    }

    pub fn ndim(&self) -> usize {
        self.meta.ndim()
    }

    pub fn numel(&self) -> usize {
        self.meta.numel()
    }

    pub fn requires_grad(&self) -> bool {
        self.meta.requires_grad()
    }

    pub fn is_parameter(&self) -> bool {
        self.meta.is_parameter()
    }

    /// Always `None`: freshly loaded tensors carry no gradient.
    pub fn grad(&self) -> Option<&Tensor> {
        None
    }

    pub fn grad_fn(&self) -> Option<&str> {
        None
    }

    pub fn layout(&self) -> &'static str {
        "torch.strided"
    }

    pub fn names(&self) -> Vec<Option<String>> {
        vec![None; self.ndim()]
    }

    pub fn output_nr(&self) -> usize {
        0
    }

    pub fn retains_grad(&self) -> bool {
        false
    }

    pub fn volatile(&self) -> bool {
        false
    }

    /// Placeholders never hold storage bytes.
    pub fn resident_bytes(&self) -> usize {
        0
    }

    /// Look up an attribute by name.
    ///
    /// Metadata names are served without I/O, `contiguous` materializes, and
    /// anything else is an [`CheckpointError::AttributeNotFound`].
    pub fn attribute(&self, name: &str) -> Result<TensorAttr> {
        Ok(match name {
            "dtype" => TensorAttr::DType(self.dtype()),
            "shape" | "size" => TensorAttr::Dims(self.shape().to_vec()),
            "stride" => TensorAttr::Dims(self.stride().to_vec()),
            "ndim" => TensorAttr::Int(self.ndim()),
            "numel" => TensorAttr::Int(self.numel()),
            "output_nr" => TensorAttr::Int(self.output_nr()),
            "requires_grad" => TensorAttr::Bool(self.requires_grad()),
            "retains_grad" => TensorAttr::Bool(self.retains_grad()),
            "volatile" => TensorAttr::Bool(self.volatile()),
            "is_parameter" => TensorAttr::Bool(self.is_parameter()),
            "grad" | "grad_fn" => TensorAttr::None,
            "layout" => TensorAttr::Str(self.layout()),
            "names" => TensorAttr::Names(self.names()),
            "contiguous" => TensorAttr::Tensor(self.contiguous()?),
            other => return Err(CheckpointError::attribute_not_found("LazyTensor", other)),
        })
    }

    /// Read the storage and rebuild the tensor, then apply deferred transforms.
    pub fn materialize(&self) -> Result<Tensor> {
        let dtype = self.meta.dtype();
        let nbytes = self.storage_key.nbytes(dtype)?;
        let storage = self
            .archive
            .storage_from_record(&self.storage_key.record_name(), nbytes, dtype)?
            .with_key(self.storage_key.clone());
        trace!(
            record = %self.storage_key.record,
            dtype = %dtype,
            "Wrapped storage record as typed storage"
        );
        let base = self.rebuild.rebuild(storage)?;
        Ok(self.deferred.run(base))
    }

    /// Materialize into densely packed memory.
    pub fn contiguous(&self) -> Result<Tensor> {
        self.materialize()?.contiguous()
    }
}

impl fmt::Debug for LazyTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LazyTensor({:?})", self.meta)
    }
}

impl PartialEq for LazyTensor {
    fn eq(&self, other: &Self) -> bool {
        self.archive.path() == other.archive.path()
            && self.storage_key == other.storage_key
            && self.rebuild == other.rebuild
            && self.deferred == other.deferred
            && self.meta == other.meta
    }
}
