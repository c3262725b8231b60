//! Minimal strided tensor runtime that checkpoints are rebuilt into.
//!
//! A [`Tensor`] is a view (offset, shape, stride) over a shared [`Storage`].
//! Storages either own little-endian bytes on the CPU or live on the meta
//! device, where only dtype and element count exist and nothing is allocated.

use crate::dtype::DType;
use crate::error::{CheckpointError, Result};
use crate::pickle::{Symbol, Value};
use std::fmt;
use std::sync::Arc;

/// Where a storage's elements live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    /// Metadata only, no backing memory.
    Meta,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Meta => f.write_str("meta"),
        }
    }
}

/// Persistent storage reference as recorded in the object graph:
/// `("storage", storage_class, record, device, numel)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKey {
    pub name: String,
    pub storage_class: String,
    pub record: String,
    pub device: String,
    pub numel: usize,
}

impl StorageKey {
    /// Archive record holding this storage's bytes.
    pub fn record_name(&self) -> String {
        format!("data/{}", self.record)
    }

    /// Bytes this storage occupies as `dtype` elements.
    pub fn nbytes(&self, dtype: DType) -> Result<usize> {
        self.numel.checked_mul(dtype.element_size()).ok_or_else(|| {
            CheckpointError::structure(format!(
                "storage {} of {} {dtype} elements overflows the address space",
                self.record, self.numel
            ))
        })
    }
}

/// Flat, typed element buffer shared by tensor views.
#[derive(Clone)]
pub struct Storage {
    dtype: DType,
    numel: usize,
    data: Option<Arc<[u8]>>,
    key: Option<Arc<StorageKey>>,
}

impl Storage {
    /// A storage on the meta device: dtype and length only.
    pub fn meta(dtype: DType, numel: usize) -> Self {
        Self {
            dtype,
            numel,
            data: None,
            key: None,
        }
    }

    /// A CPU storage over little-endian element bytes.
    pub fn from_bytes(dtype: DType, bytes: Arc<[u8]>) -> Result<Self> {
        let size = dtype.element_size();
        if bytes.len() % size != 0 {
            return Err(CheckpointError::structure(format!(
                "{} bytes is not a whole number of {dtype} elements",
                bytes.len()
            )));
        }
        Ok(Self {
            dtype,
            numel: bytes.len() / size,
            data: Some(bytes),
            key: None,
        })
    }

    /// Attach the persistent reference this storage was resolved from.
    pub fn with_key(mut self, key: StorageKey) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn key(&self) -> Option<&StorageKey> {
        self.key.as_deref()
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn device(&self) -> Device {
        if self.data.is_some() {
            Device::Cpu
        } else {
            Device::Meta
        }
    }

    /// Bytes of real memory held by this storage.
    pub fn resident_bytes(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    /// Identity of the shared buffer, if any.
    pub(crate) fn buffer_ptr(&self) -> Option<*const u8> {
        self.data.as_ref().map(|d| d.as_ptr())
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("dtype", &self.dtype)
            .field("numel", &self.numel)
            .field("device", &self.device())
            .field("key", &self.key)
            .finish()
    }
}

impl PartialEq for Storage {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.numel == other.numel
            && self.key == other.key
            && self.bytes() == other.bytes()
    }
}

/// Tensor subclass tag applied by a type-changing rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct Subclass {
    pub class: Symbol,
    pub state: Value,
}

/// Row-major strides for `shape`.
pub fn contiguous_stride(shape: &[usize]) -> Vec<usize> {
    let mut stride = vec![0; shape.len()];
    let mut acc = 1;
    for (i, dim) in shape.iter().enumerate().rev() {
        stride[i] = acc;
        acc *= (*dim).max(1);
    }
    stride
}

#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    storage_offset: usize,
    shape: Vec<usize>,
    stride: Vec<usize>,
    requires_grad: bool,
    parameter: bool,
    subclass: Option<Box<Subclass>>,
}

impl Tensor {
    /// View `storage` with the given geometry. Fails if the view reaches past the storage.
    pub fn from_storage(
        storage: Storage,
        storage_offset: usize,
        shape: Vec<usize>,
        stride: Vec<usize>,
        requires_grad: bool,
    ) -> Result<Self> {
        if shape.len() != stride.len() {
            return Err(CheckpointError::structure(format!(
                "size {shape:?} and stride {stride:?} have different ranks"
            )));
        }
        let out_of_range = || {
            CheckpointError::structure(format!(
                "view with offset {storage_offset}, size {shape:?}, stride {stride:?} exceeds storage of {} elements",
                storage.numel()
            ))
        };
        if shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d)).is_none() {
            return Err(out_of_range());
        }
        if shape.iter().all(|d| *d > 0) {
            let last = shape
                .iter()
                .zip(&stride)
                .try_fold(storage_offset, |acc, (d, s)| {
                    (d - 1).checked_mul(*s).and_then(|step| acc.checked_add(step))
                })
                .ok_or_else(out_of_range)?;
            if last >= storage.numel() {
                return Err(out_of_range());
            }
        }
        Ok(Self {
            storage,
            storage_offset,
            shape,
            stride,
            requires_grad,
            parameter: false,
            subclass: None,
        })
    }

    /// Contiguous CPU tensor from `values`, converted to `dtype`.
    pub fn from_values(dtype: DType, shape: Vec<usize>, values: &[f64]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(CheckpointError::tensor(format!(
                "shape {shape:?} needs {numel} values, got {}",
                values.len()
            )));
        }
        let mut bytes = Vec::with_capacity(numel * dtype.element_size());
        for v in values {
            dtype.encode(*v, &mut bytes);
        }
        let stride = contiguous_stride(&shape);
        Self::from_storage(Storage::from_bytes(dtype, bytes.into())?, 0, shape, stride, false)
    }

    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let numel: usize = shape.iter().product();
        let bytes: Arc<[u8]> = vec![0u8; numel * dtype.element_size()].into();
        Self {
            storage: Storage {
                dtype,
                numel,
                data: Some(bytes),
                key: None,
            },
            storage_offset: 0,
            stride: contiguous_stride(&shape),
            shape,
            requires_grad: false,
            parameter: false,
            subclass: None,
        }
    }

    /// Contiguous tensor on the meta device.
    pub fn meta(dtype: DType, shape: Vec<usize>) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            storage: Storage::meta(dtype, numel),
            storage_offset: 0,
            stride: contiguous_stride(&shape),
            shape,
            requires_grad: false,
            parameter: false,
            subclass: None,
        }
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn is_parameter(&self) -> bool {
        self.parameter
    }

    pub fn subclass(&self) -> Option<&Subclass> {
        self.subclass.as_deref()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn is_meta(&self) -> bool {
        self.device() == Device::Meta
    }

    pub fn resident_bytes(&self) -> usize {
        self.storage.resident_bytes()
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// Wrap as a learnable parameter.
    pub fn into_parameter(mut self, requires_grad: bool) -> Self {
        self.parameter = true;
        self.requires_grad = requires_grad;
        self
    }

    /// Re-tag as an instance of `class` carrying `state`.
    pub fn into_subclass(mut self, class: Symbol, state: Value) -> Self {
        self.subclass = Some(Box::new(Subclass { class, state }));
        self
    }

    pub fn is_contiguous(&self) -> bool {
        self.stride == contiguous_stride(&self.shape)
    }

    /// Element indices (into the storage) in row-major order of the view.
    fn element_indices(&self) -> Vec<usize> {
        let numel = self.numel();
        let mut out = Vec::with_capacity(numel);
        if numel == 0 {
            return out;
        }
        let mut index = vec![0usize; self.shape.len()];
        for _ in 0..numel {
            let pos = self.storage_offset
                + index
                    .iter()
                    .zip(&self.stride)
                    .map(|(i, s)| i * s)
                    .sum::<usize>();
            out.push(pos);
            for dim in (0..index.len()).rev() {
                index[dim] += 1;
                if index[dim] < self.shape[dim] {
                    break;
                }
                index[dim] = 0;
            }
        }
        out
    }

    fn data(&self) -> Result<&[u8]> {
        self.storage.bytes().ok_or_else(|| {
            CheckpointError::tensor("cannot read elements of a tensor on the meta device")
        })
    }

    /// Elements in row-major order, converted to `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let data = self.data()?;
        let size = self.dtype().element_size();
        Ok(self
            .element_indices()
            .into_iter()
            .map(|i| self.dtype().decode(&data[i * size..(i + 1) * size]))
            .collect())
    }

    /// Little-endian bytes of the view in row-major order.
    pub fn to_le_bytes(&self) -> Result<Vec<u8>> {
        let data = self.data()?;
        let size = self.dtype().element_size();
        let mut out = Vec::with_capacity(self.numel() * size);
        for i in self.element_indices() {
            out.extend_from_slice(&data[i * size..(i + 1) * size]);
        }
        Ok(out)
    }

    /// Copy into a fresh, densely packed storage unless already laid out that way.
    pub fn contiguous(&self) -> Result<Tensor> {
        if self.is_contiguous()
            && self.storage_offset == 0
            && self.storage.numel() == self.numel()
            && !self.is_meta()
        {
            return Ok(self.clone());
        }
        let bytes = self.to_le_bytes()?;
        let mut out = Tensor::from_storage(
            Storage::from_bytes(self.dtype(), bytes.into())?,
            0,
            self.shape.clone(),
            contiguous_stride(&self.shape),
            self.requires_grad,
        )?;
        out.parameter = self.parameter;
        out.subclass = self.subclass.clone();
        Ok(out)
    }

    /// Elementwise sum; the result takes `self`'s dtype.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(CheckpointError::tensor(format!(
                "shape mismatch in add: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        let lhs = self.to_f64_vec()?;
        let rhs = other.to_f64_vec()?;
        let values: Vec<f64> = lhs.iter().zip(&rhs).map(|(a, b)| a + b).collect();
        Tensor::from_values(self.dtype(), self.shape.clone(), &values)
    }

    pub fn sum(&self) -> Result<f64> {
        Ok(self.to_f64_vec()?.iter().sum())
    }

    /// Replace contents with `value`, detaching from any shared storage.
    pub fn fill(&mut self, value: f64) -> Result<()> {
        let values = vec![value; self.numel()];
        let filled = Tensor::from_values(self.dtype(), self.shape.clone(), &values)?;
        self.storage = filled.storage;
        self.storage_offset = 0;
        self.stride = filled.stride;
        Ok(())
    }

    /// Allocate zeroed CPU memory in place of meta storage, keeping every other attribute.
    pub fn to_empty(&mut self) {
        if !self.is_meta() {
            return;
        }
        let zeros = Tensor::zeros(self.dtype(), self.shape.clone());
        self.storage = zeros.storage;
        self.storage_offset = 0;
        self.stride = zeros.stride;
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.parameter { "Parameter" } else { "Tensor" };
        write!(
            f,
            "{kind}(size={:?}, dtype={}, device={}",
            self.shape,
            self.dtype(),
            self.device()
        )?;
        if self.requires_grad {
            f.write_str(", requires_grad=True")?;
        }
        if let Some(sub) = &self.subclass {
            write!(f, ", subclass={}", sub.class)?;
        }
        f.write_str(")")
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        if self.dtype() != other.dtype()
            || self.shape != other.shape
            || self.requires_grad != other.requires_grad
            || self.parameter != other.parameter
            || self.subclass != other.subclass
            || self.is_meta() != other.is_meta()
        {
            return false;
        }
        if self.is_meta() {
            return self.stride == other.stride && self.storage_offset == other.storage_offset;
        }
        match (self.to_f64_vec(), other.to_f64_vec()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}
