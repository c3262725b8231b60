//! Opt-in fallback for running tensor operations on placeholders.
//!
//! Every placeholder operand is materialized, in argument order, before the
//! operation runs on concrete tensors.

use super::LazyTensor;
use crate::error::{CheckpointError, Result};
use crate::pickle::Value;
use crate::tensor::Tensor;

/// Something an operation can take as a tensor argument.
pub trait TensorOperand {
    fn to_tensor(&self) -> Result<Tensor>;
}

impl TensorOperand for Tensor {
    fn to_tensor(&self) -> Result<Tensor> {
        Ok(self.clone())
    }
}

impl TensorOperand for LazyTensor {
    fn to_tensor(&self) -> Result<Tensor> {
        self.materialize()
    }
}

impl TensorOperand for Value {
    fn to_tensor(&self) -> Result<Tensor> {
        match self {
            Value::Tensor(t) => Ok(t.clone()),
            Value::Lazy(lazy) => lazy.materialize(),
            other => Err(CheckpointError::tensor(format!(
                "expected a tensor operand, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Materialize `args` and run `op` on them.
///
/// Mixed operands go through `&dyn TensorOperand`.
pub fn call<T, F, O>(args: &[&T], op: F) -> Result<O>
where
    T: TensorOperand + ?Sized,
    F: FnOnce(&[Tensor]) -> Result<O>,
{
    let loaded = args
        .iter()
        .map(|arg| arg.to_tensor())
        .collect::<Result<Vec<_>>>()?;
    op(&loaded)
}

/// Like [`call`] for graph values: placeholders are materialized, other values pass through.
pub fn call_values<F, O>(args: Vec<Value>, op: F) -> Result<O>
where
    F: FnOnce(Vec<Value>) -> Result<O>,
{
    let loaded = args
        .into_iter()
        .map(|arg| match arg {
            Value::Lazy(lazy) => lazy.materialize().map(Value::Tensor),
            other => Ok(other),
        })
        .collect::<Result<Vec<_>>>()?;
    op(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn test_concrete_operands_pass_through() {
        let a = Tensor::from_values(DType::F32, vec![2], &[1.0, 2.0]).unwrap();
        let b = Tensor::from_values(DType::F32, vec![2], &[3.0, 4.0]).unwrap();
        let out = call(&[&a, &b], |t| t[0].add(&t[1])).unwrap();
        assert_eq!(out.to_f64_vec().unwrap(), vec![4.0, 6.0]);
    }

    #[test]
    fn test_non_tensor_value_is_rejected() {
        let v = Value::Int(1);
        let err = call(&[&v], |t| Ok(t.len())).unwrap_err();
        assert!(matches!(err, CheckpointError::Tensor(_)));
    }

    #[test]
    fn test_call_values_keeps_plain_values() {
        let out = call_values(vec![Value::Int(2), Value::None], Ok).unwrap();
        assert_eq!(out, vec![Value::Int(2), Value::None]);
    }
}
