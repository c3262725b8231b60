//! Redirect table for the tensor reconstruction globals.

use super::placeholder::{LazyTensor, RebuildArgs, Transform};
use crate::archive::ArchiveReader;
use crate::error::{CheckpointError, Result};
use crate::pickle::{Callable, Symbol, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Whether storages are read during deserialization or deferred to placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Lazy,
    Eager,
}

type RebuildFn = fn(&Arc<ArchiveReader>, Vec<Value>) -> Result<Value>;

/// Rebuild functions keyed by the global they replace.
#[derive(Clone)]
pub struct RebuildRegistry {
    mode: LoadMode,
    entries: HashMap<Symbol, RebuildFn>,
}

impl RebuildRegistry {
    pub fn new(mode: LoadMode) -> Self {
        let tensor_v2: RebuildFn = match mode {
            LoadMode::Lazy => rebuild_tensor_v2_lazy,
            LoadMode::Eager => rebuild_tensor_v2_eager,
        };
        let mut entries: HashMap<Symbol, RebuildFn> = HashMap::new();
        entries.insert(Symbol::new("torch._utils", "_rebuild_tensor_v2"), tensor_v2);
        entries.insert(
            Symbol::new("torch._tensor", "_rebuild_from_type_v2"),
            rebuild_from_type_v2,
        );
        entries.insert(
            Symbol::new("torch._utils", "_rebuild_parameter"),
            rebuild_parameter,
        );
        Self { mode, entries }
    }

    pub fn lazy() -> Self {
        Self::new(LoadMode::Lazy)
    }

    pub fn eager() -> Self {
        Self::new(LoadMode::Eager)
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.entries.contains_key(&Symbol::new(module, name))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.entries.keys()
    }

    /// Callable for `module.name` bound to `archive`, if the symbol is redirected.
    pub fn bind(&self, module: &str, name: &str, archive: &Arc<ArchiveReader>) -> Option<Callable> {
        let symbol = Symbol::new(module, name);
        let func = *self.entries.get(&symbol)?;
        let archive = Arc::clone(archive);
        Some(Callable::native(symbol, move |args| func(&archive, args)))
    }
}

impl std::fmt::Debug for RebuildRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut symbols: Vec<String> = self.entries.keys().map(Symbol::to_string).collect();
        symbols.sort();
        f.debug_struct("RebuildRegistry")
            .field("mode", &self.mode)
            .field("symbols", &symbols)
            .finish()
    }
}

fn rebuild_tensor_v2_lazy(archive: &Arc<ArchiveReader>, args: Vec<Value>) -> Result<Value> {
    let (storage, rebuild) = RebuildArgs::parse(args)?;
    let Some(key) = storage.key().cloned() else {
        return Err(CheckpointError::structure(
            "storage passed to _rebuild_tensor_v2 has no persistent id",
        ));
    };
    if storage.bytes().is_some() {
        return rebuild.rebuild(storage).map(Value::Tensor);
    }
    let meta = rebuild.rebuild(storage)?;
    Ok(Value::Lazy(LazyTensor::new(
        meta,
        Arc::clone(archive),
        key,
        rebuild,
    )))
}

fn rebuild_tensor_v2_eager(_archive: &Arc<ArchiveReader>, args: Vec<Value>) -> Result<Value> {
    let (storage, rebuild) = RebuildArgs::parse(args)?;
    rebuild.rebuild(storage).map(Value::Tensor)
}

/// Defer `transform` onto a placeholder or apply it to a concrete tensor now.
fn defer_or_apply(target: Value, transform: Transform, op: &str) -> Result<Value> {
    match target {
        Value::Lazy(lazy) => Ok(Value::Lazy(lazy.chain(transform))),
        Value::Tensor(t) => Ok(Value::Tensor(transform.apply(t))),
        other => Err(CheckpointError::structure(format!(
            "{op} expected a tensor, got {}",
            other.type_name()
        ))),
    }
}

/// `_rebuild_from_type_v2(func, new_type, args, state)`.
fn rebuild_from_type_v2(_archive: &Arc<ArchiveReader>, args: Vec<Value>) -> Result<Value> {
    let [func, new_type, func_args, state]: [Value; 4] = args.try_into().map_err(|a: Vec<Value>| {
        CheckpointError::structure(format!(
            "_rebuild_from_type_v2 takes 4 arguments, got {}",
            a.len()
        ))
    })?;
    let Value::Callable(func) = func else {
        return Err(CheckpointError::structure(format!(
            "_rebuild_from_type_v2 expected a callable, got {}",
            func.type_name()
        )));
    };
    let Value::Callable(class) = new_type else {
        return Err(CheckpointError::structure(format!(
            "_rebuild_from_type_v2 expected a type, got {}",
            new_type.type_name()
        )));
    };
    let func_args = match func_args {
        Value::Tuple(items) | Value::List(items) => items,
        other => vec![other],
    };
    let target = func.call(func_args)?;
    let transform = Transform::FromType {
        class: class.symbol().clone(),
        state,
    };
    defer_or_apply(target, transform, "_rebuild_from_type_v2")
}

/// `_rebuild_parameter(data, requires_grad, backward_hooks)`.
fn rebuild_parameter(_archive: &Arc<ArchiveReader>, args: Vec<Value>) -> Result<Value> {
    let [data, requires_grad, backward_hooks]: [Value; 3] = args.try_into().map_err(|a: Vec<Value>| {
        CheckpointError::structure(format!(
            "_rebuild_parameter takes 3 arguments, got {}",
            a.len()
        ))
    })?;
    let transform = Transform::Parameter {
        requires_grad: requires_grad.as_bool().unwrap_or(true),
        backward_hooks,
    };
    defer_or_apply(data, transform, "_rebuild_parameter")
}
