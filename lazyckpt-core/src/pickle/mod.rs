//! Generic object-graph (pickle) deserializer and serializer.
//!
//! The unpickler is a stack machine over the pickle opcode set. Anything that
//! needs outside knowledge is delegated to a [`Resolve`] implementation:
//! turning `module.name` globals into callables, and turning persistent ids
//! into values. Callers override those two hooks to change how a stream is
//! reconstructed without touching the machine itself.

mod opcodes;
mod pickler;
mod unpickler;

pub use pickler::{PendingStorage, Pickler};
pub use unpickler::{MAX_NESTING, Unpickler};

use crate::error::{CheckpointError, Result};
use crate::lazy::LazyTensor;
use crate::tensor::{Storage, Tensor};
use std::fmt;
use std::sync::Arc;

/// Fully qualified global name, e.g. `torch._utils._rebuild_tensor_v2`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    pub module: String,
    pub name: String,
}

impl Symbol {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    pub fn is(&self, module: &str, name: &str) -> bool {
        self.module == module && self.name == name
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

pub type NativeFn = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

/// A resolved global.
#[derive(Clone)]
pub enum Callable {
    /// A class the deserializer does not know; calling it records an [`Object`].
    Class(Symbol),
    /// A symbol bound to Rust code.
    Native { symbol: Symbol, func: NativeFn },
}

impl Callable {
    pub fn native(
        symbol: Symbol,
        func: impl Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Callable::Native {
            symbol,
            func: Arc::new(func),
        }
    }

    pub fn symbol(&self) -> &Symbol {
        match self {
            Callable::Class(symbol) | Callable::Native { symbol, .. } => symbol,
        }
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        match self {
            Callable::Class(symbol) => Ok(Value::Object(Object::new(symbol.clone(), args))),
            Callable::Native { func, .. } => func(args),
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Class(symbol) => write!(f, "Class({symbol})"),
            Callable::Native { symbol, .. } => write!(f, "Native({symbol})"),
        }
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Callable::Class(_), Callable::Class(_)) | (Callable::Native { .. }, Callable::Native { .. })
        ) && self.symbol() == other.symbol()
    }
}

/// An instance of a class the deserializer has no native binding for.
///
/// `list_items` and `dict_items` collect `APPEND`/`SETITEM` operations applied
/// to the instance, which is how list and dict subclasses are pickled.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Object {
    pub class: Symbol,
    pub args: Vec<Value>,
    pub state: Option<Box<Value>>,
    pub list_items: Vec<Value>,
    pub dict_items: Vec<(Value, Value)>,
}

impl Object {
    pub fn new(class: Symbol, args: Vec<Value>) -> Self {
        Self {
            class,
            args,
            ..Default::default()
        }
    }

    /// Every value held by the instance, in a stable order.
    pub fn children(&self) -> impl Iterator<Item = &Value> {
        self.args
            .iter()
            .chain(self.state.as_deref())
            .chain(self.list_items.iter())
            .chain(self.dict_items.iter().map(|(_, v)| v))
    }
}

/// A node of a deserialized object graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Insertion-ordered key/value pairs.
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Callable(Callable),
    Object(Object),
    Storage(Storage),
    Tensor(Tensor),
    Lazy(LazyTensor),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Dict built from string keys, preserving order.
    pub fn dict<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k.into()), v))
                .collect(),
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Callable(_) => "callable",
            Value::Object(_) => "object",
            Value::Storage(_) => "storage",
            Value::Tensor(_) => "Tensor",
            Value::Lazy(_) => "LazyTensor",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_lazy(&self) -> Option<&LazyTensor> {
        match self {
            Value::Lazy(t) => Some(t),
            _ => None,
        }
    }

    /// Items of a list or tuple.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a string key in a dict.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Follow a dotted path of dict keys. Keys that themselves contain dots
    /// (`layer.weight`) are matched before splitting further.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.get(path) {
            return Some(v);
        }
        path.match_indices('.')
            .find_map(|(i, _)| self.get(&path[..i])?.lookup(&path[i + 1..]))
    }

    /// Total bytes of real tensor memory reachable from this value.
    pub fn resident_bytes(&self) -> usize {
        match self {
            Value::Tensor(t) => t.resident_bytes(),
            Value::Storage(s) => s.resident_bytes(),
            Value::Lazy(t) => t.resident_bytes(),
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
                items.iter().map(Value::resident_bytes).sum()
            }
            Value::Dict(entries) => entries
                .iter()
                .map(|(k, v)| k.resident_bytes() + v.resident_bytes())
                .sum(),
            Value::Object(obj) => obj.children().map(Value::resident_bytes).sum(),
            _ => 0,
        }
    }

    /// Number of placeholder tensors reachable from this value.
    pub fn lazy_count(&self) -> usize {
        match self {
            Value::Lazy(_) => 1,
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
                items.iter().map(Value::lazy_count).sum()
            }
            Value::Dict(entries) => entries.iter().map(|(_, v)| v.lazy_count()).sum(),
            Value::Object(obj) => obj.children().map(Value::lazy_count).sum(),
            _ => 0,
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

impl From<LazyTensor> for Value {
    fn from(t: LazyTensor) -> Self {
        Value::Lazy(t)
    }
}

/// Hooks through which the unpickler reaches outside knowledge.
pub trait Resolve {
    /// Resolve a `GLOBAL`/`STACK_GLOBAL` reference.
    fn find_class(&mut self, module: &str, name: &str) -> Result<Value> {
        find_builtin(module, name, false)
    }

    /// Resolve a `PERSID`/`BINPERSID` reference.
    fn persistent_load(&mut self, pid: Value) -> Result<Value> {
        let _ = pid;
        Err(CheckpointError::structure(
            "A load persistent id instruction was encountered, but no persistent_load function was specified",
        ))
    }
}

/// Resolver with no persistent-id support, for plain pickle streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver {
    pub strict: bool,
}

impl Resolve for DefaultResolver {
    fn find_class(&mut self, module: &str, name: &str) -> Result<Value> {
        find_builtin(module, name, self.strict)
    }
}

/// Base symbol resolution shared by every resolver.
///
/// Builtin containers and `_codecs.encode` get native bindings. Anything else
/// becomes a [`Callable::Class`] whose calls produce [`Object`]s, unless
/// `strict` is set, in which case it is an error.
pub fn find_builtin(module: &str, name: &str, strict: bool) -> Result<Value> {
    let symbol = Symbol::new(module, name);
    let callable = match (module, name) {
        ("collections", "OrderedDict") | ("builtins", "dict") | ("__builtin__", "dict") => {
            Callable::native(symbol, build_dict)
        }
        ("builtins", "set") | ("builtins", "frozenset") | ("__builtin__", "set") => {
            Callable::native(symbol, |args| Ok(Value::Set(first_seq(args)?)))
        }
        ("builtins", "list") | ("__builtin__", "list") => {
            Callable::native(symbol, |args| Ok(Value::List(first_seq(args)?)))
        }
        ("builtins", "tuple") | ("__builtin__", "tuple") => {
            Callable::native(symbol, |args| Ok(Value::Tuple(first_seq(args)?)))
        }
        ("builtins", "bytearray") | ("builtins", "bytes") => {
            Callable::native(symbol, build_bytes)
        }
        ("_codecs", "encode") => Callable::native(symbol, build_bytes),
        _ if strict && !is_storage_class(module, name) => {
            return Err(CheckpointError::UnknownSymbol {
                module: module.to_string(),
                name: name.to_string(),
            });
        }
        _ => Callable::Class(symbol),
    };
    Ok(Value::Callable(callable))
}

fn is_storage_class(module: &str, name: &str) -> bool {
    (module == "torch" || module == "torch.storage") && name.ends_with("Storage")
}

fn first_seq(args: Vec<Value>) -> Result<Vec<Value>> {
    match args.into_iter().next() {
        None => Ok(Vec::new()),
        Some(Value::List(items)) | Some(Value::Tuple(items)) | Some(Value::Set(items)) => {
            Ok(items)
        }
        Some(other) => Err(CheckpointError::structure(format!(
            "expected a sequence argument, got {}",
            other.type_name()
        ))),
    }
}

fn build_dict(args: Vec<Value>) -> Result<Value> {
    match args.into_iter().next() {
        None => Ok(Value::Dict(Vec::new())),
        Some(Value::Dict(entries)) => Ok(Value::Dict(entries)),
        Some(Value::List(items)) | Some(Value::Tuple(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Tuple(mut pair) | Value::List(mut pair) if pair.len() == 2 => {
                    let v = pair.pop().unwrap_or(Value::None);
                    let k = pair.pop().unwrap_or(Value::None);
                    Ok((k, v))
                }
                other => Err(CheckpointError::structure(format!(
                    "dict items must be pairs, got {}",
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Dict),
        Some(other) => Err(CheckpointError::structure(format!(
            "cannot build a dict from {}",
            other.type_name()
        ))),
    }
}

/// `_codecs.encode(text, "latin1")` is how protocol 2 spells a bytes literal.
fn build_bytes(args: Vec<Value>) -> Result<Value> {
    let mut args = args.into_iter();
    match args.next() {
        None => Ok(Value::Bytes(Vec::new())),
        Some(Value::Bytes(b)) => Ok(Value::Bytes(b)),
        Some(Value::List(items)) => items
            .iter()
            .map(|v| {
                v.as_int()
                    .and_then(|i| u8::try_from(i).ok())
                    .ok_or_else(|| CheckpointError::structure("byte values must be 0..=255"))
            })
            .collect::<Result<Vec<u8>>>()
            .map(Value::Bytes),
        Some(Value::Str(text)) => {
            let encoding = args.next();
            match encoding.as_ref().and_then(Value::as_str) {
                None | Some("latin1") | Some("latin-1") => text
                    .chars()
                    .map(|c| {
                        u8::try_from(u32::from(c)).map_err(|_| {
                            CheckpointError::structure("character outside latin-1 range")
                        })
                    })
                    .collect::<Result<Vec<u8>>>()
                    .map(Value::Bytes),
                Some("utf-8") | Some("utf8") => Ok(Value::Bytes(text.into_bytes())),
                Some(other) => Err(CheckpointError::structure(format!(
                    "unsupported encoding {other}"
                ))),
            }
        }
        Some(other) => Err(CheckpointError::structure(format!(
            "cannot build bytes from {}",
            other.type_name()
        ))),
    }
}
