//! Protocol 2 serializer producing the object graph `torch.save` writes.
//!
//! Tensors are emitted as calls to the standard rebuild functions and their
//! storages as persistent ids; the storage bytes themselves are collected and
//! handed back to the caller for the archive's `data/` records.

use super::opcodes::*;
use super::{Callable, Symbol, Value};
use crate::error::{CheckpointError, Result};
use crate::lazy::dispatch;
use crate::tensor::{Storage, Tensor};
use std::collections::HashMap;
use std::io::Write;

const PROTOCOL: u8 = 2;

/// Storage bytes referenced by a dumped graph, keyed by record name under `data/`.
#[derive(Debug, Clone)]
pub struct PendingStorage {
    pub key: String,
    pub bytes: Vec<u8>,
}

pub struct Pickler<W> {
    out: W,
    storages: Vec<PendingStorage>,
    keys: HashMap<*const u8, String>,
    // keeps buffer addresses unique while `keys` refers to them
    retained: Vec<Storage>,
}

impl<W: Write> Pickler<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            storages: Vec::new(),
            keys: HashMap::new(),
            retained: Vec::new(),
        }
    }

    /// Write one complete pickle (`PROTO 2` ... `STOP`).
    pub fn dump(&mut self, value: &Value) -> Result<()> {
        self.out.write_all(&[PROTO, PROTOCOL])?;
        self.value(value)?;
        self.out.write_all(&[STOP])?;
        Ok(())
    }

    /// The writer plus the storages collected by [`Pickler::dump`], in
    /// first-reference order.
    pub fn into_parts(self) -> (W, Vec<PendingStorage>) {
        (self.out, self.storages)
    }

    fn op(&mut self, op: u8) -> Result<()> {
        self.out.write_all(&[op])?;
        Ok(())
    }

    fn value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::None => self.op(NONE),
            Value::Bool(true) => self.op(NEWTRUE),
            Value::Bool(false) => self.op(NEWFALSE),
            Value::Int(i) => self.int(*i),
            Value::Float(f) => {
                self.op(BINFLOAT)?;
                self.out.write_all(&f.to_be_bytes())?;
                Ok(())
            }
            Value::Str(s) => self.string(s),
            Value::Bytes(b) => {
                // protocol 2 has no bytes opcode
                self.global(&Symbol::new("_codecs", "encode"))?;
                let text: String = b.iter().map(|c| char::from(*c)).collect();
                self.string(&text)?;
                self.string("latin1")?;
                self.op(TUPLE2)?;
                self.op(REDUCE)
            }
            Value::List(items) => {
                self.op(EMPTY_LIST)?;
                self.appends(items)
            }
            Value::Tuple(items) => self.tuple(items),
            Value::Dict(entries) => {
                self.op(EMPTY_DICT)?;
                self.setitems(entries)
            }
            Value::Set(items) => {
                self.global(&Symbol::new("builtins", "set"))?;
                self.op(EMPTY_LIST)?;
                self.appends(items)?;
                self.op(TUPLE1)?;
                self.op(REDUCE)
            }
            Value::Callable(c) => self.global(c.symbol()),
            Value::Object(obj) => {
                self.global(&obj.class)?;
                self.tuple(&obj.args)?;
                self.op(REDUCE)?;
                self.appends(&obj.list_items)?;
                self.setitems(&obj.dict_items)?;
                if let Some(state) = &obj.state {
                    self.value(state)?;
                    self.op(BUILD)?;
                }
                Ok(())
            }
            Value::Storage(storage) => self.persistent_id(storage),
            Value::Tensor(t) => self.tensor(t),
            Value::Lazy(lazy) => dispatch::call(&[lazy], |t| self.tensor(&t[0])),
        }
    }

    fn int(&mut self, i: i64) -> Result<()> {
        if (0..=0xff).contains(&i) {
            self.out.write_all(&[BININT1, i as u8])?;
        } else if (0..=0xffff).contains(&i) {
            self.op(BININT2)?;
            self.out.write_all(&(i as u16).to_le_bytes())?;
        } else if let Ok(small) = i32::try_from(i) {
            self.op(BININT)?;
            self.out.write_all(&small.to_le_bytes())?;
        } else {
            let mut bytes = i.to_le_bytes().to_vec();
            // drop redundant sign bytes
            while bytes.len() > 1 {
                let last = bytes[bytes.len() - 1];
                let prev_sign = bytes[bytes.len() - 2] & 0x80;
                if (last == 0x00 && prev_sign == 0) || (last == 0xff && prev_sign != 0) {
                    bytes.pop();
                } else {
                    break;
                }
            }
            self.out.write_all(&[LONG1, bytes.len() as u8])?;
            self.out.write_all(&bytes)?;
        }
        Ok(())
    }

    fn string(&mut self, s: &str) -> Result<()> {
        self.op(BINUNICODE)?;
        self.out.write_all(&(s.len() as u32).to_le_bytes())?;
        self.out.write_all(s.as_bytes())?;
        Ok(())
    }

    fn global(&mut self, symbol: &Symbol) -> Result<()> {
        self.op(GLOBAL)?;
        write!(self.out, "{}\n{}\n", symbol.module, symbol.name)?;
        Ok(())
    }

    fn tuple(&mut self, items: &[Value]) -> Result<()> {
        match items.len() {
            0 => self.op(EMPTY_TUPLE),
            1..=3 => {
                for item in items {
                    self.value(item)?;
                }
                self.op(TUPLE1 + items.len() as u8 - 1)
            }
            _ => {
                self.op(MARK)?;
                for item in items {
                    self.value(item)?;
                }
                self.op(TUPLE)
            }
        }
    }

    fn appends(&mut self, items: &[Value]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.op(MARK)?;
        for item in items {
            self.value(item)?;
        }
        self.op(APPENDS)
    }

    fn setitems(&mut self, entries: &[(Value, Value)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.op(MARK)?;
        for (k, v) in entries {
            self.value(k)?;
            self.value(v)?;
        }
        self.op(SETITEMS)
    }

    fn ordered_dict(&mut self) -> Result<()> {
        self.global(&Symbol::new("collections", "OrderedDict"))?;
        self.op(EMPTY_TUPLE)?;
        self.op(REDUCE)
    }

    /// `("storage", torch.<Class>, key, "cpu", numel)` as a `BINPERSID`.
    fn persistent_id(&mut self, storage: &Storage) -> Result<()> {
        let (ptr, bytes) = match (storage.buffer_ptr(), storage.bytes()) {
            (Some(ptr), Some(bytes)) => (ptr, bytes),
            _ => {
                return Err(CheckpointError::tensor(
                    "cannot save a storage on the meta device",
                ));
            }
        };
        let key = match self.keys.get(&ptr) {
            Some(key) => key.clone(),
            None => {
                let key = self.storages.len().to_string();
                self.keys.insert(ptr, key.clone());
                self.retained.push(storage.clone());
                self.storages.push(PendingStorage {
                    key: key.clone(),
                    bytes: bytes.to_vec(),
                });
                key
            }
        };
        self.op(MARK)?;
        self.string("storage")?;
        self.global(&Symbol::new("torch", storage.dtype().storage_class()))?;
        self.string(&key)?;
        self.string("cpu")?;
        self.int(storage.numel() as i64)?;
        self.op(TUPLE)?;
        self.op(BINPERSID)
    }

    /// Arguments of `_rebuild_tensor_v2` for the view `t`.
    fn rebuild_args(&mut self, t: &Tensor, requires_grad: bool) -> Result<()> {
        self.op(MARK)?;
        self.persistent_id(t.storage())?;
        self.int(t.storage_offset() as i64)?;
        let size: Vec<Value> = t.shape().iter().map(|d| Value::Int(*d as i64)).collect();
        self.tuple(&size)?;
        let stride: Vec<Value> = t.stride().iter().map(|s| Value::Int(*s as i64)).collect();
        self.tuple(&stride)?;
        self.value(&Value::Bool(requires_grad))?;
        self.ordered_dict()?;
        self.op(TUPLE)
    }

    fn tensor(&mut self, t: &Tensor) -> Result<()> {
        if t.is_parameter() {
            self.global(&Symbol::new("torch._utils", "_rebuild_parameter"))?;
            self.op(MARK)?;
            self.typed_tensor(t, false)?;
            self.value(&Value::Bool(t.requires_grad()))?;
            self.ordered_dict()?;
            self.op(TUPLE)?;
            return self.op(REDUCE);
        }
        self.typed_tensor(t, t.requires_grad())
    }

    fn typed_tensor(&mut self, t: &Tensor, requires_grad: bool) -> Result<()> {
        let rebuild = Symbol::new("torch._utils", "_rebuild_tensor_v2");
        match t.subclass() {
            None => {
                self.global(&rebuild)?;
                self.rebuild_args(t, requires_grad)?;
                self.op(REDUCE)
            }
            Some(sub) => {
                self.global(&Symbol::new("torch._tensor", "_rebuild_from_type_v2"))?;
                self.op(MARK)?;
                self.value(&Value::Callable(Callable::Class(rebuild)))?;
                self.global(&sub.class)?;
                self.rebuild_args(t, requires_grad)?;
                self.value(&sub.state)?;
                self.op(TUPLE)?;
                self.op(REDUCE)
            }
        }
    }
}
