//! Pickle stack machine.

use super::opcodes::*;
use super::{Resolve, Value};
use crate::error::{CheckpointError, Result};
use std::collections::HashMap;
use std::io::{BufRead, ErrorKind, Read};

/// Deepest container nesting a stream may build.
///
/// Values are traversed recursively once loaded, so depth is bounded here
/// instead of at every traversal.
pub const MAX_NESTING: usize = 512;

/// A stack entry. Memoized values live in the memo and are referenced by id
/// so that items added after memoization stay visible to later `GET`s.
/// Values carry their container nesting depth.
enum Slot {
    Value(Value, usize),
    Memo(u32),
}

/// Replays a pickle stream into a [`Value`] tree.
pub struct Unpickler<R, H> {
    reader: R,
    resolver: H,
    position: u64,
    stack: Vec<Slot>,
    metastack: Vec<Vec<Slot>>,
    memo: HashMap<u32, (Value, usize)>,
}

impl<R: BufRead, H: Resolve> Unpickler<R, H> {
    pub fn new(reader: R, resolver: H) -> Self {
        Self {
            reader,
            resolver,
            position: 0,
            stack: Vec::new(),
            metastack: Vec::new(),
            memo: HashMap::new(),
        }
    }

    pub fn resolver(&self) -> &H {
        &self.resolver
    }

    pub fn into_resolver(self) -> H {
        self.resolver
    }

    /// Run the machine until `STOP` and return the top of the stack.
    pub fn load(&mut self) -> Result<Value> {
        loop {
            let op = self.read_u8()?;
            match op {
                PROTO => {
                    let proto = self.read_u8()?;
                    if proto > HIGHEST_PROTOCOL {
                        return Err(self.error(format!("unsupported pickle protocol: {proto}")));
                    }
                }
                FRAME => {
                    self.read_bytes(8)?;
                }
                STOP => return self.pop(),
                MARK => {
                    let stack = std::mem::take(&mut self.stack);
                    self.metastack.push(stack);
                }
                POP => {
                    if self.stack.pop().is_none() {
                        self.pop_mark()?;
                    }
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                DUP => {
                    let slot = match self.stack.last() {
                        Some(Slot::Memo(id)) => Slot::Memo(*id),
                        Some(Slot::Value(v, depth)) => Slot::Value(v.clone(), *depth),
                        None => return Err(self.error("DUP on empty stack")),
                    };
                    self.stack.push(slot);
                }

                NONE => self.push(Value::None),
                NEWTRUE => self.push(Value::Bool(true)),
                NEWFALSE => self.push(Value::Bool(false)),
                INT => {
                    let line = self.read_line()?;
                    let value = match line.as_str() {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        text => Value::Int(self.parse_int(text)?),
                    };
                    self.push(value);
                }
                LONG => {
                    let line = self.read_line()?;
                    let value = self.parse_int(line.trim_end_matches('L'))?;
                    self.push(Value::Int(value));
                }
                BININT => {
                    let b = self.read_array::<4>()?;
                    self.push(Value::Int(i32::from_le_bytes(b) as i64));
                }
                BININT1 => {
                    let b = self.read_u8()?;
                    self.push(Value::Int(b as i64));
                }
                BININT2 => {
                    let b = self.read_array::<2>()?;
                    self.push(Value::Int(u16::from_le_bytes(b) as i64));
                }
                LONG1 => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    let value = self.decode_long(&bytes)?;
                    self.push(Value::Int(value));
                }
                LONG4 => {
                    let n = i32::from_le_bytes(self.read_array::<4>()?);
                    if n < 0 {
                        return Err(self.error("LONG pickle has negative byte count"));
                    }
                    let bytes = self.read_bytes(n as usize)?;
                    let value = self.decode_long(&bytes)?;
                    self.push(Value::Int(value));
                }
                FLOAT => {
                    let line = self.read_line()?;
                    let value = line
                        .parse::<f64>()
                        .map_err(|e| self.error(format!("invalid float {line:?}: {e}")))?;
                    self.push(Value::Float(value));
                }
                BINFLOAT => {
                    let b = self.read_array::<8>()?;
                    self.push(Value::Float(f64::from_be_bytes(b)));
                }

                STRING => {
                    let line = self.read_line()?;
                    let text = self.unquote(&line)?;
                    self.push(Value::Str(text));
                }
                BINSTRING => {
                    let n = i32::from_le_bytes(self.read_array::<4>()?);
                    if n < 0 {
                        return Err(self.error("BINSTRING pickle has negative byte count"));
                    }
                    let bytes = self.read_bytes(n as usize)?;
                    self.push(Value::Str(latin1(&bytes)));
                }
                SHORT_BINSTRING => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.push(Value::Str(latin1(&bytes)));
                }
                UNICODE => {
                    let line = self.read_line()?;
                    let text = self.unescape_unicode(&line)?;
                    self.push(Value::Str(text));
                }
                BINUNICODE => {
                    let n = u32::from_le_bytes(self.read_array::<4>()?) as usize;
                    let text = self.read_utf8(n)?;
                    self.push(Value::Str(text));
                }
                SHORT_BINUNICODE => {
                    let n = self.read_u8()? as usize;
                    let text = self.read_utf8(n)?;
                    self.push(Value::Str(text));
                }
                BINUNICODE8 => {
                    let n = self.read_len8()?;
                    let text = self.read_utf8(n)?;
                    self.push(Value::Str(text));
                }
                BINBYTES => {
                    let n = u32::from_le_bytes(self.read_array::<4>()?) as usize;
                    let bytes = self.read_bytes(n)?;
                    self.push(Value::Bytes(bytes));
                }
                SHORT_BINBYTES => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    self.push(Value::Bytes(bytes));
                }
                BINBYTES8 | BYTEARRAY8 => {
                    let n = self.read_len8()?;
                    let bytes = self.read_bytes(n)?;
                    self.push(Value::Bytes(bytes));
                }

                EMPTY_LIST => self.push(Value::List(Vec::new())),
                EMPTY_TUPLE => self.push(Value::Tuple(Vec::new())),
                EMPTY_DICT => self.push(Value::Dict(Vec::new())),
                EMPTY_SET => self.push(Value::Set(Vec::new())),
                LIST => {
                    let (items, depth) = self.pop_mark()?;
                    self.push_nested(Value::List(items), depth)?;
                }
                TUPLE => {
                    let (items, depth) = self.pop_mark()?;
                    self.push_nested(Value::Tuple(items), depth)?;
                }
                TUPLE1 | TUPLE2 | TUPLE3 => {
                    let n = (op - TUPLE1 + 1) as usize;
                    let mut items = Vec::with_capacity(n);
                    let mut depth = 0;
                    for _ in 0..n {
                        let (item, d) = self.pop_nested()?;
                        items.push(item);
                        depth = depth.max(d);
                    }
                    items.reverse();
                    self.push_nested(Value::Tuple(items), depth)?;
                }
                DICT => {
                    let (items, depth) = self.pop_mark()?;
                    let pairs = self.pairs(items)?;
                    self.push_nested(Value::Dict(pairs), depth)?;
                }
                FROZENSET => {
                    let (items, depth) = self.pop_mark()?;
                    self.push_nested(Value::Set(items), depth)?;
                }
                APPEND => {
                    let (item, depth) = self.pop_nested()?;
                    self.extend_list(vec![item], depth)?;
                }
                APPENDS => {
                    let (items, depth) = self.pop_mark()?;
                    self.extend_list(items, depth)?;
                }
                SETITEM => {
                    let (value, value_depth) = self.pop_nested()?;
                    let (key, key_depth) = self.pop_nested()?;
                    self.extend_dict(vec![(key, value)], key_depth.max(value_depth))?;
                }
                SETITEMS => {
                    let (items, depth) = self.pop_mark()?;
                    let pairs = self.pairs(items)?;
                    self.extend_dict(pairs, depth)?;
                }
                ADDITEMS => {
                    let (items, depth) = self.pop_mark()?;
                    let position = self.position;
                    match self.top_mut()? {
                        (Value::Set(set), top_depth) => {
                            set.extend(items);
                            deepen(top_depth, depth, position)?;
                        }
                        (other, _) => {
                            let kind = other.type_name();
                            return Err(self.error(format!("ADDITEMS on {kind}")));
                        }
                    }
                }

                GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    let value = self.resolver.find_class(&module, &name)?;
                    self.push(value);
                }
                STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    let (Value::Str(module), Value::Str(name)) = (module, name) else {
                        return Err(self.error("STACK_GLOBAL requires str"));
                    };
                    let value = self.resolver.find_class(&module, &name)?;
                    self.push(value);
                }
                REDUCE => {
                    let (args, depth) = self.pop_nested()?;
                    let callable = self.pop()?;
                    let value = self.call(callable, args)?;
                    self.push_nested(value, depth)?;
                }
                NEWOBJ => {
                    let (args, depth) = self.pop_nested()?;
                    let class = self.pop()?;
                    let value = self.call(class, args)?;
                    self.push_nested(value, depth)?;
                }
                NEWOBJ_EX => {
                    let (kwargs, kwargs_depth) = self.pop_nested()?;
                    let (args, args_depth) = self.pop_nested()?;
                    let class = self.pop()?;
                    let mut value = self.call(class, args)?;
                    if let (Value::Object(obj), Value::Dict(entries)) = (&mut value, kwargs) {
                        obj.dict_items.extend(entries);
                    }
                    self.push_nested(value, args_depth.max(kwargs_depth))?;
                }
                OBJ => {
                    let (mut items, depth) = self.pop_mark()?;
                    if items.is_empty() {
                        return Err(self.error("OBJ without a class"));
                    }
                    let class = items.remove(0);
                    let value = self.call(class, Value::Tuple(items))?;
                    self.push_nested(value, depth)?;
                }
                BUILD => {
                    let (state, depth) = self.pop_nested()?;
                    self.build(state, depth)?;
                }
                PERSID => {
                    let pid = self.read_line()?;
                    let value = self.resolver.persistent_load(Value::Str(pid))?;
                    self.push(value);
                }
                BINPERSID => {
                    let pid = self.pop()?;
                    let value = self.resolver.persistent_load(pid)?;
                    self.push(value);
                }

                PUT => {
                    let line = self.read_line()?;
                    let id = self.parse_memo_id(&line)?;
                    self.memoize(id)?;
                }
                BINPUT => {
                    let id = self.read_u8()? as u32;
                    self.memoize(id)?;
                }
                LONG_BINPUT => {
                    let id = u32::from_le_bytes(self.read_array::<4>()?);
                    self.memoize(id)?;
                }
                MEMOIZE => {
                    let id = self.memo.len() as u32;
                    self.memoize(id)?;
                }
                GET => {
                    let line = self.read_line()?;
                    let id = self.parse_memo_id(&line)?;
                    self.get(id)?;
                }
                BINGET => {
                    let id = self.read_u8()? as u32;
                    self.get(id)?;
                }
                LONG_BINGET => {
                    let id = u32::from_le_bytes(self.read_array::<4>()?);
                    self.get(id)?;
                }

                other => {
                    self.position -= 1;
                    return Err(self.error(format!("invalid load key, '\\x{other:02x}'")));
                }
            }
        }
    }

    fn error(&self, msg: impl Into<String>) -> CheckpointError {
        CheckpointError::format(self.position, msg)
    }

    // --- input ---

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let read = (&mut self.reader).take(n as u64).read_to_end(&mut buf)?;
        self.position += read as u64;
        if read < n {
            return Err(self.error("pickle data was truncated"));
        }
        Ok(buf)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {
                self.position += N as u64;
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(self.error("pickle data was truncated"))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_len8(&mut self) -> Result<usize> {
        let n = u64::from_le_bytes(self.read_array::<8>()?);
        usize::try_from(n).map_err(|_| self.error(format!("length {n} exceeds address space")))
    }

    fn read_utf8(&mut self, n: usize) -> Result<String> {
        let bytes = self.read_bytes(n)?;
        String::from_utf8(bytes).map_err(|e| self.error(format!("invalid utf-8 string: {e}")))
    }

    /// Read up to and excluding the next `\n`.
    fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let read = self.reader.read_until(b'\n', &mut buf)?;
        self.position += read as u64;
        if buf.last() != Some(&b'\n') {
            return Err(self.error("pickle data was truncated"));
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|e| self.error(format!("invalid text argument: {e}")))
    }

    fn parse_int(&self, text: &str) -> Result<i64> {
        text.trim()
            .parse::<i64>()
            .map_err(|e| self.error(format!("invalid integer {text:?}: {e}")))
    }

    fn parse_memo_id(&self, text: &str) -> Result<u32> {
        text.trim()
            .parse::<u32>()
            .map_err(|e| self.error(format!("invalid memo key {text:?}: {e}")))
    }

    /// Little-endian two's complement integer of arbitrary width.
    fn decode_long(&self, bytes: &[u8]) -> Result<i64> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let negative = bytes[bytes.len() - 1] & 0x80 != 0;
        let fill = if negative { 0xff } else { 0x00 };
        if bytes.len() > 8 {
            let (low, high) = bytes.split_at(8);
            let sign_ok = (low[7] & 0x80 != 0) == negative;
            if !sign_ok || high.iter().any(|b| *b != fill) {
                return Err(self.error("integer does not fit in 64 bits"));
            }
        }
        let mut buf = [fill; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(i64::from_le_bytes(buf))
    }

    fn unquote(&self, line: &str) -> Result<String> {
        let quoted = line.len() >= 2
            && ((line.starts_with('\'') && line.ends_with('\''))
                || (line.starts_with('"') && line.ends_with('"')));
        if !quoted {
            return Err(self.error("the STRING opcode argument must be quoted"));
        }
        let inner = &line[1..line.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('x') => {
                    let hex: String = chars.by_ref().take(2).collect();
                    let code = u8::from_str_radix(&hex, 16)
                        .map_err(|_| self.error(format!("invalid \\x escape {hex:?}")))?;
                    out.push(char::from(code));
                }
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        }
        Ok(out)
    }

    /// `raw-unicode-escape`: only `\uXXXX` and `\UXXXXXXXX` are escapes.
    fn unescape_unicode(&self, line: &str) -> Result<String> {
        let mut out = String::with_capacity(line.len());
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            let width = match (c, chars.peek()) {
                ('\\', Some('u')) => 4,
                ('\\', Some('U')) => 8,
                _ => {
                    out.push(c);
                    continue;
                }
            };
            chars.next();
            let hex: String = chars.by_ref().take(width).collect();
            let ch = u32::from_str_radix(&hex, 16)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| self.error(format!("invalid unicode escape {hex:?}")))?;
            out.push(ch);
        }
        Ok(out)
    }

    // --- stack ---

    /// Push a value that contains nothing nested.
    fn push(&mut self, value: Value) {
        self.stack.push(Slot::Value(value, 0));
    }

    /// Push a container whose deepest item is `inner` levels deep.
    fn push_nested(&mut self, value: Value, inner: usize) -> Result<()> {
        let mut depth = 0;
        deepen(&mut depth, inner, self.position)?;
        self.stack.push(Slot::Value(value, depth));
        Ok(())
    }

    fn resolve(&self, slot: Slot) -> Result<(Value, usize)> {
        match slot {
            Slot::Value(v, depth) => Ok((v, depth)),
            Slot::Memo(id) => self
                .memo
                .get(&id)
                .cloned()
                .ok_or_else(|| self.error(format!("memo value not found at index {id}"))),
        }
    }

    fn pop(&mut self) -> Result<Value> {
        self.pop_nested().map(|(value, _)| value)
    }

    fn pop_nested(&mut self) -> Result<(Value, usize)> {
        match self.stack.pop() {
            Some(slot) => self.resolve(slot),
            None => Err(self.error("unpickling stack underflow")),
        }
    }

    /// Items pushed since the last `MARK`, with the deepest item's depth.
    fn pop_mark(&mut self) -> Result<(Vec<Value>, usize)> {
        let outer = self
            .metastack
            .pop()
            .ok_or_else(|| self.error("could not find MARK"))?;
        let slots = std::mem::replace(&mut self.stack, outer);
        let mut items = Vec::with_capacity(slots.len());
        let mut depth = 0;
        for slot in slots {
            let (item, d) = self.resolve(slot)?;
            items.push(item);
            depth = depth.max(d);
        }
        Ok((items, depth))
    }

    fn top_mut(&mut self) -> Result<(&mut Value, &mut usize)> {
        let position = self.position;
        match self.stack.last_mut() {
            Some(Slot::Value(v, depth)) => Ok((v, depth)),
            Some(Slot::Memo(id)) => {
                let id = *id;
                self.memo
                    .get_mut(&id)
                    .map(|(v, depth)| (v, depth))
                    .ok_or_else(|| {
                        CheckpointError::format(position, format!("memo value not found at index {id}"))
                    })
            }
            None => Err(CheckpointError::format(position, "unpickling stack underflow")),
        }
    }

    fn memoize(&mut self, id: u32) -> Result<()> {
        let slot = self
            .stack
            .pop()
            .ok_or_else(|| self.error("memoize on empty stack"))?;
        let value = self.resolve(slot)?;
        self.memo.insert(id, value);
        self.stack.push(Slot::Memo(id));
        Ok(())
    }

    fn get(&mut self, id: u32) -> Result<()> {
        if !self.memo.contains_key(&id) {
            return Err(self.error(format!("memo value not found at index {id}")));
        }
        self.stack.push(Slot::Memo(id));
        Ok(())
    }

    fn pairs(&self, items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
        if items.len() % 2 != 0 {
            return Err(self.error("odd number of items for a dict"));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut it = items.into_iter();
        while let (Some(k), Some(v)) = (it.next(), it.next()) {
            pairs.push((k, v));
        }
        Ok(pairs)
    }

    fn extend_list(&mut self, items: Vec<Value>, inner: usize) -> Result<()> {
        let position = self.position;
        let (top, depth) = self.top_mut()?;
        match top {
            Value::List(list) => list.extend(items),
            Value::Object(obj) => obj.list_items.extend(items),
            other => {
                let kind = other.type_name();
                return Err(self.error(format!("cannot append to {kind}")));
            }
        }
        deepen(depth, inner, position)
    }

    fn extend_dict(&mut self, pairs: Vec<(Value, Value)>, inner: usize) -> Result<()> {
        let position = self.position;
        let (top, depth) = self.top_mut()?;
        match top {
            Value::Dict(entries) => {
                for (k, v) in pairs {
                    dict_insert(entries, k, v);
                }
            }
            Value::Object(obj) => {
                for (k, v) in pairs {
                    dict_insert(&mut obj.dict_items, k, v);
                }
            }
            other => {
                let kind = other.type_name();
                return Err(self.error(format!("cannot set items on {kind}")));
            }
        }
        deepen(depth, inner, position)
    }

    fn build(&mut self, state: Value, inner: usize) -> Result<()> {
        let position = self.position;
        let (top, depth) = self.top_mut()?;
        match (top, state) {
            (Value::Object(obj), state) => obj.state = Some(Box::new(state)),
            (Value::Dict(entries), Value::Dict(update)) => {
                for (k, v) in update {
                    dict_insert(entries, k, v);
                }
            }
            (target, _) => {
                let kind = target.type_name();
                return Err(self.error(format!("cannot apply BUILD state to {kind}")));
            }
        }
        deepen(depth, inner, position)
    }

    fn call(&mut self, callable: Value, args: Value) -> Result<Value> {
        let args = match args {
            Value::Tuple(items) => items,
            other => {
                return Err(self.error(format!(
                    "call arguments must be a tuple, got {}",
                    other.type_name()
                )));
            }
        };
        match callable {
            Value::Callable(c) => c.call(args),
            other => Err(self.error(format!("{} object is not callable", other.type_name()))),
        }
    }
}

/// Record that a container now holds something `inner` levels deep.
fn deepen(depth: &mut usize, inner: usize, position: u64) -> Result<()> {
    let needed = inner + 1;
    if needed > MAX_NESTING {
        return Err(CheckpointError::format(
            position,
            format!("containers nested deeper than {MAX_NESTING} levels"),
        ));
    }
    *depth = (*depth).max(needed);
    Ok(())
}

fn dict_insert(entries: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    match entries.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => entries.push((key, value)),
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|b| char::from(*b)).collect()
}
