//! Element types and their storage-class names.

use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
    }

    /// Map a storage class name (`FloatStorage`, `BFloat16Storage`, ...) to its dtype.
    ///
    /// `UntypedStorage` is byte-addressed and maps to `U8`.
    pub fn from_storage_class(name: &str) -> Option<Self> {
        let dtype = match name {
            "DoubleStorage" => DType::F64,
            "FloatStorage" => DType::F32,
            "HalfStorage" => DType::F16,
            "BFloat16Storage" => DType::BF16,
            "LongStorage" => DType::I64,
            "IntStorage" => DType::I32,
            "ShortStorage" => DType::I16,
            "CharStorage" => DType::I8,
            "ByteStorage" | "UntypedStorage" => DType::U8,
            "BoolStorage" => DType::Bool,
            _ => return None,
        };
        Some(dtype)
    }

    /// Storage class name written into persistent ids.
    pub fn storage_class(self) -> &'static str {
        match self {
            DType::F64 => "DoubleStorage",
            DType::F32 => "FloatStorage",
            DType::F16 => "HalfStorage",
            DType::BF16 => "BFloat16Storage",
            DType::I64 => "LongStorage",
            DType::I32 => "IntStorage",
            DType::I16 => "ShortStorage",
            DType::I8 => "CharStorage",
            DType::U8 => "ByteStorage",
            DType::Bool => "BoolStorage",
        }
    }

    /// Decode one little-endian element. `bytes` must be exactly `element_size()` long.
    pub fn decode(self, bytes: &[u8]) -> f64 {
        match self {
            DType::F64 => f64::from_le_bytes(le_array(bytes)),
            DType::F32 => f32::from_le_bytes(le_array(bytes)) as f64,
            DType::F16 => f16::from_le_bytes(le_array(bytes)).to_f64(),
            DType::BF16 => bf16::from_le_bytes(le_array(bytes)).to_f64(),
            DType::I64 => i64::from_le_bytes(le_array(bytes)) as f64,
            DType::I32 => i32::from_le_bytes(le_array(bytes)) as f64,
            DType::I16 => i16::from_le_bytes(le_array(bytes)) as f64,
            DType::I8 => bytes[0] as i8 as f64,
            DType::U8 => bytes[0] as f64,
            DType::Bool => {
                if bytes[0] != 0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Encode one element as little-endian bytes, appending to `out`.
    pub fn encode(self, value: f64, out: &mut Vec<u8>) {
        match self {
            DType::F64 => out.extend_from_slice(&value.to_le_bytes()),
            DType::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            DType::F16 => out.extend_from_slice(&f16::from_f64(value).to_le_bytes()),
            DType::BF16 => out.extend_from_slice(&bf16::from_f64(value).to_le_bytes()),
            DType::I64 => out.extend_from_slice(&(value as i64).to_le_bytes()),
            DType::I32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            DType::I16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            DType::I8 => out.push(value as i8 as u8),
            DType::U8 => out.push(value as u8),
            DType::Bool => out.push(u8::from(value != 0.0)),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F64 => "float64",
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::I64 => "int64",
            DType::I32 => "int32",
            DType::I16 => "int16",
            DType::I8 => "int8",
            DType::U8 => "uint8",
            DType::Bool => "bool",
        };
        write!(f, "torch.{name}")
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[..N]);
    buf
}

/// Byte order recorded in an archive's `byteorder` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    /// Convert raw storage bytes into little-endian element order in place.
    pub fn to_little_endian(self, bytes: &mut [u8], element_size: usize) {
        if self == ByteOrder::Little || element_size <= 1 {
            return;
        }
        for chunk in bytes.chunks_exact_mut(element_size) {
            chunk.reverse();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_class_mapping() {
        for dtype in [
            DType::F64,
            DType::F32,
            DType::F16,
            DType::BF16,
            DType::I64,
            DType::I32,
            DType::I16,
            DType::I8,
            DType::U8,
            DType::Bool,
        ] {
            assert_eq!(DType::from_storage_class(dtype.storage_class()), Some(dtype));
        }
        assert_eq!(DType::from_storage_class("UntypedStorage"), Some(DType::U8));
        assert_eq!(DType::from_storage_class("QInt8Storage"), None);
    }

    #[test]
    fn test_half_precision_values() {
        let mut buf = Vec::new();
        DType::BF16.encode(1.5, &mut buf);
        DType::F16.encode(-0.25, &mut buf);
        assert_eq!(DType::BF16.decode(&buf[0..2]), 1.5);
        assert_eq!(DType::F16.decode(&buf[2..4]), -0.25);
    }

    #[test]
    fn test_big_endian_swap() {
        let mut bytes = 7i32.to_be_bytes().to_vec();
        ByteOrder::Big.to_little_endian(&mut bytes, 4);
        assert_eq!(DType::I32.decode(&bytes), 7.0);
    }
}
