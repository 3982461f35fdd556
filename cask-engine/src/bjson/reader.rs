//! Value decoder
//!
//! Bounds-checked counterpart of the writer: every read verifies the
//! remaining length first, unknown tags and invalid UTF-8 are malformed
//! input, and nesting is capped so hostile buffers cannot exhaust the
//! stack.

use num_bigint::{BigInt, Sign};

use crate::registry::TypeRegistry;
use crate::value::{Array, ClassInstance, Record, Value};

use super::{CodecError, IndexResolver, Tag, MAX_DEPTH};

pub(super) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    registry: &'a TypeRegistry,
    resolver: &'a mut dyn IndexResolver,
    depth: usize,
}

impl<'a> Reader<'a> {
    pub(super) fn new(
        buf: &'a [u8],
        registry: &'a TypeRegistry,
        resolver: &'a mut dyn IndexResolver,
    ) -> Self {
        Reader {
            buf,
            pos: 0,
            registry,
            resolver,
            depth: 0,
        }
    }

    pub(super) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(super) fn read_value(&mut self) -> Result<Value, CodecError> {
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::Malformed("value nesting too deep".into()));
        }
        self.depth += 1;
        let value = self.read_tagged();
        self.depth -= 1;
        value
    }

    fn read_tagged(&mut self) -> Result<Value, CodecError> {
        let raw = self.u8()?;
        let tag = Tag::from_raw(raw)
            .ok_or_else(|| CodecError::Malformed(format!("unknown value tag 0x{:02x}", raw)))?;

        match tag {
            Tag::Null => Ok(Value::Null),
            Tag::False => Ok(Value::Bool(false)),
            Tag::True => Ok(Value::Bool(true)),
            Tag::Int32 => Ok(Value::Int(self.i32()?)),
            Tag::Float64 => Ok(Value::Float(f64::from_bits(self.u64()?))),
            Tag::BigInt => {
                let sign = match self.u8()? as i8 {
                    -1 => Sign::Minus,
                    0 => Sign::NoSign,
                    1 => Sign::Plus,
                    other => {
                        return Err(CodecError::Malformed(format!(
                            "invalid bigint sign {}",
                            other
                        )))
                    }
                };
                let len = self.u32()? as usize;
                let magnitude = self.take(len)?;
                Ok(Value::BigInt(Box::new(BigInt::from_bytes_le(
                    sign, magnitude,
                ))))
            }
            Tag::String => Ok(Value::String(self.string()?)),
            Tag::Date => Ok(Value::Date(self.i64()?)),
            Tag::Bytes => {
                let len = self.u32()? as usize;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            Tag::Array => {
                let count = self.u32()?;
                let arr = Array::new();
                for _ in 0..count {
                    arr.push(self.read_value()?);
                }
                Ok(Value::Array(arr))
            }
            Tag::Record => Ok(Value::Record(self.fields()?)),
            Tag::Class => {
                let name = self.string()?;
                let fields = self.fields()?;
                let fields = self
                    .registry
                    .construct(&name, fields)
                    .ok_or_else(|| CodecError::UnknownType(name.clone()))?;
                Ok(Value::Class(ClassInstance { name, fields }))
            }
            Tag::IndexRef => {
                let handle = self.u32()?;
                Ok(Value::Index(self.resolver.decode_index(handle)?))
            }
        }
    }

    fn fields(&mut self) -> Result<Record, CodecError> {
        let count = self.u32()?;
        let record = Record::new();
        for _ in 0..count {
            let key = self.string()?;
            let value = self.read_value()?;
            record.insert(key, value);
        }
        Ok(record)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::Malformed("invalid UTF-8 in string".into()))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }
}
