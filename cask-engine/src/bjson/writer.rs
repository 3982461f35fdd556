//! Value encoder
//!
//! Writes the tag-prefixed wire form described in the module docs. All
//! multi-byte quantities are little-endian; strings, byte strings, arrays
//! and records are length-prefixed with a u32.

use bytes::{BufMut, BytesMut};
use num_bigint::Sign;

use crate::value::{Record, Value};

use super::{CodecError, IndexResolver, Tag};

pub(super) fn write_value(
    value: &Value,
    resolver: &mut dyn IndexResolver,
) -> Result<Vec<u8>, CodecError> {
    let mut writer = Writer {
        buf: BytesMut::new(),
        resolver,
    };
    writer.value(value)?;
    Ok(writer.buf.to_vec())
}

struct Writer<'a> {
    buf: BytesMut,
    resolver: &'a mut dyn IndexResolver,
}

impl Writer<'_> {
    fn value(&mut self, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Null => self.buf.put_u8(Tag::Null as u8),
            Value::Bool(false) => self.buf.put_u8(Tag::False as u8),
            Value::Bool(true) => self.buf.put_u8(Tag::True as u8),
            Value::Int(v) => {
                self.buf.put_u8(Tag::Int32 as u8);
                self.buf.put_i32_le(*v);
            }
            Value::Float(v) => {
                self.buf.put_u8(Tag::Float64 as u8);
                self.buf.put_u64_le(v.to_bits());
            }
            Value::BigInt(big) => {
                let (sign, magnitude) = big.to_bytes_le();
                self.buf.put_u8(Tag::BigInt as u8);
                self.buf.put_i8(match sign {
                    Sign::Minus => -1,
                    Sign::NoSign => 0,
                    Sign::Plus => 1,
                });
                self.len_prefix(magnitude.len())?;
                self.buf.put_slice(&magnitude);
            }
            Value::String(s) => {
                self.buf.put_u8(Tag::String as u8);
                self.string(s)?;
            }
            Value::Date(ms) => {
                self.buf.put_u8(Tag::Date as u8);
                self.buf.put_i64_le(*ms);
            }
            Value::Bytes(data) => {
                self.buf.put_u8(Tag::Bytes as u8);
                self.len_prefix(data.len())?;
                self.buf.put_slice(data);
            }
            Value::Array(arr) => {
                let items = arr.items();
                self.buf.put_u8(Tag::Array as u8);
                self.len_prefix(items.len())?;
                for item in &items {
                    self.value(item)?;
                }
            }
            Value::Record(rec) => {
                self.buf.put_u8(Tag::Record as u8);
                self.fields(rec)?;
            }
            Value::Class(inst) => {
                self.buf.put_u8(Tag::Class as u8);
                self.string(&inst.name)?;
                self.fields(&inst.fields)?;
            }
            Value::Index(index) => {
                let handle = self.resolver.encode_index(index)?;
                self.buf.put_u8(Tag::IndexRef as u8);
                self.buf.put_u32_le(handle);
            }
        }
        Ok(())
    }

    fn fields(&mut self, record: &Record) -> Result<(), CodecError> {
        let entries = record.entries();
        self.len_prefix(entries.len())?;
        for (key, value) in &entries {
            self.string(key)?;
            self.value(value)?;
        }
        Ok(())
    }

    fn string(&mut self, s: &str) -> Result<(), CodecError> {
        self.len_prefix(s.len())?;
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    fn len_prefix(&mut self, len: usize) -> Result<(), CodecError> {
        let len: u32 = len
            .try_into()
            .map_err(|_| CodecError::Unencodable("length exceeds u32".into()))?;
        self.buf.put_u32_le(len);
        Ok(())
    }
}
