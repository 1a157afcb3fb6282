//! Tuple representation and serialization.

use crate::error::{Result, StrataError};
use crate::types::Field;

/// An ordered sequence of typed fields.
///
/// The leading fields form the key. A buddy (tombstone) entry is the key
/// projection of a tuple and nothing else.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tuple {
    fields: Vec<Field>,
}

impl Tuple {
    /// Creates a tuple from its fields.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Builds a tuple of Int64 fields.
    pub fn from_ints(values: &[i64]) -> Self {
        Self {
            fields: values.iter().map(|v| Field::Int64(*v)).collect(),
        }
    }

    /// Returns the fields.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Returns the field at `index`.
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    /// Returns the number of fields.
    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the tuple has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Projects the first `key_fields` fields into a new tuple.
    ///
    /// Projecting more fields than the tuple holds returns a copy of the tuple.
    pub fn key(&self, key_fields: usize) -> Tuple {
        let end = key_fields.min(self.fields.len());
        Tuple {
            fields: self.fields[..end].to_vec(),
        }
    }

    /// Returns the serialized size in bytes.
    pub fn encoded_len(&self) -> usize {
        2 + self.fields.iter().map(Field::encoded_len).sum::<usize>()
    }

    /// Appends the serialized tuple to `out`: `field_count:u16` then each field.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        for field in &self.fields {
            field.encode(out);
        }
    }

    /// Serializes the tuple into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Deserializes a tuple from the front of `buf`.
    ///
    /// Returns the tuple and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 2 {
            return Err(StrataError::InvalidTuple(format!(
                "buffer of {} bytes too short for field count",
                buf.len()
            )));
        }
        let count = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let mut fields = Vec::with_capacity(count);
        let mut offset = 2;
        for i in 0..count {
            let (field, used) = Field::decode(&buf[offset..]).ok_or_else(|| {
                StrataError::InvalidTuple(format!("field {} of {} is malformed", i, count))
            })?;
            fields.push(field);
            offset += used;
        }
        Ok((Self { fields }, offset))
    }

    /// Deserializes a tuple that occupies all of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (tuple, used) = Self::decode(buf)?;
        if used != buf.len() {
            return Err(StrataError::InvalidTuple(format!(
                "{} trailing bytes after tuple",
                buf.len() - used
            )));
        }
        Ok(tuple)
    }
}

impl From<Vec<Field>> for Tuple {
    fn from(fields: Vec<Field>) -> Self {
        Self::new(fields)
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field)?;
        }
        write!(f, ")")
    }
}
