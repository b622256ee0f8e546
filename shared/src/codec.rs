//! Bidirectional serializer
//!
//! A single [`Serializer`] either writes or reads, selected by its [`Mode`].
//! Every message implements exactly one traversal, [`Serializable::serialize`],
//! which visits its fields through `&mut` references: in encode mode the
//! serializer copies each field into the output buffer, in decode mode it
//! overwrites each field from the input. Encoding and decoding therefore
//! cannot drift apart.
//!
//! ```
//! use shared::codec::{Serializable, Serializer};
//! use shared::CodecError;
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Ping {
//!     sequence: u32,
//!     time: u64,
//! }
//!
//! impl Serializable for Ping {
//!     fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
//!         s.var_u32(&mut self.sequence)?;
//!         s.var_u64(&mut self.time)
//!     }
//! }
//!
//! let mut ping = Ping { sequence: 7, time: 1_000 };
//! let mut writer = Serializer::encoder();
//! ping.serialize(&mut writer).unwrap();
//! let bytes = writer.into_bytes();
//!
//! let mut decoded = Ping::default();
//! let mut reader = Serializer::decoder(&bytes);
//! decoded.serialize(&mut reader).unwrap();
//! reader.finish().unwrap();
//! assert_eq!(decoded, ping);
//! ```

use crate::error::CodecError;
use crate::varint;

/// Direction a [`Serializer`] moves data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Encode,
    Decode,
}

/// Types that can be traversed by a [`Serializer`].
pub trait Serializable {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError>;
}

pub struct Serializer<'a> {
    mode: Mode,
    output: Vec<u8>,
    input: &'a [u8],
    cursor: usize,
}

macro_rules! fixed_width {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, value: &mut $ty) -> Result<(), CodecError> {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            match self.mode {
                Mode::Encode => self.output.extend_from_slice(&value.to_le_bytes()),
                Mode::Decode => {
                    let bytes = self.take(WIDTH)?;
                    let mut raw = [0u8; WIDTH];
                    raw.copy_from_slice(bytes);
                    *value = <$ty>::from_le_bytes(raw);
                }
            }
            Ok(())
        }
    };
}

impl Serializer<'static> {
    /// Creates a serializer that appends to an empty buffer.
    pub fn encoder() -> Self {
        Self::encoder_with_capacity(64)
    }

    pub fn encoder_with_capacity(capacity: usize) -> Self {
        Self {
            mode: Mode::Encode,
            output: Vec::with_capacity(capacity),
            input: &[],
            cursor: 0,
        }
    }
}

impl<'a> Serializer<'a> {
    /// Creates a serializer that reads from `input`.
    pub fn decoder(input: &'a [u8]) -> Self {
        Self {
            mode: Mode::Decode,
            output: Vec::new(),
            input,
            cursor: 0,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_decoding(&self) -> bool {
        self.mode == Mode::Decode
    }

    /// Bytes written so far (encode mode).
    pub fn len(&self) -> usize {
        self.output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    /// Bytes left to read (decode mode).
    pub fn remaining(&self) -> usize {
        self.input.len() - self.cursor
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.output
    }

    /// Fails if a decoder still holds unread bytes.
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(CodecError::TrailingBytes(extra)),
        }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < count {
            return Err(CodecError::UnexpectedEnd);
        }
        let input = self.input;
        let slice = &input[self.cursor..self.cursor + count];
        self.cursor += count;
        Ok(slice)
    }

    fixed_width!(u8, u8);
    fixed_width!(u16, u16);
    fixed_width!(u32, u32);
    fixed_width!(u64, u64);
    fixed_width!(i32, i32);
    fixed_width!(f32, f32);
    fixed_width!(f64, f64);

    pub fn bool(&mut self, value: &mut bool) -> Result<(), CodecError> {
        let mut raw = u8::from(*value);
        self.u8(&mut raw)?;
        match raw {
            0 => *value = false,
            1 => *value = true,
            other => {
                return Err(CodecError::InvalidValue {
                    field: "bool",
                    value: u64::from(other),
                })
            }
        }
        Ok(())
    }

    fn var_bits(&mut self, value: &mut u64, bits: u32) -> Result<(), CodecError> {
        match self.mode {
            Mode::Encode => varint::write_u64(&mut self.output, *value),
            Mode::Decode => {
                let (decoded, used) = varint::read_bits(&self.input[self.cursor..], bits)?;
                self.cursor += used;
                *value = decoded;
            }
        }
        Ok(())
    }

    pub fn var_u64(&mut self, value: &mut u64) -> Result<(), CodecError> {
        self.var_bits(value, 64)
    }

    pub fn var_u32(&mut self, value: &mut u32) -> Result<(), CodecError> {
        let mut wide = u64::from(*value);
        self.var_bits(&mut wide, 32)?;
        *value = wide as u32;
        Ok(())
    }

    pub fn var_u16(&mut self, value: &mut u16) -> Result<(), CodecError> {
        let mut wide = u64::from(*value);
        self.var_bits(&mut wide, 16)?;
        *value = wide as u16;
        Ok(())
    }

    pub fn var_i64(&mut self, value: &mut i64) -> Result<(), CodecError> {
        let mut wide = varint::zigzag_encode(*value);
        self.var_bits(&mut wide, 64)?;
        *value = varint::zigzag_decode(wide);
        Ok(())
    }

    pub fn var_i32(&mut self, value: &mut i32) -> Result<(), CodecError> {
        let mut wide = varint::zigzag_encode(i64::from(*value));
        self.var_bits(&mut wide, 32)?;
        *value = varint::zigzag_decode(wide) as i32;
        Ok(())
    }

    /// A compressed length prefix, bounded by `max`.
    pub fn length(&mut self, len: &mut usize, max: usize) -> Result<(), CodecError> {
        if self.mode == Mode::Encode && *len > max {
            return Err(CodecError::LengthExceeded { len: *len, max });
        }
        let mut wide = *len as u64;
        self.var_bits(&mut wide, 32)?;
        let decoded = wide as usize;
        if decoded > max {
            return Err(CodecError::LengthExceeded { len: decoded, max });
        }
        *len = decoded;
        Ok(())
    }

    pub fn string(&mut self, value: &mut String, max_len: usize) -> Result<(), CodecError> {
        let mut len = value.len();
        self.length(&mut len, max_len)?;
        match self.mode {
            Mode::Encode => self.output.extend_from_slice(value.as_bytes()),
            Mode::Decode => {
                let bytes = self.take(len)?;
                *value = std::str::from_utf8(bytes)
                    .map_err(|_| CodecError::InvalidUtf8)?
                    .to_owned();
            }
        }
        Ok(())
    }

    pub fn bytes(&mut self, value: &mut Vec<u8>, max_len: usize) -> Result<(), CodecError> {
        let mut len = value.len();
        self.length(&mut len, max_len)?;
        match self.mode {
            Mode::Encode => self.output.extend_from_slice(value),
            Mode::Decode => *value = self.take(len)?.to_vec(),
        }
        Ok(())
    }

    /// Everything up to the end of the buffer, without a length prefix.
    pub fn rest(&mut self, value: &mut Vec<u8>) -> Result<(), CodecError> {
        match self.mode {
            Mode::Encode => self.output.extend_from_slice(value),
            Mode::Decode => {
                let remaining = self.remaining();
                *value = self.take(remaining)?.to_vec();
            }
        }
        Ok(())
    }

    pub fn value<T: Serializable>(&mut self, value: &mut T) -> Result<(), CodecError> {
        value.serialize(self)
    }

    /// A compressed count followed by that many elements.
    pub fn list<T: Serializable + Default>(
        &mut self,
        items: &mut Vec<T>,
        max: usize,
    ) -> Result<(), CodecError> {
        let mut len = items.len();
        self.length(&mut len, max)?;
        if self.is_decoding() {
            items.clear();
            items.reserve(len.min(self.remaining()));
            for _ in 0..len {
                let mut item = T::default();
                item.serialize(self)?;
                items.push(item);
            }
        } else {
            for item in items.iter_mut() {
                item.serialize(self)?;
            }
        }
        Ok(())
    }

    /// A compressed count followed by compressed `u32` values.
    pub fn var_u32_list(&mut self, items: &mut Vec<u32>, max: usize) -> Result<(), CodecError> {
        let mut len = items.len();
        self.length(&mut len, max)?;
        if self.is_decoding() {
            items.clear();
            items.reserve(len.min(self.remaining()));
            for _ in 0..len {
                let mut item = 0;
                self.var_u32(&mut item)?;
                items.push(item);
            }
        } else {
            for item in items.iter_mut() {
                self.var_u32(item)?;
            }
        }
        Ok(())
    }
}
