//! IoValue implementations for the built-in types

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{IoCollError, Result};
use crate::storage::ChunkPtr;

use super::{ensure_remaining, get_var, put_var, unzigzag, zigzag, IoValue, NumberSize, ValueStorage};

// =============================================================================
// Fixed-width primitives
// =============================================================================

macro_rules! fixed_int {
    ($ty:ty, $put:ident, $get:ident) => {
        impl IoValue for $ty {
            fn storage() -> ValueStorage {
                ValueStorage::Fixed {
                    size: std::mem::size_of::<$ty>(),
                }
            }

            fn encode_inline(&self, out: &mut BytesMut) {
                out.$put(*self);
            }

            fn decode_inline(input: &mut &[u8]) -> Result<Self> {
                ensure_remaining(input, std::mem::size_of::<$ty>())?;
                Ok(input.$get())
            }
        }
    };
}

fixed_int!(u8, put_u8, get_u8);
fixed_int!(u16, put_u16_le, get_u16_le);
fixed_int!(u32, put_u32_le, get_u32_le);
fixed_int!(i32, put_i32_le, get_i32_le);
fixed_int!(f64, put_f64_le, get_f64_le);

impl IoValue for bool {
    fn storage() -> ValueStorage {
        ValueStorage::Fixed { size: 1 }
    }

    fn encode_inline(&self, out: &mut BytesMut) {
        out.put_u8(*self as u8);
    }

    fn decode_inline(input: &mut &[u8]) -> Result<Self> {
        ensure_remaining(input, 1)?;
        match input.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(IoCollError::Corruption(format!("invalid bool byte: {}", other))),
        }
    }
}

// =============================================================================
// Variable-width integers
// =============================================================================

impl IoValue for u64 {
    fn storage() -> ValueStorage {
        ValueStorage::Varying { fields: 1, fixed: 0 }
    }

    fn encode_inline(&self, out: &mut BytesMut) {
        put_var(out, *self);
    }

    fn decode_inline(input: &mut &[u8]) -> Result<Self> {
        get_var(input)
    }

    fn required_widths(&self, widths: &mut [NumberSize]) {
        widths[0] = widths[0].max(NumberSize::fitting(*self));
    }

    fn encode_element(&self, widths: &[NumberSize], out: &mut BytesMut) -> Result<()> {
        widths[0].write(*self, out)
    }

    fn decode_element(widths: &[NumberSize], input: &mut &[u8]) -> Result<Self> {
        widths[0].read(input)
    }
}

impl IoValue for i64 {
    fn storage() -> ValueStorage {
        ValueStorage::Varying { fields: 1, fixed: 0 }
    }

    fn encode_inline(&self, out: &mut BytesMut) {
        put_var(out, zigzag(*self));
    }

    fn decode_inline(input: &mut &[u8]) -> Result<Self> {
        Ok(unzigzag(get_var(input)?))
    }

    fn required_widths(&self, widths: &mut [NumberSize]) {
        widths[0] = widths[0].max(NumberSize::fitting(zigzag(*self)));
    }

    fn encode_element(&self, widths: &[NumberSize], out: &mut BytesMut) -> Result<()> {
        widths[0].write(zigzag(*self), out)
    }

    fn decode_element(widths: &[NumberSize], input: &mut &[u8]) -> Result<Self> {
        Ok(unzigzag(widths[0].read(input)?))
    }
}

impl IoValue for ChunkPtr {
    fn storage() -> ValueStorage {
        ValueStorage::Varying { fields: 1, fixed: 0 }
    }

    fn encode_inline(&self, out: &mut BytesMut) {
        put_var(out, self.get());
    }

    fn decode_inline(input: &mut &[u8]) -> Result<Self> {
        Ok(ChunkPtr::new(get_var(input)?))
    }

    fn required_widths(&self, widths: &mut [NumberSize]) {
        widths[0] = widths[0].max(NumberSize::fitting(self.get()));
    }

    fn encode_element(&self, widths: &[NumberSize], out: &mut BytesMut) -> Result<()> {
        widths[0].write(self.get(), out)
    }

    fn decode_element(widths: &[NumberSize], input: &mut &[u8]) -> Result<Self> {
        Ok(ChunkPtr::new(widths[0].read(input)?))
    }
}

// =============================================================================
// Heap values (stored by reference inside arrays)
// =============================================================================

fn get_bytes(input: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_var(input)? as usize;
    ensure_remaining(input, len)?;
    let bytes = input[..len].to_vec();
    input.advance(len);
    Ok(bytes)
}

impl IoValue for String {
    fn storage() -> ValueStorage {
        ValueStorage::Reference
    }

    fn encode_inline(&self, out: &mut BytesMut) {
        put_var(out, self.len() as u64);
        out.put_slice(self.as_bytes());
    }

    fn decode_inline(input: &mut &[u8]) -> Result<Self> {
        String::from_utf8(get_bytes(input)?)
            .map_err(|e| IoCollError::Corruption(format!("invalid utf-8 string: {}", e)))
    }
}

impl IoValue for Vec<u8> {
    fn storage() -> ValueStorage {
        ValueStorage::Reference
    }

    fn encode_inline(&self, out: &mut BytesMut) {
        put_var(out, self.len() as u64);
        out.put_slice(self);
    }

    fn decode_inline(input: &mut &[u8]) -> Result<Self> {
        get_bytes(input)
    }
}

// =============================================================================
// Option (tombstones)
// =============================================================================

impl<T: IoValue> IoValue for Option<T> {
    fn storage() -> ValueStorage {
        match T::storage() {
            ValueStorage::Fixed { size } => ValueStorage::Fixed { size: size + 1 },
            ValueStorage::Varying { fields, fixed } => ValueStorage::Varying {
                fields,
                fixed: fixed + 1,
            },
            ValueStorage::Reference => ValueStorage::Reference,
        }
    }

    fn encode_inline(&self, out: &mut BytesMut) {
        match self {
            Some(value) => {
                out.put_u8(1);
                value.encode_inline(out);
            }
            None => out.put_u8(0),
        }
    }

    fn decode_inline(input: &mut &[u8]) -> Result<Self> {
        ensure_remaining(input, 1)?;
        match input.get_u8() {
            0 => Ok(None),
            1 => Ok(Some(T::decode_inline(input)?)),
            other => Err(IoCollError::Corruption(format!("invalid option flag: {}", other))),
        }
    }

    fn required_widths(&self, widths: &mut [NumberSize]) {
        if let Some(value) = self {
            value.required_widths(widths);
        }
    }

    fn encode_element(&self, widths: &[NumberSize], out: &mut BytesMut) -> Result<()> {
        match self {
            Some(value) => {
                out.put_u8(1);
                value.encode_element(widths, out)
            }
            None => {
                out.put_u8(0);
                out.put_bytes(0, T::storage().element_width(widths));
                Ok(())
            }
        }
    }

    fn decode_element(widths: &[NumberSize], input: &mut &[u8]) -> Result<Self> {
        ensure_remaining(input, 1)?;
        match input.get_u8() {
            0 => {
                let skip = T::storage().element_width(widths);
                ensure_remaining(input, skip)?;
                input.advance(skip);
                Ok(None)
            }
            _ => Ok(Some(T::decode_element(widths, input)?)),
        }
    }

    fn is_null(&self) -> bool {
        self.is_none()
    }

    fn null() -> Option<Self> {
        Some(None)
    }
}

// =============================================================================
// Pairs (map entries)
// =============================================================================

impl<A: IoValue, B: IoValue> IoValue for (A, B) {
    fn storage() -> ValueStorage {
        ValueStorage::Reference
    }

    fn encode_inline(&self, out: &mut BytesMut) {
        self.0.encode_inline(out);
        self.1.encode_inline(out);
    }

    fn decode_inline(input: &mut &[u8]) -> Result<Self> {
        let first = A::decode_inline(input)?;
        let second = B::decode_inline(input)?;
        Ok((first, second))
    }
}
