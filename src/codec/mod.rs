//! Codec Module
//!
//! Byte encodings for everything the collections persist.
//!
//! ## Responsibilities
//! - Variable-width little-endian integers (`NumberSize`)
//! - One closed set of value layouts (`ValueStorage`), picked once per collection
//! - Self-delimiting inline encoding for cells and reference payloads
//! - Fixed-width element encoding for contiguous arrays
//!
//! ## Inline Integer Format
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ Tag (1)  │ Value (0, 1, 2, 4 or 8 bytes) │
//! └──────────┴──────────────────────────────┘
//! ```
//! The tag is the byte width of the value that follows, so `0` costs one byte.
//!
//! ## Element Format (arrays)
//! ```text
//! ┌────────────────┬──────────────┬──────────────┬─────┐
//! │ Fixed bytes    │ Field 0      │ Field 1      │ ... │
//! │ (per type)     │ (width[0])   │ (width[1])   │     │
//! └────────────────┴──────────────┴──────────────┴─────┘
//! ```

mod primitives;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{IoCollError, Result};

// =============================================================================
// NumberSize
// =============================================================================

/// Byte width of a variable-width integer field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NumberSize {
    Void,
    Byte,
    Short,
    Int,
    Long,
}

impl NumberSize {
    /// All sizes, narrowest first
    pub const ALL: [NumberSize; 5] = [
        NumberSize::Void,
        NumberSize::Byte,
        NumberSize::Short,
        NumberSize::Int,
        NumberSize::Long,
    ];

    /// Number of bytes a value of this size occupies
    pub const fn bytes(self) -> usize {
        match self {
            NumberSize::Void => 0,
            NumberSize::Byte => 1,
            NumberSize::Short => 2,
            NumberSize::Int => 4,
            NumberSize::Long => 8,
        }
    }

    /// Largest value representable in this size
    pub const fn max_value(self) -> u64 {
        match self {
            NumberSize::Void => 0,
            NumberSize::Byte => u8::MAX as u64,
            NumberSize::Short => u16::MAX as u64,
            NumberSize::Int => u32::MAX as u64,
            NumberSize::Long => u64::MAX,
        }
    }

    /// Smallest size that holds `value`
    pub fn fitting(value: u64) -> NumberSize {
        Self::ALL
            .into_iter()
            .find(|size| size.can_hold(value))
            .unwrap_or(NumberSize::Long)
    }

    pub fn can_hold(self, value: u64) -> bool {
        value <= self.max_value()
    }

    /// The next wider size, if any
    pub fn next_wider(self) -> Option<NumberSize> {
        match self {
            NumberSize::Void => Some(NumberSize::Byte),
            NumberSize::Byte => Some(NumberSize::Short),
            NumberSize::Short => Some(NumberSize::Int),
            NumberSize::Int => Some(NumberSize::Long),
            NumberSize::Long => None,
        }
    }

    /// One-byte on-disk tag (the byte width)
    pub fn tag(self) -> u8 {
        self.bytes() as u8
    }

    /// Parse an on-disk tag
    pub fn from_tag(tag: u8) -> Result<NumberSize> {
        match tag {
            0 => Ok(NumberSize::Void),
            1 => Ok(NumberSize::Byte),
            2 => Ok(NumberSize::Short),
            4 => Ok(NumberSize::Int),
            8 => Ok(NumberSize::Long),
            other => Err(IoCollError::Corruption(format!(
                "invalid number size tag: {}",
                other
            ))),
        }
    }

    /// Write `value` using exactly `self.bytes()` bytes
    pub fn write(self, value: u64, out: &mut impl BufMut) -> Result<()> {
        if !self.can_hold(value) {
            return Err(IoCollError::WidthOverflow {
                required: NumberSize::fitting(value),
                available: self,
            });
        }
        if self != NumberSize::Void {
            out.put_uint_le(value, self.bytes());
        }
        Ok(())
    }

    /// Read a value of exactly `self.bytes()` bytes
    pub fn read(self, input: &mut impl Buf) -> Result<u64> {
        if self == NumberSize::Void {
            return Ok(0);
        }
        ensure_remaining(input, self.bytes())?;
        Ok(input.get_uint_le(self.bytes()))
    }

    /// Decode a little-endian value from a fixed byte slice
    pub fn read_slice(self, bytes: &[u8]) -> Result<u64> {
        let mut input = bytes;
        self.read(&mut input)
    }
}

// =============================================================================
// Inline Helpers
// =============================================================================

/// Fail with a corruption error unless `n` bytes remain
pub(crate) fn ensure_remaining(input: &impl Buf, n: usize) -> Result<()> {
    if input.remaining() < n {
        return Err(IoCollError::Corruption(format!(
            "truncated encoding: need {} bytes, {} left",
            n,
            input.remaining()
        )));
    }
    Ok(())
}

/// Write a width-tagged integer
pub fn put_var(out: &mut impl BufMut, value: u64) {
    let size = NumberSize::fitting(value);
    out.put_u8(size.tag());
    if size != NumberSize::Void {
        out.put_uint_le(value, size.bytes());
    }
}

/// Read a width-tagged integer
pub fn get_var(input: &mut impl Buf) -> Result<u64> {
    ensure_remaining(input, 1)?;
    let size = NumberSize::from_tag(input.get_u8())?;
    size.read(input)
}

/// Zigzag mapping so small negative numbers stay narrow
pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

// =============================================================================
// ValueStorage
// =============================================================================

/// How a type is laid out inside a contiguous array
///
/// Resolved once when a collection is created; every element then uses the
/// same variant and the same negotiated field widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueStorage {
    /// Same number of bytes for every value
    Fixed { size: usize },

    /// `fixed` plain bytes plus `fields` integers of negotiated width
    Varying { fields: usize, fixed: usize },

    /// The element is a pointer to a chunk holding the inline encoding
    Reference,
}

impl ValueStorage {
    /// Number of negotiated width fields
    pub fn field_count(&self) -> usize {
        match self {
            ValueStorage::Fixed { .. } => 0,
            ValueStorage::Varying { fields, .. } => *fields,
            ValueStorage::Reference => 1,
        }
    }

    /// Bytes per element for the given field widths
    pub fn element_width(&self, widths: &[NumberSize]) -> usize {
        match self {
            ValueStorage::Fixed { size } => *size,
            ValueStorage::Varying { fixed, .. } => {
                fixed + widths.iter().map(|w| w.bytes()).sum::<usize>()
            }
            ValueStorage::Reference => widths.first().map(|w| w.bytes()).unwrap_or(0),
        }
    }
}

// =============================================================================
// IoValue
// =============================================================================

/// A value the collections know how to persist
///
/// Every type provides a self-delimiting *inline* encoding. Types laid out as
/// `Fixed` reuse it for array elements; `Varying` types override the element
/// methods to honour the negotiated widths; `Reference` types never encode an
/// element themselves, the array stores a pointer to their inline bytes.
pub trait IoValue: Sized + Clone {
    fn storage() -> ValueStorage;

    fn encode_inline(&self, out: &mut BytesMut);

    fn decode_inline(input: &mut &[u8]) -> Result<Self>;

    /// Raise `widths` so that this value's varying fields fit
    fn required_widths(&self, _widths: &mut [NumberSize]) {}

    fn encode_element(&self, _widths: &[NumberSize], out: &mut BytesMut) -> Result<()> {
        self.encode_inline(out);
        Ok(())
    }

    fn decode_element(_widths: &[NumberSize], input: &mut &[u8]) -> Result<Self> {
        Self::decode_inline(input)
    }

    /// Whether a reference element may be stored as a null pointer
    fn is_null(&self) -> bool {
        false
    }

    /// Value read back from a null reference, if the type has one
    fn null() -> Option<Self> {
        None
    }
}

/// Inline bytes of a value
pub fn to_inline<T: IoValue>(value: &T) -> BytesMut {
    let mut out = BytesMut::new();
    value.encode_inline(&mut out);
    out
}

/// Decode a value from its complete inline bytes
pub fn from_inline<T: IoValue>(bytes: &[u8]) -> Result<T> {
    let mut input = bytes;
    T::decode_inline(&mut input)
}

/// Process-stable hash of a value (xxh3 over its inline encoding)
pub fn hash_value<T: IoValue>(value: &T) -> u64 {
    xxhash_rust::xxh3::xxh3_64(&to_inline(value))
}

/// Smallest widths that fit every value in `values`
pub fn negotiate_widths<'a, T: IoValue + 'a>(
    values: impl IntoIterator<Item = &'a T>,
) -> Vec<NumberSize> {
    let storage = T::storage();
    let mut widths = vec![NumberSize::Void; storage.field_count()];
    for value in values {
        required_widths_of(&storage, value, &mut widths);
    }
    widths
}

/// `required_widths`, with reference pointers handled by the caller
pub(crate) fn required_widths_of<T: IoValue>(
    storage: &ValueStorage,
    value: &T,
    widths: &mut [NumberSize],
) {
    if !matches!(storage, ValueStorage::Reference) {
        value.required_widths(widths);
    }
}
