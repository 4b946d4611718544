//! Fixed-layout wire records.
//!
//! Messages on the transport are raw bytes; the types exchanged through
//! them are plain records with a fixed field layout, written and read in
//! native byte order. Heterogeneous-endianness clusters are explicitly
//! unsupported, so there is no conversion step: a record is exactly the
//! bytes of its fields, in declaration order.

use crate::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::mem::size_of;

/// A value with a defined wire layout.
pub trait Record: Sized {
    /// Appends the encoded value to `buf`.
    fn write<B: BufMut>(&self, buf: &mut B);

    /// Reads a value from `buf`, consuming its encoded bytes.
    ///
    /// Fails with [`Error::TruncatedRecord`] when `buf` holds fewer bytes
    /// than the layout requires. Trailing bytes are left untouched: a
    /// payload may carry more than one record, or more data than the
    /// reader chooses to interpret.
    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error>;

    /// Encoded length of this value in bytes.
    fn len_encoded(&self) -> usize;

    /// Encodes the value to a fresh buffer.
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len_encoded());
        self.write(&mut buf);
        buf.freeze()
    }

    /// Decodes a value from the front of `buf`.
    fn decode<B: Buf>(mut buf: B) -> Result<Self, Error> {
        Self::read(&mut buf)
    }
}

/// A [`Record`] whose encoded length is the same for every value.
///
/// Fixed-size records are the unit of array payloads: a payload of
/// `n * LEN` bytes is `n` elements.
pub trait SizedRecord: Record {
    /// Encoded length of any value of this type.
    const LEN: usize;
}

macro_rules! numeric_record {
    ($($ty:ty => $put:ident, $get:ident;)*) => {$(
        impl Record for $ty {
            fn write<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }

            fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
                if buf.remaining() < size_of::<$ty>() {
                    return Err(Error::TruncatedRecord {
                        required: size_of::<$ty>(),
                        remaining: buf.remaining(),
                    });
                }
                Ok(buf.$get())
            }

            fn len_encoded(&self) -> usize {
                size_of::<$ty>()
            }
        }

        impl SizedRecord for $ty {
            const LEN: usize = size_of::<$ty>();
        }
    )*};
}

numeric_record! {
    u8 => put_u8, get_u8;
    i8 => put_i8, get_i8;
    u16 => put_u16_ne, get_u16_ne;
    i16 => put_i16_ne, get_i16_ne;
    u32 => put_u32_ne, get_u32_ne;
    i32 => put_i32_ne, get_i32_ne;
    u64 => put_u64_ne, get_u64_ne;
    i64 => put_i64_ne, get_i64_ne;
    f32 => put_f32_ne, get_f32_ne;
    f64 => put_f64_ne, get_f64_ne;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_round_trip() {
        let encoded = 0x1234_5678i32.encode();
        assert_eq!(encoded.len(), 4);
        assert_eq!(i32::decode(encoded).unwrap(), 0x1234_5678);

        let encoded = (-1.5f64).encode();
        assert_eq!(encoded.len(), 8);
        assert_eq!(f64::decode(encoded).unwrap(), -1.5);
    }

    #[test]
    fn read_leaves_trailing_bytes() {
        let mut buf = BytesMut::new();
        7u32.write(&mut buf);
        11u32.write(&mut buf);
        let mut buf = buf.freeze();
        assert_eq!(u32::read(&mut buf).unwrap(), 7);
        assert_eq!(buf.remaining(), 4);
        assert_eq!(u32::read(&mut buf).unwrap(), 11);
    }

    #[test]
    fn truncated_read_fails() {
        let mut buf = Bytes::from_static(&[0x01, 0x02]);
        assert_eq!(
            u32::read(&mut buf),
            Err(Error::TruncatedRecord {
                required: 4,
                remaining: 2
            })
        );
    }
}
