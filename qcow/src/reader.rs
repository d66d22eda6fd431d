// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Sequential decoding of big-endian fields from a [`ByteSource`].

use byteorder::{BigEndian, ByteOrder};

use crate::mmap::ByteSource;
use crate::Result;

/// A fixed-width big-endian field.
pub trait BeField: Sized {
    const SIZE: usize;

    /// Decodes the field from exactly `SIZE` bytes.
    fn from_be_slice(bytes: &[u8]) -> Self;
}

impl BeField for u8 {
    const SIZE: usize = 1;

    #[inline(always)]
    fn from_be_slice(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl BeField for u16 {
    const SIZE: usize = 2;

    #[inline(always)]
    fn from_be_slice(bytes: &[u8]) -> Self {
        BigEndian::read_u16(bytes)
    }
}

impl BeField for u32 {
    const SIZE: usize = 4;

    #[inline(always)]
    fn from_be_slice(bytes: &[u8]) -> Self {
        BigEndian::read_u32(bytes)
    }
}

impl BeField for u64 {
    const SIZE: usize = 8;

    #[inline(always)]
    fn from_be_slice(bytes: &[u8]) -> Self {
        BigEndian::read_u64(bytes)
    }
}

// Fixed-length byte strings are copied as is.
impl<const N: usize> BeField for [u8; N] {
    const SIZE: usize = N;

    #[inline(always)]
    fn from_be_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes[..N]);
        out
    }
}

/// A record of one or more consecutive fields decoded with a single read.
pub trait Unpack: Sized {
    /// Total width of the record in bytes.
    const SIZE: usize;

    fn unpack_from(bytes: &[u8]) -> Self;
}

macro_rules! unpack_field {
    ($($ty:ty),+) => {
        $(
            impl Unpack for $ty {
                const SIZE: usize = <$ty as BeField>::SIZE;

                fn unpack_from(bytes: &[u8]) -> Self {
                    <$ty as BeField>::from_be_slice(bytes)
                }
            }
        )+
    };
}

unpack_field!(u8, u16, u32, u64);

impl<const N: usize> Unpack for [u8; N] {
    const SIZE: usize = N;

    fn unpack_from(bytes: &[u8]) -> Self {
        <[u8; N] as BeField>::from_be_slice(bytes)
    }
}

macro_rules! unpack_tuple {
    ($($ty:ident $field:ident),+) => {
        impl<$($ty: BeField),+> Unpack for ($($ty,)+) {
            const SIZE: usize = 0 $(+ $ty::SIZE)+;

            fn unpack_from(bytes: &[u8]) -> Self {
                let mut pos = 0;
                $(
                    let $field = $ty::from_be_slice(&bytes[pos..pos + $ty::SIZE]);
                    pos += $ty::SIZE;
                )+
                debug_assert_eq!(pos, Self::SIZE);
                ($($field,)+)
            }
        }
    };
}

unpack_tuple!(A a);
unpack_tuple!(A a, B b);
unpack_tuple!(A a, B b, C c);
unpack_tuple!(A a, B b, C c, D d);
unpack_tuple!(A a, B b, C c, D d, E e);
unpack_tuple!(A a, B b, C c, D d, E e, F f);
unpack_tuple!(A a, B b, C c, D d, E e, F f, G g);
unpack_tuple!(A a, B b, C c, D d, E e, F f, G g, H h);
unpack_tuple!(A a, B b, C c, D d, E e, F f, G g, H h, I i);

/// Decodes bytes as UTF-8, replacing invalid sequences and dropping trailing
/// NUL padding.
pub fn lossy_string(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A cursor over a [`ByteSource`].
///
/// The reader only borrows the source, so any number of them can walk the same
/// image independently.
#[derive(Debug)]
pub struct FieldReader<'a, S: ?Sized> {
    source: &'a S,
    offset: u64,
}

impl<'a, S: ByteSource + ?Sized> FieldReader<'a, S> {
    pub fn new(source: &'a S, offset: u64) -> Self {
        FieldReader { source, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Moves the cursor to an absolute offset. Bounds are checked by the next read.
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Advances the cursor without reading, e.g. over padding.
    pub fn skip(&mut self, count: u64) {
        self.offset = self.offset.saturating_add(count);
    }

    /// Decodes the record `T` at the cursor and advances past it.
    ///
    /// On `OutOfBounds` the cursor is left where it was.
    pub fn unpack<T: Unpack>(&mut self) -> Result<T> {
        let bytes = self.source.read(self.offset, T::SIZE)?;
        let value = T::unpack_from(bytes);
        self.offset += T::SIZE as u64;
        Ok(value)
    }

    /// Returns the next `length` bytes and advances past them.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let bytes = self.source.read(self.offset, length)?;
        self.offset += length as u64;
        Ok(bytes)
    }

    /// Reads `length` bytes as a string, see [`lossy_string`].
    pub fn read_string(&mut self, length: usize) -> Result<String> {
        self.read_bytes(length).map(lossy_string)
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::Error;

    const BYTES: [u8; 16] = [
        0x51, 0x46, 0x49, 0xfb, // magic
        0x00, 0x00, 0x00, 0x03, // u32
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // u64
    ];

    #[test]
    fn unpack_single_fields() {
        let source: &[u8] = &BYTES;
        let mut reader = FieldReader::new(source, 4);
        assert_eq!(reader.unpack::<u32>().unwrap(), 3);
        assert_eq!(reader.offset(), 8);
        assert_eq!(reader.unpack::<u64>().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(reader.offset(), 16);

        reader.seek(8);
        assert_eq!(reader.unpack::<u8>().unwrap(), 1);
        assert_eq!(reader.unpack::<u16>().unwrap(), 0x0203);
        assert_eq!(reader.offset(), 11);
    }

    #[test]
    fn unpack_record() {
        let source: &[u8] = &BYTES;
        let mut reader = FieldReader::new(source, 0);
        let (magic, version, low, high) = reader.unpack::<([u8; 4], u32, u32, u32)>().unwrap();
        assert_eq!(&magic, b"QFI\xfb");
        assert_eq!(version, 3);
        assert_eq!(low, 0x0102_0304);
        assert_eq!(high, 0x0506_0708);
        assert_eq!(reader.offset(), 16);
        assert_eq!(<(u8, u16, [u8; 46]) as Unpack>::SIZE, 49);
    }

    #[test]
    fn out_of_bounds_leaves_cursor() {
        let source: &[u8] = &BYTES;
        let mut reader = FieldReader::new(source, 12);
        match reader.unpack::<u64>() {
            Err(Error::OutOfBounds {
                offset: 12,
                length: 8,
                size: 16,
            }) => {}
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(reader.offset(), 12);
        assert_eq!(reader.unpack::<u32>().unwrap(), 0x0506_0708);
        assert!(reader.unpack::<u8>().is_err());
    }

    #[test]
    fn skip_and_read_bytes() {
        let source: &[u8] = &BYTES;
        let mut reader = FieldReader::new(source, 0);
        reader.skip(8);
        assert_eq!(reader.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(reader.offset(), 11);
        reader.skip(u64::MAX);
        assert_eq!(reader.offset(), u64::MAX);
        assert!(reader.read_bytes(1).is_err());
    }

    #[test]
    fn readers_are_independent() {
        let source: &[u8] = &BYTES;
        let mut first = FieldReader::new(source, 0);
        let mut second = FieldReader::new(source, 8);
        assert_eq!(first.unpack::<u32>().unwrap(), 0x5146_49fb);
        assert_eq!(second.unpack::<u32>().unwrap(), 0x0102_0304);
        assert_eq!(first.offset(), 4);
        assert_eq!(second.offset(), 12);
    }

    #[test]
    fn strings() {
        assert_eq!(lossy_string(b"qed\0"), "qed");
        assert_eq!(lossy_string(b"dirty bit\0\0\0\0"), "dirty bit");
        assert_eq!(lossy_string(b"\0\0"), "");
        assert_eq!(lossy_string(b"a\0b"), "a\0b");
        assert_eq!(lossy_string(&[0x66, 0xff, 0x6f]), "f\u{fffd}o");

        let source: &[u8] = b"raw\0\0qcow2";
        let mut reader = FieldReader::new(source, 0);
        assert_eq!(reader.read_string(5).unwrap(), "raw");
        assert_eq!(reader.read_string(5).unwrap(), "qcow2");
    }
}
