// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! L1 table entry decoding.
//!
//! An L1 entry is a big-endian u64:
//!
//! | bits  | meaning                                      |
//! |-------|----------------------------------------------|
//! | 0-8   | reserved, zero                               |
//! | 9-55  | offset of the L2 table, cluster aligned      |
//! | 56-62 | reserved, zero                               |
//! | 63    | set when the L2 table refcount is exactly 1  |
//!
//! The L2 offset is masked out of bits 9-55 only; the low reserved bits are
//! reported but never folded into the offset.

use log::warn;

use crate::anomaly::Anomaly;
use crate::header::{is_cluster_aligned, Header};
use crate::mmap::ByteSource;
use crate::reader::FieldReader;
use crate::Result;

// bits 0-8 and 56-62 are reserved.
pub const L1_RESERVED_LOW_MASK: u64 = 0x1ff;
pub const L1_TABLE_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
pub const L1_RESERVED_HIGH_MASK: u64 = 0x7f00_0000_0000_0000;
// Flags
pub const CLUSTER_USED_FLAG: u64 = 1 << 63;

pub const L1_ENTRY_SIZE: u64 = 8;

/// A decoded L1 table entry. All accessors are pure functions of `raw`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct L1Entry {
    pub index: u32,
    pub raw: u64,
}

impl L1Entry {
    pub fn new(index: u32, raw: u64) -> Self {
        L1Entry { index, raw }
    }

    /// Value of reserved bits 0-8.
    pub fn reserved_low_bits(&self) -> u64 {
        self.raw & L1_RESERVED_LOW_MASK
    }

    /// Value of reserved bits 56-62, shifted down.
    pub fn reserved_high_bits(&self) -> u64 {
        (self.raw & L1_RESERVED_HIGH_MASK) >> 56
    }

    /// Offset of the L2 table, 0 if unallocated.
    pub fn l2_offset(&self) -> u64 {
        self.raw & L1_TABLE_OFFSET_MASK
    }

    /// Bit 63: the L2 table is referenced exactly once. When clear the table
    /// is unused or must be copied before it is written.
    pub fn refcount_is_one(&self) -> bool {
        self.raw & CLUSTER_USED_FLAG != 0
    }

    pub fn anomalies(&self, cluster_bits: u32) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        if self.reserved_low_bits() != 0 {
            anomalies.push(Anomaly::L1ReservedLowBits(self.reserved_low_bits()));
        }
        if !is_cluster_aligned(self.l2_offset(), cluster_bits) {
            anomalies.push(Anomaly::MisalignedOffset {
                table: "L2 table",
                offset: self.l2_offset(),
            });
        }
        if self.reserved_high_bits() != 0 {
            anomalies.push(Anomaly::L1ReservedHighBits(self.reserved_high_bits()));
        }
        anomalies
    }
}

/// Iterator over the L1 table of an image, reading one entry per step.
///
/// Stops after `l1_size` entries or after the first error.
pub struct L1Entries<'a, S: ?Sized> {
    reader: FieldReader<'a, S>,
    index: u32,
    count: u32,
    cluster_bits: u32,
    failed: bool,
}

impl<'a, S: ByteSource + ?Sized> L1Entries<'a, S> {
    pub fn new(source: &'a S, header: &Header) -> Self {
        L1Entries {
            reader: FieldReader::new(source, header.l1_table_offset),
            index: 0,
            count: header.l1_size,
            cluster_bits: header.cluster_bits,
            failed: false,
        }
    }
}

impl<S: ByteSource + ?Sized> Iterator for L1Entries<'_, S> {
    type Item = Result<L1Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.count {
            return None;
        }

        let raw = match self.reader.unpack::<u64>() {
            Ok(raw) => raw,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let entry = L1Entry::new(self.index, raw);
        for anomaly in entry.anomalies(self.cluster_bits) {
            warn!("L1 entry {}: {anomaly}", entry.index);
        }
        self.index += 1;

        Some(Ok(entry))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            return (0, Some(0));
        }
        let remaining = (self.count - self.index) as usize;
        (0, Some(remaining))
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::Error;

    const CLUSTER_BITS: u32 = 16;

    #[test]
    fn referenced_entry() {
        let entry = L1Entry::new(0, 0x8000_0000_0001_0000);
        assert_eq!(entry.l2_offset(), 0x1_0000);
        assert_eq!(entry.l2_offset() >> CLUSTER_BITS, 1);
        assert!(entry.refcount_is_one());
        assert_eq!(entry.reserved_low_bits(), 0);
        assert_eq!(entry.reserved_high_bits(), 0);
        assert!(entry.anomalies(CLUSTER_BITS).is_empty());
    }

    #[test]
    fn unused_entry() {
        let entry = L1Entry::new(3, 0);
        assert_eq!(entry.l2_offset(), 0);
        assert!(!entry.refcount_is_one());
        assert!(entry.anomalies(CLUSTER_BITS).is_empty());
    }

    #[test]
    fn offset_uses_bits_9_to_55() {
        let entry = L1Entry::new(0, u64::MAX);
        assert_eq!(entry.l2_offset(), 0x00ff_ffff_ffff_fe00);
        assert_eq!(entry.reserved_low_bits(), 0x1ff);
        assert_eq!(entry.reserved_high_bits(), 0x7f);
        assert!(entry.refcount_is_one());

        // Bit 8 is reserved, bit 9 is the lowest offset bit.
        assert_eq!(L1Entry::new(0, 1 << 8).l2_offset(), 0);
        assert_eq!(L1Entry::new(0, 1 << 9).l2_offset(), 0x200);
        // Bit 55 is the highest offset bit, bit 56 is reserved.
        assert_eq!(L1Entry::new(0, 1 << 55).l2_offset(), 1 << 55);
        assert_eq!(L1Entry::new(0, 1 << 56).l2_offset(), 0);
    }

    #[test]
    fn reserved_bit_anomalies() {
        let entry = L1Entry::new(0, 0x8000_0000_0001_0100);
        assert_eq!(entry.l2_offset(), 0x1_0000);
        assert_eq!(
            entry.anomalies(CLUSTER_BITS),
            vec![Anomaly::L1ReservedLowBits(0x100)]
        );

        let entry = L1Entry::new(0, 0x8300_0000_0001_0000);
        assert_eq!(entry.l2_offset(), 0x1_0000);
        assert!(entry.refcount_is_one());
        assert_eq!(
            entry.anomalies(CLUSTER_BITS),
            vec![Anomaly::L1ReservedHighBits(0x03)]
        );

        let entry = L1Entry::new(0, 0x0000_0000_0001_8000);
        assert_eq!(
            entry.anomalies(CLUSTER_BITS),
            vec![Anomaly::MisalignedOffset {
                table: "L2 table",
                offset: 0x1_8000
            }]
        );
    }

    #[test]
    fn anomalies_flagged_iff_reserved_bits_set() {
        for bit in 0..64 {
            let entry = L1Entry::new(0, 1u64 << bit);
            let anomalies = entry.anomalies(9);
            let reserved = bit < 9 || (56..63).contains(&bit);
            assert_eq!(!anomalies.is_empty(), reserved, "bit {bit}");
        }
    }

    #[test]
    fn huge_clusters() {
        // With 2^64 byte clusters only an unallocated entry is aligned.
        assert!(L1Entry::new(0, 0x8000_0000_0000_0000).anomalies(64).is_empty());
        assert_eq!(
            L1Entry::new(0, 0x8000_0000_0001_0000).anomalies(64),
            vec![Anomaly::MisalignedOffset {
                table: "L2 table",
                offset: 0x1_0000
            }]
        );
    }

    #[test]
    fn walk_table_with_huge_clusters() {
        let mut header = header_for_table(2, 0x200);
        header.cluster_bits = 64;
        let mut image = vec![0u8; 0x200];
        for raw in [0x8000_0000_0000_0400u64, 0] {
            image.extend_from_slice(&raw.to_be_bytes());
        }

        let entries: Vec<L1Entry> = L1Entries::new(image.as_slice(), &header)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(header.cluster_index(entries[0].l2_offset()), 0);
    }

    fn header_for_table(l1_size: u32, l1_table_offset: u64) -> Header {
        let mut bytes = vec![
            0x51, 0x46, 0x49, 0xfb, // magic
            0x00, 0x00, 0x00, 0x02, // version
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // backing file offset
            0x00, 0x00, 0x00, 0x00, // backing file size
            0x00, 0x00, 0x00, 0x09, // cluster_bits
        ];
        bytes.resize(72, 0);
        bytes[36..40].copy_from_slice(&l1_size.to_be_bytes());
        bytes[40..48].copy_from_slice(&l1_table_offset.to_be_bytes());
        Header::decode(bytes.as_slice()).unwrap()
    }

    #[test]
    fn walk_table() {
        let header = header_for_table(3, 0x200);
        let mut image = vec![0u8; 0x200];
        for raw in [0x8000_0000_0000_0400u64, 0, 0x0000_0000_0000_0600] {
            image.extend_from_slice(&raw.to_be_bytes());
        }

        let entries: Vec<L1Entry> = L1Entries::new(image.as_slice(), &header)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            entries,
            vec![
                L1Entry::new(0, 0x8000_0000_0000_0400),
                L1Entry::new(1, 0),
                L1Entry::new(2, 0x600),
            ]
        );
        assert_eq!(header.cluster_index(entries[0].l2_offset()), 2);
        assert_eq!(header.cluster_index(entries[2].l2_offset()), 3);
    }

    #[test]
    fn empty_table() {
        let header = header_for_table(0, 0x200);
        let image = vec![0u8; 0x200];
        assert_eq!(L1Entries::new(image.as_slice(), &header).count(), 0);
    }

    #[test]
    fn truncated_table() {
        let header = header_for_table(4, 0x200);
        let mut image = vec![0u8; 0x200];
        image.extend_from_slice(&0x8000_0000_0000_0400u64.to_be_bytes());
        image.extend_from_slice(&[0; 4]);

        let mut entries = L1Entries::new(image.as_slice(), &header);
        assert_eq!(entries.size_hint(), (0, Some(4)));
        assert!(entries.next().unwrap().is_ok());
        assert!(matches!(
            entries.next(),
            Some(Err(Error::OutOfBounds {
                offset: 0x208,
                length: 8,
                ..
            }))
        ));
        assert!(entries.next().is_none());
    }
}
