// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! QCOW2 header decoding for version 2 and 3 images.

use std::fmt::{Display, Formatter, Result as FmtResult};

use bitflags::bitflags;
use log::{debug, warn};

use crate::anomaly::Anomaly;
use crate::extension::{self, HeaderExtension};
use crate::mmap::ByteSource;
use crate::reader::FieldReader;
use crate::{Error, Result};

// QCOW magic that starts the header, "QFI\xfb".
pub const QCOW_MAGIC: [u8; 4] = [0x51, 0x46, 0x49, 0xfb];
// Limit clusters to reasonable sizes. Choose the same limits as qemu.
pub const MIN_CLUSTER_BITS: u32 = 9;
pub const MAX_CLUSTER_BITS: u32 = 21;
// 16-bit refcounts.
pub const DEFAULT_REFCOUNT_ORDER: u32 = 4;
// 64-bit refcounts.
const MAX_REFCOUNT_ORDER: u32 = 6;

pub const V2_BARE_HEADER_SIZE: u32 = 72;
pub const V3_BARE_HEADER_SIZE: u32 = 104;
// v3 header including the compression type byte and its padding.
pub const V3_HEADER_SIZE: u32 = 112;
const V3_COMPRESSION_PADDING: u64 = 7;

// Defined by the specification
const MAX_BACKING_FILE_SIZE: u32 = 1023;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFeatures: u64 {
        const DIRTY = 1 << 0;
        const CORRUPT = 1 << 1;
        const DATA_FILE = 1 << 2;
        const COMPRESSION = 1 << 3;
        const EXTENDED_L2 = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompatFeatures: u64 {
        const LAZY_REFCOUNTS = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AutoclearFeatures: u64 {
        const BITMAPS = 1 << 0;
        const RAW_EXTERNAL = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CryptMethod {
    None,
    Aes,
    Luks,
    Unknown(u32),
}

impl CryptMethod {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => CryptMethod::None,
            1 => CryptMethod::Aes,
            2 => CryptMethod::Luks,
            other => CryptMethod::Unknown(other),
        }
    }
}

impl Display for CryptMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            CryptMethod::None => write!(f, "unencrypted"),
            CryptMethod::Aes => write!(f, "AES"),
            CryptMethod::Luks => write!(f, "LUKS"),
            CryptMethod::Unknown(_) => write!(f, "unknown"),
        }
    }
}

// Compression types as defined in https://www.qemu.org/docs/master/interop/qcow2.html
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionType {
    Deflate,
    Zstd,
    Unknown(u8),
}

impl CompressionType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => CompressionType::Deflate,
            1 => CompressionType::Zstd,
            other => CompressionType::Unknown(other),
        }
    }

    pub fn raw(&self) -> u8 {
        match self {
            CompressionType::Deflate => 0,
            CompressionType::Zstd => 1,
            CompressionType::Unknown(raw) => *raw,
        }
    }
}

impl Display for CompressionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            CompressionType::Deflate => write!(f, "deflate"),
            CompressionType::Zstd => write!(f, "zstd"),
            CompressionType::Unknown(_) => write!(f, "unknown"),
        }
    }
}

/// Contains the information from the header of a qcow file.
///
/// Version 2 images report empty feature bits, deflate compression, a
/// refcount order of 4 and a header length of 72.
#[derive(Clone, Debug)]
pub struct Header {
    pub version: u32,

    pub backing_file_offset: u64,
    pub backing_file_size: u32,

    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: CryptMethod,

    pub l1_size: u32,
    pub l1_table_offset: u64,

    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,

    pub nb_snapshots: u32,
    pub snapshots_offset: u64,

    // v3 entries
    pub incompatible_features: IncompatFeatures,
    pub compatible_features: CompatFeatures,
    pub autoclear_features: AutoclearFeatures,
    pub refcount_order: u32,
    pub header_size: u32,
    pub compression_type: CompressionType,

    // Post-header entries
    pub backing_file: Option<String>,
    pub extensions: Vec<HeaderExtension>,
    pub anomalies: Vec<Anomaly>,
}

impl Header {
    /// Decodes the header, the backing file name and, for v3 images, the
    /// header extensions.
    ///
    /// Bad magic or an unsupported version fail before any other field is
    /// read. Fields that decode but hold invalid values are recorded in
    /// `anomalies` instead of failing.
    pub fn decode<S: ByteSource + ?Sized>(source: &S) -> Result<Header> {
        let mut reader = FieldReader::new(source, 0);
        let (magic, version) = reader.unpack::<([u8; 4], u32)>()?;
        if magic != QCOW_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        if version != 2 && version != 3 {
            return Err(Error::UnsupportedVersion(version));
        }
        debug!("Decoding qcow2 version {version} header");

        let mut anomalies = Vec::new();

        let (backing_file_offset, backing_file_size) = reader.unpack::<(u64, u32)>()?;
        let backing_file = if backing_file_offset != 0 {
            if backing_file_size > MAX_BACKING_FILE_SIZE {
                anomalies.push(Anomaly::BackingFileTooLong(backing_file_size));
            }
            let mut path_reader = FieldReader::new(source, backing_file_offset);
            Some(path_reader.read_string(backing_file_size as usize)?)
        } else {
            None
        };

        let (
            cluster_bits,
            size,
            crypt_method,
            l1_size,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
            nb_snapshots,
            snapshots_offset,
        ) = reader.unpack::<(u32, u64, u32, u32, u64, u64, u32, u32, u64)>()?;

        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
            anomalies.push(Anomaly::ClusterBitsOutOfRange(cluster_bits));
        }
        let crypt_method = CryptMethod::from_raw(crypt_method);
        if let CryptMethod::Unknown(raw) = crypt_method {
            anomalies.push(Anomaly::UnknownCryptMethod(raw));
        }

        for (table, offset) in [
            ("L1 table", l1_table_offset),
            ("refcount table", refcount_table_offset),
            ("snapshot table", snapshots_offset),
        ] {
            if !is_cluster_aligned(offset, cluster_bits) {
                anomalies.push(Anomaly::MisalignedOffset { table, offset });
            }
        }

        let mut header = Header {
            version,
            backing_file_offset,
            backing_file_size,
            cluster_bits,
            size,
            crypt_method,
            l1_size,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
            nb_snapshots,
            snapshots_offset,
            incompatible_features: IncompatFeatures::empty(),
            compatible_features: CompatFeatures::empty(),
            autoclear_features: AutoclearFeatures::empty(),
            refcount_order: DEFAULT_REFCOUNT_ORDER,
            header_size: V2_BARE_HEADER_SIZE,
            compression_type: CompressionType::Deflate,
            backing_file,
            extensions: Vec::new(),
            anomalies: Vec::new(),
        };

        if version == 3 {
            header.decode_v3(source, &mut reader, &mut anomalies)?;
        }

        for anomaly in &anomalies {
            warn!("qcow2 header: {anomaly}");
        }
        header.anomalies = anomalies;

        Ok(header)
    }

    /// Decodes the v3 fields and the header extensions.
    ///
    /// When `header_length` is a multiple of 8 and at least 112 the
    /// extensions are read from `header_length`, not from the stream
    /// position right after the compression padding (byte 112). The two
    /// differ only for headers carrying fields newer than the compression
    /// type. A `header_length` of 104 starts them at 104; any other value is
    /// flagged and falls back to byte 112.
    fn decode_v3<S: ByteSource + ?Sized>(
        &mut self,
        source: &S,
        reader: &mut FieldReader<'_, S>,
        anomalies: &mut Vec<Anomaly>,
    ) -> Result<()> {
        let (incompatible, compatible, autoclear, refcount_order, header_size) =
            reader.unpack::<(u64, u64, u64, u32, u32)>()?;

        self.incompatible_features = IncompatFeatures::from_bits_retain(incompatible);
        self.compatible_features = CompatFeatures::from_bits_retain(compatible);
        self.autoclear_features = AutoclearFeatures::from_bits_retain(autoclear);
        self.refcount_order = refcount_order;
        self.header_size = header_size;

        for (kind, bits) in [
            ("incompatible", incompatible & !IncompatFeatures::all().bits()),
            ("compatible", compatible & !CompatFeatures::all().bits()),
            ("autoclear", autoclear & !AutoclearFeatures::all().bits()),
        ] {
            if bits != 0 {
                anomalies.push(Anomaly::UnknownFeatureBits { kind, bits });
            }
        }
        if refcount_order > MAX_REFCOUNT_ORDER {
            anomalies.push(Anomaly::RefcountOrderTooLarge(refcount_order));
        }

        // Images written before the compression type field existed end the
        // header at 104 bytes and implicitly use deflate.
        let extensions_start = if header_size == V3_BARE_HEADER_SIZE {
            u64::from(V3_BARE_HEADER_SIZE)
        } else {
            let raw = reader.unpack::<u8>()?;
            self.compression_type = CompressionType::from_raw(raw);
            if let CompressionType::Unknown(raw) = self.compression_type {
                anomalies.push(Anomaly::UnknownCompressionType(raw));
            }
            reader.skip(V3_COMPRESSION_PADDING);

            if header_size >= V3_HEADER_SIZE && header_size % 8 == 0 {
                u64::from(header_size)
            } else {
                anomalies.push(Anomaly::InvalidHeaderLength(header_size));
                reader.offset()
            }
        };

        self.extensions = extension::read_extensions(source, extensions_start, anomalies)?;
        Ok(())
    }

    /// Cluster size in bytes, `None` when `cluster_bits` is 64 or more.
    pub fn cluster_size(&self) -> Option<u64> {
        1u64.checked_shl(self.cluster_bits)
    }

    /// Index of the cluster containing `offset`. Every offset lies in
    /// cluster 0 when the cluster size does not fit in a u64.
    pub fn cluster_index(&self, offset: u64) -> u64 {
        offset.checked_shr(self.cluster_bits).unwrap_or(0)
    }
}

/// True if `offset` is a multiple of `1 << cluster_bits`, for any
/// `cluster_bits`.
pub fn is_cluster_aligned(offset: u64, cluster_bits: u32) -> bool {
    offset == 0 || offset.trailing_zeros() >= cluster_bits
}
