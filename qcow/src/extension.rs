// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! QCOW2 v3 header extensions.
//!
//! The extension area is a sequence of `(type: u32, length: u32, data)` records,
//! each padded to a multiple of 8 bytes and terminated by a record of type 0.

use std::fmt::{Display, Formatter, Result as FmtResult};

use log::debug;

use crate::anomaly::Anomaly;
use crate::mmap::ByteSource;
use crate::reader::{lossy_string, FieldReader};
use crate::Result;

// Header extension types
pub const HEADER_EXT_END: u32 = 0x00000000;
// Backing file format name (raw, qcow2)
pub const HEADER_EXT_BACKING_FORMAT: u32 = 0xe2792aca;
// Feature name table
pub const HEADER_EXT_FEATURE_NAME_TABLE: u32 = 0x6803f857;
pub const HEADER_EXT_BITMAPS: u32 = 0x23852875;
// Full disk encryption header pointer
pub const HEADER_EXT_CRYPTO: u32 = 0x0537be77;
pub const HEADER_EXT_DATA_FILE: u32 = 0x44415441;

const FEATURE_NAME_LEN: usize = 46;
const FEATURE_NAME_ENTRY_SIZE: u32 = 1 + 1 + FEATURE_NAME_LEN as u32; // type + bit + name

/// Number of zero bytes following an extension payload of `length` bytes.
pub fn padding_for(length: u32) -> u32 {
    (8 - length % 8) % 8
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeatureType {
    Incompatible,
    Compatible,
    Autoclear,
    Unknown(u8),
}

impl FeatureType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => FeatureType::Incompatible,
            1 => FeatureType::Compatible,
            2 => FeatureType::Autoclear,
            other => FeatureType::Unknown(other),
        }
    }
}

impl Display for FeatureType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            FeatureType::Incompatible => write!(f, "incompatible"),
            FeatureType::Compatible => write!(f, "compatible"),
            FeatureType::Autoclear => write!(f, "autoclear"),
            FeatureType::Unknown(_) => write!(f, "unknown"),
        }
    }
}

/// One entry of the feature name table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureName {
    pub feature_type: FeatureType,
    pub bit: u8,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtensionPayload {
    BackingFormat(String),
    FeatureNameTable(Vec<FeatureName>),
    Raw(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderExtension {
    pub ext_type: u32,
    /// Offset of the extension's type field in the image.
    pub offset: u64,
    pub length: u32,
    pub payload: ExtensionPayload,
    pub padding: u32,
    /// Problems found while decoding the payload.
    pub anomalies: Vec<Anomaly>,
}

impl HeaderExtension {
    pub fn type_name(&self) -> &'static str {
        match self.ext_type {
            HEADER_EXT_BACKING_FORMAT => "backing file format",
            HEADER_EXT_FEATURE_NAME_TABLE => "feature name table",
            HEADER_EXT_BITMAPS => "bitmaps",
            HEADER_EXT_CRYPTO => "full disk encryption header pointer",
            HEADER_EXT_DATA_FILE => "external data file name",
            _ => "unknown",
        }
    }
}

/// Reads header extensions starting at `offset` up to the end marker.
///
/// Payload anomalies are kept on their extension and also appended to
/// `anomalies`.
///
/// A missing end marker runs into the end of the image and fails with
/// `OutOfBounds`, as does a payload running past it.
pub(crate) fn read_extensions<S: ByteSource + ?Sized>(
    source: &S,
    offset: u64,
    anomalies: &mut Vec<Anomaly>,
) -> Result<Vec<HeaderExtension>> {
    let mut reader = FieldReader::new(source, offset);
    let mut extensions = Vec::new();

    loop {
        let offset = reader.offset();
        let ext_type = reader.unpack::<u32>()?;
        if ext_type == HEADER_EXT_END {
            debug!("End of header extensions at offset {offset:#x}");
            break;
        }

        let length = reader.unpack::<u32>()?;
        debug!("Header extension {ext_type:#x} at offset {offset:#x}, {length} bytes");

        let mut ext_anomalies = Vec::new();
        let payload = match ext_type {
            HEADER_EXT_BACKING_FORMAT => {
                ExtensionPayload::BackingFormat(reader.read_string(length as usize)?)
            }
            HEADER_EXT_FEATURE_NAME_TABLE => ExtensionPayload::FeatureNameTable(
                read_feature_names(&mut reader, length, &mut ext_anomalies)?,
            ),
            _ => ExtensionPayload::Raw(reader.read_bytes(length as usize)?.to_vec()),
        };

        // Skip to the next 8 byte boundary
        let padding = padding_for(length);
        reader.skip(u64::from(padding));

        anomalies.extend(ext_anomalies.iter().cloned());
        extensions.push(HeaderExtension {
            ext_type,
            offset,
            length,
            payload,
            padding,
            anomalies: ext_anomalies,
        });
    }

    Ok(extensions)
}

fn read_feature_names<S: ByteSource + ?Sized>(
    reader: &mut FieldReader<'_, S>,
    length: u32,
    anomalies: &mut Vec<Anomaly>,
) -> Result<Vec<FeatureName>> {
    let mut names = Vec::new();
    for _ in 0..length / FEATURE_NAME_ENTRY_SIZE {
        let (raw_type, bit, name) = reader.unpack::<(u8, u8, [u8; FEATURE_NAME_LEN])>()?;
        let feature_type = FeatureType::from_raw(raw_type);
        if let FeatureType::Unknown(raw) = feature_type {
            anomalies.push(Anomaly::UnknownFeatureType(raw));
        }
        names.push(FeatureName {
            feature_type,
            bit,
            name: lossy_string(&name),
        });
    }

    let remainder = length % FEATURE_NAME_ENTRY_SIZE;
    if remainder != 0 {
        anomalies.push(Anomaly::PartialFeatureNameEntry { length, remainder });
        reader.read_bytes(remainder as usize)?;
    }

    Ok(names)
}
