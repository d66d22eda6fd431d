// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Read-only inspection of qcow2 disk images.
//!
//! The crate is layered bottom-up: [`mmap`] exposes a file as a bounds-checked
//! byte window, [`reader`] walks that window decoding big-endian fields, and
//! [`header`], [`extension`] and [`l1`] decode the qcow2 metadata on top of it.
//! Nothing here ever writes to the image.

pub mod anomaly;
pub mod extension;
pub mod header;
pub mod l1;
pub mod mmap;
pub mod reader;
pub mod report;

use std::io::{self, Write};

use log::debug;
use remain::sorted;
use thiserror::Error;

pub use crate::anomaly::Anomaly;
pub use crate::extension::{ExtensionPayload, FeatureName, FeatureType, HeaderExtension};
pub use crate::header::{
    AutoclearFeatures, CompatFeatures, CompressionType, CryptMethod, Header, IncompatFeatures,
};
pub use crate::l1::{L1Entries, L1Entry};
pub use crate::mmap::{ByteSource, MappedFile};
pub use crate::reader::FieldReader;

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get file size")]
    GettingFileSize(#[source] io::Error),
    #[error("Invalid magic {0:02x?}, not a qcow2 image")]
    InvalidMagic([u8; 4]),
    #[error("Failed to map file")]
    MappingFile(#[source] io::Error),
    #[error("Failed to open file")]
    OpeningFile(#[source] io::Error),
    #[error("Read of {length} bytes at offset {offset} is past the end of the {size} byte image")]
    OutOfBounds { offset: u64, length: usize, size: u64 },
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("Failed to write report")]
    WritingReport(#[source] io::Error),
}

impl Error {
    /// True for errors meaning the bytes are not a qcow2 image this crate understands.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Error::InvalidMagic(_) | Error::UnsupportedVersion(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decodes the header of `source`, then walks its L1 table, writing a report of
/// both to `out` as it goes.
///
/// The header section is written in full before the L1 pass starts, so a
/// truncated L1 table still leaves the header report and every entry decoded
/// before the failure in `out`.
pub fn inspect<S, W>(source: &S, out: &mut W) -> Result<Header>
where
    S: ByteSource + ?Sized,
    W: Write,
{
    let header = Header::decode(source)?;
    report::write_header(out, &header).map_err(Error::WritingReport)?;

    debug!(
        "Walking {} L1 entries at offset {:#x}",
        header.l1_size, header.l1_table_offset
    );
    for entry in L1Entries::new(source, &header) {
        report::write_l1_entry(out, &header, &entry?).map_err(Error::WritingReport)?;
    }

    Ok(header)
}
