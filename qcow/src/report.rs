// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Line oriented, human readable report of decoded qcow2 metadata.

use std::io::{self, Write};

use bitflags::Flags;

use crate::anomaly::Anomaly;
use crate::extension::{ExtensionPayload, HeaderExtension};
use crate::header::Header;
use crate::l1::L1Entry;

// "0x9 (DIRTY | COMPRESSION)" for known bits, plain hex otherwise.
fn describe_features<F: Flags<Bits = u64>>(flags: &F) -> String {
    let names: Vec<&str> = flags.iter_names().map(|(name, _)| name).collect();
    if names.is_empty() {
        format!("{:#x}", flags.bits())
    } else {
        format!("{:#x} ({})", flags.bits(), names.join(" | "))
    }
}

fn hex_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// Header field an anomaly is reported under.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Field {
    BackingFile,
    ClusterBits,
    CryptMethod,
    L1Table,
    RefcountTable,
    SnapshotTable,
    IncompatFeatures,
    CompatFeatures,
    AutoclearFeatures,
    RefcountOrder,
    HeaderLength,
    CompressionType,
    // Reported with the entry or extension that carries them.
    Elsewhere,
}

fn field_of(anomaly: &Anomaly) -> Field {
    match anomaly {
        Anomaly::BackingFileTooLong(_) => Field::BackingFile,
        Anomaly::ClusterBitsOutOfRange(_) => Field::ClusterBits,
        Anomaly::InvalidHeaderLength(_) => Field::HeaderLength,
        Anomaly::MisalignedOffset { table, .. } => match *table {
            "L1 table" => Field::L1Table,
            "refcount table" => Field::RefcountTable,
            "snapshot table" => Field::SnapshotTable,
            _ => Field::Elsewhere,
        },
        Anomaly::RefcountOrderTooLarge(_) => Field::RefcountOrder,
        Anomaly::UnknownCompressionType(_) => Field::CompressionType,
        Anomaly::UnknownCryptMethod(_) => Field::CryptMethod,
        Anomaly::UnknownFeatureBits { kind, .. } => match *kind {
            "incompatible" => Field::IncompatFeatures,
            "compatible" => Field::CompatFeatures,
            "autoclear" => Field::AutoclearFeatures,
            _ => Field::Elsewhere,
        },
        Anomaly::L1ReservedHighBits(_)
        | Anomaly::L1ReservedLowBits(_)
        | Anomaly::PartialFeatureNameEntry { .. }
        | Anomaly::UnknownFeatureType(_) => Field::Elsewhere,
    }
}

fn write_warnings<W: Write>(out: &mut W, header: &Header, field: Field) -> io::Result<()> {
    for anomaly in header.anomalies.iter().filter(|a| field_of(a) == field) {
        writeln!(out, "    Warning: {anomaly}")?;
    }
    Ok(())
}

fn write_cluster_bits<W: Write>(out: &mut W, header: &Header) -> io::Result<()> {
    match header.cluster_size() {
        Some(size) => writeln!(
            out,
            "Cluster bits: {} ({size} bytes per cluster)",
            header.cluster_bits
        ),
        None => writeln!(
            out,
            "Cluster bits: {} (cluster size too large to represent)",
            header.cluster_bits
        ),
    }
}

/// Writes everything decoded by [`Header::decode`]. Each anomaly is written
/// right below the field it concerns.
pub fn write_header<W: Write>(out: &mut W, header: &Header) -> io::Result<()> {
    writeln!(out, "qcow2 version: {}", header.version)?;
    writeln!(out)?;

    writeln!(out, "Backing file offset: {}", header.backing_file_offset)?;
    writeln!(out, "Backing file size: {}", header.backing_file_size)?;
    write_warnings(out, header, Field::BackingFile)?;
    if let Some(path) = &header.backing_file {
        writeln!(out, "Backing file path: {path}")?;
    }
    writeln!(out)?;

    write_cluster_bits(out, header)?;
    write_warnings(out, header, Field::ClusterBits)?;
    writeln!(out, "Virtual size: {}", header.size)?;
    writeln!(out, "Encryption method: {}", header.crypt_method)?;
    write_warnings(out, header, Field::CryptMethod)?;
    writeln!(out)?;

    writeln!(out, "L1 table entries: {}", header.l1_size)?;
    writeln!(
        out,
        "L1 table offset: {} (cluster {})",
        header.l1_table_offset,
        header.cluster_index(header.l1_table_offset)
    )?;
    write_warnings(out, header, Field::L1Table)?;
    writeln!(out)?;

    writeln!(
        out,
        "Refcount table offset: {} (cluster {})",
        header.refcount_table_offset,
        header.cluster_index(header.refcount_table_offset)
    )?;
    write_warnings(out, header, Field::RefcountTable)?;
    writeln!(
        out,
        "Refcount table clusters: {}",
        header.refcount_table_clusters
    )?;
    writeln!(out)?;

    writeln!(out, "Snapshots: {}", header.nb_snapshots)?;
    writeln!(
        out,
        "Snapshot table offset: {} (cluster {})",
        header.snapshots_offset,
        header.cluster_index(header.snapshots_offset)
    )?;
    write_warnings(out, header, Field::SnapshotTable)?;
    writeln!(out)?;

    if header.version == 3 {
        writeln!(
            out,
            "Incompatible features: {}",
            describe_features(&header.incompatible_features)
        )?;
        write_warnings(out, header, Field::IncompatFeatures)?;
        writeln!(
            out,
            "Compatible features: {}",
            describe_features(&header.compatible_features)
        )?;
        write_warnings(out, header, Field::CompatFeatures)?;
        writeln!(
            out,
            "Autoclear features: {}",
            describe_features(&header.autoclear_features)
        )?;
        write_warnings(out, header, Field::AutoclearFeatures)?;
        writeln!(out, "Refcount order: {}", header.refcount_order)?;
        write_warnings(out, header, Field::RefcountOrder)?;
        writeln!(out, "Header length: {}", header.header_size)?;
        write_warnings(out, header, Field::HeaderLength)?;
        writeln!(
            out,
            "Compression type: {} ({})",
            header.compression_type.raw(),
            header.compression_type
        )?;
        write_warnings(out, header, Field::CompressionType)?;
        writeln!(out)?;

        for (count, extension) in header.extensions.iter().enumerate() {
            write_extension(out, count, extension)?;
        }
    }

    Ok(())
}

fn write_extension<W: Write>(
    out: &mut W,
    count: usize,
    extension: &HeaderExtension,
) -> io::Result<()> {
    writeln!(
        out,
        "Header extension {count} type {:#x} ({}) at offset {}",
        extension.ext_type,
        extension.type_name(),
        extension.offset
    )?;
    writeln!(out, "    length: {}", extension.length)?;
    match &extension.payload {
        ExtensionPayload::BackingFormat(format) => {
            writeln!(out, "    backing file format: {format}")?;
        }
        ExtensionPayload::FeatureNameTable(names) => {
            for feature in names {
                writeln!(
                    out,
                    "    {} bit {} named {}",
                    feature.feature_type, feature.bit, feature.name
                )?;
            }
        }
        ExtensionPayload::Raw(data) => {
            writeln!(out, "    data: {}", hex_bytes(data))?;
        }
    }
    writeln!(out, "    padding: {}", extension.padding)?;
    for anomaly in &extension.anomalies {
        writeln!(out, "    Warning: {anomaly}")?;
    }
    writeln!(out)
}

/// Writes one L1 table entry.
pub fn write_l1_entry<W: Write>(out: &mut W, header: &Header, entry: &L1Entry) -> io::Result<()> {
    writeln!(out, "L1 table entry {} of {}", entry.index, header.l1_size)?;

    let (low, rest): (Vec<Anomaly>, Vec<Anomaly>) = entry
        .anomalies(header.cluster_bits)
        .into_iter()
        .partition(|anomaly| matches!(anomaly, Anomaly::L1ReservedLowBits(_)));
    for anomaly in &low {
        writeln!(out, "    {anomaly}")?;
    }

    writeln!(
        out,
        "    L2 offset: {} (cluster {})",
        entry.l2_offset(),
        header.cluster_index(entry.l2_offset())
    )?;
    for anomaly in &rest {
        writeln!(out, "    {anomaly}")?;
    }

    if entry.refcount_is_one() {
        writeln!(out, "    entry reference count is exactly 1")
    } else {
        writeln!(out, "    entry is unused or requires COW")
    }
}
