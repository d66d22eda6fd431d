// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use remain::sorted;
use thiserror::Error;

/// A field value that violates the qcow2 format without preventing further
/// decoding. Anomalies are collected and reported, never returned as errors.
#[sorted]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Anomaly {
    #[error("backing file name is {0} bytes, over the 1023 byte limit")]
    BackingFileTooLong(u32),
    #[error("cluster bits {0} outside the supported range 9-21")]
    ClusterBitsOutOfRange(u32),
    #[error("header length {0} is not a valid v3 header length")]
    InvalidHeaderLength(u32),
    #[error("unknown value for bits 56-62: {0:#x}")]
    L1ReservedHighBits(u64),
    #[error("unknown value for bits 0-8: {0:#x}")]
    L1ReservedLowBits(u64),
    #[error("{table} offset {offset:#x} is not aligned to a cluster boundary")]
    MisalignedOffset { table: &'static str, offset: u64 },
    #[error("feature name table of {length} bytes ends with a partial {remainder} byte entry")]
    PartialFeatureNameEntry { length: u32, remainder: u32 },
    #[error("refcount order {0} is larger than 6")]
    RefcountOrderTooLarge(u32),
    #[error("unknown compression type {0}")]
    UnknownCompressionType(u8),
    #[error("unknown encryption method {0}")]
    UnknownCryptMethod(u32),
    #[error("unknown {kind} feature bits {bits:#x}")]
    UnknownFeatureBits { kind: &'static str, bits: u64 },
    #[error("unknown feature type {0} in feature name table")]
    UnknownFeatureType(u8),
}
