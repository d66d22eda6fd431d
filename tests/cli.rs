// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output};

use vmm_sys_util::tempfile::TempFile;

fn qcow_inspect(image: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_qcow-inspect"))
        .arg(image)
        .output()
        .unwrap()
}

// A 72 byte header with a one entry L1 table in the second 64 KiB cluster,
// followed by `tail`.
fn image_file(version: u32, tail: &[u8]) -> TempFile {
    let mut image = Vec::new();
    image.extend_from_slice(b"QFI\xfb");
    image.extend_from_slice(&version.to_be_bytes());
    image.extend_from_slice(&[0; 12]); // backing file offset and size
    image.extend_from_slice(&16u32.to_be_bytes()); // cluster_bits
    image.extend_from_slice(&(1u64 << 30).to_be_bytes()); // size
    image.extend_from_slice(&0u32.to_be_bytes()); // crypt method
    image.extend_from_slice(&1u32.to_be_bytes()); // l1_size
    image.extend_from_slice(&0x1_0000u64.to_be_bytes()); // l1_table_offset
    image.resize(0x1_0000, 0);
    image.extend_from_slice(tail);

    let file = TempFile::new().unwrap();
    file.as_file().write_all(&image).unwrap();
    file
}

#[test]
fn prints_report() {
    let file = image_file(2, &0x8000_0000_0001_0000u64.to_be_bytes());
    let output = qcow_inspect(file.as_path());
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.starts_with("qcow2 version: 2\n"));
    assert!(stdout.contains("L1 table entry 0 of 1\n"));
    assert!(stdout.contains("    L2 offset: 65536 (cluster 1)\n"));
    assert!(stdout.contains("    entry reference count is exactly 1\n"));
}

#[test]
fn unsupported_version() {
    let file = image_file(5, &0x8000_0000_0001_0000u64.to_be_bytes());
    let output = qcow_inspect(file.as_path());
    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());

    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Unsupported version: 5"));
}

#[test]
fn truncated_l1_table() {
    let file = image_file(2, &[0; 4]);
    let output = qcow_inspect(file.as_path());
    assert_eq!(output.status.code(), Some(1));

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.starts_with("qcow2 version: 2\n"));
    assert!(!stdout.contains("L1 table entry 0"));

    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("past the end of the 65540 byte image"));
}

#[test]
fn missing_image() {
    let output = qcow_inspect(Path::new("/nonexistent/image.qcow2"));
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Failed to open image /nonexistent/image.qcow2"));
}

#[test]
fn requires_image_argument() {
    let output = Command::new(env!("CARGO_BIN_EXE_qcow-inspect"))
        .output()
        .unwrap();
    assert!(!output.status.success());
}
