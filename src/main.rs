// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use std::io::{self, BufWriter, Write};
use std::process;

use anyhow::Context;
use clap::{Arg, Command};
use log::debug;
use qcow::{ByteSource, MappedFile};
use qcow_inspect::{cli_print_error_chain, exit_code};

fn inspect_image(path: &str) -> anyhow::Result<()> {
    let image = MappedFile::open(path).with_context(|| format!("Failed to open image {path}"))?;
    debug!("Mapped {path}: {} bytes", image.size());

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    // Whatever was decoded before a failure is still flushed.
    let result = qcow::inspect(&image, &mut out);
    out.flush().context("Failed to write report")?;

    let header = result.with_context(|| format!("Failed to inspect image {path}"))?;
    debug!(
        "Inspected {path}: version {}, {} L1 entries, {} anomalies",
        header.version,
        header.l1_size,
        header.anomalies.len()
    );

    Ok(())
}

fn main() {
    env_logger::init();

    let cmd_arguments = Command::new("qcow-inspect")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Print the header, header extensions and L1 table of a qcow2 image.")
        .arg_required_else_help(true)
        .arg(
            Arg::new("image")
                .help("Path to the qcow2 image")
                .num_args(1)
                .required(true),
        )
        .get_matches();

    // Required argument, clap exits before this point when it is missing.
    let Some(path) = cmd_arguments.get_one::<String>("image") else {
        process::exit(1);
    };

    if let Err(e) = inspect_image(path) {
        cli_print_error_chain(&*e, "qcow-inspect");
        process::exit(exit_code(&e));
    }
}
