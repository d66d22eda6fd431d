// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;

/// Prints a chain of errors to the user in a consistent manner.
/// The user will see the failing operation first, followed by every cause
/// down to the lowest level error.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    eprint!("Error: {component} failed with the following ");
    if top_error.source().is_none() {
        eprintln!("error:");
        eprintln!("  {top_error}");
    } else {
        eprintln!("chain of errors:");
        std::iter::successors(Some(top_error), |sub_error| (*sub_error).source())
            .enumerate()
            .for_each(|(level, error)| {
                eprintln!("  {level}: {error}");
            });
    }
}

/// Process exit code for a failed inspection: 2 when the image is not a
/// qcow2 image this tool understands, 1 for every other failure.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<qcow::Error>() {
        Some(e) if e.is_format_error() => 2,
        _ => 1,
    }
}
