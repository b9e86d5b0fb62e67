// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Helpers for sizing diagnostics.

use std::fmt::Write;

/// Largest value of `values`, 0 if there is none.
#[must_use]
pub fn max_value(values: &[u32]) -> u32 {
    values.iter().copied().max().unwrap_or(0)
}

/// Number of decimal digits of `n`. Zero has one digit.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // at most 10 digits
pub fn digit_count(n: u32) -> u8 {
    n.checked_ilog10().map_or(1, |log| log as u8 + 1)
}

/// Render `(label, value)` rows with the values right aligned.
#[must_use]
pub fn sizing_table(rows: &[(&str, u32)]) -> String {
    let values: Vec<u32> = rows.iter().map(|(_, v)| *v).collect();
    let width = usize::from(digit_count(max_value(&values)));
    let label_width = rows.iter().map(|(l, _)| l.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (label, value) in rows {
        let _ = writeln!(out, "  {label:<label_width$} {value:>width$}");
    }
    out
}
