//! Utility functions

/// transform bytes into a human readable format.
pub fn to_human_readable(n: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

    if n < 1000 {
        return format!("{n} B");
    }

    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    format!("{value:.2} {}", UNITS[unit])
}

/// Percentage of `part` in `total`, 100 when `total` is zero.
pub fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    part as f64 / total as f64 * 100.0
}
