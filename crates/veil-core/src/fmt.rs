//! Human-friendly byte-count formatting for connection logs.

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Format a byte count for log output, e.g. `1.25 MiB`.
pub fn fmt_bytes(n: u64) -> String {
    if n < 1024 {
        return format!("{} B", n);
    }
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
