//! Utility functions

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// File name of brick `index` inside the output directory
pub fn brick_filename(index: usize) -> String {
    format!("{}.raw", index)
}

/// Smallest power of two `>= value` (1 for 0)
pub fn next_pow2(value: u32) -> u32 {
    value.max(1).next_power_of_two()
}

/// Round `value` up to a multiple of `multiple` (`multiple > 0`)
pub fn round_up(value: u32, multiple: u32) -> u32 {
    value.div_ceil(multiple) * multiple
}
