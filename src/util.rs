/// Fraction of `total` that `written` represents, clamped to `[0.0, 1.0]`.
///
/// A zero total means there is nothing left to transfer, so it reads as complete.
#[must_use]
pub fn progress_fraction(written: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (written as f64 / total as f64).min(1.0)
}

/// Compute progress as a whole percentage for display.
#[must_use]
pub fn progress_percent(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * 100.0).round() as u64
}

/// Render a byte count in human-friendly units.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;

    let value = bytes as f64;
    if value < KIB {
        format!("{bytes} B")
    } else if value < MIB {
        format!("{:.1} KB", value / KIB)
    } else {
        format!("{:.1} MB", value / MIB)
    }
}
