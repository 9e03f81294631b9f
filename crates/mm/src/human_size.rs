//! Human-readable size formatting for memory statistics.

use core::fmt;

/// Wraps a size in bytes and formats it with binary prefixes (KiB, MiB, GiB, TiB).
///
/// Sizes below 1 KiB are printed as plain bytes. Larger sizes are printed in the
/// largest unit that keeps the integer part non-zero, with one decimal digit when
/// the value is not a whole number of that unit.
///
/// ```
/// use mm::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(512)), "512B");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// assert_eq!(format!("{}", HumanSize(1 << 20)), "1MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl From<usize> for HumanSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

        let bytes = self.0 as u128;
        if bytes < 1024 {
            return write!(f, "{}B", bytes);
        }

        let mut unit = 0;
        let mut scale: u128 = 1024;
        while unit + 1 < UNITS.len() && bytes >= scale * 1024 {
            scale *= 1024;
            unit += 1;
        }

        let whole = bytes / scale;
        let tenths = (bytes % scale) * 10 / scale;
        if tenths == 0 {
            write!(f, "{}{}", whole, UNITS[unit])
        } else {
            write!(f, "{}.{}{}", whole, tenths, UNITS[unit])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(HumanSize(0).to_string(), "0B");
        assert_eq!(HumanSize(32).to_string(), "32B");
        assert_eq!(HumanSize(1023).to_string(), "1023B");
    }

    #[test]
    fn formats_binary_units() {
        assert_eq!(HumanSize(1024).to_string(), "1KiB");
        assert_eq!(HumanSize(1536).to_string(), "1.5KiB");
        assert_eq!(HumanSize(1 << 20).to_string(), "1MiB");
        assert_eq!(HumanSize(3 << 29).to_string(), "1.5GiB");
        assert_eq!(HumanSize(1 << 40).to_string(), "1TiB");
    }

    #[test]
    fn truncates_to_one_decimal() {
        assert_eq!(HumanSize(1025).to_string(), "1KiB");
        assert_eq!(HumanSize(1024 + 1000).to_string(), "1.9KiB");
    }
}
