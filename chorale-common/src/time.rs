//! Time-unit constants and conversions.
//!
//! The engine contract speaks nanoseconds; the audio backends speak
//! milliseconds. Conversions live here so the factors are written once.

/// Nanoseconds per millisecond
pub const NSEC_PER_MSEC: u64 = 1_000_000;

/// Nanoseconds per second
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Milliseconds per second
pub const MSEC_PER_SEC: u64 = 1_000;

/// Convert nanoseconds to whole milliseconds (truncating)
pub fn ns_to_ms(ns: u64) -> u64 {
    ns / NSEC_PER_MSEC
}

/// Convert milliseconds to nanoseconds
pub fn ms_to_ns(ms: u64) -> u64 {
    ms * NSEC_PER_MSEC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ns_ms_round_trip() {
        assert_eq!(ns_to_ms(ms_to_ns(1234)), 1234);
    }

    #[test]
    fn test_ns_to_ms_truncates() {
        assert_eq!(ns_to_ms(1_999_999), 1);
        assert_eq!(ns_to_ms(2_000_000), 2);
    }
}
