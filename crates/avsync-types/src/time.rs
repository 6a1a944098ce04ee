//! 90 kHz presentation timestamps.
//!
//! Timestamps are plain `u32` counters that wrap at 2^32. Never compare
//! them with `<` or `>`; go through [`diff`] so that values on either side
//! of the wrap order correctly.

/// Ticks per second of the presentation clock.
pub const TIME_UNIT_90K: u32 = 90_000;

/// Signed distance `a - b`, wrap-aware.
#[inline]
pub fn diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Absolute distance between `a` and `b`, wrap-aware.
#[inline]
pub fn abs_diff(a: u32, b: u32) -> u32 {
    diff(a, b).unsigned_abs()
}

/// True when `a` is at or after `b`.
#[inline]
pub fn at_or_after(a: u32, b: u32) -> bool {
    diff(a, b) >= 0
}

/// Convert milliseconds to 90 kHz ticks.
#[inline]
pub fn ms_to_pts(ms: u32) -> u32 {
    ms.wrapping_mul(90)
}

/// Convert a 90 kHz timestamp to microseconds (unwrapped).
#[inline]
pub fn pts_to_us(pts: u32) -> i64 {
    i64::from(pts) * 1000 / 90
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_diff_across_wrap() {
        assert_eq!(diff(10, u32::MAX - 9), 20);
        assert_eq!(diff(u32::MAX - 9, 10), -20);
        assert!(at_or_after(5, u32::MAX));
        assert!(!at_or_after(u32::MAX, 5));
    }

    #[test]
    fn test_abs_diff() {
        assert_eq!(abs_diff(1500, 3000), 1500);
        assert_eq!(abs_diff(0, u32::MAX), 1);
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(ms_to_pts(100), 9000);
        assert_eq!(pts_to_us(90), 1000);
    }

    proptest! {
        #[test]
        fn test_diff_matches_unwrapped(base in any::<u32>(), delta in -(1i64 << 30)..(1i64 << 30)) {
            let a64 = i64::from(base) + (1i64 << 32);
            let b64 = a64 + delta;
            let a = a64 as u32;
            let b = b64 as u32;
            prop_assert_eq!(i64::from(diff(a, b)), a64 - b64);
            prop_assert_eq!(diff(a, b), diff(a.wrapping_add(u32::MAX).wrapping_add(1), b));
        }

        #[test]
        fn test_ordering_is_antisymmetric(a in any::<u32>(), d in 1u32..(1 << 30)) {
            let b = a.wrapping_add(d);
            prop_assert!(at_or_after(b, a));
            prop_assert!(!at_or_after(a, b));
        }
    }
}
