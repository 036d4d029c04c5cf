/// Constant-time equality check for the shared enrollment password
/// (spec.md §4.3 step 1, §8 property 6). Runs over the longer of the two
/// inputs so that timing depends only on length, never on where the first
/// differing byte falls.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let len_diff = (a.len() ^ b.len()) as u8;
    let max_len = a.len().max(b.len());

    let mut diff: u8 = len_diff;
    for i in 0..max_len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn equal_strings_compare_true() {
        assert!(constant_time_eq("hunter2", "hunter2"));
    }

    #[test]
    fn differing_strings_compare_false() {
        assert!(!constant_time_eq("hunter2", "hunter3"));
        assert!(!constant_time_eq("hunter2", "hunter"));
        assert!(!constant_time_eq("", "x"));
    }

    /// Not a precise timing-attack test (that requires statistical
    /// sampling infeasible in CI), but it does confirm the loop always
    /// walks the full shared length regardless of where bytes differ.
    #[test]
    fn runtime_is_insensitive_to_mismatch_position() {
        let reference = "a".repeat(4096);
        let mut first_byte_diff = reference.clone();
        first_byte_diff.replace_range(0..1, "b");
        let mut last_byte_diff = reference.clone();
        last_byte_diff.replace_range(4095..4096, "b");

        let iterations = 2000;
        let t0 = Instant::now();
        for _ in 0..iterations {
            std::hint::black_box(constant_time_eq(&reference, &first_byte_diff));
        }
        let first_elapsed = t0.elapsed();

        let t1 = Instant::now();
        for _ in 0..iterations {
            std::hint::black_box(constant_time_eq(&reference, &last_byte_diff));
        }
        let last_elapsed = t1.elapsed();

        // Generous bound: both should be within the same order of
        // magnitude. A position-dependent (short-circuiting) compare
        // would show the first-byte-diff case finishing much faster.
        let ratio = first_elapsed.as_nanos().max(1) as f64 / last_elapsed.as_nanos().max(1) as f64;
        assert!(ratio > 0.2 && ratio < 5.0, "ratio={ratio}");
    }
}
