use std::time::Duration;

/// Backoff ceiling regardless of multiplier and attempt count.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// `base * multiplier^attempt`, clamped. A multiplier under 1 never shrinks
/// the base interval.
pub fn backoff_delay(base: Duration, multiplier: f64, attempt: u32) -> Duration {
    let factor = multiplier.max(1.0).powi(attempt as i32);
    base.mul_f64(factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_clamps() {
        let base = Duration::from_secs(10);
        assert_eq!(backoff_delay(base, 2.0, 0), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 2.0, 1), Duration::from_secs(20));
        assert_eq!(backoff_delay(base, 2.0, 3), Duration::from_secs(80));
        assert_eq!(backoff_delay(base, 2.0, 10), MAX_BACKOFF);
    }

    #[test]
    fn multiplier_below_one_is_not_a_shrink() {
        let base = Duration::from_secs(10);
        assert_eq!(backoff_delay(base, 0.5, 3), Duration::from_secs(10));
    }
}
