//! Exponential reconnect backoff.
//!
//! The k-th consecutive delay is `min(floor * 2^(k-1), ceiling)`. A
//! successful open resets the sequence to the floor.

use std::time::Duration;

/// Doubling delay sequence between `floor` and `ceiling`.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    /// Delay the next attempt will get.
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `floor`. A ceiling below the floor is
    /// raised to it.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay for the next attempt; doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// Delay the next attempt would get, without consuming it.
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Restart the sequence at the floor.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// First delay of a sequence.
    pub fn floor(&self) -> Duration {
        self.floor
    }

    /// Largest delay ever returned.
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_doubles_up_to_ceiling() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 10_000, 10_000, 10_000]);
    }

    #[test]
    fn test_kth_delay_formula() {
        let floor = ms(500);
        let ceiling = ms(10_000);
        let mut backoff = Backoff::new(floor, ceiling);
        for k in 1..=12u32 {
            let expected = floor.saturating_mul(2u32.saturating_pow(k - 1)).min(ceiling);
            assert_eq!(backoff.next_delay(), expected, "attempt {k}");
        }
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.peek(), ms(2000));
        backoff.reset();
        assert_eq!(backoff.next_delay(), ms(500));
    }

    #[test]
    fn test_ceiling_below_floor_is_clamped() {
        let mut backoff = Backoff::new(ms(300), ms(100));
        assert_eq!(backoff.ceiling(), ms(300));
        assert_eq!(backoff.next_delay(), ms(300));
        assert_eq!(backoff.next_delay(), ms(300));
    }
}
