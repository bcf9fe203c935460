//! # Fibonacci Backoff
//!
//! Progressive backoff measured in controller ticks. Grows more slowly than
//! exponential backoff, so a task that keeps failing is retried a few times
//! quickly and then settles at the cap.
//!
//! Sequence with the defaults: 1, 1, 2, 3, 5, 8, 10 (max) ticks.

/// Shortest wait between two attempts, in ticks.
pub const MIN_BACKOFF_TICKS: u64 = 1;
/// Longest wait between two attempts, in ticks.
pub const MAX_BACKOFF_TICKS: u64 = 10;

/// Fibonacci backoff calculator
///
/// Each value is the sum of the previous two, capped at `max_ticks`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff in ticks (for reset)
    min_ticks: u64,
    prev_ticks: u64,
    current_ticks: u64,
    max_ticks: u64,
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(MIN_BACKOFF_TICKS, MAX_BACKOFF_TICKS)
    }
}

impl FibonacciBackoff {
    /// Create a backoff with the given minimum and maximum, in ticks
    #[must_use]
    pub fn new(min_ticks: u64, max_ticks: u64) -> Self {
        Self {
            min_ticks,
            prev_ticks: 0,
            current_ticks: min_ticks,
            max_ticks,
        }
    }

    /// Get the next backoff in ticks and advance the sequence
    pub fn next_ticks(&mut self) -> u64 {
        let result = self.current_ticks;
        let next = self.prev_ticks + self.current_ticks;
        self.prev_ticks = self.current_ticks;
        self.current_ticks = std::cmp::min(next, self.max_ticks);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_ticks = 0;
        self.current_ticks = self.min_ticks;
    }

    /// Stateless variant: backoff after `attempt` failed attempts.
    ///
    /// Attempts 0 and 1 both wait `min_ticks`, then the sequence follows
    /// Fibonacci: min, min, 2*min, 3*min, 5*min, ... capped at `max_ticks`.
    #[must_use]
    pub fn ticks_for_attempt(attempt: u32, min_ticks: u64, max_ticks: u64) -> u64 {
        if attempt <= 1 {
            return std::cmp::min(min_ticks, max_ticks);
        }

        let mut prev = min_ticks;
        let mut current = min_ticks;
        for _ in 2..=attempt {
            let next = prev + current;
            prev = current;
            current = std::cmp::min(next, max_ticks);
            if current == max_ticks {
                break;
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        let seq: Vec<u64> = (0..8).map(|_| backoff.next_ticks()).collect();
        assert_eq!(seq, vec![1, 1, 2, 3, 5, 8, 10, 10]);
    }

    #[test]
    fn test_reset() {
        let mut backoff = FibonacciBackoff::default();
        backoff.next_ticks();
        backoff.next_ticks();
        backoff.next_ticks();
        backoff.reset();
        assert_eq!(backoff.next_ticks(), 1);
        assert_eq!(backoff.next_ticks(), 1);
    }

    #[test]
    fn test_ticks_for_attempt_matches_stateful_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        for attempt in 0..12u32 {
            assert_eq!(
                backoff.next_ticks(),
                FibonacciBackoff::ticks_for_attempt(attempt, 1, 10),
                "attempt {attempt}"
            );
        }
        assert_eq!(FibonacciBackoff::ticks_for_attempt(4, 1, 10), 5);
        assert_eq!(FibonacciBackoff::ticks_for_attempt(40, 1, 10), 10);
    }
}
