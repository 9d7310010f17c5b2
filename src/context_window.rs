use serde::{Deserialize, Serialize};

/// Half-open `[start, end)` span of model-history indices withheld from
/// requests. The entries stay on disk; only outgoing requests elide them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationRange {
    pub start: usize,
    pub end: usize,
}

impl TruncationRange {
    pub fn elided_len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationStrategy {
    /// Drop the oldest quarter of the untouched history.
    Quarter,
    /// Keep only the final exchange.
    LastTwo,
    /// Leave the range unchanged.
    None,
}

/// Tracks how close a task is to the model's context limit and computes
/// which historical span to elide when it gets there.
#[derive(Debug, Clone, Copy)]
pub struct ContextWindowManager {
    window_tokens: usize,
}

impl ContextWindowManager {
    pub fn new(window_tokens: usize) -> Self {
        Self { window_tokens }
    }

    /// Headroom reserved for the response and prompt growth. Proportional
    /// with a floor so small local windows are not starved.
    fn reserve_tokens(&self) -> usize {
        (self.window_tokens / 5).max(8_192).min(self.window_tokens)
    }

    pub fn should_truncate(&self, used_tokens: usize) -> bool {
        used_tokens >= self.window_tokens.saturating_sub(self.reserve_tokens())
    }

    /// Compute the next elision span. Entry 0 (the task message) is never
    /// dropped, so `start` is always 1. Drop counts are rounded down to an
    /// even number to preserve the user/assistant cadence of the entry
    /// that follows the range.
    pub fn next_range(
        &self,
        current: Option<TruncationRange>,
        history_len: usize,
        strategy: TruncationStrategy,
    ) -> Option<TruncationRange> {
        let current_end = current.map(|range| range.end).unwrap_or(1).max(1);

        if matches!(strategy, TruncationStrategy::None) {
            return current;
        }

        // Nothing beyond the task message and the final exchange: no room.
        if history_len <= 3 {
            return current;
        }

        let new_end = match strategy {
            TruncationStrategy::Quarter => {
                let untouched = history_len.saturating_sub(current_end);
                let drop = (untouched / 4) & !1;
                current_end + drop
            }
            TruncationStrategy::LastTwo => {
                let mut end = history_len.saturating_sub(2);
                if (end.saturating_sub(1)) % 2 == 1 {
                    end = end.saturating_sub(1);
                }
                end
            }
            TruncationStrategy::None => unreachable!(),
        };

        let new_end = new_end.clamp(current_end, history_len.saturating_sub(2).max(1));
        if new_end <= 1 {
            return current;
        }

        Some(TruncationRange {
            start: 1,
            end: new_end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_truncate_respects_reserve() {
        let manager = ContextWindowManager::new(200_000);
        assert!(!manager.should_truncate(100_000));
        assert!(manager.should_truncate(160_000));
        assert!(manager.should_truncate(260_000));
    }

    #[test]
    fn test_should_truncate_small_window_floor() {
        let manager = ContextWindowManager::new(16_000);
        // reserve floors at 8192
        assert!(!manager.should_truncate(7_000));
        assert!(manager.should_truncate(8_000));
    }

    #[test]
    fn test_none_strategy_is_idempotent() {
        let manager = ContextWindowManager::new(200_000);
        let range = Some(TruncationRange { start: 1, end: 9 });
        let once = manager.next_range(range, 40, TruncationStrategy::None);
        let twice = manager.next_range(once, 40, TruncationStrategy::None);
        assert_eq!(once, range);
        assert_eq!(twice, range);
    }

    #[test]
    fn test_quarter_drops_even_count_from_untouched() {
        let manager = ContextWindowManager::new(200_000);
        let range = manager
            .next_range(None, 41, TruncationStrategy::Quarter)
            .expect("range");
        assert_eq!(range.start, 1);
        // (41 - 1) / 4 = 10, already even
        assert_eq!(range.end, 11);

        let next = manager
            .next_range(Some(range), 41, TruncationStrategy::Quarter)
            .expect("range");
        // (41 - 11) / 4 = 7 -> rounded down to 6
        assert_eq!(next.end, 17);
    }

    #[test]
    fn test_last_two_keeps_final_exchange() {
        let manager = ContextWindowManager::new(200_000);
        let range = manager
            .next_range(None, 21, TruncationStrategy::LastTwo)
            .expect("range");
        assert_eq!(range.start, 1);
        assert_eq!(range.end, 19);

        // Never moves backwards.
        let shrunk = manager.next_range(Some(range), 21, TruncationStrategy::Quarter);
        assert_eq!(shrunk, Some(range));
    }

    #[test]
    fn test_tiny_history_left_alone() {
        let manager = ContextWindowManager::new(200_000);
        assert_eq!(manager.next_range(None, 3, TruncationStrategy::Quarter), None);
        assert_eq!(manager.next_range(None, 2, TruncationStrategy::LastTwo), None);
    }
}
