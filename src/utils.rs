//! Utility types and functions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct UpperBoundTracker<T> {
    max_val: Option<T>,
}

impl<T: Ord + Copy> UpperBoundTracker<T> {
    pub fn update(&mut self, new: T) -> T {
        let v = self.max_val.map_or(new, |prev| prev.max(new));
        self.max_val = Some(v);
        v
    }

    pub fn get(&self) -> Option<T> {
        self.max_val
    }
}

/// Cooperative cancellation flag, shared between a build and whoever may
/// interrupt it.
///
/// ```
/// use statehist::utils::CancelToken;
///
/// let token = CancelToken::new();
/// let handle = token.clone();
///
/// assert!(!token.is_cancelled());
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// The underlying flag, e.g. to have a signal handler raise it.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::UpperBoundTracker;

    #[test]
    fn test_upper_bound() {
        let mut t = UpperBoundTracker::default();

        assert_eq!(t.get(), None);
        assert_eq!(t.update(5u64), 5);
        assert_eq!(t.update(3), 5);
        assert_eq!(t.update(8), 8);
        assert_eq!(t.get(), Some(8));
    }
}
