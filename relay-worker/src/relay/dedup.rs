//! Recently resolved task tokens
//!
//! QoS 1 deliveries on a persistent session can arrive more than once. A
//! token is claimed before computing so a redelivery, even one racing the
//! first copy, is skipped instead of resolved twice. Only the most recent
//! `capacity` tokens are remembered; older ones are evicted first-in first-out.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

/// Default number of tokens remembered
pub const DEFAULT_RECENT_TOKENS: usize = 10_000;

#[derive(Debug)]
pub struct RecentTokens {
    capacity: usize,
    inner: Mutex<Window>,
}

#[derive(Debug, Default)]
struct Window {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentTokens {
    /// `capacity == 0` disables deduplication
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Window::default()),
        }
    }

    /// Returns `false` if the token was already claimed
    pub fn claim(&self, token: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }

        let mut window = self.inner.lock();
        if window.seen.contains(token) {
            return false;
        }
        if window.order.len() >= self.capacity
            && let Some(oldest) = window.order.pop_front()
        {
            window.seen.remove(&oldest);
        }
        window.seen.insert(token.to_string());
        window.order.push_back(token.to_string());
        true
    }

    /// Forget a claim whose resolution never reached the bus
    pub fn release(&self, token: &str) {
        let mut window = self.inner.lock();
        if window.seen.remove(token) {
            window.order.retain(|t| t != token);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecentTokens {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_TOKENS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_once() {
        let tokens = RecentTokens::new(4);
        assert!(tokens.claim("T1"));
        assert!(!tokens.claim("T1"));
        assert!(tokens.claim("T2"));
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let tokens = RecentTokens::new(2);
        tokens.claim("a");
        tokens.claim("b");
        tokens.claim("c");

        assert_eq!(tokens.len(), 2);
        assert!(tokens.claim("a"));
        assert!(!tokens.claim("c"));
    }

    #[test]
    fn test_release_allows_reclaim() {
        let tokens = RecentTokens::new(4);
        tokens.claim("lost");
        tokens.release("lost");

        assert!(tokens.is_empty());
        assert!(tokens.claim("lost"));
    }

    #[test]
    fn test_zero_capacity_disables() {
        let tokens = RecentTokens::new(0);
        assert!(tokens.claim("T1"));
        assert!(tokens.claim("T1"));
        assert!(tokens.is_empty());
    }
}
