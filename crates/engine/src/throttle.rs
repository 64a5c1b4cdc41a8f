use std::time::Duration;

use tokio::time::Instant;

/// Admits at most one event per interval; the first event always passes.
#[derive(Debug, Clone)]
pub struct PointerThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl PointerThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_per_window() {
        let start = Instant::now();
        let mut throttle = PointerThrottle::new(Duration::from_millis(50));
        let admitted: Vec<u64> = (0..200u64)
            .filter(|ms| throttle.admit(start + Duration::from_millis(*ms)))
            .collect();
        assert_eq!(admitted, vec![0, 50, 100, 150]);
    }

    #[test]
    fn zero_interval_admits_everything() {
        let start = Instant::now();
        let mut throttle = PointerThrottle::new(Duration::ZERO);
        assert!(throttle.admit(start));
        assert!(throttle.admit(start));
    }
}
