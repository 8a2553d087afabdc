use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Explicit timestamp unit: milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_add(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Age of `earlier` as seen from `self`, clamped at zero.
    pub fn millis_since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Time source injected into both components so TTL expiry and retry
/// timestamps are testable without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

/// Wall-clock time. The production clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now_ms.store(now.0, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_since_clamps_at_zero() {
        let earlier = UnixTimeMs(1_000);
        let later = UnixTimeMs(1_500);
        assert_eq!(later.millis_since(earlier), 500);
        assert_eq!(earlier.millis_since(later), 0);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(UnixTimeMs(100));
        assert_eq!(clock.now(), UnixTimeMs(100));
        clock.advance(50);
        assert_eq!(clock.now(), UnixTimeMs(150));
        clock.set(UnixTimeMs(10));
        assert_eq!(clock.now(), UnixTimeMs(10));
    }
}
