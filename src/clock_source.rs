//! Wall-clock abstraction.
//!
//! Every background job and filename timestamp reads "now". Routing that
//! through a trait (rather than calling `chrono::Utc::now()` directly)
//! lets tests inject deterministic timestamps instead of racing real
//! time, the same way `fs::InMemoryFileSystem` substitutes for disk.

use std::sync::atomic::{AtomicI64, Ordering};

/// Supplies the current time, in Unix milliseconds, to anything that needs
/// to stamp a filename or evaluate a freshness window.
pub trait Clock: Send + Sync {
    /// Current time as Unix milliseconds.
    fn now_ms(&self) -> i64;
}

/// Reads the real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A deterministic clock for tests: starts at a fixed instant and only
/// advances when told to, so freshness-window and idle-timeout logic can be
/// exercised without sleeping in a test thread.
#[derive(Debug)]
pub struct FixedClock {
    now_ms: AtomicI64,
}

impl FixedClock {
    /// Start the clock at `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    /// Move the clock forward by `delta_ms` and return the new time.
    pub fn advance_ms(&self, delta_ms: i64) -> i64 {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }

    /// Set the clock to an absolute time.
    pub fn set_ms(&self, ms: i64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
