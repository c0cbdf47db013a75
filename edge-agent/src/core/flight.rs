//! In-flight guard
//!
//! Single-flight flag shared by an engine's entry points. Acquisition is a
//! compare-and-swap; the guard clears the flag when dropped, on every path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct InFlight {
    flag: Arc<AtomicBool>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the flag, or `None` while another holder is active
    pub fn try_begin(&self) -> Option<InFlightGuard> {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard {
                flag: self.flag.clone(),
            })
    }

    pub fn is_active(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
#[must_use = "the flag is released as soon as the guard is dropped"]
pub struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_holder() {
        let flight = InFlight::new();
        let guard = flight.try_begin();
        assert!(guard.is_some());
        assert!(flight.is_active());
        assert!(flight.try_begin().is_none());
        drop(guard);
        assert!(!flight.is_active());
        assert!(flight.try_begin().is_some());
    }

    #[test]
    fn test_released_on_panic() {
        let flight = InFlight::new();
        let cloned = flight.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.try_begin();
            panic!("handler failed");
        });
        assert!(result.is_err());
        assert!(!flight.is_active());
    }
}
