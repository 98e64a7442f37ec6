use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Venue-level circuit breaker: opens after five consecutive failures across
/// any endpoint, closes again sixty seconds later. Plain state machine, not
/// a crate dependency — nothing in the retrieval pack carries a dedicated
/// circuit-breaker crate for this purpose.
pub struct VenueCircuit {
    state: Mutex<State>,
    open_threshold: u32,
    reset_after: Duration,
}

struct State {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl VenueCircuit {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                consecutive_failures: 0,
                opened_at: None,
            }),
            open_threshold: 5,
            reset_after: Duration::from_secs(60),
        }
    }

    /// Returns `Some(remaining_secs)` if calls should currently be rejected.
    pub fn check(&self) -> Option<u64> {
        let mut s = self.state.lock().expect("circuit mutex poisoned");
        if let Some(opened_at) = s.opened_at {
            let elapsed = opened_at.elapsed();
            if elapsed >= self.reset_after {
                // half-open: let the next call through and see what happens.
                s.opened_at = None;
                s.consecutive_failures = 0;
                None
            } else {
                Some((self.reset_after - elapsed).as_secs())
            }
        } else {
            None
        }
    }

    pub fn record_success(&self) {
        let mut s = self.state.lock().expect("circuit mutex poisoned");
        s.consecutive_failures = 0;
        s.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut s = self.state.lock().expect("circuit mutex poisoned");
        s.consecutive_failures += 1;
        if s.consecutive_failures >= self.open_threshold && s.opened_at.is_none() {
            s.opened_at = Some(Instant::now());
        }
    }
}

impl Default for VenueCircuit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_five_consecutive_failures() {
        let circuit = VenueCircuit::new();
        for _ in 0..4 {
            circuit.record_failure();
            assert!(circuit.check().is_none());
        }
        circuit.record_failure();
        assert!(circuit.check().is_some());
    }

    #[test]
    fn success_resets_the_counter() {
        let circuit = VenueCircuit::new();
        for _ in 0..4 {
            circuit.record_failure();
        }
        circuit.record_success();
        circuit.record_failure();
        assert!(circuit.check().is_none());
    }
}
