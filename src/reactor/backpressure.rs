// src/reactor/backpressure.rs - Outbound queue admission gate
//
// Three-state controller over the approximate outbound queue length:
// Normal -> Lagging above max/2, -> Overflown (drop) above max, back to
// Normal below max/4. Strict comparisons give the hysteresis; every
// transition is logged exactly once.

use std::sync::atomic::{AtomicU8, Ordering};

use log::{error, info, warn};

/// Send-path congestion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureState {
    /// Queue below the warning watermark; everything is enqueued.
    Normal,
    /// Queue above `max/2`; still enqueuing, consumer is behind.
    Lagging,
    /// Queue above `max`; new packets are dropped.
    Overflown,
}

impl BackpressureState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BackpressureState::Lagging,
            2 => BackpressureState::Overflown,
            _ => BackpressureState::Normal,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BackpressureState::Normal => 0,
            BackpressureState::Lagging => 1,
            BackpressureState::Overflown => 2,
        }
    }
}

/// Lock-free admission gate shared by all producer threads.
pub(crate) struct BackpressureGate {
    state: AtomicU8,
    max_queue: usize,
}

impl BackpressureGate {
    pub fn new(max_queue: usize) -> Self {
        Self {
            state: AtomicU8::new(BackpressureState::Normal.as_u8()),
            max_queue: max_queue.max(4),
        }
    }

    pub fn state(&self) -> BackpressureState {
        BackpressureState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    /// Decide whether a packet may be enqueued given the current queue
    /// length, updating the state machine. Returns false when the packet
    /// must be dropped.
    pub fn admit(&self, queued: usize) -> bool {
        let state = self.state();

        if queued > self.max_queue {
            if state != BackpressureState::Overflown
                && self.transition(state, BackpressureState::Overflown)
            {
                error!("Sending queue overflown, dropping packets (len {})", queued);
            }
            return false;
        }

        if queued > self.max_queue / 2 && state == BackpressureState::Normal {
            if self.transition(state, BackpressureState::Lagging) {
                warn!("Sending queue lagging behind (len {})", queued);
            }
        } else if queued < self.max_queue / 4 && state != BackpressureState::Normal {
            if self.transition(state, BackpressureState::Normal) {
                info!("Sending queue back to normal (len {})", queued);
            }
        }

        true
    }

    /// Compare-and-swap so each crossing logs from exactly one thread.
    fn transition(&self, from: BackpressureState, to: BackpressureState) -> bool {
        self.state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_admits() {
        let gate = BackpressureGate::new(16);
        assert!(gate.admit(0));
        assert!(gate.admit(8));
        assert_eq!(gate.state(), BackpressureState::Normal);
    }

    #[test]
    fn test_lagging_above_half() {
        let gate = BackpressureGate::new(16);
        assert!(gate.admit(9));
        assert_eq!(gate.state(), BackpressureState::Lagging);
        // Still admitting while lagging.
        assert!(gate.admit(12));
        assert_eq!(gate.state(), BackpressureState::Lagging);
    }

    #[test]
    fn test_overflown_drops() {
        let gate = BackpressureGate::new(16);
        assert!(!gate.admit(17));
        assert_eq!(gate.state(), BackpressureState::Overflown);
        // Saturated: keeps dropping, state does not flap.
        assert!(!gate.admit(20));
        assert_eq!(gate.state(), BackpressureState::Overflown);
    }

    #[test]
    fn test_hysteresis_recovery() {
        let gate = BackpressureGate::new(16);
        assert!(!gate.admit(17));
        assert_eq!(gate.state(), BackpressureState::Overflown);

        // Between low and high watermark: still not recovered.
        assert!(gate.admit(8));
        assert_eq!(gate.state(), BackpressureState::Overflown);

        // Strictly below max/4: back to normal.
        assert!(gate.admit(3));
        assert_eq!(gate.state(), BackpressureState::Normal);
    }

    #[test]
    fn test_lagging_recovers_to_normal() {
        let gate = BackpressureGate::new(16);
        assert!(gate.admit(9));
        assert_eq!(gate.state(), BackpressureState::Lagging);
        assert!(gate.admit(3));
        assert_eq!(gate.state(), BackpressureState::Normal);
    }

    #[test]
    fn test_full_cycle() {
        let gate = BackpressureGate::new(8);
        let mut states = Vec::new();
        for queued in [1, 5, 9, 12, 5, 1] {
            gate.admit(queued);
            states.push(gate.state());
        }
        assert_eq!(
            states,
            [
                BackpressureState::Normal,
                BackpressureState::Lagging,
                BackpressureState::Overflown,
                BackpressureState::Overflown,
                BackpressureState::Overflown,
                BackpressureState::Normal,
            ]
        );
    }
}
