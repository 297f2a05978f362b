//! Signals
//!
//! Four kernel signals with fixed dispositions: term, stop, cont, and
//! the child-state-change notification (which waitpid surfaces; delivery
//! itself does nothing).
//!
//! Host terminal events (Ctrl-C / Ctrl-Z / Ctrl-\) arrive asynchronously
//! from whatever drives the terminal; the only thing that crosses the
//! boundary is one atomic integer. The scheduler drains it once per
//! slice and relays to the foreground process.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Kernel signals, numbered as the `kill` syscall accepts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Terminate the process (0).
    Term,
    /// Stop the process (1).
    Stop,
    /// Continue a stopped process (2).
    Cont,
    /// A child changed state; no direct action.
    Chld,
}

impl Signal {
    pub fn from_num(n: i32) -> Option<Signal> {
        match n {
            0 => Some(Signal::Term),
            1 => Some(Signal::Stop),
            2 => Some(Signal::Cont),
            _ => None,
        }
    }
}

/// Terminal events the host can hand us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// Ctrl-C; relayed to the foreground process as term.
    Interrupt,
    /// Ctrl-Z; relayed to the foreground process as stop.
    TerminalStop,
    /// Ctrl-\; recorded but not relayed.
    TerminalQuit,
}

/// The one-integer mailbox between the host and the scheduler. Writers
/// may be interrupt-context-like (another thread, a terminal hook); the
/// slot holds only the most recent signal.
#[derive(Clone)]
pub struct HostSignalSlot(Arc<AtomicI32>);

const SIG_NONE: i32 = 0;

impl HostSignalSlot {
    pub fn new() -> HostSignalSlot {
        HostSignalSlot(Arc::new(AtomicI32::new(SIG_NONE)))
    }

    /// Record a host signal, overwriting any earlier undrained one.
    pub fn notify(&self, sig: HostSignal) {
        let n = match sig {
            HostSignal::Interrupt => 1,
            HostSignal::TerminalStop => 2,
            HostSignal::TerminalQuit => 3,
        };
        self.0.store(n, Ordering::SeqCst);
    }

    /// Atomically take the pending signal, if any.
    pub fn take(&self) -> Option<HostSignal> {
        match self.0.swap(SIG_NONE, Ordering::SeqCst) {
            1 => Some(HostSignal::Interrupt),
            2 => Some(HostSignal::TerminalStop),
            3 => Some(HostSignal::TerminalQuit),
            _ => None,
        }
    }
}

impl Default for HostSignalSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_numbers() {
        assert_eq!(Signal::from_num(0), Some(Signal::Term));
        assert_eq!(Signal::from_num(1), Some(Signal::Stop));
        assert_eq!(Signal::from_num(2), Some(Signal::Cont));
        assert_eq!(Signal::from_num(3), None);
    }

    #[test]
    fn test_slot_take_clears() {
        let slot = HostSignalSlot::new();
        assert_eq!(slot.take(), None);
        slot.notify(HostSignal::Interrupt);
        assert_eq!(slot.take(), Some(HostSignal::Interrupt));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_slot_keeps_latest_only() {
        let slot = HostSignalSlot::new();
        slot.notify(HostSignal::Interrupt);
        slot.notify(HostSignal::TerminalStop);
        assert_eq!(slot.take(), Some(HostSignal::TerminalStop));
    }
}
