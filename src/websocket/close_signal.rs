use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    Open,
    Closing,
    Closed,
}

/// One-shot close signal for a connection.
///
/// `fire` is the single check-and-set every removal path goes through: only
/// the caller that wins the `Open -> Closing` transition performs teardown.
/// The token wakes the connection's loops; it is a child of the owning
/// worker's shutdown token, so pool shutdown wakes them too without firing
/// the signal.
#[derive(Debug)]
pub struct CloseSignal {
    state: AtomicU8,
    token: CancellationToken,
}

impl CloseSignal {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            state: AtomicU8::new(OPEN),
            token,
        }
    }

    /// Returns true for exactly one caller.
    pub fn fire(&self) -> bool {
        let won = self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.token.cancel();
        }
        won
    }

    /// Transport is gone. Only moves forward from `Closing`.
    pub fn mark_closed(&self) {
        let _ = self
            .state
            .compare_exchange(CLOSING, CLOSED, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn state(&self) -> CloseState {
        match self.state.load(Ordering::Acquire) {
            OPEN => CloseState::Open,
            CLOSING => CloseState::Closing,
            _ => CloseState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Resolves once the signal fired or the worker shut down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
