use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Why a run was stopped. Timeout and user stop share the same terminal
/// event shape and differ only in this reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    UserRequested,
    TimeoutExceeded,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::UserRequested => write!(f, "user requested"),
            StopReason::TimeoutExceeded => write!(f, "timeout exceeded"),
        }
    }
}

/// Cooperative cancellation handle. The engine checks it at scheduling
/// boundaries only; running executors are never preempted.
#[derive(Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: std::sync::Arc<Mutex<Option<StopReason>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// First trigger wins; later reasons are ignored.
    pub fn trigger(&self, reason: StopReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
            self.token.cancel();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }

    /// Resolves when the signal fires; used in `select!` waits.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
