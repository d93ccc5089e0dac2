// =============================================================================
// Cancellation Controller — turns Ctrl-C into a bailout or an abort
// =============================================================================
//
// First interrupt:
//   - bailout enabled   -> cancel the `bailout` token; the monitor cancels any
//                          resting order and market-sells what is left.
//   - bailout disabled  -> cancel the `abort` token; the monitor stops where
//                          it is and no sell is attempted.
// Second interrupt: the process exits immediately.
// =============================================================================

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Exit status used when a second interrupt kills the process.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    Bailout,
    Abort,
    ForceExit,
}

pub struct InterruptController {
    bailout_enabled: bool,
    interrupts: AtomicU8,
    bailout: CancellationToken,
    abort: CancellationToken,
}

impl InterruptController {
    pub fn new(bailout_enabled: bool) -> Self {
        Self {
            bailout_enabled,
            interrupts: AtomicU8::new(0),
            bailout: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    /// Token cancelled when a bailout was requested.
    pub fn bailout_token(&self) -> CancellationToken {
        self.bailout.clone()
    }

    /// Token cancelled when the run should stop without selling.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Whether an interrupt has been received.
    pub fn is_interrupted(&self) -> bool {
        self.bailout.is_cancelled() || self.abort.is_cancelled()
    }

    /// Resolves once an interrupt has been received.
    pub async fn interrupted(&self) {
        tokio::select! {
            _ = self.bailout.cancelled() => {}
            _ = self.abort.cancelled() => {}
        }
    }

    /// Record one interrupt and decide what it means.
    pub fn on_interrupt(&self) -> InterruptAction {
        let seen = self.interrupts.fetch_add(1, Ordering::SeqCst);
        if seen > 0 {
            return InterruptAction::ForceExit;
        }
        if self.bailout_enabled {
            self.bailout.cancel();
            InterruptAction::Bailout
        } else {
            self.abort.cancel();
            InterruptAction::Abort
        }
    }

    /// Listen for Ctrl-C for the rest of the process lifetime.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "unable to listen for interrupts");
                return;
            }
            match self.on_interrupt() {
                InterruptAction::Bailout => {
                    warn!("interrupt received, bailing out (press Ctrl-C again to exit immediately)");
                }
                InterruptAction::Abort => {
                    warn!("interrupt received, bailout disabled, stopping without selling");
                }
                InterruptAction::ForceExit => {
                    error!("second interrupt received, exiting now");
                    std::process::exit(FORCED_EXIT_CODE);
                }
            }
        }
    }
}
