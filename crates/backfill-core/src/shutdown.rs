//! Two-stage shutdown: the first signal drains, the second exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal forces termination.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownEvent {
    CtrlC,
    SigTerm,
    ListenerFailed,
}

/// What a received signal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// Stop selecting work, finish in-flight records, flush, save.
    Graceful,
    /// Leave immediately.
    Force,
}

/// Owns the run's cancellation token.
#[derive(Debug, Clone, Default)]
pub struct ShutdownController {
    token: CancellationToken,
    requests: Arc<AtomicU32>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token threaded through every suspension point of the run.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register a shutdown request. The first cancels the token.
    pub fn request(&self) -> ShutdownAction {
        let previous = self.requests.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        if previous == 0 {
            ShutdownAction::Graceful
        } else {
            ShutdownAction::Force
        }
    }

    /// Listen for SIGINT/SIGTERM for the rest of the process lifetime.
    ///
    /// The second signal terminates the process with [`FORCED_EXIT_CODE`].
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                let event = wait_for_signal().await;
                if event == ShutdownEvent::ListenerFailed {
                    break;
                }
                match controller.request() {
                    ShutdownAction::Graceful => {
                        tracing::warn!(
                            ?event,
                            "Shutdown requested, finishing in-flight records (signal again to force)"
                        );
                    }
                    ShutdownAction::Force => {
                        tracing::error!(?event, "Second signal received, exiting immediately");
                        std::process::exit(FORCED_EXIT_CODE);
                    }
                }
            }
        })
    }
}

async fn wait_for_signal() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "Failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "Failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_is_graceful_then_forced() {
        let controller = ShutdownController::new();
        let token = controller.token();
        assert!(!token.is_cancelled());

        assert_eq!(controller.request(), ShutdownAction::Graceful);
        assert!(token.is_cancelled());
        assert!(controller.is_shutting_down());

        assert_eq!(controller.request(), ShutdownAction::Force);
    }

    #[test]
    fn clones_share_state() {
        let a = ShutdownController::new();
        let b = a.clone();
        a.request();
        assert!(b.is_shutting_down());
        assert_eq!(b.request(), ShutdownAction::Force);
    }
}
