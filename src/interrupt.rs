use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Routes user interrupts to whichever stage is running. Each stage gets a
/// fresh token, so an interrupt ends only the current stage.
#[derive(Clone, Default)]
pub struct Interrupts {
    current: Arc<Mutex<CancellationToken>>,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for the next stage, replacing the previous one.
    pub fn stage_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.current.lock() {
            Ok(mut current) => *current = token.clone(),
            Err(poisoned) => *poisoned.into_inner() = token.clone(),
        }
        token
    }

    /// Cancel the running stage.
    pub fn interrupt(&self) {
        match self.current.lock() {
            Ok(current) => current.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }

    /// Forward every Ctrl+C to [`Interrupts::interrupt`] for the life of
    /// the process.
    pub fn listen_for_ctrl_c(&self) -> JoinHandle<()> {
        let interrupts = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Cannot listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Interrupted by user. Skipping to next stage...");
                interrupts.interrupt();
            }
        })
    }
}
