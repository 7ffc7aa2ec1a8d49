//! Polling until a condition holds or a deadline passes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// A condition to wait for.
#[async_trait]
pub trait WaitHandle: Send + Sync {
    /// Name used in logs and in the timeout error.
    fn name(&self) -> &str;

    /// Interval between two checks.
    fn tick(&self) -> Duration;

    /// Overall deadline, measured from the first check.
    fn timeout(&self) -> Duration;

    /// Whether the condition holds now. An error counts as "not yet".
    async fn check(&self) -> Result<bool>;
}

/// Check `handle` right away, then once per tick, until it reports ready or
/// its timeout elapses. Returns [`Error::Timeout`] naming the handle on expiry.
pub async fn wait_until(handle: &dyn WaitHandle) -> Result<()> {
    let deadline = Instant::now() + handle.timeout();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match handle.check().await {
            Ok(true) => {
                debug!(wait = handle.name(), attempts, "Condition met");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => debug!(wait = handle.name(), error = %e, "Check failed"),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(handle.name().to_string()));
        }
        tokio::time::sleep(handle.tick().min(deadline - now)).await;
    }
}
