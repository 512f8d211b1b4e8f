//! Bounded retry with fixed delay
//!
//! Used only where re-running the operation is idempotent (the batched ack
//! path). Lock acquisition is deliberately never routed through here.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// Run `op` up to `attempts` times, sleeping `delay` between attempts.
/// Returns the first success or the last error.
pub async fn with_fixed_delay<T, F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!("Attempt {}/{} failed, retrying: {}", attempt, attempts, e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
