//! Self-restarting guard wrapped around every worker thread.
//!
//! An unattended broker instance must heal itself from any transient fault
//! without operator intervention, so the same supervise loop backs every
//! long-lived worker instead of each one hand-rolling its own rescue logic.

use crate::BrokerResult;
use transport::BackoffPolicy;
use tracing::{info, warn};

/// What a supervised unit of work wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervised {
    /// Run the unit again immediately (and reset the backoff counter)
    Continue,
    /// Shut the worker down cleanly
    Stop,
}

/// Run `unit` until it asks to stop. Failures are logged and retried after a
/// capped backoff; a success resets the backoff counter.
pub fn supervise<F>(name: &str, policy: BackoffPolicy, mut unit: F)
where
    F: FnMut() -> BrokerResult<Supervised>,
{
    let mut attempt: u32 = 0;

    loop {
        match unit() {
            Ok(Supervised::Stop) => {
                info!(worker = name, "worker stopped");
                return;
            }
            Ok(Supervised::Continue) => {
                attempt = 0;
            }
            Err(e) => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!(
                    worker = name,
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "worker failed, restarting"
                );
                std::thread::sleep(delay);
            }
        }
    }
}
