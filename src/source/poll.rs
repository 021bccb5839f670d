//! The poll loop: fetch on an interval, back off exponentially on failure,
//! reset on success, wind down when the stop token fires.

use std::time::Duration;

use tracing::{error, warn};

use crate::shared::backoff::backoff_delay;
use crate::shared::stop::StopToken;

use super::{SourceError, SourceHub};

/// Drive a source hub until stopped or until consecutive failures exhaust
/// `max_poll_retries`. Rejects re-entry and unready hubs up front.
pub async fn run_poll_loop(hub: &mut SourceHub, stop: &StopToken) -> Result<(), SourceError> {
    hub.begin_polling()?;
    let interval = Duration::from_secs(hub.options().interval_secs);
    let multiplier = hub.options().retry_multiplier;
    let max_retries = hub.options().max_poll_retries;

    let mut attempt: u32 = 0;
    let result = loop {
        if stop.is_stopped() {
            break Ok(());
        }

        let delay = match hub.tick().await {
            Ok(_) => {
                attempt = 0;
                interval
            }
            Err(err) => {
                attempt += 1;
                if attempt > max_retries {
                    error!(
                        "[{}] giving up after {max_retries} failed polls: {err}",
                        hub.name()
                    );
                    break Err(err);
                }
                let delay = backoff_delay(interval, multiplier, attempt);
                warn!(
                    "[{}] poll failed (attempt {attempt}/{max_retries}), retrying in {delay:?}: {err}",
                    hub.name()
                );
                delay
            }
        };

        if !stop.sleep(delay).await {
            break Ok(());
        }
    };

    hub.end_polling();
    result
}
