/// Reconnection supervisor.
///
/// Reacts only to error closes: a clean `disconnect()` ends the loop.
/// Failed attempts back off exponentially with jitter; a connection that
/// stayed up past the stability threshold resets the backoff, and after
/// ten consecutive failures the supervisor gives up with the last error.
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::client::{connection, Shared};
use crate::error::Result;

/// Maximum consecutive failed attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// How long a connection must be up before we consider it "stable"
/// and reset the backoff to initial values.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

pub(crate) async fn run_supervised(shared: Arc<Shared>) -> Result<()> {
    let keep_alive = &shared.config.keep_alive;
    let mut backoff = Backoff::new(
        Duration::from_secs(keep_alive.reconnection_base_delay_secs),
        Duration::from_secs(keep_alive.reconnection_max_delay_secs),
    );
    let mut shutdown = shared.subscribe_shutdown();

    loop {
        let connected_at = Instant::now();
        let error = match connection::run_once(shared.clone()).await {
            Ok(()) => {
                info!("disconnected cleanly");
                return Ok(());
            }
            Err(e) => e,
        };

        if shared.shutdown_requested() {
            return Ok(());
        }
        if !error.is_retriable() {
            error!("permanent connection error: {error}");
            return Err(error);
        }

        if connected_at.elapsed() >= STABILITY_THRESHOLD {
            backoff.reset();
            info!("connection was stable, backoff reset");
        }
        if backoff.exceeded_max_attempts(MAX_RECONNECT_ATTEMPTS) {
            error!("exceeded {MAX_RECONNECT_ATTEMPTS} reconnection attempts, giving up");
            return Err(error);
        }

        let delay = backoff.next_delay();
        warn!(
            "connection lost ({error}); reconnecting in {:.1}s (attempt {})",
            delay.as_secs_f64(),
            backoff.attempt
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                info!("shutdown requested during backoff");
                return Ok(());
            }
        }
    }
}
