use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Two-stage Ctrl-C handling: the first signal sets the scheduler's stop
/// flag so live operations are aborted cleanly; a second signal exits
/// immediately with the conventional 130.
pub fn spawn_ctrl_c_handler(stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!(
            "stop requested — aborting live operations (press CTRL+C again to exit immediately)"
        );
        stop.store(true, Ordering::SeqCst);

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("stop requested again — exiting immediately");
        std::process::exit(130);
    });
}
