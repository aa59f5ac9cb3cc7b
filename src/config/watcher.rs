//! # Configuration Change Watcher
//!
//! Polls the configuration document's modification time and notifies the
//! agent when it changes. Polling keeps the watcher free of platform
//! specifics; the interval is coarse since configuration changes are rare.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Watch the given file for modification-time changes. Each detected change
/// produces one message on the returned channel; the task stops when the
/// cancellation token fires.
pub fn watch_config(
    path: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut last_modified = modification_time(&path).await;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let modified = modification_time(&path).await;
            if modified.is_some() && modified != last_modified {
                last_modified = modified;
                debug!(file = %path.display(), "Configuration file changed");
                // a pending notification already covers this change
                let _ = tx.try_send(());
            }
        }
    });

    rx
}

async fn modification_time(path: &PathBuf) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok().and_then(|metadata| metadata.modified().ok())
}
