//! Periodic store trimming task.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Store;

/// How often to check whether the calendar day rolled over. Deletions
/// only happen when it does, so this just bounds the detection latency.
const TRIM_INTERVAL: Duration = Duration::from_secs(60);

/// Run the trim loop until cancelled.
pub async fn run_trimmer(store: Arc<dyn Store>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(TRIM_INTERVAL) => {}
        }
        match store.trim_nodes() {
            Ok(trim) => {
                if trim.advanced {
                    // TODO: also surface the expired channel-subscription
                    // count here once trim_nodes reports it
                    info!(
                        removed_core = trim.removed_core,
                        removed_net = trim.removed_net,
                        "day counter advanced, trimmed expired records"
                    );
                } else {
                    debug!("trim pass: day unchanged");
                }
            }
            Err(e) => error!(error = %e, "trim pass failed"),
        }
    }
}
