//! Batch keep-alive while files are uploading.

use crate::backend::Heartbeat;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A running heartbeat task. Dropping it without [`stop`](Self::stop) leaves
/// the task running until the runtime shuts down.
pub struct HeartbeatHandle {
    stop: CancellationToken,
    task: JoinHandle<usize>,
}

impl HeartbeatHandle {
    /// Starts sending heartbeats for `batch_id` every `interval`.
    ///
    /// The first heartbeat goes out one interval after start.
    pub fn start<H>(heartbeat: Arc<H>, batch_id: String, interval: Duration) -> Self
    where
        H: Heartbeat + ?Sized + 'static,
    {
        let stop = CancellationToken::new();
        let token = stop.clone();
        info!(
            "💓 Heartbeat every {} for batch {}",
            humantime::format_duration(interval),
            batch_id
        );
        let task = tokio::spawn(async move { pump(heartbeat, batch_id, interval, token).await });
        Self { stop, task }
    }

    /// Stops the task and waits for it to exit, returning the number of
    /// heartbeats sent.
    pub async fn stop(self) -> usize {
        self.stop.cancel();
        match self.task.await {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Heartbeat task ended abnormally: {}", e);
                0
            }
        }
    }
}

async fn pump<H>(heartbeat: Arc<H>, batch_id: String, period: Duration, stop: CancellationToken) -> usize
where
    H: Heartbeat + ?Sized,
{
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    let mut sent = 0;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                match heartbeat.beat(&batch_id).await {
                    Ok(()) => {
                        sent += 1;
                        debug!("Heartbeat {} sent for batch {}", sent, batch_id);
                    }
                    Err(e) => warn!("⚠️  Heartbeat for batch {} failed: {}", batch_id, e),
                }
            }
        }
    }
    debug!("Heartbeat for batch {} stopped after {} beat(s)", batch_id, sent);
    sent
}
