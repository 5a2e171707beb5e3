// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ack::AckManager;

/// Runs [`AckManager::sweep`] every `poll_time` until `cancel` fires.
pub fn spawn_sweeper(
    manager: Arc<AckManager>,
    poll_time: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep_interval = interval(poll_time);
        sweep_interval.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Ack sweeper stopped");
                    return;
                }
                _ = sweep_interval.tick() => {
                    let report = manager.sweep();
                    debug!(
                        "Ack sweep done: {} sessions and {} acks evicted, {} sessions live",
                        report.sessions,
                        report.acks,
                        manager.session_count()
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckLimits;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_sweeper_evicts_until_cancelled() {
        let manager = Arc::new(AckManager::new(AckLimits {
            max_ack_age: Duration::from_millis(10),
            max_session_age: Duration::from_millis(10),
            ..AckLimits::default()
        }));
        manager.register_ack("token", "channel", 0).unwrap();
        assert_eq!(manager.session_count(), 1);

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(manager.clone(), Duration::from_millis(20), cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.session_count(), 0);
        assert!(logs_contain("Ack sweep done"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop when cancelled")
            .unwrap();
        assert!(logs_contain("Ack sweeper stopped"));
    }
}
