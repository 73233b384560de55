//! Background reconnection.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{Consumer, ConsumerError};
use crate::utils::retry::reconnect_backoff;

/// Handle to a running reconnection. Cancelling or dropping it abandons the
/// reconnection at its next suspension point.
pub struct ReconnectTaskHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconnectTaskHandle {
    /// Signal the reconnection to stop.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to end.
    pub async fn join(self) {
        let Self { cancel, task } = self;
        if let Err(e) = task.await {
            error!(error = %e, "Reconnection task panicked");
        }
        drop(cancel);
    }
}

pub(super) fn spawn_reconnect(consumer: Arc<Consumer>) -> ReconnectTaskHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let consumer_id = consumer.id();
        tokio::select! {
            result = reconnect(&consumer) => match result {
                Ok(()) => info!(%consumer_id, "Consumer reconnected"),
                Err(e) => error!(%consumer_id, error = %e, "Reconnection failed"),
            },
            _ = cancel_rx.changed() => {
                info!(%consumer_id, "Reconnection cancelled");
            }
        }
    });

    ReconnectTaskHandle {
        cancel: cancel_tx,
        task,
    }
}

async fn reconnect(consumer: &Arc<Consumer>) -> Result<(), ConsumerError> {
    consumer
        .transport
        .wait_until_consuming_stopped_core()
        .await
        .map_err(|e| consumer.failure("wait until consuming stopped", e))?;

    consumer.disconnect().await?;

    let consumer_id = consumer.id();
    let target = Arc::clone(consumer);
    (|| {
        let consumer = Arc::clone(&target);
        async move { consumer.connect().await }
    })
    .retry(reconnect_backoff(consumer.reconnect_config()))
    .notify(|err: &ConsumerError, dur: Duration| {
        warn!(%consumer_id, error = %err, delay = ?dur, "Reconnect failed, retrying");
    })
    .await
}
