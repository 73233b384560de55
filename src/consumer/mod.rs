//! Broker consumer.
//!
//! The consumer owns the lifecycle state machine around a broker-specific
//! [`BrokerTransport`]:
//!
//! ```text
//! Disconnected ─connect─▶ Connected ─start─▶ Consuming
//!      ▲                      ▲                  │
//!      │                      └──────stop────────┘
//!      └───────────────disconnect──────────────────
//! ```
//!
//! It wraps every delivered message in an [`InboundEnvelope`], resolves the
//! sequence store for its partition, drives the behavior pipeline, and keeps
//! the failed-attempt counters error policies read.
//!
//! Locks guard short mutations only and are never held across an await.

pub mod behaviors;
mod context;
mod reconnect;
mod status;
mod transport;

pub use context::{
    ConsumedMessage, ConsumerPipelineContext, HandlerError, MessageHandler, Services,
};
pub use reconnect::ReconnectTaskHandle;
pub use status::{ConsumerStatus, ConsumerStatusInfo, StatusChange};
pub use transport::{BrokerTransport, TransportError};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{
    BrokerMessageIdentifier, Endpoint, InboundEnvelope, MessageHeaders, PartitionKey,
    FAILED_ATTEMPTS_HEADER,
};
use crate::config::ReconnectConfig;
use crate::pipeline::{Pipeline, PipelineError};
use crate::sequence::{AbortReason, SequenceStore};

/// Result type for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors surfaced by consumer operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    #[error("Consumer is not connected")]
    NotConnected,

    #[error("Consumer is disconnecting")]
    Disconnecting,

    #[error("Consumer was dropped")]
    Dropped,

    #[error("Broker {operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

type ConnectFuture = Shared<BoxFuture<'static, Result<()>>>;

#[derive(Default)]
struct Lifecycle {
    is_connected: bool,
    is_consuming: bool,
    is_stopping: bool,
    is_disconnecting: bool,
    connecting: Option<ConnectFuture>,
}

/// Consumer bound to one endpoint.
pub struct Consumer {
    id: Uuid,
    endpoint: Arc<Endpoint>,
    transport: Arc<dyn BrokerTransport>,
    pipeline: Pipeline<ConsumerPipelineContext>,
    services: Services,
    reconnect_config: ReconnectConfig,
    weak_self: Weak<Consumer>,
    lifecycle: Mutex<Lifecycle>,
    status: ConsumerStatusInfo,
    failed_attempts: Mutex<HashMap<BrokerMessageIdentifier, u32>>,
    sequence_stores: Mutex<HashMap<Option<PartitionKey>, Arc<SequenceStore>>>,
    reconnect_task: Mutex<Option<ReconnectTaskHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears one lifecycle flag when dropped, so a cancelled operation never
/// leaves it set.
struct FlagReset<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    flag: fn(&mut Lifecycle) -> &mut bool,
}

impl Drop for FlagReset<'_> {
    fn drop(&mut self) {
        let mut lifecycle = lock(self.lifecycle);
        *(self.flag)(&mut *lifecycle) = false;
    }
}

impl Consumer {
    /// Build a consumer and bind it to its transport.
    pub fn new(
        endpoint: Arc<Endpoint>,
        transport: Arc<dyn BrokerTransport>,
        pipeline: Pipeline<ConsumerPipelineContext>,
        services: Services,
        reconnect_config: ReconnectConfig,
    ) -> Arc<Self> {
        let consumer = Arc::new_cyclic(|weak_self| Self {
            id: Uuid::new_v4(),
            endpoint,
            transport,
            pipeline,
            services,
            reconnect_config,
            weak_self: weak_self.clone(),
            lifecycle: Mutex::new(Lifecycle::default()),
            status: ConsumerStatusInfo::default(),
            failed_attempts: Mutex::new(HashMap::new()),
            sequence_stores: Mutex::new(HashMap::new()),
            reconnect_task: Mutex::new(None),
        });

        consumer.transport.bind(Arc::downgrade(&consumer));
        debug!(
            consumer_id = %consumer.id,
            endpoint = %consumer.endpoint.name(),
            behaviors = ?consumer.pipeline.names(),
            "Consumer created"
        );
        consumer
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn status_info(&self) -> &ConsumerStatusInfo {
        &self.status
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect_config
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.lifecycle).is_connected
    }

    pub fn is_consuming(&self) -> bool {
        lock(&self.lifecycle).is_consuming
    }

    fn arc(&self) -> Result<Arc<Self>> {
        self.weak_self.upgrade().ok_or(ConsumerError::Dropped)
    }

    fn failure(&self, operation: &'static str, source: TransportError) -> ConsumerError {
        error!(
            consumer_id = %self.id,
            endpoint = %self.endpoint.name(),
            operation,
            error = %source,
            "Broker operation failed"
        );
        ConsumerError::Transport { operation, source }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect and start consuming.
    ///
    /// No-op when already connected. Concurrent callers share one in-flight
    /// attempt and observe the same outcome.
    pub async fn connect(&self) -> Result<()> {
        let connecting = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.is_connected {
                return Ok(());
            }
            match &lifecycle.connecting {
                Some(connecting) => connecting.clone(),
                None => {
                    let consumer = self.arc()?;
                    let connecting = async move {
                        let result = consumer.connect_and_start().await;
                        lock(&consumer.lifecycle).connecting = None;
                        result
                    }
                    .boxed()
                    .shared();
                    lifecycle.connecting = Some(connecting.clone());
                    connecting
                }
            }
        };

        connecting.await
    }

    async fn connect_and_start(&self) -> Result<()> {
        info!(
            consumer_id = %self.id,
            endpoint = %self.endpoint.name(),
            "Connecting consumer"
        );

        self.transport
            .connect_core()
            .await
            .map_err(|e| self.failure("connect", e))?;

        lock(&self.lifecycle).is_connected = true;
        self.status.set_connected();
        info!(
            consumer_id = %self.id,
            endpoint = %self.endpoint.name(),
            "Consumer connected"
        );

        self.start().await
    }

    /// Stop consuming, abort pending sequences and disconnect.
    ///
    /// No-op when not connected or when a disconnect is already running.
    pub async fn disconnect(&self) -> Result<()> {
        let stop_first = {
            let mut lifecycle = lock(&self.lifecycle);
            if !lifecycle.is_connected || lifecycle.is_disconnecting {
                return Ok(());
            }
            lifecycle.is_disconnecting = true;
            lifecycle.is_consuming && !lifecycle.is_stopping
        };

        let _disconnecting = FlagReset {
            lifecycle: &self.lifecycle,
            flag: |lifecycle| &mut lifecycle.is_disconnecting,
        };
        self.disconnect_inner(stop_first).await
    }

    async fn disconnect_inner(&self, stop_first: bool) -> Result<()> {
        info!(
            consumer_id = %self.id,
            endpoint = %self.endpoint.name(),
            "Disconnecting consumer"
        );

        // The stop hook must run even if the consume loop never started,
        // otherwise waiting for it to stop below never resolves.
        if stop_first {
            self.stop().await?;
        } else {
            self.transport
                .stop_core()
                .await
                .map_err(|e| self.failure("stop", e))?;
        }

        self.dispose_sequence_stores().await;

        self.transport
            .wait_until_consuming_stopped_core()
            .await
            .map_err(|e| self.failure("wait until consuming stopped", e))?;

        // Messages still in the pipeline when the stores were first disposed
        // may have created stores or sequences since.
        self.dispose_sequence_stores().await;

        self.transport
            .disconnect_core()
            .await
            .map_err(|e| self.failure("disconnect", e))?;

        {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.is_connected = false;
            lifecycle.is_consuming = false;
        }
        self.status.set_disconnected();

        info!(
            consumer_id = %self.id,
            endpoint = %self.endpoint.name(),
            "Consumer disconnected"
        );
        Ok(())
    }

    /// Detach every sequence store and abort what it holds.
    ///
    /// A disposed store aborts sequences added to it later, so pipelines
    /// still holding it cannot leave pending sequences behind.
    async fn dispose_sequence_stores(&self) {
        let stores: Vec<_> = lock(&self.sequence_stores)
            .drain()
            .map(|(_, store)| store)
            .collect();
        for store in stores {
            store.dispose(AbortReason::ConsumerAborted).await;
        }
    }

    /// Start the consume loop. Fails fast when not connected.
    pub async fn start(&self) -> Result<()> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if !lifecycle.is_connected {
                return Err(ConsumerError::NotConnected);
            }
            if lifecycle.is_disconnecting {
                return Err(ConsumerError::Disconnecting);
            }
            if lifecycle.is_consuming {
                return Ok(());
            }
            lifecycle.is_consuming = true;
        }

        debug!(
            consumer_id = %self.id,
            endpoint = %self.endpoint.name(),
            "Starting consumer"
        );

        match self.transport.start_core().await {
            Ok(()) => {
                self.status.set_consuming();
                info!(
                    consumer_id = %self.id,
                    endpoint = %self.endpoint.name(),
                    "Consumer started"
                );
                Ok(())
            }
            Err(e) => {
                lock(&self.lifecycle).is_consuming = false;
                Err(self.failure("start", e))
            }
        }
    }

    /// Stop the consume loop. No-op when not consuming or already stopping.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if !lifecycle.is_consuming || lifecycle.is_stopping {
                return Ok(());
            }
            lifecycle.is_stopping = true;
        }
        let stopping = FlagReset {
            lifecycle: &self.lifecycle,
            flag: |lifecycle| &mut lifecycle.is_stopping,
        };

        debug!(
            consumer_id = %self.id,
            endpoint = %self.endpoint.name(),
            "Stopping consumer"
        );

        let result = self.transport.stop_core().await;
        if result.is_ok() {
            lock(&self.lifecycle).is_consuming = false;
        }
        drop(stopping);

        match result {
            Ok(()) => {
                if self.is_connected() {
                    self.status.set_connected();
                }
                info!(
                    consumer_id = %self.id,
                    endpoint = %self.endpoint.name(),
                    "Consumer stopped"
                );
                Ok(())
            }
            Err(e) => Err(self.failure("stop", e)),
        }
    }

    /// Stop now, then disconnect and reconnect in the background.
    ///
    /// Returns once consumption is stopped. Reconnection failures are logged
    /// and never reach the caller. A previous reconnection still running is
    /// cancelled and awaited first.
    pub async fn trigger_reconnect(&self) -> Result<()> {
        let consuming = self.is_consuming();
        if consuming {
            self.stop().await?;
        } else {
            self.transport
                .stop_core()
                .await
                .map_err(|e| self.failure("stop", e))?;
        }

        warn!(
            consumer_id = %self.id,
            endpoint = %self.endpoint.name(),
            "Reconnection triggered"
        );

        let previous = self.take_reconnect_task();
        if let Some(previous) = previous {
            previous.cancel();
            previous.join().await;
        }

        let handle = reconnect::spawn_reconnect(self.arc()?);
        *lock(&self.reconnect_task) = Some(handle);
        Ok(())
    }

    /// Handle of the last reconnection task, if any.
    pub fn take_reconnect_task(&self) -> Option<ReconnectTaskHandle> {
        lock(&self.reconnect_task).take()
    }

    /// Cancel any reconnection and disconnect. Never fails.
    ///
    /// A reconnection cancelled in the middle of its own disconnect is
    /// awaited first, so the disconnect below is never skipped.
    pub async fn dispose(&self) {
        let reconnecting = self.take_reconnect_task();
        if let Some(handle) = reconnecting {
            handle.cancel();
            handle.join().await;
        }

        if let Err(e) = self.disconnect().await {
            error!(
                consumer_id = %self.id,
                endpoint = %self.endpoint.name(),
                error = %e,
                "Failed to dispose consumer"
            );
        }
    }

    // ========================================================================
    // Message handling
    // ========================================================================

    /// Sequence store for the partition of `identifier`.
    ///
    /// With independent partition processing each partition gets its own
    /// store, so sequences never span partitions. Otherwise one store is
    /// shared. Stores are created on first use.
    pub fn get_sequence_store(&self, identifier: &BrokerMessageIdentifier) -> Arc<SequenceStore> {
        let key = if self.endpoint.process_partitions_independently() {
            identifier.partition_key()
        } else {
            None
        };

        let mut stores = lock(&self.sequence_stores);
        Arc::clone(
            stores
                .entry(key)
                .or_insert_with(|| Arc::new(self.services.create_sequence_store())),
        )
    }

    /// All sequence stores created so far.
    pub fn sequence_stores(&self) -> Vec<Arc<SequenceStore>> {
        lock(&self.sequence_stores).values().cloned().collect()
    }

    /// Run a delivered message through the pipeline.
    ///
    /// Called by the transport's consume loop, possibly concurrently for
    /// different partitions. Messages delivered while a disconnect is running
    /// are refused and left uncommitted.
    #[tracing::instrument(
        name = "consumer.handle_message",
        skip_all,
        fields(consumer_id = %self.id, endpoint = %self.endpoint.name(), identifier = %identifier)
    )]
    pub async fn handle_message(
        self: &Arc<Self>,
        body: Option<Bytes>,
        headers: MessageHeaders,
        actual_endpoint_name: &str,
        identifier: BrokerMessageIdentifier,
    ) -> Result<()> {
        if lock(&self.lifecycle).is_disconnecting {
            debug!("Message refused, consumer is disconnecting");
            return Err(ConsumerError::Disconnecting);
        }

        let envelope = InboundEnvelope::new(
            body,
            headers,
            Arc::clone(&self.endpoint),
            actual_endpoint_name,
            identifier,
        );
        self.status.record_consumed(envelope.identifier());

        let store = self.get_sequence_store(envelope.identifier());
        let context = ConsumerPipelineContext::new(
            envelope,
            Arc::clone(self),
            store,
            self.services.clone(),
        );

        self.pipeline.execute(context).await?;
        Ok(())
    }

    // ========================================================================
    // Failed attempts, commit and rollback
    // ========================================================================

    /// Count one more failed attempt for the envelope's message.
    ///
    /// The first count is seeded from the failed-attempts header, so attempts
    /// made before a redelivery to another consumer are not lost.
    pub fn increment_failed_attempts(&self, envelope: &InboundEnvelope) -> u32 {
        let mut failed_attempts = lock(&self.failed_attempts);
        let count = failed_attempts
            .entry(envelope.identifier().clone())
            .or_insert_with(|| {
                envelope
                    .headers()
                    .get_as::<u32>(FAILED_ATTEMPTS_HEADER)
                    .unwrap_or(0)
            });
        *count += 1;
        *count
    }

    /// Failed attempts recorded for a message.
    pub fn failed_attempts(&self, identifier: &BrokerMessageIdentifier) -> u32 {
        lock(&self.failed_attempts)
            .get(identifier)
            .copied()
            .unwrap_or(0)
    }

    /// Commit the identifiers and forget their failed attempts.
    pub async fn commit(&self, identifiers: &[BrokerMessageIdentifier]) -> Result<()> {
        self.transport
            .commit_core(identifiers)
            .await
            .map_err(|e| self.failure("commit", e))?;

        let mut failed_attempts = lock(&self.failed_attempts);
        for identifier in identifiers {
            failed_attempts.remove(identifier);
        }
        debug!(
            consumer_id = %self.id,
            count = identifiers.len(),
            "Committed"
        );
        Ok(())
    }

    /// Roll back the identifiers so they are redelivered.
    ///
    /// Failed attempts are kept for the redelivery.
    pub async fn rollback(&self, identifiers: &[BrokerMessageIdentifier]) -> Result<()> {
        self.transport
            .rollback_core(identifiers)
            .await
            .map_err(|e| self.failure("rollback", e))?;

        debug!(
            consumer_id = %self.id,
            count = identifiers.len(),
            "Rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests;
