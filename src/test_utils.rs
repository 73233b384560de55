//! Test utilities and mock implementations.
//!
//! Mock transports and a collecting handler for exercising consumers and
//! producers without a broker.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::RwLock;

use crate::broker::{
    BrokerMessageIdentifier, Endpoint, EndpointConfig, InboundEnvelope, MessageHeaders,
    OutboundEnvelope, CHUNKS_COUNT_HEADER, CHUNK_INDEX_HEADER, MESSAGE_ID_HEADER,
};
use crate::config::ReconnectConfig;
use crate::consumer::behaviors::consumer_pipeline;
use crate::consumer::{
    BrokerTransport, ConsumedMessage, Consumer, ConsumerError, HandlerError, MessageHandler,
    Services, TransportError,
};
use crate::producer::ProducerTransport;

/// Partition used by [`make_envelope`] and [`make_chunk`].
pub const TEST_PARTITION: i32 = 0;

/// Build a test endpoint with default settings.
pub fn test_endpoint(name: &str) -> Arc<Endpoint> {
    endpoint_from(EndpointConfig::new(name))
}

/// Build an endpoint from a configuration that is known to be valid.
pub fn endpoint_from(config: EndpointConfig) -> Arc<Endpoint> {
    Arc::new(config.build().expect("test endpoint configuration is valid"))
}

/// Inbound envelope at `offset` of the endpoint's topic, with a JSON body.
pub fn make_envelope(endpoint: &Arc<Endpoint>, offset: i64) -> InboundEnvelope {
    InboundEnvelope::new(
        Some(Bytes::from(format!(r#"{{"offset":{offset}}}"#))),
        MessageHeaders::new(),
        Arc::clone(endpoint),
        endpoint.name(),
        BrokerMessageIdentifier::offset(endpoint.name(), TEST_PARTITION, offset),
    )
}

/// Chunk headers for chunk `index` of `message_id`.
pub fn chunk_headers(message_id: &str, index: usize, count: Option<usize>) -> MessageHeaders {
    let mut headers = MessageHeaders::new()
        .with(MESSAGE_ID_HEADER, message_id)
        .with(CHUNK_INDEX_HEADER, index);
    if let Some(count) = count {
        headers.add(CHUNKS_COUNT_HEADER, count);
    }
    headers
}

/// Inbound chunk at `offset`. The body is the chunk index as text.
pub fn make_chunk(
    endpoint: &Arc<Endpoint>,
    message_id: &str,
    index: usize,
    count: Option<usize>,
    offset: i64,
) -> InboundEnvelope {
    InboundEnvelope::new(
        Some(Bytes::from(index.to_string())),
        chunk_headers(message_id, index, count),
        Arc::clone(endpoint),
        endpoint.name(),
        BrokerMessageIdentifier::offset(endpoint.name(), TEST_PARTITION, offset),
    )
}

/// Consumer with the default pipeline and `handler`.
pub fn test_consumer(
    endpoint: Arc<Endpoint>,
    transport: Arc<MockBrokerTransport>,
    handler: Arc<dyn MessageHandler>,
) -> Arc<Consumer> {
    Consumer::new(
        endpoint,
        transport,
        consumer_pipeline(),
        Services::new().with_handler(handler),
        ReconnectConfig {
            min_delay_ms: 1,
            max_delay_ms: 5,
            max_attempts: 5,
        },
    )
}

/// Poll `condition` every few milliseconds until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Broker transport
// ============================================================================

/// Mock broker transport recording every hook call.
#[derive(Default)]
pub struct MockBrokerTransport {
    consumer: Mutex<Option<Weak<Consumer>>>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    wait_calls: AtomicUsize,
    connect_failures: AtomicUsize,
    fail_on_start: AtomicBool,
    fail_on_commit: AtomicBool,
    fail_on_disconnect: AtomicBool,
    connect_delay_ms: AtomicU64,
    disconnect_delay_ms: AtomicU64,
    commits: RwLock<Vec<BrokerMessageIdentifier>>,
    rollbacks: RwLock<Vec<BrokerMessageIdentifier>>,
}

impl MockBrokerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_on_start(&self, fail: bool) {
        self.fail_on_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_disconnect(&self, fail: bool) {
        self.fail_on_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.disconnect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn wait_calls(&self) -> usize {
        self.wait_calls.load(Ordering::SeqCst)
    }

    pub async fn commits(&self) -> Vec<BrokerMessageIdentifier> {
        self.commits.read().await.clone()
    }

    pub async fn rollbacks(&self) -> Vec<BrokerMessageIdentifier> {
        self.rollbacks.read().await.clone()
    }

    fn bound_consumer(&self) -> Result<Arc<Consumer>, ConsumerError> {
        self.consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(ConsumerError::Dropped)
    }

    /// Deliver a message to the bound consumer, as a consume loop would.
    pub async fn deliver(
        &self,
        body: Option<Bytes>,
        headers: MessageHeaders,
        identifier: BrokerMessageIdentifier,
    ) -> Result<(), ConsumerError> {
        let consumer = self.bound_consumer()?;
        let endpoint_name = consumer.endpoint().name().to_string();
        consumer
            .handle_message(body, headers, &endpoint_name, identifier)
            .await
    }

    /// Deliver several partitions: messages of a partition in order, up to
    /// the endpoint's max degree of parallelism partitions at a time.
    pub async fn deliver_partitions(
        &self,
        partitions: Vec<Vec<InboundEnvelope>>,
    ) -> Result<(), ConsumerError> {
        let parallelism = self
            .bound_consumer()?
            .endpoint()
            .max_degree_of_parallelism();

        let results: Vec<Result<(), ConsumerError>> = futures::stream::iter(partitions)
            .map(|envelopes| async move {
                for envelope in envelopes {
                    self.deliver(
                        envelope.body().cloned(),
                        envelope.headers().clone(),
                        envelope.identifier().clone(),
                    )
                    .await?;
                }
                Ok::<(), ConsumerError>(())
            })
            .buffer_unordered(parallelism.max(1))
            .collect()
            .await;

        results.into_iter().collect()
    }
}

#[async_trait]
impl BrokerTransport for MockBrokerTransport {
    fn bind(&self, consumer: Weak<Consumer>) {
        *self.consumer.lock().unwrap_or_else(PoisonError::into_inner) = Some(consumer);
    }

    async fn connect_core(&self) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let failing = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connection(
                "Mock connect failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn disconnect_core(&self) -> Result<(), TransportError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.disconnect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.fail_on_disconnect.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(
                "Mock disconnect failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn start_core(&self) -> Result<(), TransportError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_start.load(Ordering::SeqCst) {
            return Err(TransportError::Operation("Mock start failure".to_string()));
        }
        Ok(())
    }

    async fn stop_core(&self) -> Result<(), TransportError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_core(
        &self,
        identifiers: &[BrokerMessageIdentifier],
    ) -> Result<(), TransportError> {
        if self.fail_on_commit.load(Ordering::SeqCst) {
            return Err(TransportError::Operation("Mock commit failure".to_string()));
        }
        self.commits.write().await.extend_from_slice(identifiers);
        Ok(())
    }

    async fn rollback_core(
        &self,
        identifiers: &[BrokerMessageIdentifier],
    ) -> Result<(), TransportError> {
        self.rollbacks.write().await.extend_from_slice(identifiers);
        Ok(())
    }

    async fn wait_until_consuming_stopped_core(&self) -> Result<(), TransportError> {
        self.wait_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Message handler
// ============================================================================

/// Handler collecting what it receives.
///
/// Single envelopes and batches are kept apart; a batch stream is drained
/// before the handler returns.
#[derive(Default)]
pub struct CollectingHandler {
    singles: Mutex<Vec<InboundEnvelope>>,
    batches: Mutex<Vec<Vec<InboundEnvelope>>>,
    failures_left: AtomicUsize,
    delay_ms: AtomicU64,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` invocations.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Sleep before handling each single envelope.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn singles(&self) -> Vec<InboundEnvelope> {
        self.singles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn batches(&self) -> Vec<Vec<InboundEnvelope>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageHandler for CollectingHandler {
    async fn handle(&self, message: ConsumedMessage) -> Result<(), HandlerError> {
        match message {
            ConsumedMessage::Single(envelope) => {
                let delay = self.delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err("Mock handler failure".into());
                }
                self.singles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(envelope);
            }
            ConsumedMessage::Stream(mut stream) => {
                let mut batch = Vec::new();
                while let Some(item) = stream.next().await {
                    batch.push(item?);
                }
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err("Mock handler failure".into());
                }
                self.batches
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(batch);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Producer transport
// ============================================================================

/// Mock producer transport assigning increasing offsets.
#[derive(Default)]
pub struct MockProducerTransport {
    produced: RwLock<Vec<OutboundEnvelope>>,
    next_offset: AtomicI64,
    fail_on_produce: AtomicBool,
}

impl MockProducerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_produce(&self, fail: bool) {
        self.fail_on_produce.store(fail, Ordering::SeqCst);
    }

    pub async fn produced(&self) -> Vec<OutboundEnvelope> {
        self.produced.read().await.clone()
    }
}

#[async_trait]
impl ProducerTransport for MockProducerTransport {
    async fn produce_core(
        &self,
        envelope: &OutboundEnvelope,
    ) -> Result<BrokerMessageIdentifier, TransportError> {
        if self.fail_on_produce.load(Ordering::SeqCst) {
            return Err(TransportError::Operation(
                "Mock produce failure".to_string(),
            ));
        }
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.produced.write().await.push(envelope.clone());
        Ok(BrokerMessageIdentifier::offset(
            envelope.endpoint().name(),
            TEST_PARTITION,
            offset,
        ))
    }
}
