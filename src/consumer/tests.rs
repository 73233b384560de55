use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::*;
use crate::broker::{BatchSettings, EndpointConfig};
use crate::consumer::behaviors::{
    BatchSequencerBehavior, DeserializerBehavior, ErrorPolicyBehavior, SubscriberBehavior,
    BATCH_SEQUENCE_PREFIX,
};
use crate::pipeline::{Behavior, Next};
use crate::sequence::AbortReason;
use crate::test_utils::{
    endpoint_from, make_envelope, test_consumer, test_endpoint, CollectingHandler,
    MockBrokerTransport,
};

fn setup() -> (Arc<Consumer>, Arc<MockBrokerTransport>, Arc<CollectingHandler>) {
    setup_with(test_endpoint("orders"))
}

fn setup_with(
    endpoint: Arc<Endpoint>,
) -> (Arc<Consumer>, Arc<MockBrokerTransport>, Arc<CollectingHandler>) {
    let transport = Arc::new(MockBrokerTransport::new());
    let handler = Arc::new(CollectingHandler::new());
    let consumer = test_consumer(endpoint, Arc::clone(&transport), handler.clone());
    (consumer, transport, handler)
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_connect_starts_consuming() {
    let (consumer, transport, _) = setup();

    consumer.connect().await.unwrap();

    assert!(consumer.is_connected());
    assert!(consumer.is_consuming());
    assert_eq!(transport.connect_calls(), 1);
    assert_eq!(transport.start_calls(), 1);
    assert_eq!(consumer.status_info().status(), ConsumerStatus::Consuming);

    let history: Vec<_> = consumer
        .status_info()
        .history()
        .into_iter()
        .map(|change| change.status)
        .collect();
    assert_eq!(
        history,
        vec![ConsumerStatus::Connected, ConsumerStatus::Consuming]
    );
}

#[tokio::test]
async fn test_connect_when_connected_is_noop() {
    let (consumer, transport, _) = setup();

    consumer.connect().await.unwrap();
    consumer.connect().await.unwrap();

    assert_eq!(transport.connect_calls(), 1);
    assert_eq!(transport.start_calls(), 1);
}

#[tokio::test]
async fn test_concurrent_connect_is_single_flight() {
    let (consumer, transport, _) = setup();
    transport.set_connect_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(consumer.connect(), consumer.connect());

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(transport.connect_calls(), 1);
    assert_eq!(transport.start_calls(), 1);
}

#[tokio::test]
async fn test_concurrent_connect_shares_failure() {
    let (consumer, transport, _) = setup();
    transport.set_connect_delay(Duration::from_millis(50));
    transport.fail_next_connects(1);

    let (first, second) = tokio::join!(consumer.connect(), consumer.connect());

    let first = first.unwrap_err();
    assert_eq!(Err::<(), _>(first.clone()), second);
    assert!(matches!(
        first,
        ConsumerError::Transport {
            operation: "connect",
            ..
        }
    ));
    assert_eq!(transport.connect_calls(), 1);
    assert!(!consumer.is_connected());
    assert_eq!(consumer.status_info().status(), ConsumerStatus::Disconnected);

    // The in-flight attempt is cleared, so a retry reaches the broker again.
    consumer.connect().await.unwrap();
    assert_eq!(transport.connect_calls(), 2);
    assert!(consumer.is_connected());
}

#[tokio::test]
async fn test_start_failure_leaves_consumer_connected() {
    let (consumer, transport, _) = setup();
    transport.set_fail_on_start(true);

    let err = consumer.connect().await.unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::Transport {
            operation: "start",
            ..
        }
    ));
    assert!(consumer.is_connected());
    assert!(!consumer.is_consuming());

    transport.set_fail_on_start(false);
    consumer.start().await.unwrap();
    assert!(consumer.is_consuming());
}

#[tokio::test]
async fn test_start_requires_connection() {
    let (consumer, transport, _) = setup();

    assert_eq!(consumer.start().await, Err(ConsumerError::NotConnected));
    assert_eq!(transport.start_calls(), 0);
}

#[tokio::test]
async fn test_stop_and_restart() {
    let (consumer, transport, _) = setup();
    consumer.connect().await.unwrap();

    consumer.stop().await.unwrap();
    assert!(!consumer.is_consuming());
    assert_eq!(consumer.status_info().status(), ConsumerStatus::Connected);

    // Not consuming: stopping again does not reach the broker.
    consumer.stop().await.unwrap();
    assert_eq!(transport.stop_calls(), 1);

    consumer.start().await.unwrap();
    assert!(consumer.is_consuming());
    assert_eq!(transport.start_calls(), 2);
}

#[tokio::test]
async fn test_disconnect_when_disconnected_is_noop() {
    let (consumer, transport, _) = setup();

    consumer.disconnect().await.unwrap();

    assert_eq!(transport.stop_calls(), 0);
    assert_eq!(transport.wait_calls(), 0);
    assert_eq!(transport.disconnect_calls(), 0);
}

#[tokio::test]
async fn test_disconnect_stops_and_disconnects() {
    let (consumer, transport, _) = setup();
    consumer.connect().await.unwrap();

    consumer.disconnect().await.unwrap();

    assert_eq!(transport.stop_calls(), 1);
    assert_eq!(transport.wait_calls(), 1);
    assert_eq!(transport.disconnect_calls(), 1);
    assert!(!consumer.is_connected());
    assert!(!consumer.is_consuming());
    assert_eq!(consumer.status_info().status(), ConsumerStatus::Disconnected);

    consumer.disconnect().await.unwrap();
    assert_eq!(transport.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_disconnect_when_not_consuming_calls_stop_hook() {
    let (consumer, transport, _) = setup();
    consumer.connect().await.unwrap();
    consumer.stop().await.unwrap();

    consumer.disconnect().await.unwrap();

    // Once from stop, once directly from disconnect.
    assert_eq!(transport.stop_calls(), 2);
    assert_eq!(transport.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_disconnect_aborts_pending_sequences() {
    let mut config = EndpointConfig::new("orders");
    config.batch = Some(BatchSettings {
        size: 10,
        max_wait_ms: None,
    });
    let (consumer, transport, handler) = setup_with(endpoint_from(config));
    consumer.connect().await.unwrap();

    for offset in 0..2 {
        let envelope = make_envelope(consumer.endpoint(), offset);
        transport
            .deliver(
                envelope.body().cloned(),
                envelope.headers().clone(),
                envelope.identifier().clone(),
            )
            .await
            .unwrap();
    }

    let stores = consumer.sequence_stores();
    assert_eq!(stores.len(), 1);
    let batch = stores[0].get(BATCH_SEQUENCE_PREFIX, true).unwrap();
    assert!(batch.is_pending());

    consumer.disconnect().await.unwrap();

    assert_eq!(batch.abort_reason(), Some(AbortReason::ConsumerAborted));
    assert!(consumer.sequence_stores().is_empty());
    assert!(handler.batches().is_empty());
    assert!(transport.commits().await.is_empty());
}

#[tokio::test]
async fn test_failed_disconnect_can_be_retried() {
    let (consumer, transport, _) = setup();
    consumer.connect().await.unwrap();
    transport.set_fail_on_disconnect(true);

    let err = consumer.disconnect().await.unwrap_err();
    assert!(matches!(
        err,
        ConsumerError::Transport {
            operation: "disconnect",
            ..
        }
    ));
    assert!(consumer.is_connected());

    // The disconnecting guard is cleared: messages are accepted again.
    let envelope = make_envelope(consumer.endpoint(), 0);
    transport
        .deliver(
            envelope.body().cloned(),
            envelope.headers().clone(),
            envelope.identifier().clone(),
        )
        .await
        .unwrap();

    transport.set_fail_on_disconnect(false);
    consumer.disconnect().await.unwrap();

    assert_eq!(transport.disconnect_calls(), 2);
    assert!(!consumer.is_connected());
    assert_eq!(consumer.status_info().status(), ConsumerStatus::Disconnected);
}

#[tokio::test]
async fn test_cancelled_disconnect_can_be_retried() {
    let (consumer, transport, _) = setup();
    consumer.connect().await.unwrap();
    transport.set_disconnect_delay(Duration::from_millis(500));

    let cancelled =
        tokio::time::timeout(Duration::from_millis(20), consumer.disconnect()).await;
    assert!(cancelled.is_err());
    assert!(consumer.is_connected());

    transport.set_disconnect_delay(Duration::ZERO);
    consumer.disconnect().await.unwrap();

    assert_eq!(transport.disconnect_calls(), 2);
    assert!(!consumer.is_connected());
}

#[tokio::test]
async fn test_dispose_during_reconnect_disconnects() {
    let (consumer, transport, _) = setup();
    consumer.connect().await.unwrap();
    transport.set_disconnect_delay(Duration::from_millis(500));

    consumer.trigger_reconnect().await.unwrap();
    // Let the reconnection reach the broker disconnect.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.disconnect_calls(), 1);

    transport.set_disconnect_delay(Duration::ZERO);
    consumer.dispose().await;

    assert_eq!(transport.disconnect_calls(), 2);
    assert!(!consumer.is_connected());
    assert_eq!(consumer.status_info().status(), ConsumerStatus::Disconnected);
    assert!(consumer.take_reconnect_task().is_none());
}

/// Holds each message until released, after decoding.
#[derive(Default)]
struct GateBehavior {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Behavior<ConsumerPipelineContext> for GateBehavior {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn sort_index(&self) -> i32 {
        350
    }

    async fn handle(
        &self,
        context: ConsumerPipelineContext,
        next: Next<ConsumerPipelineContext>,
    ) -> crate::pipeline::Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        next.run(context).await
    }
}

#[tokio::test]
async fn test_batch_started_during_disconnect_is_aborted() {
    let mut config = EndpointConfig::new("orders");
    config.batch = Some(BatchSettings {
        size: 10,
        max_wait_ms: None,
    });
    let gate = Arc::new(GateBehavior::default());
    let behaviors: Vec<Arc<dyn Behavior<ConsumerPipelineContext>>> = vec![
        Arc::new(ErrorPolicyBehavior),
        Arc::new(DeserializerBehavior),
        gate.clone(),
        Arc::new(BatchSequencerBehavior),
        Arc::new(SubscriberBehavior),
    ];
    let transport = Arc::new(MockBrokerTransport::new());
    let handler = Arc::new(CollectingHandler::new());
    let consumer = Consumer::new(
        endpoint_from(config),
        transport.clone(),
        Pipeline::new(behaviors),
        Services::new().with_handler(handler.clone()),
        ReconnectConfig::default(),
    );
    consumer.connect().await.unwrap();

    let envelope = make_envelope(consumer.endpoint(), 0);
    let delivery = {
        let transport = Arc::clone(&transport);
        let envelope = envelope.clone();
        tokio::spawn(async move {
            transport
                .deliver(
                    envelope.body().cloned(),
                    envelope.headers().clone(),
                    envelope.identifier().clone(),
                )
                .await
        })
    };

    gate.entered.notified().await;
    let store = Arc::clone(&consumer.sequence_stores()[0]);

    consumer.disconnect().await.unwrap();
    gate.release.notify_one();

    tokio::time::timeout(Duration::from_secs(2), delivery)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(store.is_empty());
    assert!(!store.has_pending_sequences());
    assert!(handler.batches().is_empty());
    assert!(transport.commits().await.is_empty());
    assert_eq!(
        transport.rollbacks().await,
        vec![envelope.identifier().clone()]
    );
}

// ============================================================================
// Sequence stores
// ============================================================================

#[tokio::test]
async fn test_sequence_store_per_partition() {
    let (consumer, _, _) = setup();

    let p0 = BrokerMessageIdentifier::offset("orders", 0, 1);
    let p0_later = BrokerMessageIdentifier::offset("orders", 0, 7);
    let p1 = BrokerMessageIdentifier::offset("orders", 1, 1);

    let store_p0 = consumer.get_sequence_store(&p0);
    assert!(Arc::ptr_eq(&store_p0, &consumer.get_sequence_store(&p0_later)));
    assert!(!Arc::ptr_eq(&store_p0, &consumer.get_sequence_store(&p1)));
    assert_eq!(consumer.sequence_stores().len(), 2);
}

#[tokio::test]
async fn test_sequence_store_shared_across_partitions() {
    let mut config = EndpointConfig::new("orders");
    config.process_partitions_independently = false;
    let (consumer, _, _) = setup_with(endpoint_from(config));

    let p0 = consumer.get_sequence_store(&BrokerMessageIdentifier::offset("orders", 0, 1));
    let p1 = consumer.get_sequence_store(&BrokerMessageIdentifier::offset("orders", 1, 1));

    assert!(Arc::ptr_eq(&p0, &p1));
    assert_eq!(consumer.sequence_stores().len(), 1);
}

#[tokio::test]
async fn test_concurrent_store_resolution_creates_one_store() {
    let (consumer, _, _) = setup();
    let identifier = BrokerMessageIdentifier::offset("orders", 3, 0);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let consumer = Arc::clone(&consumer);
            let identifier = identifier.clone();
            tokio::spawn(async move { consumer.get_sequence_store(&identifier).id() })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

// ============================================================================
// Failed attempts, commit and rollback
// ============================================================================

#[tokio::test]
async fn test_failed_attempts_seeded_from_header() {
    let (consumer, _, _) = setup();
    let endpoint = Arc::clone(consumer.endpoint());
    let envelope = InboundEnvelope::new(
        None,
        MessageHeaders::new().with(FAILED_ATTEMPTS_HEADER, 2),
        endpoint,
        "orders",
        BrokerMessageIdentifier::offset("orders", 0, 5),
    );

    assert_eq!(consumer.increment_failed_attempts(&envelope), 3);
    assert_eq!(consumer.increment_failed_attempts(&envelope), 4);
    assert_eq!(consumer.failed_attempts(envelope.identifier()), 4);
}

#[tokio::test]
async fn test_commit_purges_only_committed_identifiers() {
    let (consumer, transport, _) = setup();
    let first = make_envelope(consumer.endpoint(), 1);
    let second = make_envelope(consumer.endpoint(), 2);
    consumer.increment_failed_attempts(&first);
    consumer.increment_failed_attempts(&second);

    consumer
        .commit(&[first.identifier().clone()])
        .await
        .unwrap();

    assert_eq!(consumer.failed_attempts(first.identifier()), 0);
    assert_eq!(consumer.failed_attempts(second.identifier()), 1);
    assert_eq!(transport.commits().await, vec![first.identifier().clone()]);
}

#[tokio::test]
async fn test_rollback_keeps_failed_attempts() {
    let (consumer, transport, _) = setup();
    let envelope = make_envelope(consumer.endpoint(), 1);
    consumer.increment_failed_attempts(&envelope);

    consumer
        .rollback(&[envelope.identifier().clone()])
        .await
        .unwrap();

    assert_eq!(consumer.failed_attempts(envelope.identifier()), 1);
    assert_eq!(
        transport.rollbacks().await,
        vec![envelope.identifier().clone()]
    );
}

#[tokio::test]
async fn test_commit_failure_keeps_failed_attempts() {
    let (consumer, transport, _) = setup();
    transport.set_fail_on_commit(true);
    let envelope = make_envelope(consumer.endpoint(), 1);
    consumer.increment_failed_attempts(&envelope);

    let err = consumer
        .commit(&[envelope.identifier().clone()])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConsumerError::Transport {
            operation: "commit",
            ..
        }
    ));
    assert_eq!(consumer.failed_attempts(envelope.identifier()), 1);
}

// ============================================================================
// Reconnection and disposal
// ============================================================================

#[tokio::test]
async fn test_trigger_reconnect_cycles_connection() {
    let (consumer, transport, _) = setup();
    consumer.connect().await.unwrap();

    consumer.trigger_reconnect().await.unwrap();
    consumer.take_reconnect_task().unwrap().join().await;

    assert_eq!(transport.disconnect_calls(), 1);
    assert_eq!(transport.connect_calls(), 2);
    assert!(consumer.is_connected());
    assert!(consumer.is_consuming());
}

#[tokio::test]
async fn test_trigger_reconnect_retries_failed_connects() {
    let (consumer, transport, _) = setup();
    consumer.connect().await.unwrap();
    transport.fail_next_connects(2);

    consumer.trigger_reconnect().await.unwrap();
    consumer.take_reconnect_task().unwrap().join().await;

    assert_eq!(transport.connect_calls(), 4);
    assert!(consumer.is_consuming());
}

#[tokio::test]
async fn test_dispose_never_fails() {
    let (consumer, transport, _) = setup();
    consumer.connect().await.unwrap();

    consumer.dispose().await;
    consumer.dispose().await;

    assert_eq!(transport.disconnect_calls(), 1);
    assert!(!consumer.is_connected());
}
