use super::*;
use crate::broker::{
    BrokerMessageIdentifier, EndpointConfig, CHUNKS_COUNT_HEADER, CHUNK_INDEX_HEADER,
};
use crate::test_utils::{endpoint_from, test_endpoint, MockProducerTransport};

fn producer(endpoint: Arc<Endpoint>) -> (Producer, Arc<MockProducerTransport>) {
    let transport = Arc::new(MockProducerTransport::new());
    let strategy = Arc::new(DefaultProduceStrategy::new(transport.clone()));
    (Producer::new(endpoint, strategy), transport)
}

fn chunked_endpoint(chunk_size: usize) -> Arc<Endpoint> {
    let mut config = EndpointConfig::new("files");
    config.chunk_size = Some(chunk_size);
    endpoint_from(config)
}

#[test]
fn test_default_pipeline_order() {
    assert_eq!(
        producer_pipeline().names(),
        vec!["chunking", "produce_strategy"]
    );
}

#[tokio::test]
async fn test_produce_single_message() {
    let (producer, transport) = producer(test_endpoint("orders"));

    let produced = producer
        .produce(
            Some(Bytes::from_static(b"{}")),
            MessageHeaders::new().with("x-tenant", "acme"),
        )
        .await
        .unwrap();

    assert_eq!(produced.len(), 1);
    let envelope = &produced[0];
    assert_eq!(
        envelope.identifier(),
        Some(&BrokerMessageIdentifier::offset("orders", 0, 0))
    );
    assert_eq!(envelope.headers().get("x-tenant"), Some("acme"));
    assert!(envelope.headers().contains(MESSAGE_ID_HEADER));
    assert_eq!(transport.produced().await.len(), 1);
}

#[tokio::test]
async fn test_existing_message_id_is_kept() {
    let (producer, _) = producer(test_endpoint("orders"));

    let produced = producer
        .produce(None, MessageHeaders::new().with(MESSAGE_ID_HEADER, "m-42"))
        .await
        .unwrap();

    assert_eq!(produced[0].headers().get(MESSAGE_ID_HEADER), Some("m-42"));
    assert_eq!(
        produced[0]
            .headers()
            .iter()
            .filter(|h| h.name == MESSAGE_ID_HEADER)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_large_body_is_chunked() {
    let (producer, transport) = producer(chunked_endpoint(4));

    let produced = producer
        .produce(Some(Bytes::from_static(b"0123456789")), MessageHeaders::new())
        .await
        .unwrap();

    assert_eq!(produced.len(), 3);
    let message_id = produced[0].headers().get(MESSAGE_ID_HEADER).unwrap();
    for (index, chunk) in produced.iter().enumerate() {
        assert_eq!(chunk.headers().get(MESSAGE_ID_HEADER), Some(message_id));
        assert_eq!(chunk.headers().get_as::<usize>(CHUNK_INDEX_HEADER), Some(index));
        assert_eq!(chunk.headers().get_as::<usize>(CHUNKS_COUNT_HEADER), Some(3));
    }
    assert_eq!(produced[2].body(), Some(&Bytes::from_static(b"89")));
    assert_eq!(transport.produced().await.len(), 3);
}

#[tokio::test]
async fn test_small_body_is_not_chunked() {
    let (producer, _) = producer(chunked_endpoint(16));

    let produced = producer
        .produce(Some(Bytes::from_static(b"short")), MessageHeaders::new())
        .await
        .unwrap();

    assert_eq!(produced.len(), 1);
    assert!(!produced[0].headers().contains(CHUNK_INDEX_HEADER));
}

#[tokio::test]
async fn test_transport_failure_is_reported() {
    let (producer, transport) = producer(test_endpoint("orders"));
    transport.set_fail_on_produce(true);

    let err = producer
        .produce(Some(Bytes::from_static(b"{}")), MessageHeaders::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProduceError::Pipeline(PipelineError::Produce(_))
    ));
    assert!(transport.produced().await.is_empty());
}
