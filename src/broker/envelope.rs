//! Raw inbound and outbound envelopes.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::{BrokerMessageIdentifier, Endpoint, MessageHeaders};

/// Sequence membership attached to an envelope once it is routed into a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceInfo {
    /// Id of the sequence the envelope belongs to.
    pub sequence_id: String,
    /// One-based position of the envelope within the sequence.
    pub position: usize,
}

/// A message received from the broker.
///
/// Built once per delivery and never mutated; behaviors that need a
/// different envelope build a new one with the `with_*` methods.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    body: Option<Bytes>,
    headers: MessageHeaders,
    endpoint: Arc<Endpoint>,
    actual_endpoint_name: String,
    identifier: BrokerMessageIdentifier,
    diagnostics: Option<HashMap<String, String>>,
    message: Option<serde_json::Value>,
    sequence: Option<SequenceInfo>,
}

impl InboundEnvelope {
    pub fn new(
        body: Option<Bytes>,
        headers: MessageHeaders,
        endpoint: Arc<Endpoint>,
        actual_endpoint_name: impl Into<String>,
        identifier: BrokerMessageIdentifier,
    ) -> Self {
        Self {
            body,
            headers,
            endpoint,
            actual_endpoint_name: actual_endpoint_name.into(),
            identifier,
            diagnostics: None,
            message: None,
            sequence: None,
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Name the message was actually consumed from (topic of a wildcard subscription).
    pub fn actual_endpoint_name(&self) -> &str {
        &self.actual_endpoint_name
    }

    pub fn identifier(&self) -> &BrokerMessageIdentifier {
        &self.identifier
    }

    pub fn diagnostics(&self) -> Option<&HashMap<String, String>> {
        self.diagnostics.as_ref()
    }

    /// Decoded message, set by the deserializer behavior.
    pub fn message(&self) -> Option<&serde_json::Value> {
        self.message.as_ref()
    }

    pub fn sequence(&self) -> Option<&SequenceInfo> {
        self.sequence.as_ref()
    }

    /// Tombstone / empty message.
    pub fn is_tombstone(&self) -> bool {
        self.body.as_ref().map_or(true, |b| b.is_empty())
    }

    pub fn with_diagnostics(mut self, diagnostics: HashMap<String, String>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn with_message(mut self, message: Option<serde_json::Value>) -> Self {
        self.message = message;
        self
    }

    pub fn with_sequence(mut self, sequence: SequenceInfo) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// A message about to be produced.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    body: Option<Bytes>,
    headers: MessageHeaders,
    endpoint: Arc<Endpoint>,
    identifier: Option<BrokerMessageIdentifier>,
}

impl OutboundEnvelope {
    pub fn new(body: Option<Bytes>, headers: MessageHeaders, endpoint: Arc<Endpoint>) -> Self {
        Self {
            body,
            headers,
            endpoint,
            identifier: None,
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Position assigned by the broker once produced.
    pub fn identifier(&self) -> Option<&BrokerMessageIdentifier> {
        self.identifier.as_ref()
    }

    pub fn with_identifier(mut self, identifier: BrokerMessageIdentifier) -> Self {
        self.identifier = Some(identifier);
        self
    }
}
