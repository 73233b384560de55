//! Message sequences.
//!
//! A sequence groups related messages (the chunks of one logical message,
//! or a batch) and republishes them, in arrival order, on a single-pass
//! stream read by the rest of the pipeline.
//!
//! State machine:
//!
//! ```text
//!   new ──add──▶ Pending ──rule satisfied──▶ Complete
//!                   │
//!                   └──abort──▶ Aborted(reason)
//! ```
//!
//! `Complete` and `Aborted` are terminal: further `add` calls fail. The
//! stream ends when the sequence leaves `Pending`; an aborted sequence ends
//! its stream with an `Err(SequenceError::Aborted)` item instead of
//! silently truncating.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::broker::{
    BrokerMessageIdentifier, InboundEnvelope, SequenceInfo, CHUNKS_COUNT_HEADER,
    CHUNK_INDEX_HEADER, CHUNK_IS_LAST_HEADER,
};
use crate::consumer::ConsumerPipelineContext;
use crate::pipeline::PipelineError;

mod store;

pub use store::SequenceStore;

/// Result type for sequence operations.
pub type Result<T> = std::result::Result<T, SequenceError>;

/// Errors raised by sequences and observed on their streams.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("Sequence '{id}' is {status}, no further messages accepted")]
    NotPending { id: String, status: SequenceStatus },

    #[error("Sequence '{id}' expected chunk {expected} but got {actual}")]
    OutOfOrderChunk {
        id: String,
        expected: usize,
        actual: usize,
    },

    #[error("Sequence '{id}' aborted: {reason}")]
    Aborted { id: String, reason: AbortReason },

    #[error("Sequence '{id}' stream was dropped before completion")]
    StreamClosed { id: String },
}

/// Why a sequence was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The hosting consumer disconnected.
    ConsumerAborted,
    /// A newer sequence started before this one completed.
    IncompleteSequence,
    /// Another sequence with the same id replaced it in the store.
    Replaced,
    /// The stream reader went away before the sequence completed.
    EnumerationAborted,
    /// Processing failed.
    Error(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsumerAborted => f.write_str("consumer aborted"),
            Self::IncompleteSequence => f.write_str("incomplete sequence"),
            Self::Replaced => f.write_str("replaced by a newer sequence"),
            Self::EnumerationAborted => f.write_str("enumeration aborted"),
            Self::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// Current state of a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceStatus {
    Pending,
    Complete,
    Aborted(AbortReason),
}

impl SequenceStatus {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for SequenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Complete => f.write_str("complete"),
            Self::Aborted(reason) => write!(f, "aborted ({})", reason),
        }
    }
}

/// Rule deciding when a sequence is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionRule {
    /// Chunks of one message. Complete when the declared count is reached
    /// or a chunk flagged as last is added.
    Chunks,
    /// Batch of messages. Complete at `size` envelopes or after `max_wait`.
    Batch {
        size: usize,
        max_wait: Option<Duration>,
    },
}

struct SequenceState {
    status: SequenceStatus,
    is_new: bool,
    length: usize,
    total_length: Option<usize>,
    offsets: Vec<BrokerMessageIdentifier>,
    sender: Option<mpsc::Sender<InboundEnvelope>>,
}

fn lock(state: &Mutex<SequenceState>) -> MutexGuard<'_, SequenceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stateful accumulator of related messages.
pub struct Sequence {
    id: String,
    rule: CompletionRule,
    state: Arc<Mutex<SequenceState>>,
    stream: Mutex<Option<SequenceStream>>,
    processing: Mutex<Option<JoinHandle<std::result::Result<(), PipelineError>>>>,
    context: Mutex<Option<ConsumerPipelineContext>>,
}

impl Sequence {
    /// Create a pending sequence whose stream buffers up to `backpressure_limit` envelopes.
    pub fn new(
        id: impl Into<String>,
        rule: CompletionRule,
        total_length: Option<usize>,
        backpressure_limit: usize,
    ) -> Arc<Self> {
        let id = id.into();
        let (sender, receiver) = mpsc::channel(backpressure_limit.max(1));
        let state = Arc::new(Mutex::new(SequenceState {
            status: SequenceStatus::Pending,
            is_new: true,
            length: 0,
            total_length,
            offsets: Vec::new(),
            sender: Some(sender),
        }));

        let stream = SequenceStream {
            id: id.clone(),
            receiver: ReceiverStream::new(receiver),
            state: Arc::clone(&state),
            finished: false,
        };

        let sequence = Arc::new(Self {
            id,
            rule,
            state,
            stream: Mutex::new(Some(stream)),
            processing: Mutex::new(None),
            context: Mutex::new(None),
        });

        if let CompletionRule::Batch {
            max_wait: Some(max_wait),
            ..
        } = sequence.rule
        {
            let weak = Arc::downgrade(&sequence);
            tokio::spawn(async move {
                tokio::time::sleep(max_wait).await;
                if let Some(sequence) = weak.upgrade() {
                    if sequence.complete() {
                        debug!(sequence_id = %sequence.id, "Batch completed by timeout");
                    }
                }
            });
        }

        sequence
    }

    /// Create a chunk sequence.
    pub fn chunks(
        id: impl Into<String>,
        total_length: Option<usize>,
        backpressure_limit: usize,
    ) -> Arc<Self> {
        Self::new(id, CompletionRule::Chunks, total_length, backpressure_limit)
    }

    /// Create a batch sequence.
    pub fn batch(
        id: impl Into<String>,
        size: usize,
        max_wait: Option<Duration>,
        backpressure_limit: usize,
    ) -> Arc<Self> {
        Self::new(
            id,
            CompletionRule::Batch { size, max_wait },
            None,
            backpressure_limit,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rule(&self) -> &CompletionRule {
        &self.rule
    }

    /// True until a second envelope is added.
    pub fn is_new(&self) -> bool {
        lock(&self.state).is_new
    }

    pub fn length(&self) -> usize {
        lock(&self.state).length
    }

    pub fn total_length(&self) -> Option<usize> {
        lock(&self.state).total_length
    }

    pub fn status(&self) -> SequenceStatus {
        lock(&self.state).status.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(lock(&self.state).status, SequenceStatus::Pending)
    }

    pub fn is_complete(&self) -> bool {
        matches!(lock(&self.state).status, SequenceStatus::Complete)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(lock(&self.state).status, SequenceStatus::Aborted(_))
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match &lock(&self.state).status {
            SequenceStatus::Aborted(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Identifiers of the member messages, in arrival order.
    pub fn offsets(&self) -> Vec<BrokerMessageIdentifier> {
        lock(&self.state).offsets.clone()
    }

    /// Add an envelope, waiting if the stream buffer is full.
    ///
    /// Returns the new length.
    pub async fn add(&self, envelope: InboundEnvelope) -> Result<usize> {
        let (sender, envelope, length, completed) = {
            let mut state = lock(&self.state);

            if state.status.is_terminal() {
                return Err(SequenceError::NotPending {
                    id: self.id.clone(),
                    status: state.status.clone(),
                });
            }

            let mut is_last = false;
            if self.rule == CompletionRule::Chunks {
                if let Some(index) = envelope.headers().get_as::<usize>(CHUNK_INDEX_HEADER) {
                    if index != state.length {
                        let expected = state.length;
                        state.status = SequenceStatus::Aborted(AbortReason::IncompleteSequence);
                        state.sender = None;
                        warn!(
                            sequence_id = %self.id,
                            expected,
                            actual = index,
                            "Chunk out of order, sequence aborted"
                        );
                        return Err(SequenceError::OutOfOrderChunk {
                            id: self.id.clone(),
                            expected,
                            actual: index,
                        });
                    }
                }
                if state.total_length.is_none() {
                    state.total_length = envelope.headers().get_as::<usize>(CHUNKS_COUNT_HEADER);
                }
                is_last = envelope.headers().get_as::<bool>(CHUNK_IS_LAST_HEADER) == Some(true);
            }

            state.is_new = state.length == 0;
            state.length += 1;
            state.offsets.push(envelope.identifier().clone());
            let length = state.length;

            let completed = is_last
                || match self.rule {
                    CompletionRule::Chunks => state.total_length.is_some_and(|t| length >= t),
                    CompletionRule::Batch { size, .. } => length >= size,
                };

            let sender = if completed {
                state.status = SequenceStatus::Complete;
                state.sender.take()
            } else {
                state.sender.clone()
            };

            let envelope = envelope.with_sequence(SequenceInfo {
                sequence_id: self.id.clone(),
                position: length,
            });

            (sender, envelope, length, completed)
        };

        if let Some(sender) = sender {
            if sender.send(envelope).await.is_err() {
                self.abort(AbortReason::EnumerationAborted);
                return Err(SequenceError::StreamClosed {
                    id: self.id.clone(),
                });
            }
        }

        if completed {
            debug!(sequence_id = %self.id, length, "Sequence complete");
        }

        Ok(length)
    }

    /// Mark the sequence complete. Returns false if it was already terminal.
    pub fn complete(&self) -> bool {
        let mut state = lock(&self.state);
        if state.status.is_terminal() {
            return false;
        }
        state.status = SequenceStatus::Complete;
        state.sender = None;
        true
    }

    /// Abort the sequence. Returns false if it was already terminal.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let mut state = lock(&self.state);
        if state.status.is_terminal() {
            return false;
        }
        debug!(sequence_id = %self.id, reason = %reason, "Sequence aborted");
        state.status = SequenceStatus::Aborted(reason);
        state.sender = None;
        true
    }

    /// Take the output stream. Only the first caller gets it.
    pub fn take_stream(&self) -> Option<SequenceStream> {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Attach the pipeline context that started this sequence.
    pub fn set_context(&self, context: ConsumerPipelineContext) {
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(context);
    }

    pub fn context(&self) -> Option<ConsumerPipelineContext> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register the task reading the stream.
    pub fn set_processing_task(&self, task: JoinHandle<std::result::Result<(), PipelineError>>) {
        *self.processing.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Wait for the task reading the stream, if any, and return its outcome.
    pub async fn processing_completed(&self) -> std::result::Result<(), PipelineError> {
        let task = self
            .processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match task {
            Some(task) => task
                .await
                .map_err(|e| PipelineError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }

    /// Drop the context back-reference once the sequence is released.
    pub(crate) fn release(&self) {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Sequence")
            .field("id", &self.id)
            .field("rule", &self.rule)
            .field("status", &state.status)
            .field("length", &state.length)
            .field("total_length", &state.total_length)
            .finish()
    }
}

/// Single-pass stream of the envelopes added to a sequence.
pub struct SequenceStream {
    id: String,
    receiver: ReceiverStream<InboundEnvelope>,
    state: Arc<Mutex<SequenceState>>,
    finished: bool,
}

impl SequenceStream {
    pub fn sequence_id(&self) -> &str {
        &self.id
    }
}

impl Stream for SequenceStream {
    type Item = Result<InboundEnvelope>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.receiver).poll_next(cx) {
            Poll::Ready(Some(envelope)) => Poll::Ready(Some(Ok(envelope))),
            Poll::Ready(None) => {
                self.finished = true;
                let status = lock(&self.state).status.clone();
                match status {
                    SequenceStatus::Aborted(reason) => Poll::Ready(Some(Err(
                        SequenceError::Aborted {
                            id: self.id.clone(),
                            reason,
                        },
                    ))),
                    _ => Poll::Ready(None),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
