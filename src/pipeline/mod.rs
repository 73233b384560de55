//! Behavior pipelines.
//!
//! A pipeline is an ordered, immutable list of behaviors. Each behavior gets
//! the current context and a [`Next`] continuation standing for the rest of
//! the pipeline. It may replace the context before calling `next`, do work
//! after `next` returns, or not call `next` at all to skip the remaining
//! behaviors.
//!
//! Execution is sequential per context. Parallelism across messages is the
//! caller's business.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::sequence::SequenceError;

/// Result type for pipeline execution.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised while running a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Produce failed: {0}")]
    Produce(String),

    #[error("{operation} failed: {message}")]
    Broker {
        operation: &'static str,
        message: String,
    },

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

/// One step of a pipeline over contexts of type `C`.
#[async_trait]
pub trait Behavior<C>: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &'static str;

    /// Fixed position in the pipeline. Lower runs first.
    fn sort_index(&self) -> i32;

    /// Process the context. Call `next.run(context)` to continue the pipeline.
    async fn handle(&self, context: C, next: Next<C>) -> Result<()>;
}

/// Continuation over the behaviors that follow the current one.
pub struct Next<C> {
    behaviors: Arc<[Arc<dyn Behavior<C>>]>,
    index: usize,
}

impl<C> Clone for Next<C> {
    fn clone(&self) -> Self {
        Self {
            behaviors: Arc::clone(&self.behaviors),
            index: self.index,
        }
    }
}

impl<C: Send + 'static> Next<C> {
    /// Run the remaining behaviors with `context`.
    ///
    /// The returned future is `'static`, so it can be spawned.
    pub fn run(self, context: C) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let Some(behavior) = self.behaviors.get(self.index).cloned() else {
                return Ok(());
            };
            let next = Next {
                behaviors: Arc::clone(&self.behaviors),
                index: self.index + 1,
            };
            behavior.handle(context, next).await
        })
    }

    /// Number of behaviors still to run.
    pub fn remaining(&self) -> usize {
        self.behaviors.len().saturating_sub(self.index)
    }
}

/// Ordered behavior list, sorted once at construction.
pub struct Pipeline<C> {
    behaviors: Arc<[Arc<dyn Behavior<C>>]>,
}

impl<C> Clone for Pipeline<C> {
    fn clone(&self) -> Self {
        Self {
            behaviors: Arc::clone(&self.behaviors),
        }
    }
}

impl<C: Send + 'static> Pipeline<C> {
    /// Build a pipeline. Behaviors with equal sort index keep their given order.
    pub fn new(mut behaviors: Vec<Arc<dyn Behavior<C>>>) -> Self {
        behaviors.sort_by_key(|b| b.sort_index());
        Self {
            behaviors: behaviors.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Run the whole pipeline. An empty pipeline succeeds immediately.
    pub async fn execute(&self, context: C) -> Result<()> {
        Next {
            behaviors: Arc::clone(&self.behaviors),
            index: 0,
        }
        .run(context)
        .await
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.behaviors.iter().map(|b| b.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }
}

impl<C> fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.behaviors.iter().map(|b| (b.sort_index(), b.name())))
            .finish()
    }
}
