//! Ordered handler chain with chain-of-responsibility dispatch.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use super::{
    InvokeError, RequestContext,
    stages::{AwaitCommit, ResolveTargets, SendProposal, SubmitToOrderer, ValidateResponses},
};

/// One pipeline stage.
///
/// A handler does its work on the shared context and then either calls `next.run(ctx)` to
/// continue or returns early to short-circuit the rest of the chain.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stage name used in errors and logs.
    fn name(&self) -> &str;

    /// Runs this stage.
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), InvokeError>;
}

/// Remainder of the chain after the current handler.
#[derive(Clone, Copy)]
pub struct Next<'chain> {
    /// Handlers still to run.
    handlers: &'chain [Arc<dyn Handler>],
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.handlers.len())
            .finish()
    }
}

impl<'chain> Next<'chain> {
    /// Creates a cursor over `handlers`.
    #[must_use]
    pub const fn new(handlers: &'chain [Arc<dyn Handler>]) -> Self {
        Self { handlers }
    }

    /// Returns the number of handlers still to run.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.handlers.len()
    }

    /// Runs the next handler; an empty remainder completes successfully.
    ///
    /// # Errors
    ///
    /// Returns the handler's error tagged with the name of the stage that raised it.
    pub async fn run(self, ctx: &mut RequestContext) -> Result<(), InvokeError> {
        let Some((handler, rest)) = self.handlers.split_first() else {
            return Ok(());
        };
        handler
            .handle(ctx, Next::new(rest))
            .await
            .map_err(|error| error.in_stage(handler.name()))
    }
}

/// Ordered list of handlers.
#[derive(Clone, Default)]
pub struct HandlerChain {
    /// Handlers in execution order.
    handlers: Vec<Arc<dyn Handler>>,
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl HandlerChain {
    /// Creates a chain from explicit handlers.
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self { handlers }
    }

    /// Read-only pipeline: resolve, send, validate.
    #[must_use]
    pub fn query() -> Self {
        Self::new(vec![
            Arc::new(ResolveTargets),
            Arc::new(SendProposal),
            Arc::new(ValidateResponses),
        ])
    }

    /// Full pipeline through commit confirmation.
    #[must_use]
    pub fn execute() -> Self {
        Self::query()
            .with_handler(Arc::new(SubmitToOrderer))
            .with_handler(Arc::new(AwaitCommit))
    }

    /// Appends a handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Appends a handler in place.
    pub fn push(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// Inserts `handler` before the first stage named `name`.
    ///
    /// Returns false, leaving the chain unchanged, when no stage has that name.
    pub fn insert_before(&mut self, name: &str, handler: Arc<dyn Handler>) -> bool {
        match self.position(name) {
            Some(index) => {
                self.handlers.insert(index, handler);
                true
            }
            None => false,
        }
    }

    /// Inserts `handler` after the first stage named `name`.
    ///
    /// Returns false, leaving the chain unchanged, when no stage has that name.
    pub fn insert_after(&mut self, name: &str, handler: Arc<dyn Handler>) -> bool {
        match self.position(name) {
            Some(index) => {
                self.handlers.insert(index.saturating_add(1), handler);
                true
            }
            None => false,
        }
    }

    /// Returns stage names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true when the chain has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the chain against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure, tagged with that stage's name.
    pub async fn run(&self, ctx: &mut RequestContext) -> Result<(), InvokeError> {
        Next::new(&self.handlers).run(ctx).await
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.handlers
            .iter()
            .position(|handler| handler.name() == name)
    }
}
