//! Program fixtures.

use crate::program::{Argv, Program, ProgramFault};
use crate::runtime::InstanceContext;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// A program whose body is a closure.
///
/// ```rust,ignore
/// let child = FnProgram::new(|ctx, _argv| async move {
///     let out = ctx.inherited_endpoints()[0];
///     ctx.write_all(out, b"ok").await?;
///     Ok(0)
/// });
/// ```
pub struct FnProgram<F> {
    body: F,
}

impl<F, Fut> FnProgram<F>
where
    F: Fn(InstanceContext, Argv) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<i8, ProgramFault>> + Send + 'static,
{
    /// Wraps a closure.
    pub fn new(body: F) -> Self {
        Self { body }
    }

    /// Wraps a closure and erases the type.
    pub fn shared(body: F) -> Arc<dyn Program> {
        Arc::new(Self::new(body))
    }
}

#[async_trait]
impl<F, Fut> Program for FnProgram<F>
where
    F: Fn(InstanceContext, Argv) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<i8, ProgramFault>> + Send + 'static,
{
    async fn run(self: Arc<Self>, ctx: InstanceContext, argv: Argv) -> Result<i8, ProgramFault> {
        (self.body)(ctx, argv).await
    }
}

impl<F> std::fmt::Debug for FnProgram<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProgram").finish_non_exhaustive()
    }
}
