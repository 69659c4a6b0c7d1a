//! ExecutionHooks — the execution-store observer triple.
//!
//! A no-op by default; embedders supply the real collaborator at `Engine`
//! construction. Never a process-global singleton.

use async_trait::async_trait;

use crate::error::GraphError;
use crate::graph::GraphDocument;
use crate::scheduler::ExecutionResult;

/// Everything a hook needs to know about the run it's observing.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub correlation_id: String,
}

#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    async fn on_execution_start(&self, _execution_id: &str, _ctx: &ExecutionContext, _graph: &GraphDocument) {}
    async fn on_execution_complete(&self, _execution_id: &str, _result: &ExecutionResult) {}
    async fn on_execution_failed(&self, _execution_id: &str, _error: &GraphError) {}
}

/// The default, no-op hook set.
pub struct NoopHooks;

#[async_trait]
impl ExecutionHooks for NoopHooks {}
