//! Handler ABI and registry — the external collaborator that does the actual work
//! of a node. The core only knows how to look one up and invoke it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::graph::NodeSpec;

/// Context passed to a handler invocation: prior node outputs and the execution's
/// correlation id, so handlers can thread tracing without the core imposing a
/// request-scoped global.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub correlation_id: String,
    pub prior_outputs: HashMap<String, Value>,
}

/// A unit of work bound to a node's `handler` identifier.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, node: &NodeSpec, ctx: &HandlerContext) -> Result<Value>;
}

/// `lookup(handler_id) -> Option<Arc<dyn Handler>>`. Implementations are free to
/// back this with a static map, a plugin registry, or anything else; the core only
/// depends on the trait.
pub trait HandlerRegistry: Send + Sync {
    fn lookup(&self, handler_id: &str) -> Option<Arc<dyn Handler>>;
}

/// An in-memory registry, sufficient for the reference CLI driver and tests.
#[derive(Default)]
pub struct StaticHandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl StaticHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler_id: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler_id.into(), handler);
    }
}

impl HandlerRegistry for StaticHandlerRegistry {
    fn lookup(&self, handler_id: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(handler_id).cloned()
    }
}
