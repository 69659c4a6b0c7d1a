//! Guard ABI, GuardRunner, and the guard factory registry.

pub mod audit;
pub mod rate_limit;
pub mod rbac;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GraphError, Result};
use crate::graph::GuardDeclaration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardStatus {
    Success,
    Block,
    Delay,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardResult {
    pub status: GuardStatus,
    pub message: Option<String>,
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Value,
}

impl GuardResult {
    pub fn success() -> Self {
        Self {
            status: GuardStatus::Success,
            message: None,
            retry_after_ms: None,
            metadata: Value::Null,
        }
    }

    pub fn block(message: impl Into<String>) -> Self {
        Self {
            status: GuardStatus::Block,
            message: Some(message.into()),
            retry_after_ms: None,
            metadata: Value::Null,
        }
    }

    pub fn block_with_retry(message: impl Into<String>, retry_after_ms: u64) -> Self {
        Self {
            status: GuardStatus::Block,
            message: Some(message.into()),
            retry_after_ms: Some(retry_after_ms),
            metadata: Value::Null,
        }
    }

    pub fn delay(retry_after_ms: u64) -> Self {
        Self {
            status: GuardStatus::Delay,
            message: None,
            retry_after_ms: Some(retry_after_ms),
            metadata: Value::Null,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            status: GuardStatus::Warn,
            message: Some(message.into()),
            retry_after_ms: None,
            metadata: Value::Null,
        }
    }
}

/// The caller's identity, as asserted by whatever authenticated the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    pub id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GuardInput {
    pub correlation_id: String,
    pub user: UserContext,
    pub target_id: String,
    pub parameters: Value,
    pub prior_outputs: HashMap<String, Value>,
}

/// One lifecycle contract per guard instance, single-execution-scoped.
#[async_trait]
pub trait Guard: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare state (dial Redis, preload JWKS, build role-hierarchy map). Errors
    /// abort the execution before any node runs.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Pure check; no state mutation.
    async fn validate(&self, input: &GuardInput) -> Result<GuardResult>;

    /// Authoritative check; may mutate guard-owned state.
    async fn execute(&self, input: &GuardInput) -> Result<GuardResult>;

    /// Release resources. Called exactly once per execution, even on failure.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

pub type GuardFactory = Arc<dyn Fn(&GuardDeclaration) -> Result<Arc<dyn Guard>> + Send + Sync>;

/// Maps guard-type-name to factory; instantiates guards declared on the graph.
#[derive(Default, Clone)]
pub struct GuardRegistry {
    factories: HashMap<String, GuardFactory>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duplicate registration under the same name is an error.
    pub fn register(&mut self, name: impl Into<String>, factory: GuardFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(GraphError::ConfigInvalid(format!(
                "guard factory '{name}' already registered"
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn instantiate(&self, decl: &GuardDeclaration) -> Result<Arc<dyn Guard>> {
        let key = guard_type_key(decl);
        let factory = self.factories.get(&key).ok_or_else(|| {
            GraphError::ConfigInvalid(format!("no guard factory registered for '{key}'"))
        })?;
        factory(decl)
    }
}

fn guard_type_key(decl: &GuardDeclaration) -> String {
    use crate::graph::GuardType;
    match decl.guard_type {
        GuardType::Rbac => "rbac".to_string(),
        GuardType::RateLimit => "rate_limit".to_string(),
        GuardType::Audit => "audit".to_string(),
        GuardType::Custom => decl
            .config
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("custom")
            .to_string(),
    }
}

/// A guard's verdict paired with which guard produced it, so a caller can still
/// name the offending guard once results have been aggregated.
#[derive(Debug, Clone)]
pub struct GuardVerdict {
    pub guard_name: String,
    pub result: GuardResult,
}

impl GuardVerdict {
    fn success() -> Self {
        Self {
            guard_name: String::new(),
            result: GuardResult::success(),
        }
    }
}

/// Applies the guards attached to a node, in declaration order, for a single
/// pass through the chain. `warn` verdicts are logged and do not short-circuit;
/// the first `block` or `delay` verdict does. Callers that need to retry past a
/// `delay` verdict (the dispatcher's admission loop) re-invoke this per round.
pub struct GuardRunner;

impl GuardRunner {
    pub async fn run_all(guards: &[Arc<dyn Guard>], input: &GuardInput) -> Result<GuardVerdict> {
        for guard in guards {
            let result = guard.execute(input).await?;
            match result.status {
                GuardStatus::Success => continue,
                GuardStatus::Warn => {
                    tracing::warn!(
                        guard = guard.name(),
                        target = %input.target_id,
                        message = ?result.message,
                        "guard warning"
                    );
                    continue;
                }
                GuardStatus::Block | GuardStatus::Delay => {
                    return Ok(GuardVerdict {
                        guard_name: guard.name().to_string(),
                        result,
                    });
                }
            }
        }
        Ok(GuardVerdict::success())
    }
}
