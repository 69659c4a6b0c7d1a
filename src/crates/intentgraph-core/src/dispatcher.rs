//! HandlerDispatcher — guard evaluation, timeout enforcement, and retry/backoff for
//! a single node's execution.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ResolvedConfig;
use crate::error::{GraphError, Result};
use crate::graph::NodeSpec;
use crate::guards::{Guard, GuardInput, GuardRunner, GuardStatus};
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::retry::{RetryDecision, RetryPolicy};

pub struct HandlerDispatcher<'a> {
    pub handlers: &'a dyn HandlerRegistry,
    pub config: &'a ResolvedConfig,
}

impl<'a> HandlerDispatcher<'a> {
    pub fn new(handlers: &'a dyn HandlerRegistry, config: &'a ResolvedConfig) -> Self {
        Self { handlers, config }
    }

    /// Run one node to completion or failure, including retries. `guards` were
    /// instantiated once at the start of the execution, not per attempt.
    pub async fn dispatch(
        &self,
        node: &NodeSpec,
        guards: &[Arc<dyn Guard>],
        guard_input: &GuardInput,
        ctx: &HandlerContext,
        cancellation: &CancellationToken,
    ) -> Result<Value> {
        let handler = self
            .handlers
            .lookup(&node.properties.handler)
            .ok_or_else(|| GraphError::HandlerMissing(node.properties.handler.clone()))?;

        let timeout = Duration::from_secs(
            node.properties
                .timeout_secs
                .unwrap_or(self.config.timeout_secs),
        );

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.run_guards_to_admission(guards, guard_input, cancellation).await?;

            let result = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(GraphError::Cancelled),
                r = tokio::time::timeout(timeout, handler.call(node, ctx)) => match r {
                    Ok(inner) => inner,
                    Err(_) => Err(GraphError::HandlerTimeout {
                        node: node.id.clone(),
                        timeout_secs: timeout.as_secs(),
                    }),
                },
            };

            match result {
                Ok(output) => return Ok(output),
                Err(error) => {
                    if matches!(error, GraphError::Cancelled) {
                        return Err(error);
                    }
                    match RetryPolicy::decide(self.config, attempt, &error) {
                        RetryDecision::Retry(delay) => {
                            tracing::warn!(node = %node.id, attempt, error = %error, "node failed, retrying");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancellation.cancelled() => return Err(GraphError::Cancelled),
                            }
                        }
                        RetryDecision::GiveUp => return Err(error),
                    }
                }
            }
        }
    }

    /// Run the guard chain via [`GuardRunner::run_all`], honoring `delay` by
    /// sleeping and re-running the whole chain, bounded by the node's retry
    /// budget so a misbehaving guard can't stall forever.
    async fn run_guards_to_admission(
        &self,
        guards: &[Arc<dyn Guard>],
        input: &GuardInput,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        for delay_round in 0..self.config.max_attempts {
            let verdict = GuardRunner::run_all(guards, input).await?;
            match verdict.result.status {
                GuardStatus::Success => return Ok(()),
                GuardStatus::Block => {
                    return Err(GraphError::GuardBlocked {
                        guard: verdict.guard_name,
                        node: input.target_id.clone(),
                        reason: verdict.result.message.unwrap_or_default(),
                    });
                }
                GuardStatus::Delay => {
                    let retry_after_ms = verdict.result.retry_after_ms.unwrap_or(1000);
                    if delay_round + 1 == self.config.max_attempts {
                        return Err(GraphError::GuardDelayed {
                            guard: verdict.guard_name,
                            node: input.target_id.clone(),
                            retry_after_ms,
                        });
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(retry_after_ms)) => {}
                        _ = cancellation.cancelled() => return Err(GraphError::Cancelled),
                    }
                }
                GuardStatus::Warn => unreachable!("GuardRunner::run_all resolves warn verdicts internally"),
            }
        }
        Err(GraphError::Internal("guard admission loop exhausted without a verdict".into()))
    }
}
