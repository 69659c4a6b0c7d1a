//! Scheduler / Engine — the top-level control loop.
//!
//! One control task admits READY nodes into a worker budget of `maxParallel`,
//! dispatches each to a spawned tokio task, and collects completions through a
//! `Semaphore`-gated `FuturesUnordered` of the workers' `JoinHandle`s.
//! `JoinHandle` registers its waker at spawn time, not at await time, so the
//! control loop can never miss a completion that races ahead of its own
//! `.next().await` the way a shared `Notify` can. NodeLifecycle re-derives
//! readiness (and cascades SKIPPED) between admission rounds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigResolver;
use crate::dispatcher::HandlerDispatcher;
use crate::error::{GraphError, Result};
use crate::graph::GraphDocument;
use crate::guards::{Guard, GuardInput, GuardRegistry, UserContext};
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::hooks::{ExecutionContext, ExecutionHooks};
use crate::lifecycle::NodeLifecycle;
use crate::state::{ExecutionState, NodeStatus};
use crate::topo::TopoValidator;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub skipped_nodes: Vec<String>,
    pub pending_nodes: Vec<String>,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

/// Ties the graph, config, handler registry, guard registry, and hooks together
/// for one execution. An explicit collaborator — never a process-global singleton.
pub struct Engine {
    handlers: Arc<dyn HandlerRegistry>,
    guard_registry: Arc<GuardRegistry>,
    hooks: Arc<dyn ExecutionHooks>,
}

impl Engine {
    pub fn new(
        handlers: Arc<dyn HandlerRegistry>,
        guard_registry: Arc<GuardRegistry>,
        hooks: Arc<dyn ExecutionHooks>,
    ) -> Self {
        Self {
            handlers,
            guard_registry,
            hooks,
        }
    }

    /// Run a graph with no guard-facing request parameters (`GuardInput.parameters`
    /// is `Value::Null` for every node). Use [`Self::execute_with_parameters`] when
    /// guards need to see e.g. an `authorization` header or `remote_addr`.
    pub async fn execute(
        &self,
        graph: Arc<GraphDocument>,
        user: UserContext,
        correlation_id: String,
        execution_id: String,
    ) -> Result<ExecutionResult> {
        self.execute_with_parameters(
            graph,
            user,
            Value::Null,
            correlation_id,
            execution_id,
            CancellationToken::new(),
        )
        .await
    }

    /// Run a graph, threading `parameters` (the request-scoped context guards see
    /// via `GuardInput.parameters` — e.g. `{"authorization": "...", "remote_addr":
    /// "..."}`) into every node's guard evaluation.
    pub async fn execute_with_parameters(
        &self,
        graph: Arc<GraphDocument>,
        user: UserContext,
        parameters: Value,
        correlation_id: String,
        execution_id: String,
        cancellation: CancellationToken,
    ) -> Result<ExecutionResult> {
        let exec_ctx = ExecutionContext {
            execution_id: execution_id.clone(),
            correlation_id: correlation_id.clone(),
        };
        self.hooks
            .on_execution_start(&execution_id, &exec_ctx, &graph)
            .await;

        if let Err(e) = TopoValidator::validate(&graph) {
            self.hooks.on_execution_failed(&execution_id, &e).await;
            return Err(e);
        }

        let (resolved, warnings) = match ConfigResolver::resolve(&graph.spec.config) {
            Ok(r) => r,
            Err(e) => {
                self.hooks.on_execution_failed(&execution_id, &e).await;
                return Err(e);
            }
        };
        for warning in &warnings {
            tracing::warn!(execution_id = %execution_id, "{}", warning.0);
        }

        let instantiated = match self.instantiate_guards(&graph) {
            Ok(g) => g,
            Err(e) => {
                self.hooks.on_execution_failed(&execution_id, &e).await;
                return Err(e);
            }
        };

        let mut initialized = Vec::new();
        let mut init_error = None;
        for (decl, guard) in &instantiated {
            match guard.init().await {
                Ok(()) => initialized.push(guard.clone()),
                Err(e) => {
                    tracing::error!(guard = %decl.name, error = %e, "guard init failed");
                    init_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = init_error {
            for guard in &initialized {
                let _ = guard.cleanup().await;
            }
            self.hooks.on_execution_failed(&execution_id, &e).await;
            return Err(e);
        }

        let guards_by_node = Self::guards_by_node(&graph, &instantiated);

        let started_at = Instant::now();
        let run_result = self
            .run_loop(
                &graph,
                &resolved,
                &guards_by_node,
                &user,
                &parameters,
                &correlation_id,
                &cancellation,
            )
            .await;

        for guard in &initialized {
            if let Err(e) = guard.cleanup().await {
                tracing::warn!(error = %e, "guard cleanup failed");
            }
        }

        let execution_time_ms = started_at.elapsed().as_millis() as u64;
        let result = run_result.into_result(execution_time_ms);

        if result.success {
            self.hooks.on_execution_complete(&execution_id, &result).await;
        } else if let Some(message) = &result.error {
            self.hooks
                .on_execution_failed(&execution_id, &GraphError::Internal(message.clone()))
                .await;
        }

        Ok(result)
    }

    fn instantiate_guards(
        &self,
        graph: &GraphDocument,
    ) -> Result<Vec<(crate::graph::GuardDeclaration, Arc<dyn Guard>)>> {
        graph
            .spec
            .guards
            .iter()
            .map(|decl| self.guard_registry.instantiate(decl).map(|g| (decl.clone(), g)))
            .collect()
    }

    fn guards_by_node(
        graph: &GraphDocument,
        instantiated: &[(crate::graph::GuardDeclaration, Arc<dyn Guard>)],
    ) -> HashMap<String, Vec<Arc<dyn Guard>>> {
        let mut map = HashMap::new();
        for node_id in graph.node_ids() {
            let guards: Vec<Arc<dyn Guard>> = instantiated
                .iter()
                .filter(|(decl, _)| decl.apply_to.applies_to_node(node_id))
                .map(|(_, g)| g.clone())
                .collect();
            map.insert(node_id.clone(), guards);
        }
        map
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        graph: &Arc<GraphDocument>,
        resolved: &crate::config::ResolvedConfig,
        guards_by_node: &HashMap<String, Vec<Arc<dyn Guard>>>,
        user: &UserContext,
        parameters: &Value,
        correlation_id: &str,
        cancellation: &CancellationToken,
    ) -> RunOutcome {
        let state = Arc::new(ExecutionState::new(graph.node_ids().cloned()));
        let semaphore = Arc::new(Semaphore::new(resolved.max_parallel as usize));
        let mut in_flight: FuturesUnordered<JoinHandle<String>> = FuturesUnordered::new();
        let mut terminating = false;
        let mut first_failure: Option<GraphError> = None;

        loop {
            NodeLifecycle::advance_to_fixpoint(graph, &state);

            if !terminating {
                while in_flight.len() < resolved.max_parallel as usize {
                    let ready = state.nodes_with_status(NodeStatus::Ready);
                    let Some(node_id) = ready.into_iter().next() else {
                        break;
                    };
                    let handle = self.admit(
                        graph.clone(),
                        resolved.clone(),
                        guards_by_node.get(&node_id).cloned().unwrap_or_default(),
                        user.clone(),
                        parameters.clone(),
                        correlation_id.to_string(),
                        node_id,
                        state.clone(),
                        semaphore.clone(),
                        cancellation.clone(),
                    );
                    in_flight.push(handle);
                }
            }

            if in_flight.is_empty() {
                break;
            }

            // `JoinHandle` registers its waker with the spawned task at spawn time,
            // so this can't miss a completion that happened before we got here —
            // unlike a shared `Notify`, there's no window where the notification
            // fires before the waiter is registered.
            match in_flight.next().await {
                Some(Ok(node_id)) => {
                    if !terminating && state.status(&node_id) == Some(NodeStatus::Failed) {
                        terminating = true;
                        first_failure = state.error_of(&node_id).map(|e| (*e).clone_display());
                    }
                }
                Some(Err(join_error)) => {
                    tracing::error!(error = %join_error, "worker task panicked");
                }
                None => unreachable!("loop only awaits next() when in_flight is non-empty"),
            }
        }

        RunOutcome {
            state,
            first_failure,
        }
    }

    /// Spawn one node's dispatch as a tokio task and return its `JoinHandle`
    /// (resolving to the node id once the worker has recorded completion or
    /// failure in `state`), so the caller can hold it in a `FuturesUnordered`.
    #[allow(clippy::too_many_arguments)]
    fn admit(
        &self,
        graph: Arc<GraphDocument>,
        resolved: crate::config::ResolvedConfig,
        guards: Vec<Arc<dyn Guard>>,
        user: UserContext,
        parameters: Value,
        correlation_id: String,
        node_id: String,
        state: Arc<ExecutionState>,
        semaphore: Arc<Semaphore>,
        cancellation: CancellationToken,
    ) -> JoinHandle<String> {
        state.mark_running(&node_id);
        let handlers = self.handlers.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let node = graph.node(&node_id).cloned();
            let Some(node) = node else {
                state.mark_failed(&node_id, GraphError::Internal(format!("unknown node '{node_id}'")));
                return node_id;
            };

            let prior_outputs: HashMap<String, Value> = graph
                .incoming_edges(&node_id)
                .filter_map(|e| state.output(&e.from).map(|o| (e.from.clone(), o)))
                .collect();

            let guard_input = GuardInput {
                correlation_id: correlation_id.clone(),
                user: user.clone(),
                target_id: node_id.clone(),
                parameters,
                prior_outputs: prior_outputs.clone(),
            };
            let ctx = HandlerContext {
                correlation_id,
                prior_outputs,
            };

            let dispatcher = HandlerDispatcher::new(handlers.as_ref(), &resolved);
            match dispatcher
                .dispatch(&node, &guards, &guard_input, &ctx, &cancellation)
                .await
            {
                Ok(output) => {
                    tracing::info!(node = %node_id, "node complete");
                    state.mark_complete(&node_id, output);
                }
                Err(error) => {
                    tracing::warn!(node = %node_id, error = %error, "node failed");
                    state.mark_failed(&node_id, error);
                }
            }
            node_id
        })
    }
}

/// Internal helper: `GraphError` doesn't implement `Clone` (thiserror + nested
/// non-Clone variants aren't guaranteed to be), so the aggregate error is carried
/// forward as its rendered message instead.
trait ClonableDisplay {
    fn clone_display(&self) -> GraphError;
}

impl ClonableDisplay for GraphError {
    fn clone_display(&self) -> GraphError {
        GraphError::Internal(self.to_string())
    }
}

struct RunOutcome {
    state: Arc<ExecutionState>,
    first_failure: Option<GraphError>,
}

impl RunOutcome {
    fn into_result(self, execution_time_ms: u64) -> ExecutionResult {
        let completed_nodes = self.state.nodes_with_status(NodeStatus::Complete);
        let failed_nodes = self.state.nodes_with_status(NodeStatus::Failed);
        let skipped_nodes = self.state.nodes_with_status(NodeStatus::Skipped);
        let mut pending_nodes = self.state.nodes_with_status(NodeStatus::Pending);
        pending_nodes.extend(self.state.nodes_with_status(NodeStatus::Ready));

        let success = failed_nodes.is_empty();
        let error = self.first_failure.as_ref().map(|e| e.to_string());

        ExecutionResult {
            success,
            completed_nodes,
            failed_nodes,
            skipped_nodes,
            pending_nodes,
            execution_time_ms,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeSpec;
    use crate::guards::audit::AuditGuard;
    use crate::guards::rbac::RbacConfig;
    use crate::handler::{Handler, StaticHandlerRegistry};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn call(&self, _node: &NodeSpec, _ctx: &HandlerContext) -> Result<serde_json::Value> {
            Ok(json!({}))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl Handler for FailingHandler {
        async fn call(&self, node: &NodeSpec, _ctx: &HandlerContext) -> Result<serde_json::Value> {
            Err(GraphError::HandlerFailed {
                node: node.id.clone(),
                message: "boom".into(),
            })
        }
    }

    struct SlowHandler {
        delegate: Arc<dyn Handler>,
    }

    #[async_trait]
    impl Handler for SlowHandler {
        async fn call(&self, node: &NodeSpec, ctx: &HandlerContext) -> Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.delegate.call(node, ctx).await
        }
    }

    fn registry_with(handlers: Vec<(&str, Arc<dyn Handler>)>) -> Arc<dyn HandlerRegistry> {
        let mut registry = StaticHandlerRegistry::new();
        for (name, handler) in handlers {
            registry.register(name, handler);
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn linear_graph_all_complete() {
        let yaml = "metadata:\n  name: payroll\n  version: \"1\"\nspec:\n  nodes:\n    - id: A\n      kind: action\n      handler: noop\n    - id: B\n      kind: action\n      handler: noop\n    - id: C\n      kind: action\n      handler: noop\n    - id: D\n      kind: action\n      handler: noop\n    - id: E\n      kind: action\n      handler: noop\n  edges:\n    - id: A_B\n      from: A\n      to: B\n      kind: sequence\n    - id: B_C\n      from: B\n      to: C\n      kind: sequence\n    - id: C_D\n      from: C\n      to: D\n      kind: sequence\n    - id: D_E\n      from: D\n      to: E\n      kind: sequence\n  config:\n    concurrency:\n      maxParallel: 2\n";
        let graph = Arc::new(GraphDocument::from_yaml(yaml).unwrap());
        let engine = Engine::new(
            registry_with(vec![("noop", Arc::new(NoopHandler))]),
            Arc::new(GuardRegistry::new()),
            Arc::new(crate::hooks::NoopHooks),
        );
        let result = engine
            .execute(graph, UserContext::default(), "c1".into(), "e1".into())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.completed_nodes.len(), 5);
        assert!(result.failed_nodes.is_empty());
        assert!(result.skipped_nodes.is_empty());
    }

    #[tokio::test]
    async fn failure_cascades_skip_to_downstream() {
        let yaml = "metadata:\n  name: t\n  version: \"1\"\nspec:\n  nodes:\n    - id: A\n      kind: action\n      handler: noop\n    - id: B\n      kind: action\n      handler: fail\n    - id: C\n      kind: action\n      handler: noop\n  edges:\n    - id: A_B\n      from: A\n      to: B\n      kind: sequence\n    - id: B_C\n      from: B\n      to: C\n      kind: sequence\n  config:\n    retry:\n      maxAttempts: 1\n";
        let graph = Arc::new(GraphDocument::from_yaml(yaml).unwrap());
        let engine = Engine::new(
            registry_with(vec![("noop", Arc::new(NoopHandler)), ("fail", Arc::new(FailingHandler))]),
            Arc::new(GuardRegistry::new()),
            Arc::new(crate::hooks::NoopHooks),
        );
        let result = engine
            .execute(graph, UserContext::default(), "c1".into(), "e1".into())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.completed_nodes, vec!["A".to_string()]);
        assert_eq!(result.failed_nodes, vec!["B".to_string()]);
        assert_eq!(result.skipped_nodes, vec!["C".to_string()]);
        assert!(result.error.unwrap().contains("B"));
    }

    #[tokio::test]
    async fn cycle_is_rejected_before_any_handler_runs() {
        let yaml = "metadata:\n  name: t\n  version: \"1\"\nspec:\n  nodes:\n    - id: A\n      kind: action\n      handler: noop\n    - id: B\n      kind: action\n      handler: noop\n  edges:\n    - id: A_B\n      from: A\n      to: B\n      kind: sequence\n    - id: B_A\n      from: B\n      to: A\n      kind: sequence\n";
        let graph = Arc::new(GraphDocument::from_yaml(yaml).unwrap());
        let engine = Engine::new(
            registry_with(vec![("noop", Arc::new(NoopHandler))]),
            Arc::new(GuardRegistry::new()),
            Arc::new(crate::hooks::NoopHooks),
        );
        let err = engine
            .execute(graph, UserContext::default(), "c1".into(), "e1".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::GraphCycle);
    }

    #[tokio::test]
    async fn conditional_branch_leaves_successor_pending() {
        let yaml = "metadata:\n  name: t\n  version: \"1\"\nspec:\n  nodes:\n    - id: D\n      kind: decision\n      handler: deny\n    - id: X\n      kind: action\n      handler: noop\n  edges:\n    - id: D_X\n      from: D\n      to: X\n      kind: conditional\n      conditions:\n        - field: approval.status\n          operator: equals\n          value: approved\n";
        let graph = Arc::new(GraphDocument::from_yaml(yaml).unwrap());

        struct DenyHandler;
        #[async_trait]
        impl Handler for DenyHandler {
            async fn call(&self, _node: &NodeSpec, _ctx: &HandlerContext) -> Result<serde_json::Value> {
                Ok(json!({"approval": {"status": "denied"}}))
            }
        }

        let engine = Engine::new(
            registry_with(vec![("deny", Arc::new(DenyHandler)), ("noop", Arc::new(NoopHandler))]),
            Arc::new(GuardRegistry::new()),
            Arc::new(crate::hooks::NoopHooks),
        );
        let result = engine
            .execute(graph, UserContext::default(), "c1".into(), "e1".into())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.completed_nodes, vec!["D".to_string()]);
        assert_eq!(result.pending_nodes, vec!["X".to_string()]);
    }

    #[tokio::test]
    async fn parallel_fanout_respects_max_parallel() {
        let yaml = "metadata:\n  name: t\n  version: \"1\"\nspec:\n  nodes:\n    - id: A\n      kind: action\n      handler: slow\n    - id: B\n      kind: action\n      handler: slow\n    - id: C\n      kind: action\n      handler: slow\n  config:\n    concurrency:\n      maxParallel: 2\n";
        let graph = Arc::new(GraphDocument::from_yaml(yaml).unwrap());
        let engine = Engine::new(
            registry_with(vec![(
                "slow",
                Arc::new(SlowHandler {
                    delegate: Arc::new(NoopHandler),
                }),
            )]),
            Arc::new(GuardRegistry::new()),
            Arc::new(crate::hooks::NoopHooks),
        );
        let result = engine
            .execute(graph, UserContext::default(), "c1".into(), "e1".into())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.completed_nodes.len(), 3);
    }

    #[tokio::test]
    async fn rbac_guard_blocks_first_node_and_cascades_skip() {
        let yaml = "metadata:\n  name: t\n  version: \"1\"\nspec:\n  nodes:\n    - id: A\n      kind: action\n      handler: noop\n    - id: B\n      kind: action\n      handler: noop\n  edges:\n    - id: A_B\n      from: A\n      to: B\n      kind: sequence\n  guards:\n    - name: rbac1\n      type: rbac\n      apply_to:\n        nodes: [A]\n      config:\n        required_roles: \"payroll_admin,finance_manager\"\n";
        let graph = Arc::new(GraphDocument::from_yaml(yaml).unwrap());

        let mut registry = GuardRegistry::new();
        registry
            .register(
                "rbac",
                Arc::new(|decl: &crate::graph::GuardDeclaration| {
                    let config: RbacConfig = serde_json::from_value(decl.config.clone()).unwrap();
                    Ok(Arc::new(crate::guards::rbac::RbacGuard::new(decl.name.clone(), config)?)
                        as Arc<dyn Guard>)
                }),
            )
            .unwrap();

        let engine = Engine::new(
            registry_with(vec![("noop", Arc::new(NoopHandler))]),
            Arc::new(registry),
            Arc::new(crate::hooks::NoopHooks),
        );
        let user = UserContext {
            id: Some("u1".into()),
            roles: vec!["sales_rep".into()],
            permissions: vec![],
        };
        let result = engine
            .execute(graph, user, "c1".into(), "e1".into())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failed_nodes, vec!["A".to_string()]);
        assert_eq!(result.skipped_nodes, vec!["B".to_string()]);
    }

    /// Runs under the multi-thread runtime so a worker genuinely executes on a
    /// different OS thread than the control loop — the scenario the `Notify`-based
    /// design used to hang under, masked by the current-thread flavor everywhere
    /// else in this module.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_fanout_completes_under_multi_thread_runtime() {
        let yaml = "metadata:\n  name: t\n  version: \"1\"\nspec:\n  nodes:\n    - id: A\n      kind: action\n      handler: noop\n    - id: B\n      kind: action\n      handler: noop\n    - id: C\n      kind: action\n      handler: noop\n    - id: D\n      kind: action\n      handler: noop\n  config:\n    concurrency:\n      maxParallel: 4\n";
        let graph = Arc::new(GraphDocument::from_yaml(yaml).unwrap());
        let engine = Engine::new(
            registry_with(vec![("noop", Arc::new(NoopHandler))]),
            Arc::new(GuardRegistry::new()),
            Arc::new(crate::hooks::NoopHooks),
        );
        let result = engine
            .execute(graph, UserContext::default(), "c1".into(), "e1".into())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.completed_nodes.len(), 4);
    }

    #[tokio::test]
    async fn execute_with_parameters_reaches_jwt_guard() {
        use crate::guards::rbac::{JwtGuardConfig, JwtKeySource, JwtSubGuard};
        use jsonwebtoken::{encode, EncodingKey, Header};

        let secret = b"top-secret".to_vec();
        // `exp` is required by jsonwebtoken's default `Validation`; pick a timestamp
        // far enough in the future that this test never flakes on clock skew.
        let claims = json!({"sub": "u1", "exp": 4_102_444_800u64});
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(&secret)).unwrap();

        let yaml = "metadata:\n  name: t\n  version: \"1\"\nspec:\n  nodes:\n    - id: A\n      kind: action\n      handler: noop\n  guards:\n    - name: jwt1\n      type: custom\n      apply_to:\n        nodes: [A]\n      config:\n        kind: jwt\n";
        let graph = Arc::new(GraphDocument::from_yaml(yaml).unwrap());

        let mut registry = GuardRegistry::new();
        registry
            .register(
                "jwt",
                Arc::new(move |decl: &crate::graph::GuardDeclaration| {
                    Ok(Arc::new(JwtSubGuard::new(
                        decl.name.clone(),
                        JwtGuardConfig {
                            algorithms: vec!["HS256".into()],
                            clock_skew_secs: 30,
                            roles_claim: None,
                            jwks_cooldown_secs: 300,
                        },
                        JwtKeySource::HmacSecret(secret.clone()),
                    )) as Arc<dyn Guard>)
                }),
            )
            .unwrap();

        let engine = Engine::new(
            registry_with(vec![("noop", Arc::new(NoopHandler))]),
            Arc::new(registry),
            Arc::new(crate::hooks::NoopHooks),
        );

        // No `authorization`/`jwt` parameter: the guard can't see a token when
        // `execute`'s `Value::Null` default is used, so it blocks.
        let blocked = engine
            .execute(graph.clone(), UserContext::default(), "c1".into(), "e1".into())
            .await
            .unwrap();
        assert!(!blocked.success);
        assert_eq!(blocked.failed_nodes, vec!["A".to_string()]);

        let authorized = engine
            .execute_with_parameters(
                graph,
                UserContext::default(),
                json!({"authorization": format!("Bearer {token}")}),
                "c1".into(),
                "e1".into(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(authorized.success);
        assert_eq!(authorized.completed_nodes, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn audit_guard_never_blocks() {
        let yaml = "metadata:\n  name: t\n  version: \"1\"\nspec:\n  nodes:\n    - id: A\n      kind: action\n      handler: noop\n  guards:\n    - name: audit1\n      type: audit\n      apply_to:\n        nodes: [A]\n";
        let graph = Arc::new(GraphDocument::from_yaml(yaml).unwrap());
        let mut registry = GuardRegistry::new();
        registry
            .register(
                "audit",
                Arc::new(|decl: &crate::graph::GuardDeclaration| {
                    Ok(Arc::new(AuditGuard::new(decl.name.clone())) as Arc<dyn Guard>)
                }),
            )
            .unwrap();
        let engine = Engine::new(
            registry_with(vec![("noop", Arc::new(NoopHandler))]),
            Arc::new(registry),
            Arc::new(crate::hooks::NoopHooks),
        );
        let result = engine
            .execute(graph, UserContext::default(), "c1".into(), "e1".into())
            .await
            .unwrap();
        assert!(result.success);
    }
}
