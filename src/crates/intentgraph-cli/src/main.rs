//! # intentgraph-cli
//!
//! Reference driver for intentgraph-core: loads a graph document, runs it with
//! a handful of built-in no-op handlers, and prints the execution result.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use intentgraph_core::handler::{Handler, HandlerContext, StaticHandlerRegistry};
use intentgraph_core::{Engine, GraphDocument, GuardRegistry, NoopHooks, UserContext};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "intentgraph")]
#[command(about = "Run an intent graph document", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a graph document (YAML or JSON)
    graph_file: PathBuf,

    /// Inject a deterministic failure at this node id
    #[arg(long)]
    fail_node: Option<String>,

    /// Override the graph's declared maxParallel
    #[arg(long)]
    max_parallel: Option<u32>,

    /// Bearer token forwarded to guards as `parameters.authorization`
    #[arg(long)]
    jwt: Option<String>,

    /// Client IP forwarded to guards as `parameters.remote_addr`
    #[arg(long)]
    remote_addr: Option<String>,
}

struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn call(
        &self,
        _node: &intentgraph_core::graph::NodeSpec,
        _ctx: &HandlerContext,
    ) -> intentgraph_core::Result<Value> {
        Ok(serde_json::json!({}))
    }
}

struct InjectedFailureHandler {
    node_id: String,
}

#[async_trait]
impl Handler for InjectedFailureHandler {
    async fn call(
        &self,
        node: &intentgraph_core::graph::NodeSpec,
        ctx: &HandlerContext,
    ) -> intentgraph_core::Result<Value> {
        if node.id == self.node_id {
            return Err(intentgraph_core::GraphError::HandlerFailed {
                node: node.id.clone(),
                message: "failure injected by --fail-node".to_string(),
            });
        }
        NoopHandler.call(node, ctx).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();

    let source = std::fs::read_to_string(&cli.graph_file)
        .with_context(|| format!("reading graph file {}", cli.graph_file.display()))?;
    let mut graph = GraphDocument::from_str_auto(&source).context("parsing graph document")?;

    if let Some(max_parallel) = cli.max_parallel {
        graph.spec.config.concurrency.max_parallel = max_parallel;
    }

    let mut handlers = StaticHandlerRegistry::new();
    for node in &graph.spec.nodes {
        let handler: Arc<dyn Handler> = match &cli.fail_node {
            Some(fail_node) if fail_node == &node.id => Arc::new(InjectedFailureHandler {
                node_id: fail_node.clone(),
            }),
            _ => Arc::new(NoopHandler),
        };
        handlers.register(node.properties.handler.clone(), handler);
    }

    let engine = Engine::new(Arc::new(handlers), Arc::new(GuardRegistry::new()), Arc::new(NoopHooks));

    let mut parameters = serde_json::Map::new();
    if let Some(jwt) = &cli.jwt {
        parameters.insert("authorization".to_string(), Value::String(format!("Bearer {jwt}")));
    }
    if let Some(remote_addr) = &cli.remote_addr {
        parameters.insert("remote_addr".to_string(), Value::String(remote_addr.clone()));
    }

    let correlation_id = uuid::Uuid::new_v4().to_string();
    let execution_id = uuid::Uuid::new_v4().to_string();
    let result = engine
        .execute_with_parameters(
            Arc::new(graph),
            UserContext::default(),
            Value::Object(parameters),
            correlation_id,
            execution_id,
            tokio_util::sync::CancellationToken::new(),
        )
        .await;

    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.success {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Err(error) => {
            eprintln!("execution failed before scheduling: {error}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_graph_document_from_a_file_on_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "metadata:\n  name: cli-smoke\nspec:\n  nodes:\n    - id: A\n      kind: action\n      handler: noop\n"
        )
        .unwrap();

        let source = std::fs::read_to_string(file.path()).unwrap();
        let graph = GraphDocument::from_str_auto(&source).unwrap();
        assert_eq!(graph.metadata.name, "cli-smoke");
        assert_eq!(graph.spec.nodes.len(), 1);
    }
}
