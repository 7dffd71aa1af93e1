//! Demo binary for thought-orchestrator
//!
//! Registers the thoughts in a workflow file, runs the workflow once with
//! shell-command bodies, and prints the run report as JSON.
//!
//! ```text
//! thought-orchestrator workflow.toml
//! ```
//!
//! The workflow file holds `[[thought]]` definitions and `[[node]]` entries:
//!
//! ```toml
//! name = "greet"
//!
//! [[thought]]
//! name = "hello"
//! body = "echo '{\"greeting\": \"hello\"}'"
//! capabilities = ["shell.exec"]
//! outputs = { greeting = { type = "string" } }
//!
//! [[node]]
//! id = "say"
//! thought = "hello"
//! ```
//!
//! ## Environment Variables
//!
//! - `THOUGHT_CONFIG`: engine config TOML (defaults, plus `shell.exec`, otherwise)
//! - `THOUGHT_WORKER_POOL_SIZE`, `THOUGHT_ALLOWED_CAPABILITIES`, ...: override
//!   single settings, see [`thought_orchestrator::config::loader`]
//! - `THOUGHT_AUTO_APPROVE=approve|reject`: answer every approval request;
//!   unset prompts on stdin
//! - `LOG_FORMAT=json`: structured JSON output
//! - `RUST_LOG=info`: log level filter

use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use thought_orchestrator::config::loader;
use thought_orchestrator::graph::NodeSpec;
use thought_orchestrator::sandbox::ProcessExecutor;
use thought_orchestrator::scheduler::RunEvent;
use thought_orchestrator::{
    init_tracing, metrics, Decision, Engine, EngineConfig, RawDefinition, WorkflowSpec,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    name: String,
    #[serde(default, rename = "thought")]
    thoughts: Vec<RawDefinition>,
    #[serde(default, rename = "node")]
    nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Copy)]
enum AutoApprove {
    Approve,
    Reject,
    Ask,
}

impl AutoApprove {
    fn from_env() -> Self {
        match std::env::var("THOUGHT_AUTO_APPROVE").as_deref() {
            Ok("approve") => Self::Approve,
            Ok("reject") => Self::Reject,
            _ => Self::Ask,
        }
    }
}

async fn ask(rendering: &str) -> Decision {
    println!("\n{rendering}\nApprove? [y/N] ");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match lines.next_line().await {
        Ok(Some(line)) if line.trim().eq_ignore_ascii_case("y") => Decision::Approve,
        _ => Decision::Reject,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();
    metrics::init_metrics()?;

    let Some(workflow_path) = std::env::args().nth(1) else {
        eprintln!("usage: thought-orchestrator <workflow.toml>");
        std::process::exit(2);
    };

    let base = match std::env::var("THOUGHT_CONFIG") {
        Ok(path) => loader::load_from_file(Path::new(&path))?,
        Err(_) => {
            let mut config = EngineConfig::default();
            config.allowed_capabilities.push("shell.exec".to_string());
            config
        }
    };
    let config = loader::with_env_overrides(base, std::env::vars())?;

    let file: WorkflowFile = toml::from_str(&std::fs::read_to_string(&workflow_path)?)?;
    let engine = Arc::new(Engine::new(config, Arc::new(ProcessExecutor::new()))?);
    let restored = engine.restore()?;
    info!(restored, workflow = %file.name, "demo: engine ready");

    for raw in file.thoughts {
        let name = raw.name.clone();
        match engine.define_if_changed(raw) {
            Ok(Some(id)) => info!(thought = %id, "demo: defined"),
            Ok(None) => info!(thought = %name, "demo: restored version is current"),
            Err(e) => warn!(thought = %name, error = %e, "demo: definition refused"),
        }
    }

    let policy = AutoApprove::from_env();
    let mut events = engine.subscribe();
    let approver = Arc::clone(&engine);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RunEvent::ApprovalRequested { request }) => {
                    let decision = match policy {
                        AutoApprove::Approve => Decision::Approve,
                        AutoApprove::Reject => Decision::Reject,
                        AutoApprove::Ask => ask(&request.rendering).await,
                    };
                    if let Err(e) = approver.resolve_approval(request.id, decision) {
                        warn!(request_id = %request.id, error = %e, "demo: decision not recorded");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "demo: event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let spec = WorkflowSpec {
        name: file.name,
        nodes: file.nodes,
    };
    let report = engine.submit(&spec)?.wait().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    info!(status = %report.status, "demo: finished");
    Ok(())
}
