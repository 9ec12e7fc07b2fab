// Parallel one-shot command runs across nodes

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::command::ExecOutput;
use crate::runtime::ContainerRuntime;
use crate::types::NodeName;

/// How one node's run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded(ExecOutput),
    /// The command ran but `accept` rejected its exit status.
    Failed(ExecOutput),
    /// The command could not be run at all.
    Error(String),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// Run `cmd` on every node at once and wait for all of them.
///
/// A failing node never cancels its siblings. Results come back in the order
/// of `nodes`.
pub async fn run_on_all<R>(
    runtime: Arc<R>,
    nodes: &[NodeName],
    cmd: &[String],
    accept: fn(Option<i32>) -> bool,
) -> Vec<(NodeName, RunOutcome)>
where
    R: ContainerRuntime + ?Sized + 'static,
{
    let mut set = JoinSet::new();
    for (index, node) in nodes.iter().enumerate() {
        let runtime = runtime.clone();
        let node = node.clone();
        let cmd = cmd.to_vec();
        set.spawn(async move {
            info!("Running `{}` on `{}`", cmd.join(" "), node);
            let outcome = match runtime.exec(&node, &cmd).await {
                Ok(out) if accept(out.status) => RunOutcome::Succeeded(out),
                Ok(out) => RunOutcome::Failed(out),
                Err(e) => RunOutcome::Error(e.to_string()),
            };
            (index, outcome)
        });
    }

    let mut outcomes: Vec<Option<RunOutcome>> = vec![None; nodes.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, outcome)) => outcomes[index] = Some(outcome),
            Err(e) => warn!("Run task ended abnormally: {}", e),
        }
    }

    nodes
        .iter()
        .cloned()
        .zip(outcomes)
        .map(|(node, outcome)| {
            let outcome =
                outcome.unwrap_or_else(|| RunOutcome::Error("task panicked".to_string()));
            match &outcome {
                RunOutcome::Succeeded(_) => info!("Run on `{}` finished", node),
                RunOutcome::Failed(out) => warn!(
                    "Run on `{}` exited with {:?}: {}",
                    node,
                    out.status,
                    out.stderr.trim()
                ),
                RunOutcome::Error(e) => warn!("Run on `{}` could not start: {}", node, e),
            }
            (node, outcome)
        })
        .collect()
}
