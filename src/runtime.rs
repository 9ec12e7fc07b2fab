//! Container runtime seam.
//!
//! [`ContainerRuntime`] is the narrow surface the provisioner needs from a
//! container engine. [`DockerCli`] drives the `docker` command line; tests
//! substitute an in-process fake.

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::command::{self, ExecOutput, argv};
use crate::error::{LabError, LabResult};
use crate::types::{ImageRef, NodeName};

/// Everything needed to start one lab node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLaunch {
    pub name: NodeName,
    pub hostname: String,
    pub image: ImageRef,
    pub labels: Vec<(String, String)>,
    pub network: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container for the node.
    async fn run_node(&self, launch: &NodeLaunch) -> LabResult<()>;

    /// Force-remove a container. Removing a missing container succeeds.
    async fn remove_node(&self, name: &NodeName) -> LabResult<()>;

    /// Names of all containers, running or not, that carry `label_key`. Sorted.
    async fn list_nodes(&self, label_key: &str) -> LabResult<Vec<NodeName>>;

    /// Current address of the container, if it has one yet.
    async fn node_address(&self, name: &NodeName) -> LabResult<Option<IpAddr>>;

    /// Run a command inside the container. Non-zero exit is reported, not raised.
    async fn exec(&self, name: &NodeName, cmd: &[String]) -> LabResult<ExecOutput>;
}

/// [`ContainerRuntime`] backed by the docker-compatible CLI at `program`.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
    network: Option<String>,
}

impl DockerCli {
    pub fn new(program: impl Into<String>, network: Option<String>) -> Self {
        Self {
            program: program.into(),
            network,
        }
    }

    fn run_args(launch: &NodeLaunch) -> Vec<String> {
        let mut args = argv([
            "run",
            "--detach",
            "--name",
            launch.name.as_str(),
            "--hostname",
            launch.hostname.as_str(),
        ]);
        for (key, value) in &launch.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(network) = &launch.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        args.push(launch.image.to_string());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run_node(&self, launch: &NodeLaunch) -> LabResult<()> {
        info!("Starting node `{}` from image `{}`", launch.name, launch.image);
        let out = command::run_checked(&self.program, &Self::run_args(launch)).await?;
        debug!("node `{}` container id {}", launch.name, out.stdout.trim());
        Ok(())
    }

    async fn remove_node(&self, name: &NodeName) -> LabResult<()> {
        let args = argv(["rm", "--force", "--volumes", name.as_str()]);
        let out = command::run(&self.program, &args).await?;
        if out.success() || is_missing_container(&out.stderr) {
            info!("Removed node `{}`", name);
            Ok(())
        } else {
            Err(command::failed(&self.program, &args, &out))
        }
    }

    async fn list_nodes(&self, label_key: &str) -> LabResult<Vec<NodeName>> {
        let args = argv([
            "ps".to_string(),
            "--all".to_string(),
            "--filter".to_string(),
            format!("label={}", label_key),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ]);
        let out = command::run_checked(&self.program, &args).await?;
        Ok(parse_names(&out.stdout))
    }

    async fn node_address(&self, name: &NodeName) -> LabResult<Option<IpAddr>> {
        let args = argv(["inspect", "--type", "container", name.as_str()]);
        let out = command::run_checked(&self.program, &args).await?;
        parse_inspect_address(&out.stdout, self.network.as_deref())
    }

    async fn exec(&self, name: &NodeName, cmd: &[String]) -> LabResult<ExecOutput> {
        let mut args = argv(["exec", name.as_str()]);
        args.extend(cmd.iter().cloned());
        command::run(&self.program, &args).await
    }
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("no such container")
}

fn parse_names(stdout: &str) -> Vec<NodeName> {
    let mut names: Vec<NodeName> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(NodeName::from)
        .collect();
    names.sort();
    names.dedup();
    names
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "NetworkSettings")]
    network_settings: Option<NetworkSettings>,
}

#[derive(Debug, Deserialize)]
struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
    #[serde(rename = "Networks", default)]
    networks: BTreeMap<String, EndpointSettings>,
}

#[derive(Debug, Deserialize)]
struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<String>,
}

fn non_empty_ip(raw: Option<&String>) -> LabResult<Option<IpAddr>> {
    match raw.map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e| LabError::UnexpectedOutput(format!("bad address `{}`: {}", s, e))),
        None => Ok(None),
    }
}

/// Pick the container address out of `docker inspect` output.
///
/// Preference: the named network, then the first network with an address,
/// then the legacy top-level `IPAddress`.
pub fn parse_inspect_address(raw: &str, network: Option<&str>) -> LabResult<Option<IpAddr>> {
    let entries: Vec<InspectEntry> = serde_json::from_str(raw)
        .map_err(|e| LabError::UnexpectedOutput(format!("inspect output: {}", e)))?;
    let Some(settings) = entries.into_iter().next().and_then(|e| e.network_settings) else {
        return Ok(None);
    };

    if let Some(endpoint) = network.and_then(|n| settings.networks.get(n)) {
        if let Some(ip) = non_empty_ip(endpoint.ip_address.as_ref())? {
            return Ok(Some(ip));
        }
    }

    for endpoint in settings.networks.values() {
        if let Some(ip) = non_empty_ip(endpoint.ip_address.as_ref())? {
            return Ok(Some(ip));
        }
    }

    non_empty_ip(settings.ip_address.as_ref())
}
