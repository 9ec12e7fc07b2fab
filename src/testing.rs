//! In-process stand-ins for the container runtime and certificate authority.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::command::ExecOutput;
use crate::error::{LabError, LabResult};
use crate::puppet::CertAuthority;
use crate::runtime::{ContainerRuntime, NodeLaunch};
use crate::types::NodeName;

/// Fake runtime. Every call is appended to `calls` as a short string.
#[derive(Default)]
pub struct FakeRuntime {
    pub calls: Mutex<Vec<String>>,
    pub containers: Mutex<BTreeMap<NodeName, NodeLaunch>>,
    /// Address reported for every running container.
    pub address: Option<IpAddr>,
    /// Exit status per node for agent runs. Missing nodes exit 0.
    pub exit_status: BTreeMap<NodeName, i32>,
    /// Signing requests land here, shared with a [`FakeCa`].
    pub csr_sink: Option<Arc<Mutex<Vec<String>>>>,
}

impl FakeRuntime {
    pub fn with_address(ip: &str) -> Self {
        Self {
            address: Some(ip.parse().unwrap()),
            ..Default::default()
        }
    }

    pub fn seed(&self, name: &str, label_key: &str, quest: &str) {
        let name = NodeName::new(name);
        self.containers.lock().unwrap().insert(
            name.clone(),
            NodeLaunch {
                name,
                hostname: String::new(),
                image: "seed".into(),
                labels: vec![(label_key.to_string(), quest.to_string())],
                network: None,
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run_node(&self, launch: &NodeLaunch) -> LabResult<()> {
        self.record(format!("run {}", launch.name));
        self.containers
            .lock()
            .unwrap()
            .insert(launch.name.clone(), launch.clone());
        Ok(())
    }

    async fn remove_node(&self, name: &NodeName) -> LabResult<()> {
        self.record(format!("rm {}", name));
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_nodes(&self, label_key: &str) -> LabResult<Vec<NodeName>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.labels.iter().any(|(k, _)| k == label_key))
            .map(|c| c.name.clone())
            .collect())
    }

    async fn node_address(&self, name: &NodeName) -> LabResult<Option<IpAddr>> {
        if self.containers.lock().unwrap().contains_key(name) {
            Ok(self.address)
        } else {
            Err(LabError::MissingAddress(name.to_string()))
        }
    }

    async fn exec(&self, name: &NodeName, cmd: &[String]) -> LabResult<ExecOutput> {
        self.record(format!("exec {} {}", name, cmd.join(" ")));
        if cmd.iter().any(|a| a == "--waitforcert") {
            if let (Some(sink), Some(certname)) = (&self.csr_sink, cmd.last()) {
                sink.lock().unwrap().push(certname.clone());
            }
            return Ok(ExecOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: "Exiting; no certificate found and waitforcert is disabled".to_string(),
            });
        }
        let status = self.exit_status.get(name).copied().unwrap_or(0);
        Ok(ExecOutput {
            status: Some(status),
            stdout: String::new(),
            stderr: if status == 0 { String::new() } else { "agent failed".to_string() },
        })
    }
}

/// Fake CA: signs whatever has been requested through the shared `pending` list.
#[derive(Default)]
pub struct FakeCa {
    pub pending: Arc<Mutex<Vec<String>>>,
    pub signed: Mutex<Vec<String>>,
    pub cleaned: Mutex<Vec<String>>,
}

#[async_trait]
impl CertAuthority for FakeCa {
    async fn pending_requests(&self) -> LabResult<Vec<String>> {
        Ok(self.pending.lock().unwrap().clone())
    }

    async fn sign(&self, certname: &str) -> LabResult<()> {
        self.pending.lock().unwrap().retain(|c| c != certname);
        self.signed.lock().unwrap().push(certname.to_string());
        Ok(())
    }

    async fn clean(&self, certname: &str) -> LabResult<()> {
        self.cleaned.lock().unwrap().push(certname.to_string());
        Ok(())
    }
}
