//! Quest provisioning: tear down what is left from the last quest, start the
//! new quest's nodes, make them resolvable, wait for them to come up, and
//! register them with the configuration-management master.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{LabSettings, NodeOptions};
use crate::error::{LabError, LabResult};
use crate::fanout::{self, RunOutcome};
use crate::hosts;
use crate::poll::{self, Poller};
use crate::puppet::{self, CertAuthority};
use crate::runtime::{ContainerRuntime, NodeLaunch};
use crate::stash::ConfigStash;
use crate::types::{NodeName, QuestName};

/// What a provisioning run did.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub quest: QuestName,
    pub removed: Vec<NodeName>,
    pub started: Vec<NodeName>,
    pub signed: Vec<String>,
    pub runs: Vec<(NodeName, RunOutcome)>,
}

impl ProvisionReport {
    pub fn failed_runs(&self) -> impl Iterator<Item = &NodeName> {
        self.runs
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(node, _)| node)
    }
}

/// Drives one quest's nodes through their lifecycle.
pub struct QuestProvisioner<R: ?Sized, C: ?Sized> {
    settings: LabSettings,
    runtime: Arc<R>,
    ca: Arc<C>,
}

impl<R, C> QuestProvisioner<R, C>
where
    R: ContainerRuntime + ?Sized + 'static,
    C: CertAuthority + ?Sized,
{
    pub fn new(settings: LabSettings, runtime: Arc<R>, ca: Arc<C>) -> Self {
        Self {
            settings,
            runtime,
            ca,
        }
    }

    pub fn settings(&self) -> &LabSettings {
        &self.settings
    }

    fn poller(&self, attempts: u32) -> Poller {
        Poller::new(self.settings.poll_interval, attempts)
    }

    fn certname(&self, node: &NodeName) -> String {
        node.fqdn(&self.settings.domain)
    }

    pub fn launch_for(&self, quest: &QuestName, node: &NodeOptions) -> NodeLaunch {
        NodeLaunch {
            name: node.name.clone(),
            hostname: self.certname(&node.name),
            image: node.image.clone(),
            labels: vec![(self.settings.label_key.clone(), quest.to_string())],
            network: self.settings.network.clone(),
        }
    }

    /// Provision every node of `quest`, replacing whatever lab nodes exist.
    pub async fn provision(
        &self,
        quest: &QuestName,
        nodes: &[NodeOptions],
    ) -> LabResult<ProvisionReport> {
        info!("Provisioning quest `{}` ({} node(s))", quest, nodes.len());

        let removed = self.teardown().await?;

        let mut started = Vec::with_capacity(nodes.len());
        for node in nodes {
            self.runtime.run_node(&self.launch_for(quest, node)).await?;
            started.push(node.name.clone());
        }

        self.refresh_hosts().await?;
        self.wait_for_ssh(&started).await?;

        let to_sign: Vec<NodeName> = nodes
            .iter()
            .filter(|n| n.sign_cert)
            .map(|n| n.name.clone())
            .collect();
        let signed = self.register(&to_sign).await?;

        let to_run: Vec<NodeName> = nodes
            .iter()
            .filter(|n| n.run_puppet)
            .map(|n| n.name.clone())
            .collect();
        let runs = self.run_agents(&to_run).await;

        let report = ProvisionReport {
            quest: quest.clone(),
            removed,
            started,
            signed,
            runs,
        };
        let failed = report.failed_runs().count();
        if failed > 0 {
            warn!(
                "Quest `{}` is up, but {} agent run(s) failed",
                quest, failed
            );
        } else {
            info!("Quest `{}` is ready", quest);
        }
        Ok(report)
    }

    /// Remove every lab node and its certificate, then refresh the hosts file.
    pub async fn teardown(&self) -> LabResult<Vec<NodeName>> {
        let existing = self.runtime.list_nodes(&self.settings.label_key).await?;
        if existing.is_empty() {
            info!("No lab nodes to remove");
        }

        for node in &existing {
            self.runtime.remove_node(node).await?;
            let certname = self.certname(node);
            if let Err(e) = self.ca.clean(&certname).await {
                warn!("Could not clean certificate for `{}`: {}", certname, e);
            }
        }

        // Always refresh: the block may outlive containers removed by other means.
        self.refresh_hosts().await?;
        Ok(existing)
    }

    /// Rebuild the hosts block from the lab containers that exist right now.
    pub async fn refresh_hosts(&self) -> LabResult<()> {
        let Some(path) = &self.settings.hosts_file else {
            return Ok(());
        };
        let names = self.runtime.list_nodes(&self.settings.label_key).await?;
        let entries =
            hosts::collect_entries(self.runtime.as_ref(), &names, &self.settings.domain).await?;
        hosts::rewrite(path, &entries).await
    }

    /// Wait until each node has an address and its SSH port accepts connections.
    ///
    /// The address lookup and the port probe each get `ssh_attempts` tries, so a
    /// node can take up to twice that many probes before timing out.
    pub async fn wait_for_ssh(&self, nodes: &[NodeName]) -> LabResult<()> {
        let poller = self.poller(self.settings.ssh_attempts);

        for node in nodes {
            let runtime = self.runtime.clone();
            let ip = poller
                .until(&format!("address of `{}`", node), || {
                    let runtime = runtime.clone();
                    let node = node.clone();
                    async move { runtime.node_address(&node).await }
                })
                .await
                .map_err(|e| match e {
                    LabError::Timeout { .. } => LabError::MissingAddress(node.to_string()),
                    other => other,
                })?;

            let addr = SocketAddr::new(ip, self.settings.ssh_port);
            poll::wait_for_port(
                &poller,
                &format!("ssh on `{}`", node),
                addr,
                self.settings.connect_timeout,
            )
            .await?;
        }

        Ok(())
    }

    /// Request, await and sign a certificate for each node.
    ///
    /// The configured master files stay moved aside for the duration.
    pub async fn register(&self, nodes: &[NodeName]) -> LabResult<Vec<String>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let _stash = ConfigStash::stash(&self.settings.stash_paths)?;
        let poller = self.poller(self.settings.csr_attempts);
        let mut signed = Vec::with_capacity(nodes.len());

        for node in nodes {
            let certname = self.certname(node);
            self.ca.clean(&certname).await?;

            let request = puppet::request_cert_argv(&self.settings.agent_program, &certname);
            let out = self.runtime.exec(node, &request).await?;
            info!(
                "Requested certificate for `{}` (agent exited {:?})",
                certname, out.status
            );

            let ca = self.ca.as_ref();
            let wanted = certname.as_str();
            poller
                .until(
                    &format!("signing request from `{}`", certname),
                    move || async move {
                        let pending = ca.pending_requests().await?;
                        Ok(pending.iter().any(|c| c == wanted).then_some(()))
                    },
                )
                .await?;

            self.ca.sign(&certname).await?;
            signed.push(certname);
        }

        Ok(signed)
    }

    /// One agent run on each node in parallel.
    pub async fn run_agents(&self, nodes: &[NodeName]) -> Vec<(NodeName, RunOutcome)> {
        if nodes.is_empty() {
            return Vec::new();
        }
        let cmd = puppet::agent_run_argv(&self.settings.agent_program);
        fanout::run_on_all(
            self.runtime.clone(),
            nodes,
            &cmd,
            puppet::agent_run_succeeded,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCa, FakeRuntime};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn node(name: &str, sign_cert: bool, run_puppet: bool) -> NodeOptions {
        NodeOptions {
            name: NodeName::new(name),
            image: "agent".into(),
            sign_cert,
            run_puppet,
        }
    }

    fn settings(ssh_port: u16, hosts_file: Option<std::path::PathBuf>) -> LabSettings {
        LabSettings {
            hosts_file,
            ssh_port,
            poll_interval: Duration::from_millis(5),
            connect_timeout: Duration::from_millis(200),
            ssh_attempts: 3,
            csr_attempts: 3,
            stash_paths: Vec::new(),
            ..Default::default()
        }
    }

    struct Harness {
        runtime: Arc<FakeRuntime>,
        ca: Arc<FakeCa>,
        provisioner: QuestProvisioner<FakeRuntime, FakeCa>,
        _listener: TcpListener,
    }

    async fn harness(
        hosts_file: Option<std::path::PathBuf>,
        exit_status: BTreeMap<NodeName, i32>,
    ) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let ca = Arc::new(FakeCa::default());
        let runtime = Arc::new(FakeRuntime {
            csr_sink: Some(ca.pending.clone()),
            exit_status,
            ..FakeRuntime::with_address("127.0.0.1")
        });
        let provisioner =
            QuestProvisioner::new(settings(port, hosts_file), runtime.clone(), ca.clone());

        Harness {
            runtime,
            ca,
            provisioner,
            _listener: listener,
        }
    }

    #[tokio::test]
    async fn test_provision_full_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let hosts_path = dir.path().join("hosts");
        std::fs::write(&hosts_path, "127.0.0.1 localhost\n").unwrap();

        let h = harness(Some(hosts_path.clone()), BTreeMap::new()).await;
        h.runtime.seed("leftover", "quest-nodes.quest", "old");

        let quest = QuestName::new("hiera");
        let nodes = vec![node("web", true, true), node("db", false, false)];
        let report = h.provisioner.provision(&quest, &nodes).await.unwrap();

        assert_eq!(report.removed, vec![NodeName::new("leftover")]);
        assert_eq!(
            report.started,
            vec![NodeName::new("web"), NodeName::new("db")]
        );
        assert_eq!(report.signed, vec!["web.puppet.vm".to_string()]);
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].0.as_str(), "web");
        assert!(report.runs[0].1.is_success());
        assert_eq!(report.failed_runs().count(), 0);

        let calls = h.runtime.calls();
        assert_eq!(calls[0], "rm leftover");
        assert_eq!(calls[1], "run web");
        assert_eq!(calls[2], "run db");
        assert!(calls[3].starts_with("exec web puppet agent --test --noop --waitforcert 0"));
        assert_eq!(calls[4], "exec web puppet agent --test");
        assert_eq!(calls.len(), 5);

        // Leftover cert cleaned at teardown, stale web cert cleaned before request
        let cleaned = h.ca.cleaned.lock().unwrap().clone();
        assert_eq!(
            cleaned,
            vec!["leftover.puppet.vm".to_string(), "web.puppet.vm".to_string()]
        );

        let text = std::fs::read_to_string(&hosts_path).unwrap();
        assert!(text.starts_with("127.0.0.1 localhost\n"));
        assert!(text.contains("127.0.0.1\tdb.puppet.vm db\n"));
        assert!(text.contains("127.0.0.1\tweb.puppet.vm web\n"));
        assert!(!text.contains("leftover"));
    }

    #[tokio::test]
    async fn test_failed_agent_run_is_reported_not_fatal() {
        let mut exit_status = BTreeMap::new();
        exit_status.insert(NodeName::new("db"), 1);
        exit_status.insert(NodeName::new("web"), 2);
        let h = harness(None, exit_status).await;

        let quest = QuestName::new("q");
        let nodes = vec![node("web", true, true), node("db", true, true)];
        let report = h.provisioner.provision(&quest, &nodes).await.unwrap();

        assert_eq!(report.runs.len(), 2);
        assert_eq!(report.runs[0].0.as_str(), "web");
        assert!(report.runs[0].1.is_success());
        assert_eq!(report.runs[1].0.as_str(), "db");
        assert!(matches!(report.runs[1].1, RunOutcome::Failed(_)));
        assert_eq!(
            report.failed_runs().cloned().collect::<Vec<_>>(),
            vec![NodeName::new("db")]
        );
    }

    #[tokio::test]
    async fn test_ssh_timeout_aborts() {
        let closed_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let runtime = Arc::new(FakeRuntime::with_address("127.0.0.1"));
        let ca = Arc::new(FakeCa::default());
        let provisioner = QuestProvisioner::new(settings(closed_port, None), runtime.clone(), ca);

        let err = provisioner
            .provision(&QuestName::new("q"), &[node("web", true, true)])
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        // Nothing past the readiness gate ran
        assert_eq!(runtime.calls(), vec!["run web".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_address_times_out() {
        let runtime = Arc::new(FakeRuntime::default());
        let ca = Arc::new(FakeCa::default());
        let provisioner = QuestProvisioner::new(settings(22, None), runtime.clone(), ca);
        runtime.seed("web", "quest-nodes.quest", "q");

        let err = provisioner
            .wait_for_ssh(&[NodeName::new("web")])
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::MissingAddress(n) if n == "web"));
    }

    #[tokio::test]
    async fn test_csr_never_arrives() {
        let h = harness(None, BTreeMap::new()).await;
        // Requests go nowhere, so the CA never sees one
        let runtime = Arc::new(FakeRuntime::with_address("127.0.0.1"));
        let provisioner = QuestProvisioner::new(
            h.provisioner.settings().clone(),
            runtime.clone(),
            h.ca.clone(),
        );

        let err = provisioner
            .register(&[NodeName::new("web")])
            .await
            .unwrap_err();
        match err {
            LabError::Timeout { what, attempts, .. } => {
                assert!(what.contains("web.puppet.vm"));
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.ca.signed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_restores_stashed_files() {
        let dir = tempfile::tempdir().unwrap();
        let autosign = dir.path().join("autosign.conf");
        std::fs::write(&autosign, "true\n").unwrap();

        let ca = Arc::new(FakeCa::default());
        let runtime = Arc::new(FakeRuntime::with_address("127.0.0.1"));
        let mut s = settings(22, None);
        s.stash_paths = vec![autosign.clone()];
        let provisioner = QuestProvisioner::new(s, runtime, ca);

        // No CSR sink: registration times out, the file must still come back
        let err = provisioner
            .register(&[NodeName::new("web")])
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(std::fs::read_to_string(&autosign).unwrap(), "true\n");
    }

    #[tokio::test]
    async fn test_teardown_only_removes_labelled() {
        let dir = tempfile::tempdir().unwrap();
        let hosts_path = dir.path().join("hosts");
        let h = harness(Some(hosts_path.clone()), BTreeMap::new()).await;
        h.runtime.seed("a", "quest-nodes.quest", "q");
        h.runtime.seed("b", "quest-nodes.quest", "q");
        h.runtime.seed("other", "someone.else", "x");

        let removed = h.provisioner.teardown().await.unwrap();
        assert_eq!(removed, vec![NodeName::new("a"), NodeName::new("b")]);
        assert!(h.runtime.containers.lock().unwrap().contains_key(&NodeName::new("other")));
        // Nothing left to list, so no block was written
        assert!(!hosts_path.exists());
    }

    #[tokio::test]
    async fn test_teardown_clears_stale_block_without_containers() {
        let dir = tempfile::tempdir().unwrap();
        let hosts_path = dir.path().join("hosts");
        std::fs::write(
            &hosts_path,
            "127.0.0.1 localhost\n# BEGIN quest-nodes\n10.0.0.9\tgone.puppet.vm gone\n# END quest-nodes\n",
        )
        .unwrap();

        let runtime = Arc::new(FakeRuntime::default());
        let ca = Arc::new(FakeCa::default());
        let provisioner = QuestProvisioner::new(settings(22, Some(hosts_path.clone())), runtime, ca);

        let removed = provisioner.teardown().await.unwrap();
        assert!(removed.is_empty());
        assert_eq!(
            std::fs::read_to_string(&hosts_path).unwrap(),
            "127.0.0.1 localhost\n"
        );
    }

    #[tokio::test]
    async fn test_empty_quest() {
        let h = harness(None, BTreeMap::new()).await;
        let report = h
            .provisioner
            .provision(&QuestName::new("welcome"), &[])
            .await
            .unwrap();
        assert!(report.started.is_empty());
        assert!(report.signed.is_empty());
        assert!(report.runs.is_empty());
    }

    #[test]
    fn test_launch_for() {
        let ca = Arc::new(FakeCa::default());
        let runtime = Arc::new(FakeRuntime::default());
        let mut s = LabSettings::default();
        s.network = Some("lab".to_string());
        let provisioner = QuestProvisioner::new(s, runtime, ca);

        let launch = provisioner.launch_for(&QuestName::new("hiera"), &node("web", false, false));
        assert_eq!(launch.hostname, "web.puppet.vm");
        assert_eq!(
            launch.labels,
            vec![("quest-nodes.quest".to_string(), "hiera".to_string())]
        );
        assert_eq!(launch.network.as_deref(), Some("lab"));
    }
}
