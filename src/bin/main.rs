use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use quest_nodes::{LabSettings, QuestBook, QuestName, create_provisioner, resolve_quest_file};

#[derive(Parser)]
#[command(name = "quest-nodes")]
#[command(about = "Provision and tear down the lab nodes of a training quest")]
struct Cli {
    /// Quest whose nodes should be provisioned
    #[arg(required_unless_present_any = ["teardown", "list_quests"])]
    quest: Option<String>,

    /// Quest file mapping quest names to node lists
    #[arg(long, env = "QUEST_NODES_CONFIG")]
    quests: Option<PathBuf>,

    /// Remove all lab nodes and exit
    #[arg(long, conflicts_with_all = ["quest", "list_quests"])]
    teardown: bool,

    /// List the quests in the quest file and exit
    #[arg(long)]
    list_quests: bool,

    /// Container runtime binary
    #[arg(long, env = "QUEST_NODES_RUNTIME", default_value = "docker")]
    runtime: String,

    /// Network to attach nodes to
    #[arg(long, env = "QUEST_NODES_NETWORK")]
    network: Option<String>,

    /// Domain suffix for node hostnames and certnames
    #[arg(long, env = "QUEST_NODES_DOMAIN", default_value = "puppet.vm")]
    domain: String,

    /// Label key marking containers as lab nodes
    #[arg(long, env = "QUEST_NODES_LABEL", default_value = "quest-nodes.quest")]
    label_key: String,

    /// Hosts file to keep in sync with the lab nodes
    #[arg(long, env = "QUEST_NODES_HOSTS_FILE", default_value = "/etc/hosts")]
    hosts_file: PathBuf,

    /// Leave the hosts file alone
    #[arg(long, env = "QUEST_NODES_NO_HOSTS", default_value_t = false)]
    no_hosts: bool,

    /// Binary providing `ca list|sign|clean` on the master
    #[arg(long, env = "QUEST_NODES_CA", default_value = "puppetserver")]
    ca_program: String,

    /// Agent binary inside the nodes
    #[arg(long, env = "QUEST_NODES_AGENT", default_value = "puppet")]
    agent_program: String,

    #[arg(long, env = "QUEST_NODES_SSH_PORT", default_value_t = 22)]
    ssh_port: u16,

    /// Seconds between readiness probes
    #[arg(long, env = "QUEST_NODES_POLL_INTERVAL", default_value_t = 2)]
    poll_interval_secs: u64,

    /// Probes before giving up on a node's address, and again on its SSH port
    #[arg(long, env = "QUEST_NODES_SSH_ATTEMPTS", default_value_t = 30)]
    ssh_attempts: u32,

    /// Probes before giving up on a node's signing request
    #[arg(long, env = "QUEST_NODES_CSR_ATTEMPTS", default_value_t = 15)]
    csr_attempts: u32,

    /// Master files to move aside while certificates are signed (comma separated)
    #[arg(
        long = "stash",
        env = "QUEST_NODES_STASH",
        value_delimiter = ',',
        default_value = "/etc/puppetlabs/puppet/autosign.conf"
    )]
    stash_paths: Vec<PathBuf>,
}

impl Cli {
    fn settings(&self) -> LabSettings {
        LabSettings {
            runtime: self.runtime.clone(),
            network: self.network.clone(),
            domain: self.domain.clone(),
            label_key: self.label_key.clone(),
            hosts_file: (!self.no_hosts).then(|| self.hosts_file.clone()),
            ca_program: self.ca_program.clone(),
            agent_program: self.agent_program.clone(),
            ssh_port: self.ssh_port,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            ssh_attempts: self.ssh_attempts,
            csr_attempts: self.csr_attempts,
            stash_paths: self.stash_paths.clone(),
            ..Default::default()
        }
    }
}

fn load_book(cli: &Cli) -> Result<QuestBook> {
    let path = resolve_quest_file(cli.quests.clone())?;
    info!("Loading quests from {}", path.display());
    QuestBook::load(&path).with_context(|| format!("loading {}", path.display()))
}

async fn run(cli: Cli) -> Result<()> {
    if cli.list_quests {
        let book = load_book(&cli)?;
        for quest in book.quest_names() {
            let nodes = book.nodes(quest)?;
            let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
            println!("{:<30} {}", quest, names.join(", "));
        }
        return Ok(());
    }

    let provisioner = create_provisioner(cli.settings());

    if cli.teardown {
        let removed = provisioner.teardown().await?;
        println!("Removed {} lab node(s)", removed.len());
        return Ok(());
    }

    let quest = QuestName::new(
        cli.quest
            .clone()
            .context("a quest name is required")?,
    );
    let book = load_book(&cli)?;
    let nodes = book.nodes(&quest)?;

    let report = provisioner.provision(&quest, nodes).await?;

    println!("Quest: {}", report.quest);
    println!("{:<30} {:<10} {:<10}", "NODE", "CERT", "RUN");
    println!("{}", "-".repeat(52));
    for node in &report.started {
        let fqdn = node.fqdn(&provisioner.settings().domain);
        let cert = if report.signed.contains(&fqdn) { "signed" } else { "-" };
        let run = report
            .runs
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, outcome)| if outcome.is_success() { "ok" } else { "failed" })
            .unwrap_or("-");
        println!("{:<30} {:<10} {:<10}", node, cert, run);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("quest_nodes=info".parse()?))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
