use serde::Deserialize;
use std::{collections::BTreeMap, collections::HashSet, env, fs, path::Path, path::PathBuf};
use std::time::Duration;

use crate::error::{LabError, LabResult};
use crate::types::{ImageRef, NodeName, QuestName};

/// Environment variable pointing at the quest file.
pub const QUEST_CONFIG_ENV: &str = "QUEST_NODES_CONFIG";

/// One entry of a quest's node list, as written in the quest file.
#[derive(Debug, Deserialize, Clone)]
struct RawNodeOptions {
    name: String,
    image: String,
    #[serde(default)]
    sign_cert: bool,
    #[serde(default)]
    run_puppet: bool,
}

/// A node the quest needs, after environment expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    pub name: NodeName,
    pub image: ImageRef,
    pub sign_cert: bool,
    pub run_puppet: bool,
}

impl From<RawNodeOptions> for NodeOptions {
    fn from(raw: RawNodeOptions) -> Self {
        Self {
            name: NodeName::new(raw.name),
            image: ImageRef::new(expand_env_vars(&raw.image)),
            sign_cert: raw.sign_cert,
            run_puppet: raw.run_puppet,
        }
    }
}

/// The parsed quest file: quest name to ordered node list.
#[derive(Debug, Clone, Default)]
pub struct QuestBook {
    quests: BTreeMap<QuestName, Vec<NodeOptions>>,
}

impl QuestBook {
    /// Parse and validate quest file contents.
    pub fn from_json(raw: &str) -> LabResult<Self> {
        let parsed: BTreeMap<String, Vec<RawNodeOptions>> =
            serde_json::from_str(raw).map_err(|e| LabError::InvalidQuestFile(e.to_string()))?;

        let mut quests = BTreeMap::new();
        for (quest, nodes) in parsed {
            let mut seen = HashSet::new();
            for node in &nodes {
                if node.name.trim().is_empty() {
                    return Err(LabError::InvalidQuestFile(format!(
                        "quest `{}` has a node with an empty name",
                        quest
                    )));
                }
                if !seen.insert(node.name.clone()) {
                    return Err(LabError::InvalidQuestFile(format!(
                        "quest `{}` lists node `{}` more than once",
                        quest, node.name
                    )));
                }
            }
            quests.insert(
                QuestName::new(quest),
                nodes.into_iter().map(NodeOptions::from).collect(),
            );
        }

        Ok(Self { quests })
    }

    /// Read and parse the quest file at `path`.
    pub fn load(path: &Path) -> LabResult<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw).map_err(|e| match e {
            LabError::InvalidQuestFile(msg) => {
                LabError::InvalidQuestFile(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Node list for `quest`, in provisioning order.
    pub fn nodes(&self, quest: &QuestName) -> LabResult<&[NodeOptions]> {
        self.quests
            .get(quest)
            .map(Vec::as_slice)
            .ok_or_else(|| LabError::QuestNotFound {
                quest: quest.to_string(),
                known: self.quest_names().iter().map(|q| q.to_string()).collect(),
            })
    }

    /// Quest names in sorted order.
    pub fn quest_names(&self) -> Vec<&QuestName> {
        self.quests.keys().collect()
    }
}

/// Find the quest file. An explicit path always wins.
pub fn resolve_quest_file(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p);
    }

    if let Ok(p) = env::var(QUEST_CONFIG_ENV) {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("quest-nodes").join("quests.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from("quests.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find quests.json (pass --quests, set {} or create ./quests.json)",
        QUEST_CONFIG_ENV
    ))
}

/// Replace `${NAME}` with the value of the environment variable `NAME`.
/// Unknown variables are left as written.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) if closed => out.push_str(&val),
                _ => {
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// Everything tunable about how nodes are provisioned and probed.
#[derive(Debug, Clone)]
pub struct LabSettings {
    /// Container runtime binary.
    pub runtime: String,
    /// Network to attach nodes to. `None` uses the runtime's default.
    pub network: Option<String>,
    /// Domain suffix for node hostnames and certnames.
    pub domain: String,
    /// Label key marking containers as lab nodes; its value is the quest name.
    pub label_key: String,
    /// Hosts file carrying the managed block. `None` leaves name resolution alone.
    pub hosts_file: Option<PathBuf>,
    /// Binary providing `ca list|sign|clean` on the master.
    pub ca_program: String,
    /// Agent binary inside the nodes.
    pub agent_program: String,
    pub ssh_port: u16,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    /// Tries for a node's address lookup and, separately, for its SSH port.
    pub ssh_attempts: u32,
    pub csr_attempts: u32,
    /// Master files moved aside while certificates are requested and signed.
    pub stash_paths: Vec<PathBuf>,
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            network: None,
            domain: "puppet.vm".to_string(),
            label_key: "quest-nodes.quest".to_string(),
            hosts_file: Some(PathBuf::from("/etc/hosts")),
            ca_program: "puppetserver".to_string(),
            agent_program: "puppet".to_string(),
            ssh_port: 22,
            connect_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            ssh_attempts: 30,
            csr_attempts: 15,
            stash_paths: vec![PathBuf::from("/etc/puppetlabs/puppet/autosign.conf")],
        }
    }
}
