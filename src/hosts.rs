//! Managed block in the hosts file so lab nodes resolve by name.
//!
//! Only the lines between [`BEGIN_MARKER`] and [`END_MARKER`] are ours;
//! everything else in the file is preserved as-is.

use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::LabResult;
use crate::runtime::ContainerRuntime;
use crate::types::NodeName;

pub const BEGIN_MARKER: &str = "# BEGIN quest-nodes";
pub const END_MARKER: &str = "# END quest-nodes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: NodeName,
    pub fqdn: String,
    pub ip: IpAddr,
}

/// Render the managed block, sorted by node name. Ends with a newline.
pub fn render_block(entries: &[HostEntry], generated_at: DateTime<Utc>) -> String {
    let mut sorted: Vec<&HostEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut block = String::new();
    block.push_str(BEGIN_MARKER);
    block.push('\n');
    block.push_str(&format!(
        "# generated {}\n",
        generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    for entry in sorted {
        if entry.fqdn == entry.name.as_str() {
            block.push_str(&format!("{}\t{}\n", entry.ip, entry.fqdn));
        } else {
            block.push_str(&format!("{}\t{} {}\n", entry.ip, entry.fqdn, entry.name));
        }
    }
    block.push_str(END_MARKER);
    block.push('\n');
    block
}

/// Replace the managed block in `existing` with `block`, or append it.
/// `None` removes the block.
///
/// A begin marker with no end marker after it is treated as a one-line block,
/// so nothing following it is lost.
pub fn splice(existing: &str, block: Option<&str>) -> String {
    fn bare(line: &str) -> &str {
        line.trim_end_matches(['\n', '\r'])
    }

    let lines: Vec<&str> = existing.split_inclusive('\n').collect();
    let span = lines.iter().position(|l| bare(l) == BEGIN_MARKER).map(|begin| {
        let end = lines[begin + 1..]
            .iter()
            .position(|l| bare(l) == END_MARKER)
            .map_or(begin, |offset| begin + 1 + offset);
        (begin, end)
    });

    let mut out = String::with_capacity(existing.len() + block.map_or(0, str::len));
    match span {
        Some((begin, end)) => {
            for line in &lines[..begin] {
                out.push_str(line);
            }
            if let Some(block) = block {
                out.push_str(block);
            }
            for line in &lines[end + 1..] {
                out.push_str(line);
            }
        }
        None => {
            out.push_str(existing);
            if let Some(block) = block {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(block);
            }
        }
    }

    out
}

/// Rewrite the managed block of the hosts file at `path`.
pub async fn rewrite(path: &Path, entries: &[HostEntry]) -> LabResult<()> {
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let block = (!entries.is_empty()).then(|| render_block(entries, Utc::now()));
    let updated = splice(&existing, block.as_deref());

    if updated != existing {
        // Write in place: the hosts file may be a bind mount that cannot be replaced.
        tokio::fs::write(path, updated).await?;
    }
    info!(
        "Updated {} with {} node entr{}",
        path.display(),
        entries.len(),
        if entries.len() == 1 { "y" } else { "ies" }
    );
    Ok(())
}

/// Look up the current address of each node. Nodes without one are skipped.
pub async fn collect_entries<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    names: &[NodeName],
    domain: &str,
) -> LabResult<Vec<HostEntry>> {
    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        match runtime.node_address(name).await? {
            Some(ip) => entries.push(HostEntry {
                name: name.clone(),
                fqdn: name.fqdn(domain),
                ip,
            }),
            None => warn!("Node `{}` has no address yet, leaving it out of hosts", name),
        }
    }
    Ok(entries)
}
