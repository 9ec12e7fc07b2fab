// Core modules
mod command;
pub mod config;
pub mod error;
pub mod fanout;
pub mod hosts;
pub mod poll;
pub mod provisioner;
pub mod puppet;
pub mod runtime;
pub mod stash;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export key types and functions
pub use command::ExecOutput;
pub use config::{LabSettings, NodeOptions, QuestBook, resolve_quest_file};
pub use error::{LabError, LabResult};
pub use poll::Poller;
pub use provisioner::{ProvisionReport, QuestProvisioner};
pub use puppet::{CertAuthority, PuppetCa};
pub use runtime::{ContainerRuntime, DockerCli};
pub use types::{ImageRef, NodeName, QuestName};

use std::sync::Arc;

/// Convenience function to build a provisioner wired to the real CLIs.
///
/// Uses `settings.runtime` for containers and `settings.ca_program` for
/// the certificate authority.
pub fn create_provisioner(settings: LabSettings) -> QuestProvisioner<DockerCli, PuppetCa> {
    let runtime = Arc::new(DockerCli::new(
        settings.runtime.clone(),
        settings.network.clone(),
    ));
    let ca = Arc::new(PuppetCa::new(settings.ca_program.clone()));
    QuestProvisioner::new(settings, runtime, ca)
}
