//! Configuration-management seam: the certificate authority on the master
//! and the agent command lines run inside nodes.

use async_trait::async_trait;
use tracing::info;

use crate::command::{self, ExecOutput, argv};
use crate::error::LabResult;

#[async_trait]
pub trait CertAuthority: Send + Sync {
    /// Certnames with an outstanding signing request.
    async fn pending_requests(&self) -> LabResult<Vec<String>>;

    async fn sign(&self, certname: &str) -> LabResult<()>;

    /// Revoke and delete any certificate or request for `certname`.
    /// Cleaning an unknown certname succeeds.
    async fn clean(&self, certname: &str) -> LabResult<()>;
}

/// [`CertAuthority`] backed by `puppetserver ca`.
#[derive(Debug, Clone)]
pub struct PuppetCa {
    program: String,
}

impl PuppetCa {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn ca_args(action: &str, certname: Option<&str>) -> Vec<String> {
        let mut args = argv(["ca", action]);
        if let Some(name) = certname {
            args.push("--certname".to_string());
            args.push(name.to_string());
        }
        args
    }
}

#[async_trait]
impl CertAuthority for PuppetCa {
    async fn pending_requests(&self) -> LabResult<Vec<String>> {
        let out = command::run_checked(&self.program, &Self::ca_args("list", None)).await?;
        Ok(parse_pending_requests(&out.stdout))
    }

    async fn sign(&self, certname: &str) -> LabResult<()> {
        command::run_checked(&self.program, &Self::ca_args("sign", Some(certname))).await?;
        info!("Signed certificate for `{}`", certname);
        Ok(())
    }

    async fn clean(&self, certname: &str) -> LabResult<()> {
        let args = Self::ca_args("clean", Some(certname));
        let out = command::run(&self.program, &args).await?;
        if out.success() || is_unknown_cert(&out) {
            info!("Cleaned certificate for `{}`", certname);
            Ok(())
        } else {
            Err(command::failed(&self.program, &args, &out))
        }
    }
}

fn is_unknown_cert(out: &ExecOutput) -> bool {
    let text = format!("{}\n{}", out.stdout, out.stderr).to_ascii_lowercase();
    text.contains("could not find") || text.contains("not found")
}

/// Certnames listed under "Requested Certificates:" in `ca list` output.
pub fn parse_pending_requests(stdout: &str) -> Vec<String> {
    let mut pending = Vec::new();
    let mut in_requested = false;

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.ends_with(':') && !line.starts_with(char::is_whitespace) {
            in_requested = trimmed.eq_ignore_ascii_case("Requested Certificates:");
            continue;
        }
        if in_requested {
            if let Some(token) = trimmed.split_whitespace().next() {
                pending.push(token.trim_matches('"').to_string());
            }
        }
    }

    pending
}

/// Agent invocation that submits a signing request and exits without waiting.
pub fn request_cert_argv(agent_program: &str, certname: &str) -> Vec<String> {
    argv([
        agent_program,
        "agent",
        "--test",
        "--noop",
        "--waitforcert",
        "0",
        "--certname",
        certname,
    ])
}

/// One full agent run.
pub fn agent_run_argv(agent_program: &str) -> Vec<String> {
    argv([agent_program, "agent", "--test"])
}

/// `puppet agent --test` exits 2 when it applied changes, which is still a success.
pub fn agent_run_succeeded(status: Option<i32>) -> bool {
    matches!(status, Some(0) | Some(2))
}
