// External command invocation shared by the runtime and CA wrappers

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::{LabError, LabResult};

/// Captured result of a finished command. A non-zero exit is not an error here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Run `program args...` to completion, capturing output.
pub async fn run(program: &str, args: &[String]) -> LabResult<ExecOutput> {
    debug!("running `{} {}`", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| LabError::Spawn {
            program: program.to_string(),
            source,
        })?;

    Ok(ExecOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Like [`run`], but a non-zero exit becomes [`LabError::CommandFailed`].
pub async fn run_checked(program: &str, args: &[String]) -> LabResult<ExecOutput> {
    let output = run(program, args).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(failed(program, args, &output))
    }
}

pub(crate) fn failed(program: &str, args: &[String], output: &ExecOutput) -> LabError {
    LabError::CommandFailed {
        program: program.to_string(),
        args: args.to_vec(),
        status: output.status,
        stderr: if output.stderr.trim().is_empty() {
            output.stdout.clone()
        } else {
            output.stderr.clone()
        },
    }
}

/// Build an owned argv from string literals.
pub fn argv<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
