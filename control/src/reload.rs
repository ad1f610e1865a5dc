//! Proxy reload driver
//!
//! Runs the configured reload command (e.g. `nginx -s reload`) as a plain
//! argument vector, without a shell. Success is exit status 0; anything else
//! is a [`SyncError::ReloadFailed`] carrying the command's output. No retries
//! happen here.

use crate::error::SyncError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Reload command plus its time limit
#[derive(Debug, Clone)]
pub struct ReloadCommand {
    argv: Vec<String>,
    timeout: Duration,
}

impl ReloadCommand {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Run the command once and return its combined output on success.
    ///
    /// The child is killed if this future is dropped (shutdown) or the
    /// timeout expires.
    pub async fn run(&self) -> Result<String, SyncError> {
        let (program, args) = match self.argv.split_first() {
            Some((program, args)) if !program.is_empty() => (program, args),
            _ => return Err(SyncError::ReloadCommandMissing),
        };

        debug!("Running reload command: {:?}", self.argv);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.failed(e.to_string(), String::new())),
            Err(_) => {
                return Err(self.failed(
                    format!("timed out after {}s", self.timeout.as_secs_f64()),
                    String::new(),
                ))
            }
        };

        let combined = combine_output(&output.stdout, &output.stderr);
        if output.status.success() {
            Ok(combined)
        } else {
            Err(self.failed(output.status.to_string(), combined))
        }
    }

    fn failed(&self, reason: String, output: String) -> SyncError {
        SyncError::ReloadFailed {
            command: self.argv.clone(),
            reason,
            output,
        }
    }
}

/// stdout followed by stderr, lossily decoded and trimmed
fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(stderr));
    combined.trim().to_string()
}
