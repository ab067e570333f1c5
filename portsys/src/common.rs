/*!
Shared helpers for running external commands and for keeping secrets out of
everything the tool prints.
*/

use log::{self, debug, LevelFilter};
use snafu::{ensure, ResultExt, Snafu};
use std::process::Output;
use std::sync::{Arc, RwLock};
use tokio::process::Command;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("Unable to start command '{command}': {source}"))]
    CommandStart {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display("Command '{command}' was unsuccessful, exit code {code}:\n{output}"))]
    CommandFailure {
        command: String,
        code: i32,
        output: String,
    },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Render a command for error messages and logs.
pub(crate) fn command_line(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    std::iter::once(std_cmd.get_program())
        .chain(std_cmd.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a command and return a `Result` letting us know whether or not it
/// worked. Pipes stdout/stderr through when logging is more verbose than
/// `Warn`.
pub(crate) async fn exec_log(cmd: &mut Command) -> Result<()> {
    let quiet = matches!(
        log::max_level(),
        LevelFilter::Off | LevelFilter::Error | LevelFilter::Warn
    );
    exec(cmd, quiet).await
}

/// Run a command. `quiet` determines whether its output is captured or
/// streamed to our own stdout/stderr.
pub(crate) async fn exec(cmd: &mut Command, quiet: bool) -> Result<()> {
    debug!("Running: {:?}", cmd);
    let command = command_line(cmd);
    if quiet {
        let output = cmd
            .output()
            .await
            .context(CommandStartSnafu { command: &command })?;
        ensure!(
            output.status.success(),
            CommandFailureSnafu {
                command,
                code: output.status.code().unwrap_or(1),
                output: format!(
                    "{}\n{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                ),
            }
        );
    } else {
        let status = cmd
            .status()
            .await
            .context(CommandStartSnafu { command: &command })?;
        ensure!(
            status.success(),
            CommandFailureSnafu {
                command,
                code: status.code().unwrap_or(1),
                output: String::new(),
            }
        );
    }
    Ok(())
}

/// Run a command and capture its output, failing on a non-zero exit.
pub(crate) async fn output(cmd: &mut Command) -> Result<Output> {
    let out = output_unchecked(cmd).await?;
    ensure!(
        out.status.success(),
        CommandFailureSnafu {
            command: command_line(cmd),
            code: out.status.code().unwrap_or(1),
            output: format!(
                "{}\n{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            ),
        }
    );
    Ok(out)
}

/// Run a command and capture its output without inspecting the exit status.
pub(crate) async fn output_unchecked(cmd: &mut Command) -> Result<Output> {
    debug!("Running: {:?}", cmd);
    cmd.output().await.context(CommandStartSnafu {
        command: command_line(cmd),
    })
}

/// A shared table of secret strings. Every log line and error message that
/// might carry a provider URL or token is passed through [`Redactor::redact`]
/// before it is emitted.
#[derive(Debug, Clone, Default)]
pub(crate) struct Redactor {
    secrets: Arc<RwLock<Vec<String>>>,
}

pub(crate) const REDACTED: &str = "*** [secret] ***";

impl Redactor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a secret. Empty or single-character strings are ignored so a
    /// degenerate secret cannot blank out entire messages.
    pub(crate) fn add(&self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.len() > 1 {
            let mut secrets = self.secrets.write().unwrap_or_else(|e| e.into_inner());
            if !secrets.contains(&secret) {
                secrets.push(secret);
            }
        }
    }

    pub(crate) fn redact(&self, text: impl AsRef<str>) -> String {
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        let mut out = text.as_ref().to_string();
        for secret in secrets.iter() {
            out = out.replace(secret, REDACTED);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_failed_command_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let err = output(&mut cmd).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 3"), "{message}");
        assert!(message.contains("boom"), "{message}");
    }

    #[tokio::test]
    async fn successful_command_is_ok() {
        let mut cmd = Command::new("true");
        exec(&mut cmd, true).await.unwrap();
    }

    #[test]
    fn redactor_replaces_every_occurrence() {
        let redactor = Redactor::new();
        redactor.add("s3cr3t-token");
        let output =
            redactor.redact("PUT https://host/x?sig=s3cr3t-token failed; retry with s3cr3t-token");
        assert!(!output.contains("s3cr3t-token"));
        assert_eq!(output.matches(REDACTED).count(), 2);
    }

    #[test]
    fn short_secrets_are_not_registered() {
        let redactor = Redactor::new();
        redactor.add("x");
        assert_eq!(redactor.redact("axb"), "axb");
    }
}
