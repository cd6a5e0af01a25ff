use async_trait::async_trait;
use log::{debug, error, info};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{KeeperError, Result};

/// Live side of the interface: status dumps and reloading the config file.
#[async_trait]
pub trait WgControl: Send + Sync {
    /// Text of `wg show <iface>`.
    async fn show(&self) -> Result<String>;

    /// Make the running interface match the configuration file.
    async fn apply(&self) -> Result<()>;
}

/// Drives the `wg` and `wg-quick` command line tools.
#[derive(Debug, Clone)]
pub struct CliWgControl {
    interface: String,
    timeout: Duration,
    wg: String,
    wg_quick: String,
}

impl CliWgControl {
    pub fn new(interface: &str, timeout: Duration) -> Self {
        Self {
            interface: interface.to_string(),
            timeout,
            wg: "wg".to_string(),
            wg_quick: "wg-quick".to_string(),
        }
    }

    /// Use other binaries, e.g. absolute paths or wrappers.
    pub fn with_binaries(mut self, wg: &str, wg_quick: &str) -> Self {
        self.wg = wg.to_string();
        self.wg_quick = wg_quick.to_string();
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn describe(cmd: &Command) -> String {
        format!("{:?}", cmd.as_std())
    }

    /// Run `cmd` to completion, feeding `input` to stdin, and return stdout.
    async fn run(&self, mut cmd: Command, input: Option<&str>) -> Result<String> {
        let label = Self::describe(&cmd);
        debug!("Executing: {}", label);

        cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let work = async {
            let mut child = cmd
                .spawn()
                .map_err(|e| KeeperError::io(format!("spawning {}", label), e))?;
            if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
                stdin
                    .write_all(text.as_bytes())
                    .await
                    .map_err(|e| KeeperError::io(format!("writing stdin of {}", label), e))?;
                // Dropping stdin closes the pipe so the child sees EOF.
            }
            child
                .wait_with_output()
                .await
                .map_err(|e| KeeperError::io(format!("waiting for {}", label), e))
        };

        let output = timeout(self.timeout, work)
            .await
            .map_err(|_| KeeperError::Timeout {
                command: label.clone(),
                seconds: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("{} failed ({}): {}", label, output.status, stderr);
            return Err(KeeperError::io(
                format!("{} exited with {}", label, output.status),
                std::io::Error::new(std::io::ErrorKind::Other, stderr),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl WgControl for CliWgControl {
    async fn show(&self) -> Result<String> {
        let mut cmd = Command::new(&self.wg);
        cmd.arg("show").arg(&self.interface);
        self.run(cmd, None).await
    }

    /// `wg syncconf <iface> <(wg-quick strip <iface>)`, without a shell.
    async fn apply(&self) -> Result<()> {
        let mut strip = Command::new(&self.wg_quick);
        strip.arg("strip").arg(&self.interface);
        let stripped = self.run(strip, None).await?;

        let mut sync = Command::new(&self.wg);
        sync.arg("syncconf").arg(&self.interface).arg("/dev/stdin");
        self.run(sync, Some(&stripped)).await?;

        info!("Reloaded {} from its configuration file", self.interface);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let control = CliWgControl::new("wg-test0", Duration::from_secs(5))
            .with_binaries("/nonexistent/wg", "/nonexistent/wg-quick");
        assert!(matches!(control.show().await, Err(KeeperError::Io { .. })));
        assert!(matches!(control.apply().await, Err(KeeperError::Io { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_command_times_out() {
        let control = CliWgControl::new("wg-test0", Duration::from_millis(100));
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let result = control.run(cmd, None).await;
        assert!(matches!(result, Err(KeeperError::Timeout { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let control = CliWgControl::new("wg-test0", Duration::from_secs(5));
        let out = control
            .run(Command::new("cat"), Some("[Interface]\n"))
            .await
            .unwrap();
        assert_eq!(out, "[Interface]\n");
    }
}
