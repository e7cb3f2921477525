//! Command runner
//!
//! Writes the inventory pointing at the adapter and runs the playbook
//! executable, streaming its output line by line to the observer.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::TempPath;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::observer::{Event, Observer, OutputStream};

/// Runner errors
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Error preparing inventory file: {0}")]
    Inventory(std::io::Error),

    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Non-zero exit status: {0}")]
    NonZeroExit(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inventory line for the single host behind the adapter
pub fn inventory_line(user: &str, port: u16) -> String {
    format!(
        "default ansible_ssh_host=127.0.0.1 ansible_ssh_user={} ansible_ssh_port={}",
        user, port
    )
}

/// Temporary inventory file, removed on drop
pub fn write_inventory(user: &str, port: u16) -> Result<TempPath, RunnerError> {
    let mut file = tempfile::Builder::new()
        .prefix("comm-adapter-inventory")
        .tempfile()
        .map_err(RunnerError::Inventory)?;
    file.write_all(inventory_line(user, port).as_bytes())
        .map_err(RunnerError::Inventory)?;
    file.flush().map_err(RunnerError::Inventory)?;
    Ok(file.into_temp_path())
}

/// One invocation of the playbook executable
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: String,
    pub playbook: PathBuf,
    pub inventory: PathBuf,
    pub private_key: PathBuf,
    pub extra_arguments: Vec<String>,
}

impl Invocation {
    /// `<playbook> -i <inventory> --private-key <key> <extra...>`
    ///
    /// The playbook path is made absolute.
    pub fn args(&self) -> Result<Vec<String>, RunnerError> {
        let playbook = absolute(&self.playbook)?;
        let mut args = vec![
            playbook.to_string_lossy().into_owned(),
            "-i".to_string(),
            self.inventory.to_string_lossy().into_owned(),
            "--private-key".to_string(),
            self.private_key.to_string_lossy().into_owned(),
        ];
        args.extend(self.extra_arguments.iter().cloned());
        Ok(args)
    }

    /// Run to completion, or until `cancel` fires
    pub async fn run(
        &self,
        observer: &dyn Observer,
        cancel: &CancellationToken,
    ) -> Result<(), RunnerError> {
        let args = self.args()?;
        observer.report(&Event::Message(format!(
            "Executing command runner: {} {}",
            self.command,
            args.join(" ")
        )));

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                command: self.command.clone(),
                source,
            })?;
        debug!("[runner] started {} (pid {:?})", self.command, child.id());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async {
            tokio::join!(
                forward(stdout, OutputStream::Stdout, observer),
                forward(stderr, OutputStream::Stderr, observer),
            );
            child.wait().await
        };

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("[runner] cancelled, killing {}", self.command);
                return Err(RunnerError::Cancelled);
            }
            status = run => status?,
        };

        if !status.success() {
            return Err(RunnerError::NonZeroExit(status.to_string()));
        }
        Ok(())
    }
}

fn absolute(path: &Path) -> Result<PathBuf, RunnerError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

async fn forward<R>(reader: Option<R>, stream: OutputStream, observer: &dyn Observer)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => observer.report(&Event::RunnerOutput { stream, line }),
            Ok(None) => break,
            Err(e) => {
                observer.report(&Event::Message(format!("error reading output: {}", e)));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::MemoryObserver;

    fn invocation(command: &str, extra: &[&str]) -> Invocation {
        Invocation {
            command: command.to_string(),
            playbook: PathBuf::from("/srv/site.yml"),
            inventory: PathBuf::from("/tmp/inventory"),
            private_key: PathBuf::from("/tmp/key"),
            extra_arguments: extra.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_inventory_file() {
        let path = write_inventory("packer-ansible", 2201).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "default ansible_ssh_host=127.0.0.1 ansible_ssh_user=packer-ansible ansible_ssh_port=2201"
        );

        let kept = path.to_path_buf();
        drop(path);
        assert!(!kept.exists());
    }

    #[test]
    fn test_arguments() {
        let args = invocation("ansible-playbook", &["-vvv", "--tags=web"]).args().unwrap();
        assert_eq!(
            args,
            vec![
                "/srv/site.yml",
                "-i",
                "/tmp/inventory",
                "--private-key",
                "/tmp/key",
                "-vvv",
                "--tags=web",
            ]
        );
    }

    #[test]
    fn test_relative_playbook_made_absolute() {
        let mut inv = invocation("ansible-playbook", &[]);
        inv.playbook = PathBuf::from("site.yml");
        let args = inv.args().unwrap();
        assert!(Path::new(&args[0]).is_absolute());
        assert!(args[0].ends_with("site.yml"));
    }

    #[tokio::test]
    async fn test_output_streamed_to_observer() {
        // `echo` prints its arguments, standing in for the playbook runner.
        let observer = MemoryObserver::new();
        invocation("echo", &[])
            .run(&observer, &CancellationToken::new())
            .await
            .unwrap();

        assert!(observer.contains("Executing command runner: echo"));
        assert!(observer
            .lines()
            .iter()
            .any(|l| l == "/srv/site.yml -i /tmp/inventory --private-key /tmp/key"));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let observer = MemoryObserver::new();
        let err = invocation("false", &[])
            .run(&observer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NonZeroExit(_)));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let observer = MemoryObserver::new();
        let err = invocation("/nonexistent/ansible-playbook", &[])
            .run(&observer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancel_stops_runner() {
        let observer = MemoryObserver::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut inv = invocation("sleep", &[]);
        inv.playbook = PathBuf::from("/");
        let err = inv.run(&observer, &cancel).await.unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled));
    }
}
