//! Communicator contract
//!
//! The abstract remote-execution backend the adapter drives. Concrete
//! backends (SSH, container exec, cloud consoles) live outside this crate;
//! [`LocalCommunicator`] runs against the local machine.
//!
//! Only `start`, `upload` and `download` are required. Directory-level
//! transfers, `stat` and `read_dir` default to [`CommunicatorError::Unsupported`];
//! `mkdir`, `rmdir`, `remove` and `rename` default to a POSIX shell command
//! run through `start`.

mod local;
#[cfg(test)]
pub(crate) mod testing;

use std::borrow::Cow;
use std::io;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream};
use tracing::debug;

pub use local::LocalCommunicator;

/// Byte stream handed to the backend (command stdin, upload content)
pub type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

/// Byte stream filled by the backend (command stdout/stderr, download content)
pub type ByteSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Buffer size of the in-memory pipes used to capture command output
const CAPTURE_BUFFER: usize = 64 * 1024;

/// Backend errors
#[derive(Debug, thiserror::Error)]
pub enum CommunicatorError {
    #[error("Operation not supported by backend: {0}")]
    Unsupported(&'static str),

    #[error("No such file: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Command could not be started: {0}")]
    StartFailed(String),

    #[error("Command '{command}' exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: u32,
        stderr: String,
    },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CommunicatorError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, CommunicatorError::Unsupported(_))
    }
}

/// A command to run on the target
///
/// Streams default to empty stdin and discarded output.
pub struct RemoteCmd {
    pub command: String,
    pub stdin: Option<ByteSource>,
    pub stdout: ByteSink,
    pub stderr: ByteSink,
}

impl RemoteCmd {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
            stdout: Box::pin(tokio::io::sink()),
            stderr: Box::pin(tokio::io::sink()),
        }
    }

    pub fn with_stdin(mut self, stdin: ByteSource) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn with_stdout(mut self, stdout: ByteSink) -> Self {
        self.stdout = stdout;
        self
    }

    pub fn with_stderr(mut self, stderr: ByteSink) -> Self {
        self.stderr = stderr;
        self
    }
}

impl std::fmt::Debug for RemoteCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCmd")
            .field("command", &self.command)
            .field("stdin", &self.stdin.is_some())
            .finish()
    }
}

/// Metadata of a file on the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    /// Permission bits (`0o755` style, without file type bits)
    pub mode: u32,
    pub is_dir: bool,
    /// Seconds since the epoch
    pub mtime: Option<u32>,
}

impl FileMeta {
    pub fn file(size: u64, mode: u32) -> Self {
        Self {
            size,
            mode,
            is_dir: false,
            mtime: None,
        }
    }

    pub fn dir(mode: u32) -> Self {
        Self {
            size: 0,
            mode,
            is_dir: true,
            mtime: None,
        }
    }
}

/// Directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub meta: FileMeta,
}

/// Remote-execution backend
///
/// Every method may be called concurrently for distinct invocations.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Run a command and return its terminal exit status
    async fn start(&self, cmd: RemoteCmd) -> Result<u32, CommunicatorError>;

    /// Write `source` to `path` on the target
    async fn upload(
        &self,
        path: &str,
        source: ByteSource,
        meta: Option<FileMeta>,
    ) -> Result<(), CommunicatorError>;

    /// Stream the content of `path` on the target into `sink`
    async fn download(&self, path: &str, sink: ByteSink) -> Result<(), CommunicatorError>;

    async fn upload_dir(
        &self,
        _dst: &str,
        _src: &Path,
        _exclude: &[String],
    ) -> Result<(), CommunicatorError> {
        Err(CommunicatorError::Unsupported("upload_dir"))
    }

    async fn download_dir(
        &self,
        _src: &str,
        _dst: &Path,
        _exclude: &[String],
    ) -> Result<(), CommunicatorError> {
        Err(CommunicatorError::Unsupported("download_dir"))
    }

    /// `Ok(None)` when the path does not exist
    async fn stat(&self, _path: &str) -> Result<Option<FileMeta>, CommunicatorError> {
        Err(CommunicatorError::Unsupported("stat"))
    }

    async fn read_dir(&self, _path: &str) -> Result<Vec<DirEntry>, CommunicatorError> {
        Err(CommunicatorError::Unsupported("read_dir"))
    }

    async fn mkdir(&self, path: &str) -> Result<(), CommunicatorError> {
        run_checked(self, format!("mkdir {}", quote(path))).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), CommunicatorError> {
        run_checked(self, format!("rmdir {}", quote(path))).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), CommunicatorError> {
        run_checked(self, format!("rm -f {}", quote(path))).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), CommunicatorError> {
        run_checked(self, format!("mv {} {}", quote(from), quote(to))).await?;
        Ok(())
    }
}

/// Captured result of [`run_captured`]
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: u32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `command` through `comm`, capturing stdout and stderr
pub async fn run_captured<C>(comm: &C, command: String) -> Result<CommandOutput, CommunicatorError>
where
    C: Communicator + ?Sized,
{
    let (out_w, out_r) = tokio::io::duplex(CAPTURE_BUFFER);
    let (err_w, err_r) = tokio::io::duplex(CAPTURE_BUFFER);

    let cmd = RemoteCmd::new(command)
        .with_stdout(Box::pin(out_w))
        .with_stderr(Box::pin(err_w));

    // The sinks are dropped together with `cmd` once the backend is done,
    // which ends both readers.
    let (status, stdout, stderr) = tokio::join!(comm.start(cmd), drain(out_r), drain(err_r));

    Ok(CommandOutput {
        status: status?,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Run `command` and fail on a non-zero exit status
pub async fn run_checked<C>(comm: &C, command: String) -> Result<String, CommunicatorError>
where
    C: Communicator + ?Sized,
{
    debug!("[communicator] {}", command);
    let output = run_captured(comm, command.clone()).await?;
    if output.status != 0 {
        return Err(CommunicatorError::CommandFailed {
            command,
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Quote a path for a POSIX shell
pub fn quote(path: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(path))
}

async fn drain(mut reader: DuplexStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

#[cfg(test)]
mod tests {
    use super::testing::StubCommunicator;
    use super::*;

    #[test]
    fn test_quote_paths() {
        assert_eq!(quote("/tmp/plain"), "/tmp/plain");
        assert_eq!(quote("/tmp/with space"), "'/tmp/with space'");
    }

    #[tokio::test]
    async fn test_run_checked_captures_stdout() {
        let comm = StubCommunicator::new();
        let out = run_checked(&comm, "echo hi".to_string()).await.unwrap();
        assert_eq!(out, "hi\n");
    }

    #[tokio::test]
    async fn test_default_mkdir_runs_shell_command() {
        let comm = StubCommunicator::new();
        comm.mkdir("/tmp/new dir").await.unwrap();

        assert_eq!(comm.commands(), vec!["mkdir '/tmp/new dir'".to_string()]);
    }

    #[tokio::test]
    async fn test_default_rename_reports_failure() {
        let comm = StubCommunicator::new().with_exit_status(1);
        let err = comm.rename("/a", "/b").await.unwrap_err();

        match err {
            CommunicatorError::CommandFailed { command, status, .. } => {
                assert_eq!(command, "mv /a /b");
                assert_eq!(status, 1);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_optional_operations_default_to_unsupported() {
        let comm = StubCommunicator::new();
        assert!(comm.read_dir("/").await.unwrap_err().is_unsupported());
        assert!(comm
            .upload_dir("/dst", Path::new("/src"), &[])
            .await
            .unwrap_err()
            .is_unsupported());
    }
}
