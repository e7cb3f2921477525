//! Recording backend used by the test suites

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{ByteSink, ByteSource, Communicator, CommunicatorError, FileMeta, RemoteCmd};

/// In-memory backend
///
/// `start` understands `echo <words>` (writes the words and a newline to
/// stdout), `fail` (writes `boom` to stderr) and echoes stdin to stdout for
/// every command. Uploaded files are kept and served back on download.
#[derive(Default)]
pub struct StubCommunicator {
    exit_status: u32,
    fail_start: bool,
    stat_supported: bool,
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    dirs: Mutex<Vec<String>>,
}

impl StubCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_status(mut self, status: u32) -> Self {
        self.exit_status = status;
        self
    }

    pub fn with_failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn with_stat(mut self) -> Self {
        self.stat_supported = true;
        self
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.files.lock().insert(path.to_string(), content.to_vec());
        self
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.dirs.lock().push(path.to_string());
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl Communicator for StubCommunicator {
    async fn start(&self, mut cmd: RemoteCmd) -> Result<u32, CommunicatorError> {
        if self.fail_start {
            return Err(CommunicatorError::StartFailed("backend unreachable".into()));
        }
        self.commands.lock().push(cmd.command.clone());

        if let Some(words) = cmd.command.strip_prefix("echo ") {
            cmd.stdout.write_all(words.as_bytes()).await?;
            cmd.stdout.write_all(b"\n").await?;
        }
        if cmd.command.starts_with("fail") {
            cmd.stderr.write_all(b"boom\n").await?;
        }
        if let Some(mut stdin) = cmd.stdin.take() {
            tokio::io::copy(&mut stdin, &mut cmd.stdout).await?;
        }
        cmd.stdout.flush().await?;
        cmd.stderr.flush().await?;
        Ok(self.exit_status)
    }

    async fn upload(
        &self,
        path: &str,
        mut source: ByteSource,
        _meta: Option<FileMeta>,
    ) -> Result<(), CommunicatorError> {
        let mut content = Vec::new();
        source.read_to_end(&mut content).await?;
        self.uploads.lock().push((path.to_string(), content.clone()));
        self.files.lock().insert(path.to_string(), content);
        Ok(())
    }

    async fn download(&self, path: &str, mut sink: ByteSink) -> Result<(), CommunicatorError> {
        let content = self
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| CommunicatorError::NotFound(path.to_string()))?;
        sink.write_all(&content).await?;
        sink.flush().await?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Option<FileMeta>, CommunicatorError> {
        if !self.stat_supported {
            return Err(CommunicatorError::Unsupported("stat"));
        }
        if self.dirs.lock().iter().any(|d| d == path) {
            return Ok(Some(FileMeta::dir(0o755)));
        }
        Ok(self
            .files
            .lock()
            .get(path)
            .map(|content| FileMeta::file(content.len() as u64, 0o644)))
    }
}
