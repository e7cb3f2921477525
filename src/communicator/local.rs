//! Local backend
//!
//! Runs commands with `sh -c` and transfers files on the local filesystem.
//! Useful for trying the adapter without a real target.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ByteSink, ByteSource, Communicator, CommunicatorError, DirEntry, FileMeta, RemoteCmd};

/// Backend that targets the machine the adapter runs on
#[derive(Debug, Clone, Default)]
pub struct LocalCommunicator {
    /// Working directory for commands and relative paths
    workdir: Option<PathBuf>,
}

impl LocalCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workdir(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: Some(workdir.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.workdir {
            Some(dir) if !Path::new(path).is_absolute() => dir.join(path),
            _ => PathBuf::from(path),
        }
    }
}

fn map_io(path: &str, err: std::io::Error) -> CommunicatorError {
    match err.kind() {
        ErrorKind::NotFound => CommunicatorError::NotFound(path.to_string()),
        ErrorKind::PermissionDenied => CommunicatorError::PermissionDenied(path.to_string()),
        _ => CommunicatorError::Io(err),
    }
}

fn meta_from(md: &std::fs::Metadata) -> FileMeta {
    let mtime = md
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .and_then(|d| u32::try_from(d.as_secs()).ok());

    FileMeta {
        size: md.len(),
        mode: md.permissions().mode() & 0o7777,
        is_dir: md.is_dir(),
        mtime,
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    async fn start(&self, cmd: RemoteCmd) -> Result<u32, CommunicatorError> {
        let RemoteCmd {
            command,
            stdin,
            mut stdout,
            mut stderr,
        } = cmd;

        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(&command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            process.current_dir(dir);
        }

        let mut child = process
            .spawn()
            .map_err(|e| CommunicatorError::StartFailed(format!("{}: {}", command, e)))?;
        debug!("[local] started '{}' (pid {:?})", command, child.id());

        let child_stdin = child.stdin.take();
        let mut child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| CommunicatorError::StartFailed("stdout not captured".into()))?;
        let mut child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| CommunicatorError::StartFailed("stderr not captured".into()))?;

        let feed_stdin = async move {
            if let (Some(mut source), Some(mut sink)) = (stdin, child_stdin) {
                let _ = tokio::io::copy(&mut source, &mut sink).await;
                let _ = sink.shutdown().await;
            }
        };
        let pump_stdout = async {
            let r = tokio::io::copy(&mut child_stdout, &mut stdout).await;
            let _ = stdout.flush().await;
            r
        };
        let pump_stderr = async {
            let r = tokio::io::copy(&mut child_stderr, &mut stderr).await;
            let _ = stderr.flush().await;
            r
        };

        // stdin may never reach EOF; the feeder is dropped once the process exits.
        let feeder = tokio::spawn(feed_stdin);
        let (out, err) = tokio::join!(pump_stdout, pump_stderr);
        if let Err(e) = out.and(err) {
            debug!("[local] output stream of '{}' closed early: {}", command, e);
        }
        drop(child_stdout);
        drop(child_stderr);

        let status = child.wait().await;
        feeder.abort();
        let status = status?;
        // Signals have no exit code; report them the way a shell would.
        let code = match status.code() {
            Some(code) => code as u32,
            None => {
                use std::os::unix::process::ExitStatusExt;
                128 + status.signal().unwrap_or(0) as u32
            }
        };
        Ok(code)
    }

    async fn upload(
        &self,
        path: &str,
        mut source: ByteSource,
        meta: Option<FileMeta>,
    ) -> Result<(), CommunicatorError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }

        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| map_io(path, e))?;
        tokio::io::copy(&mut source, &mut file)
            .await
            .map_err(|e| CommunicatorError::Transfer(format!("{}: {}", path, e)))?;
        file.flush().await?;

        if let Some(meta) = meta {
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(meta.mode))
                .await
                .map_err(|e| map_io(path, e))?;
        }
        Ok(())
    }

    async fn download(&self, path: &str, mut sink: ByteSink) -> Result<(), CommunicatorError> {
        let mut file = tokio::fs::File::open(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))?;
        tokio::io::copy(&mut file, &mut sink)
            .await
            .map_err(|e| CommunicatorError::Transfer(format!("{}: {}", path, e)))?;
        sink.flush().await?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Option<FileMeta>, CommunicatorError> {
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(md) => Ok(Some(meta_from(&md))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(path, e)),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, CommunicatorError> {
        let mut dir = tokio::fs::read_dir(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let md = entry.metadata().await?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                meta: meta_from(&md),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn mkdir(&self, path: &str) -> Result<(), CommunicatorError> {
        tokio::fs::create_dir(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn rmdir(&self, path: &str) -> Result<(), CommunicatorError> {
        tokio::fs::remove_dir(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn remove(&self, path: &str) -> Result<(), CommunicatorError> {
        tokio::fs::remove_file(self.resolve(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), CommunicatorError> {
        tokio::fs::rename(self.resolve(from), self.resolve(to))
            .await
            .map_err(|e| map_io(from, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::run_captured;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_reports_exit_status_and_output() {
        let comm = LocalCommunicator::new();
        let out = run_captured(&comm, "echo hi; echo oops >&2; exit 3".to_string())
            .await
            .unwrap();

        assert_eq!(out.status, 3);
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_upload_download_and_stat() {
        let dir = TempDir::new().unwrap();
        let comm = LocalCommunicator::with_workdir(dir.path());

        comm.upload(
            "nested/file.txt",
            Box::pin(&b"content"[..]),
            Some(FileMeta::file(7, 0o600)),
        )
        .await
        .unwrap();

        let meta = comm.stat("nested/file.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 7);
        assert_eq!(meta.mode, 0o600);
        assert!(!meta.is_dir);
        assert!(comm.stat("missing").await.unwrap().is_none());

        let (w, mut r) = tokio::io::duplex(1024);
        comm.download("nested/file.txt", Box::pin(w)).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut r, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"content");

        let entries = comm.read_dir("nested").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "file.txt");
    }

    #[tokio::test]
    async fn test_missing_download_is_not_found() {
        let dir = TempDir::new().unwrap();
        let comm = LocalCommunicator::with_workdir(dir.path());
        let err = comm
            .download("nope", Box::pin(tokio::io::sink()))
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicatorError::NotFound(_)));
    }
}
