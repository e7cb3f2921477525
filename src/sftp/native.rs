//! Native SFTP translation
//!
//! Answers SFTP v3 requests by calling the backend directly. Uploads are
//! streamed: OPEN starts a backend upload fed through an in-memory pipe, each
//! WRITE appends to it and CLOSE waits for the backend to finish. Downloads
//! are fetched whole at OPEN and served from memory.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::error::SftpError;
use super::path::normalize;
use crate::communicator::{Communicator, CommunicatorError, DirEntry, FileMeta};
use crate::observer::{Event, Observer};

/// Pipe capacity between WRITE packets and the backend upload
const UPLOAD_BUFFER: usize = 256 * 1024;

/// Pipe capacity used while fetching a download
const DOWNLOAD_BUFFER: usize = 256 * 1024;

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// Upload in progress
struct Upload {
    path: String,
    writer: Option<DuplexStream>,
    written: u64,
    task: Option<JoinHandle<Result<(), CommunicatorError>>>,
}

impl Upload {
    /// Close the pipe and wait for the backend to store the file
    async fn finish(&mut self) -> Result<(), CommunicatorError> {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        match self.task.take() {
            Some(task) => task.await.map_err(|e| {
                CommunicatorError::Transfer(format!("upload task failed: {}", e))
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        // Abort first so an abandoned upload is never completed with
        // truncated content.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum OpenHandle {
    Upload(Upload),
    Download { path: String, content: Bytes },
    Dir { path: String, entries: Option<Vec<DirEntry>> },
}

/// `russh_sftp` handler backed by a [`Communicator`]
pub struct NativeSftp {
    communicator: Arc<dyn Communicator>,
    observer: Arc<dyn Observer>,
    next_handle: u64,
    handles: HashMap<String, OpenHandle>,
}

impl NativeSftp {
    pub fn new(communicator: Arc<dyn Communicator>, observer: Arc<dyn Observer>) -> Self {
        Self {
            communicator,
            observer,
            next_handle: 0,
            handles: HashMap::new(),
        }
    }

    /// Handles are never reused within a session
    fn insert(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let id = self.next_handle.to_string();
        self.handles.insert(id.clone(), handle);
        id
    }

    /// Convert a backend error, reporting it unless the operation is merely unsupported
    fn backend_error(&self, operation: &'static str, path: &str, err: CommunicatorError) -> SftpError {
        if !err.is_unsupported() {
            self.observer.report(&Event::SftpFailed {
                operation,
                path: path.to_string(),
                error: err.to_string(),
            });
        }
        err.into()
    }

    async fn begin_upload(&mut self, path: String, attrs: &FileAttributes) -> String {
        let (writer, reader) = tokio::io::duplex(UPLOAD_BUFFER);
        let meta = attrs
            .permissions
            .map(|mode| FileMeta::file(attrs.size.unwrap_or(0), mode & 0o7777));

        let communicator = self.communicator.clone();
        let target = path.clone();
        let task = tokio::spawn(async move {
            communicator.upload(&target, Box::pin(reader), meta).await
        });

        debug!("[sftp] upload started: {}", path);
        self.insert(OpenHandle::Upload(Upload {
            path,
            writer: Some(writer),
            written: 0,
            task: Some(task),
        }))
    }

    async fn fetch(&self, path: &str) -> Result<Bytes, SftpError> {
        let (writer, mut reader) = tokio::io::duplex(DOWNLOAD_BUFFER);
        let download = self.communicator.download(path, Box::pin(writer));
        let collect = async move {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.map(|_| buf)
        };

        let (result, content) = tokio::join!(download, collect);
        result.map_err(|e| self.backend_error("download", path, e))?;
        Ok(Bytes::from(content?))
    }

    async fn stat_path(&self, path: &str) -> Result<FileAttributes, SftpError> {
        match self.communicator.stat(path).await {
            Ok(Some(meta)) => Ok(attributes(&meta)),
            Ok(None) => Err(SftpError::FileNotFound(path.to_string())),
            Err(e) if e.is_unsupported() => Ok(synthesize(path)),
            Err(e) => Err(self.backend_error("stat", path, e)),
        }
    }
}

fn attributes(meta: &FileMeta) -> FileAttributes {
    let kind = if meta.is_dir { S_IFDIR } else { S_IFREG };
    FileAttributes {
        size: Some(meta.size),
        permissions: Some(kind | (meta.mode & 0o7777)),
        atime: meta.mtime,
        mtime: meta.mtime,
        ..Default::default()
    }
}

/// Plausible attributes for backends that cannot stat
fn synthesize(path: &str) -> FileAttributes {
    let normalized = normalize(path);
    let is_dir = path.ends_with('/')
        || normalized == "/"
        || normalized == "."
        || normalized.ends_with("/..")
        || normalized == "..";
    if is_dir {
        attributes(&FileMeta::dir(0o755))
    } else {
        attributes(&FileMeta::file(0, 0o644))
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

impl russh_sftp::server::Handler for NativeSftp {
    type Error = SftpError;

    fn unimplemented(&self) -> Self::Error {
        SftpError::Unsupported("request")
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!("[sftp] client version {}", version);
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        if pflags.contains(OpenFlags::APPEND) {
            return Err(SftpError::Unsupported("append"));
        }

        let handle = if pflags.intersects(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE)
        {
            self.begin_upload(filename, &attrs).await
        } else {
            let content = self.fetch(&filename).await?;
            debug!("[sftp] downloaded {} ({} bytes)", filename, content.len());
            self.insert(OpenHandle::Download {
                path: filename,
                content,
            })
        };
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        let open = self
            .handles
            .remove(&handle)
            .ok_or_else(|| SftpError::UnknownHandle(handle.clone()))?;

        if let OpenHandle::Upload(mut upload) = open {
            upload
                .finish()
                .await
                .map_err(|e| self.backend_error("upload", &upload.path, e))?;
            info!("[sftp] uploaded {} ({} bytes)", upload.path, upload.written);
        }
        Ok(ok_status(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let content = match self.handles.get(&handle) {
            Some(OpenHandle::Download { path, content }) => {
                debug!("[sftp] read {} at {} ({} bytes)", path, offset, len);
                content
            }
            Some(_) => {
                return Err(SftpError::ProtocolError(format!(
                    "handle {} is not open for reading",
                    handle
                )))
            }
            None => return Err(SftpError::UnknownHandle(handle)),
        };

        let total = content.len() as u64;
        if offset >= total {
            return Err(SftpError::Eof);
        }
        let start = offset as usize;
        let end = offset.saturating_add(len as u64).min(total) as usize;
        Ok(Data {
            id,
            data: content.slice(start..end).to_vec(),
        })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let upload = match self.handles.get_mut(&handle) {
            Some(OpenHandle::Upload(upload)) => upload,
            Some(_) => {
                return Err(SftpError::ProtocolError(format!(
                    "handle {} is not open for writing",
                    handle
                )))
            }
            None => return Err(SftpError::UnknownHandle(handle)),
        };

        if offset != upload.written {
            return Err(SftpError::ProtocolError(format!(
                "write at offset {} but {} bytes written to {}",
                offset, upload.written, upload.path
            )));
        }

        let written = match upload.writer.as_mut() {
            Some(writer) => writer.write_all(&data).await,
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        };
        if written.is_ok() {
            upload.written += data.len() as u64;
            return Ok(ok_status(id));
        }

        // The backend stopped reading; surface its own error.
        let Some(OpenHandle::Upload(mut upload)) = self.handles.remove(&handle) else {
            return Err(SftpError::UnknownHandle(handle));
        };
        let err = match upload.finish().await {
            Err(e) => e,
            Ok(()) => CommunicatorError::Transfer("upload ended early".to_string()),
        };
        Err(self.backend_error("upload", &upload.path, err))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = self.stat_path(&path).await?;
        Ok(Attrs { id, attrs })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = self.stat_path(&path).await?;
        Ok(Attrs { id, attrs })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let attrs = match self.handles.get(&handle) {
            Some(OpenHandle::Upload(upload)) => attributes(&FileMeta::file(upload.written, 0o644)),
            Some(OpenHandle::Download { content, .. }) => {
                attributes(&FileMeta::file(content.len() as u64, 0o644))
            }
            Some(OpenHandle::Dir { .. }) => attributes(&FileMeta::dir(0o755)),
            None => return Err(SftpError::UnknownHandle(handle)),
        };
        Ok(Attrs { id, attrs })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let entries = self
            .communicator
            .read_dir(&path)
            .await
            .map_err(|e| self.backend_error("read_dir", &path, e))?;
        let handle = self.insert(OpenHandle::Dir {
            path,
            entries: Some(entries),
        });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let (path, entries) = match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir { path, entries }) => (path, entries),
            Some(_) => {
                return Err(SftpError::ProtocolError(format!(
                    "handle {} is not a directory",
                    handle
                )))
            }
            None => return Err(SftpError::UnknownHandle(handle)),
        };

        match entries.take() {
            Some(entries) if !entries.is_empty() => {
                debug!("[sftp] listing {} ({} entries)", path, entries.len());
                let files = entries
                    .iter()
                    .map(|entry| File::new(entry.name.clone(), attributes(&entry.meta)))
                    .collect();
                Ok(Name { id, files })
            }
            _ => Err(SftpError::Eof),
        }
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.communicator
            .remove(&filename)
            .await
            .map_err(|e| self.backend_error("remove", &filename, e))?;
        Ok(ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.communicator
            .mkdir(&path)
            .await
            .map_err(|e| self.backend_error("mkdir", &path, e))?;
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.communicator
            .rmdir(&path)
            .await
            .map_err(|e| self.backend_error("rmdir", &path, e))?;
        Ok(ok_status(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::dummy(normalize(&path))],
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.communicator
            .rename(&oldpath, &newpath)
            .await
            .map_err(|e| self.backend_error("rename", &oldpath, e))?;
        Ok(ok_status(id))
    }
}
