//! Exec bridge - splices an SSH session channel onto a backend command
//!
//! Channel data feeds the command's stdin, stdout goes back as channel data
//! and stderr as extended data (type 1). The backend's exit status is sent
//! before EOF and close; a backend failure closes the channel without one.

use std::sync::Arc;

use russh::server::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tracing::{debug, warn};

use crate::adapter::AdapterContext;
use crate::communicator::{Communicator, CommunicatorError, RemoteCmd};
use crate::observer::Event;

/// Pipe capacity between channel data and the command's stdin
const STDIN_BUFFER: usize = 64 * 1024;

/// SSH extended data type for stderr
const EXTENDED_DATA_STDERR: u32 = 1;

/// Run an exec request to completion and report the outcome
pub async fn run(ctx: Arc<AdapterContext>, channel: Channel<Msg>, command: String) {
    match splice(channel, ctx.communicator.clone(), command.clone()).await {
        Ok(status) => {
            ctx.observer
                .report(&Event::ExecFinished { command, status });
        }
        Err(e) => {
            ctx.observer.report(&Event::ExecFailed {
                command,
                error: e.to_string(),
            });
        }
    }
}

/// Run `command` through `communicator` with its streams wired to `channel`
///
/// Returns once the backend has reported completion, even if the client went
/// away earlier.
pub async fn splice(
    mut channel: Channel<Msg>,
    communicator: Arc<dyn Communicator>,
    command: String,
) -> Result<u32, CommunicatorError> {
    let (stdin_w, stdin_r) = tokio::io::duplex(STDIN_BUFFER);
    let cmd = RemoteCmd::new(command.clone())
        .with_stdin(Box::pin(stdin_r))
        .with_stdout(Box::pin(channel.make_writer()))
        .with_stderr(Box::pin(channel.make_writer_ext(Some(EXTENDED_DATA_STDERR))));

    let mut backend = tokio::spawn(async move { communicator.start(cmd).await });
    let mut stdin: Option<DuplexStream> = Some(stdin_w);
    let mut client_open = true;

    let joined = loop {
        tokio::select! {
            joined = &mut backend => break joined,
            msg = channel.wait(), if client_open => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Some(writer) = stdin.as_mut() {
                        if writer.write_all(&data).await.is_err() {
                            // The command stopped reading its input.
                            stdin = None;
                        }
                    }
                }
                Some(ChannelMsg::Eof) => {
                    if let Some(mut writer) = stdin.take() {
                        let _ = writer.shutdown().await;
                    }
                }
                Some(ChannelMsg::Close) | None => {
                    debug!("[exec] client closed the channel early: {}", command);
                    client_open = false;
                    stdin = None;
                }
                Some(_) => {}
            }
        }
    };
    drop(stdin);

    let result = joined
        .map_err(|e| CommunicatorError::StartFailed(format!("backend task failed: {}", e)))
        .and_then(|r| r);

    match &result {
        Ok(status) => {
            debug!("[exec] '{}' exited with {}", command, status);
            if client_open {
                let _ = channel.exit_status(*status).await;
            }
        }
        Err(e) => warn!("[exec] '{}' failed: {}", command, e),
    }
    if client_open {
        let _ = channel.eof().await;
        let _ = channel.close().await;
    }
    result
}
