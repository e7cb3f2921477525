//! SFTP helper strategy
//!
//! Instead of translating packets, a real SFTP server speaks to the client
//! over the channel. It runs either on the target, started through the
//! backend, or as a local process.

use std::borrow::Cow;
use std::sync::Arc;

use russh::server::Msg;
use russh::Channel;
use tracing::info;

use crate::adapter::AdapterContext;
use crate::bridge::exec::splice;
use crate::communicator::{Communicator, LocalCommunicator};
use crate::observer::Event;

/// Run the helper `command` on the target
pub async fn run_remote(ctx: &AdapterContext, channel: Channel<Msg>, command: &str) {
    run(ctx, channel, ctx.communicator.clone(), command.to_string()).await;
}

/// Run `program` locally with `args`
pub async fn run_local(ctx: &AdapterContext, channel: Channel<Msg>, program: &str, args: &[String]) {
    let command = local_command(program, args);
    let local: Arc<dyn Communicator> = Arc::new(LocalCommunicator::new());
    run(ctx, channel, local, command).await;
}

async fn run(
    ctx: &AdapterContext,
    channel: Channel<Msg>,
    communicator: Arc<dyn Communicator>,
    command: String,
) {
    info!("[sftp] starting helper: {}", command);
    match splice(channel, communicator, command.clone()).await {
        Ok(0) => {}
        Ok(status) => ctx.observer.report(&Event::HelperFailed {
            command,
            error: format!("exited with status {}", status),
        }),
        Err(e) => ctx.observer.report(&Event::HelperFailed {
            command,
            error: e.to_string(),
        }),
    }
}

/// Shell command line for a local helper
fn local_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(|part| shell_escape::unix::escape(Cow::Borrowed(part)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_command_quotes_arguments() {
        assert_eq!(
            local_command("/usr/lib/openssh/sftp-server", &["-l".into(), "DEBUG 3".into()]),
            "/usr/lib/openssh/sftp-server -l 'DEBUG 3'"
        );
        assert_eq!(local_command("sftp-server", &[]), "sftp-server");
    }
}
