//! SFTP bridge
//!
//! Serves the `sftp` subsystem of a session channel with the strategy chosen
//! in [`SftpStrategy`]: native translation onto the backend, or a helper SFTP
//! server wired straight to the channel.

pub mod error;
pub mod helper;
pub mod native;
pub mod path;

use std::sync::Arc;

use russh::server::Msg;
use russh::Channel;
use tracing::debug;

use crate::adapter::AdapterContext;
use crate::config::SftpStrategy;

pub use error::SftpError;
pub use native::NativeSftp;

/// Serve the subsystem on `channel` until the client is done
pub async fn serve(ctx: Arc<AdapterContext>, channel: Channel<Msg>) {
    match &ctx.config.sftp {
        SftpStrategy::Native => {
            debug!("[sftp] native session on channel {:?}", channel.id());
            let handler = NativeSftp::new(ctx.communicator.clone(), ctx.observer.clone());
            russh_sftp::server::run(channel.into_stream(), handler).await;
        }
        SftpStrategy::RemoteHelper { command } => {
            helper::run_remote(&ctx, channel, command).await;
        }
        SftpStrategy::LocalHelper { program, args } => {
            helper::run_local(&ctx, channel, program, args).await;
        }
    }
}
