//! Per-connection SSH handler: authentication and channel routing

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::registry::ConnectionRegistry;
use super::{AdapterContext, AdapterError};
use crate::observer::Event;
use crate::{bridge, sftp};

/// Only public-key authentication is offered
pub(crate) fn publickey_only() -> MethodSet {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::PublicKey);
    methods
}

pub(crate) struct ConnectionHandler {
    ctx: Arc<AdapterContext>,
    registry: Arc<ConnectionRegistry>,
    tracker: TaskTracker,
    conn_id: String,
    remote: SocketAddr,
    local: SocketAddr,
    /// Opened session channels not yet claimed by a request
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        ctx: Arc<AdapterContext>,
        registry: Arc<ConnectionRegistry>,
        tracker: TaskTracker,
        conn_id: String,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Self {
        Self {
            ctx,
            registry,
            tracker,
            conn_id,
            remote,
            local,
            channels: HashMap::new(),
        }
    }

    fn report_auth(&self, method: &'static str, user: &str, accepted: bool) {
        self.ctx.observer.report(&Event::AuthAttempt {
            method,
            remote: self.remote,
            local: self.local,
            user: user.to_string(),
            accepted,
        });
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(publickey_only()),
            partial_success: false,
        }
    }

    fn refuse(&self, channel: ChannelId, request: &str, session: &mut Session) -> Result<(), AdapterError> {
        debug!("[adapter] refusing {} on channel {:?}", request, channel);
        session.channel_failure(channel)?;
        Ok(())
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = AdapterError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.report_auth("none", user, false);
        Ok(Self::reject())
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        self.report_auth("password", user, false);
        Ok(Self::reject())
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.ctx.authenticator.check(user, public_key) {
            // Reported once the signature has been verified.
            return Ok(Auth::Accept);
        }
        self.report_auth("publickey", user, false);
        Ok(Self::reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let accepted = self.ctx.authenticator.check(user, public_key);
        self.report_auth("publickey", user, accepted);
        if !accepted {
            return Ok(Self::reject());
        }
        self.registry.authenticated(&self.conn_id, user);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("[adapter] session channel opened: {:?}", channel.id());
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // The command goes to the backend byte for byte.
        let Ok(command) = std::str::from_utf8(data) else {
            warn!("[adapter] exec on channel {:?} is not valid UTF-8", channel);
            return self.refuse(channel, "exec", session);
        };
        let Some(claimed) = self.channels.remove(&channel) else {
            return self.refuse(channel, "exec", session);
        };

        let command = command.to_string();
        debug!("[adapter] exec on channel {:?}: {}", channel, command);
        session.channel_success(channel)?;

        let ctx = self.ctx.clone();
        self.tracker.spawn(async move {
            bridge::exec::run(ctx, claimed, command).await;
        });
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            return self.refuse(channel, name, session);
        }
        let Some(claimed) = self.channels.remove(&channel) else {
            return self.refuse(channel, name, session);
        };

        debug!("[adapter] sftp subsystem on channel {:?}", channel);
        session.channel_success(channel)?;

        let ctx = self.ctx.clone();
        self.tracker.spawn(async move {
            sftp::serve(ctx, claimed).await;
        });
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, "pty-req", session)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, "shell", session)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, "env", session)
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, "x11-req", session)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("[adapter] channel closed: {:?}", channel);
        self.channels.remove(&channel);
        Ok(())
    }
}
