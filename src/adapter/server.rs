//! Adapter lifecycle: bind, serve, shutdown

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::auth::{Authenticator, SingleKeyAuthenticator};
use super::handler::{publickey_only, ConnectionHandler};
use super::listener::bind_loopback;
use super::registry::{ConnectionInfo, ConnectionRegistry};
use super::{AdapterContext, AdapterError};
use crate::communicator::Communicator;
use crate::config::AdapterConfig;
use crate::identity::Identity;
use crate::observer::{Event, Observer, TracingObserver};

/// Adapter under construction
pub struct Adapter {
    config: AdapterConfig,
    host_key: PrivateKey,
    communicator: Arc<dyn Communicator>,
    observer: Arc<dyn Observer>,
    authenticator: Arc<dyn Authenticator>,
}

impl Adapter {
    /// Adapter accepting `config.user` with the identity's authorized key
    pub fn new(
        config: AdapterConfig,
        identity: &Identity,
        communicator: Arc<dyn Communicator>,
    ) -> Self {
        let authenticator = Arc::new(SingleKeyAuthenticator::new(
            config.user.clone(),
            identity.authorized_key().clone(),
        ));
        Self {
            config,
            host_key: identity.host_key().clone(),
            communicator,
            observer: Arc::new(TracingObserver),
            authenticator,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    fn russh_config(&self) -> russh::server::Config {
        let inactivity = self.config.inactivity_timeout_secs;
        russh::server::Config {
            methods: publickey_only(),
            keys: vec![self.host_key.clone()],
            auth_rejection_time: Duration::from_millis(self.config.auth_rejection_ms),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: (inactivity > 0).then(|| Duration::from_secs(inactivity)),
            ..Default::default()
        }
    }

    /// Bind the loopback listener
    pub async fn bind(self) -> Result<BoundAdapter, AdapterError> {
        let (listener, port) =
            bind_loopback(self.config.preferred_port(), self.observer.as_ref()).await?;
        self.observer.report(&Event::Listening { port });

        let russh_config = Arc::new(self.russh_config());
        let handle = AdapterHandle {
            shutdown: CancellationToken::new(),
            fired: Arc::new(AtomicBool::new(false)),
            tracker: TaskTracker::new(),
            registry: Arc::new(ConnectionRegistry::new()),
            observer: self.observer.clone(),
        };
        let ctx = Arc::new(AdapterContext {
            config: self.config,
            communicator: self.communicator,
            observer: self.observer,
            authenticator: self.authenticator,
        });

        Ok(BoundAdapter {
            ctx,
            russh_config,
            listener,
            port,
            handle,
        })
    }

    /// Bind and serve in a background task
    pub async fn start(self) -> Result<RunningAdapter, AdapterError> {
        Ok(self.bind().await?.spawn())
    }
}

/// Adapter with a bound listener, not yet serving
pub struct BoundAdapter {
    ctx: Arc<AdapterContext>,
    russh_config: Arc<russh::server::Config>,
    listener: TcpListener,
    port: u16,
    handle: AdapterHandle,
}

impl BoundAdapter {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handle(&self) -> AdapterHandle {
        self.handle.clone()
    }

    /// Accept connections until shutdown or a listener error
    pub async fn serve(self) -> Result<(), AdapterError> {
        let BoundAdapter {
            ctx,
            russh_config,
            listener,
            port,
            handle,
        } = self;
        info!("[adapter] serving on 127.0.0.1:{}", port);

        let result = loop {
            tokio::select! {
                biased;
                _ = handle.shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let local = stream
                            .local_addr()
                            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], port)));
                        let ctx = ctx.clone();
                        let config = russh_config.clone();
                        let conn = handle.clone();
                        handle.tracker.spawn(async move {
                            conn.run_connection(ctx, config, stream, remote, local).await;
                        });
                    }
                    Err(_) if handle.is_shut_down() => break Ok(()),
                    Err(e) => break Err(AdapterError::Io(e)),
                }
            }
        };

        drop(listener);
        handle.tracker.close();
        debug!("[adapter] listener on port {} closed", port);
        result
    }

    /// Serve in a background task
    pub fn spawn(self) -> RunningAdapter {
        let port = self.port;
        let handle = self.handle();
        let task = tokio::spawn(self.serve());
        RunningAdapter { port, handle, task }
    }
}

/// Control handle shared with whoever needs to stop the adapter
#[derive(Clone)]
pub struct AdapterHandle {
    shutdown: CancellationToken,
    fired: Arc<AtomicBool>,
    tracker: TaskTracker,
    registry: Arc<ConnectionRegistry>,
    observer: Arc<dyn Observer>,
}

impl AdapterHandle {
    /// Stop accepting connections; in-flight sessions keep running
    ///
    /// Safe to call any number of times.
    pub fn shutdown(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.observer.report(&Event::ShuttingDown);
        self.shutdown.cancel();
    }

    /// Shut down and forcibly disconnect every live connection
    pub fn terminate(&self) {
        self.shutdown();
        self.registry.disconnect_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Live connections
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.list()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    /// A live connection by id
    pub fn connection(&self, id: &str) -> Option<ConnectionInfo> {
        self.registry.get(id)
    }

    /// Wait for every connection, exec and helper task to finish
    ///
    /// Only returns after shutdown has fired. Native SFTP sessions run on
    /// their own task and end when their connection does.
    pub async fn wait_drained(&self) {
        self.shutdown.cancelled().await;
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn run_connection(
        &self,
        ctx: Arc<AdapterContext>,
        config: Arc<russh::server::Config>,
        stream: TcpStream,
        remote: SocketAddr,
        local: SocketAddr,
    ) {
        let id = self.registry.register(remote);
        let handler = ConnectionHandler::new(
            ctx.clone(),
            self.registry.clone(),
            self.tracker.clone(),
            id.clone(),
            remote,
            local,
        );

        let outcome = match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => {
                self.registry.attach(&id, session.handle());
                session.await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            if !e.is_disconnect() && !self.is_shut_down() {
                ctx.observer.report(&Event::ConnectionFailed {
                    remote,
                    error: e.to_string(),
                });
            }
        }
        self.registry.unregister(&id);
    }
}

/// Adapter serving in a background task
pub struct RunningAdapter {
    port: u16,
    handle: AdapterHandle,
    task: JoinHandle<Result<(), AdapterError>>,
}

impl RunningAdapter {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handle(&self) -> AdapterHandle {
        self.handle.clone()
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    pub fn terminate(&self) {
        self.handle.terminate();
    }

    /// Wait for the accept loop to end
    pub async fn join(self) -> Result<(), AdapterError> {
        self.task
            .await
            .map_err(|e| AdapterError::Task(e.to_string()))?
    }
}
