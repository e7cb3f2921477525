//! Provisioner
//!
//! Full flow: identity, adapter, inventory, command runner, teardown.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::{Adapter, AdapterError, AdapterHandle};
use crate::communicator::Communicator;
use crate::config::{ConfigError, ProvisionerConfig};
use crate::identity::{Identity, IdentityError};
use crate::observer::Observer;
use crate::runner::{self, Invocation, RunnerError};

/// Provisioning errors
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Identity(#[from] IdentityError),

    #[error("Error setting up SSH proxy connection: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Error executing command runner: {0}")]
    Runner(#[from] RunnerError),
}

/// Runs a playbook against a target reachable only through a [`Communicator`]
#[derive(Default)]
pub struct Provisioner {
    cancel: CancellationToken,
    adapter: Mutex<Option<AdapterHandle>>,
}

impl Provisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision the target behind `communicator`
    ///
    /// The adapter is shut down before returning, whatever the outcome.
    pub async fn provision(
        &self,
        config: &ProvisionerConfig,
        communicator: Arc<dyn Communicator>,
        observer: Arc<dyn Observer>,
    ) -> Result<(), ProvisionError> {
        config.validate()?;
        let adapter_config = config.adapter_config();
        let identity = Identity::from_config(&adapter_config)?;
        let user = adapter_config.user.clone();

        let running = Adapter::new(adapter_config, &identity, communicator)
            .with_observer(observer.clone())
            .start()
            .await?;
        *self.adapter.lock() = Some(running.handle());
        if self.cancel.is_cancelled() {
            running.shutdown();
        }

        let result = self
            .run_playbook(config, &identity, &user, running.port(), observer.as_ref())
            .await;

        running.shutdown();
        if let Err(e) = running.join().await {
            warn!("[provisioner] adapter ended with an error: {}", e);
        }
        self.adapter.lock().take();
        result
    }

    async fn run_playbook(
        &self,
        config: &ProvisionerConfig,
        identity: &Identity,
        user: &str,
        port: u16,
        observer: &dyn Observer,
    ) -> Result<(), ProvisionError> {
        // A generated inventory lives until the runner is done.
        let generated;
        let inventory = match &config.inventory_file {
            Some(path) => path.clone(),
            None => {
                generated = runner::write_inventory(user, port)?;
                generated.to_path_buf()
            }
        };

        let invocation = Invocation {
            command: config.command.clone(),
            playbook: config.playbook_file.clone(),
            inventory,
            private_key: identity.private_key_file().to_path_buf(),
            extra_arguments: config.extra_arguments.clone(),
        };
        invocation.run(observer, &self.cancel).await?;
        info!("[provisioner] playbook finished");
        Ok(())
    }

    /// Stop a running provision
    ///
    /// Kills the command runner and shuts the adapter down. Safe to call
    /// more than once and concurrently with the normal teardown.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.adapter.lock().as_ref() {
            handle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::testing::StubCommunicator;
    use crate::observer::MemoryObserver;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(dir: &TempDir, command: &str) -> ProvisionerConfig {
        let playbook = dir.path().join("site.yml");
        std::fs::write(&playbook, "- hosts: all\n").unwrap();
        ProvisionerConfig {
            command: command.to_string(),
            playbook_file: playbook,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_provision_runs_and_tears_down() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, "echo");
        config.adapter.local_port = free_port();
        let observer = Arc::new(MemoryObserver::new());

        Provisioner::new()
            .provision(&config, Arc::new(StubCommunicator::new()), observer.clone())
            .await
            .unwrap();

        assert!(observer.contains("SSH proxy listening on 127.0.0.1:"));
        assert!(observer.contains("--private-key"));
        assert!(observer.contains("shutting down the SSH proxy"));
    }

    #[tokio::test]
    async fn test_runner_failure_still_shuts_down() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, "false");
        config.adapter.local_port = free_port();
        let observer = Arc::new(MemoryObserver::new());

        let err = Provisioner::new()
            .provision(&config, Arc::new(StubCommunicator::new()), observer.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Runner(RunnerError::NonZeroExit(_))));
        assert!(observer.contains("shutting down the SSH proxy"));
    }

    #[tokio::test]
    async fn test_invalid_config_starts_nothing() {
        let config = ProvisionerConfig {
            playbook_file: PathBuf::from("/nonexistent/site.yml"),
            ..Default::default()
        };
        let observer = Arc::new(MemoryObserver::new());

        let err = Provisioner::new()
            .provision(&config, Arc::new(StubCommunicator::new()), observer.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Config(_)));
        assert!(observer.lines().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, "sleep");
        config.extra_arguments = vec!["30".to_string()];
        config.adapter.local_port = free_port();
        let observer = Arc::new(MemoryObserver::new());

        let provisioner = Provisioner::new();
        provisioner.cancel();
        provisioner.cancel();

        let err = provisioner
            .provision(&config, Arc::new(StubCommunicator::new()), observer.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Runner(RunnerError::Cancelled)));
        provisioner.cancel();
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }
}
