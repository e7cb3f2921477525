//! Loopback SSH adapter
//!
//! Listens on `127.0.0.1`, authenticates the single authorized client and
//! routes its session channels to the exec and SFTP bridges.

pub mod auth;
mod handler;
pub mod listener;
pub mod registry;
mod server;

use std::sync::Arc;

use thiserror::Error;

use crate::communicator::Communicator;
use crate::config::AdapterConfig;
use crate::identity::IdentityError;
use crate::observer::Observer;

pub use auth::{Authenticator, SingleKeyAuthenticator};
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use server::{Adapter, AdapterHandle, BoundAdapter, RunningAdapter};

/// Adapter errors
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("No port available on 127.0.0.1 between {first} and {last}")]
    NoPortAvailable { first: u16, last: u16 },

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Adapter task failed: {0}")]
    Task(String),
}

impl AdapterError {
    /// Plain end of a connection, not worth reporting
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            AdapterError::Ssh(russh::Error::Disconnect) | AdapterError::Ssh(russh::Error::HUP)
        )
    }
}

/// State shared by every connection and channel task
pub struct AdapterContext {
    pub config: AdapterConfig,
    pub communicator: Arc<dyn Communicator>,
    pub observer: Arc<dyn Observer>,
    pub authenticator: Arc<dyn Authenticator>,
}
