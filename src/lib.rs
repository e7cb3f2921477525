//! comm-adapter
//!
//! A loopback SSH server that lets an SSH-only command-runner drive a target
//! whose real control channel is an abstract [`Communicator`]. Exec requests
//! become backend command invocations; the `sftp` subsystem becomes backend
//! uploads, downloads and directory operations.
//!
//! ```text
//! ┌──────────────┐   SSH / SFTP    ┌──────────────┐   start/upload/   ┌──────────┐
//! │ command      │ ──────────────▸ │   Adapter    │ ────download────▸ │  Target  │
//! │ runner       │ ◂────────────── │ (127.0.0.1)  │ ◂──────────────── │          │
//! └──────────────┘                 └──────────────┘                    └──────────┘
//! ```

pub mod adapter;
pub mod bridge;
pub mod communicator;
pub mod config;
pub mod identity;
pub mod observer;
pub mod provisioner;
pub mod runner;
pub mod sftp;

pub use adapter::{Adapter, AdapterContext, AdapterError, AdapterHandle, RunningAdapter};
pub use communicator::{Communicator, CommunicatorError, RemoteCmd};
pub use config::{AdapterConfig, ProvisionerConfig, SftpStrategy};
pub use identity::Identity;
pub use observer::{Event, Observer, TracingObserver};
pub use provisioner::Provisioner;
