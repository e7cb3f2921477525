//! Channel bridges
//!
//! Per-channel tasks that connect an accepted SSH request to the backend.
//! The SFTP bridge lives in [`crate::sftp`].

pub mod exec;
