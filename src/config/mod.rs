//! Configuration Management Module
//!
//! JSON-backed provisioner settings and their validation.

pub mod types;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use types::{
    AdapterConfig, ProvisionerConfig, SftpStrategy, DEFAULT_PORT, DEFAULT_RUNNER_COMMAND,
    DEFAULT_SFTP_COMMAND, DEFAULT_USER, PORT_PROBE_ATTEMPTS,
};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{0} must be specified")]
    Missing(&'static str),

    #[error("{field}: {path} is invalid: {reason}")]
    InvalidFile {
        field: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("{0}")]
    Multiple(String),
}

impl ProvisionerConfig {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check the settings, collecting every problem
    ///
    /// The playbook must be an existing file. Key files are optional, but
    /// once either is given both must be existing files.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if let Err(e) = validate_file(&self.playbook_file, "playbook_file") {
            errors.push(e);
        }

        let authorized = self.adapter.ssh_authorized_key_file.as_deref();
        let host = self.adapter.ssh_host_key_file.as_deref();
        if authorized.is_some() || host.is_some() {
            let checks = [
                (authorized, "ssh_authorized_key_file"),
                (host, "ssh_host_key_file"),
            ];
            for (path, field) in checks {
                match path {
                    Some(path) => {
                        if let Err(e) = validate_file(path, field) {
                            errors.push(e);
                        }
                    }
                    None => errors.push(ConfigError::Missing(field)),
                }
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }
}

fn validate_file(path: &Path, field: &'static str) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::Missing(field));
    }
    let md = std::fs::metadata(path).map_err(|e| ConfigError::InvalidFile {
        field,
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if md.is_dir() {
        return Err(ConfigError::InvalidFile {
            field,
            path: path.to_path_buf(),
            reason: "must point to a file".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn test_validate_requires_playbook() {
        let config = ProvisionerConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("playbook_file")));
    }

    #[test]
    fn test_validate_playbook_must_be_file() {
        let dir = TempDir::new().unwrap();
        let config = ProvisionerConfig {
            playbook_file: dir.path().to_path_buf(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must point to a file"));
    }

    #[test]
    fn test_validate_key_files_come_in_pairs() {
        let dir = TempDir::new().unwrap();
        let mut config = ProvisionerConfig {
            playbook_file: touch(&dir, "site.yml"),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.adapter.ssh_authorized_key_file = Some(touch(&dir, "id.pub"));
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("ssh_host_key_file")));

        config.adapter.ssh_host_key_file = Some(touch(&dir, "host"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = ProvisionerConfig {
            playbook_file: PathBuf::from("/nonexistent/site.yml"),
            adapter: AdapterConfig {
                ssh_host_key_file: Some(PathBuf::from("/nonexistent/host")),
                ..Default::default()
            },
            ..Default::default()
        };
        match config.validate().unwrap_err() {
            ConfigError::Multiple(msg) => {
                assert!(msg.contains("playbook_file"));
                assert!(msg.contains("ssh_authorized_key_file"));
                assert!(msg.contains("ssh_host_key_file"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"playbook_file":"site.yml","user":"deploy"}"#).unwrap();

        let config = ProvisionerConfig::load(&path).unwrap();
        assert_eq!(config.adapter.user, "deploy");
        assert_eq!(config.playbook_file, PathBuf::from("site.yml"));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ProvisionerConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
