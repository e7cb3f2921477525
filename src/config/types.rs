//! Configuration Types
//!
//! Adapter settings and the provisioner settings that wrap them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Port tried first when none is configured
pub const DEFAULT_PORT: u16 = 2200;

/// How many consecutive higher ports are probed after the preferred one
pub const PORT_PROBE_ATTEMPTS: u16 = 10;

/// The only principal the adapter accepts
pub const DEFAULT_USER: &str = "packer-ansible";

/// Helper used when the helper strategy is selected without a command
pub const DEFAULT_SFTP_COMMAND: &str = "/usr/lib/sftp-server -e";

/// Command-runner executable used when none is configured
pub const DEFAULT_RUNNER_COMMAND: &str = "ansible-playbook";

/// How the `sftp` subsystem is served
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SftpStrategy {
    /// Translate SFTP packets into backend calls
    #[default]
    Native,
    /// Run an SFTP server on the target through the backend
    RemoteHelper {
        #[serde(default = "default_sftp_command")]
        command: String,
    },
    /// Run an SFTP server as a local process
    LocalHelper {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_sftp_command() -> String {
    DEFAULT_SFTP_COMMAND.to_string()
}

impl SftpStrategy {
    /// Helper strategy built from a legacy `sftp_command` string
    pub fn remote_helper(command: Option<&str>) -> Self {
        SftpStrategy::RemoteHelper {
            command: command
                .filter(|c| !c.trim().is_empty())
                .unwrap_or(DEFAULT_SFTP_COMMAND)
                .to_string(),
        }
    }
}

/// Settings consumed by the adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdapterConfig {
    /// Preferred local port (0 = [`DEFAULT_PORT`])
    pub local_port: u16,

    /// Principal name clients must authenticate as
    pub user: String,

    /// OpenSSH public key of the single authorized client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_authorized_key_file: Option<PathBuf>,

    /// OpenSSH private host key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_host_key_file: Option<PathBuf>,

    /// SFTP bridging strategy
    pub sftp: SftpStrategy,

    /// Delay before answering a rejected auth attempt, in milliseconds
    pub auth_rejection_ms: u64,

    /// Drop connections idle for this long (0 = never)
    pub inactivity_timeout_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            user: DEFAULT_USER.to_string(),
            ssh_authorized_key_file: None,
            ssh_host_key_file: None,
            sftp: SftpStrategy::Native,
            auth_rejection_ms: 0,
            inactivity_timeout_secs: 0,
        }
    }
}

impl AdapterConfig {
    /// Port the listener starts probing from
    pub fn preferred_port(&self) -> u16 {
        if self.local_port == 0 {
            DEFAULT_PORT
        } else {
            self.local_port
        }
    }
}

/// Full provisioner settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Command-runner executable
    pub command: String,

    /// Extra arguments appended to the runner invocation
    pub extra_arguments: Vec<String>,

    /// Playbook handed to the runner
    pub playbook_file: PathBuf,

    /// Use this inventory instead of generating one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_file: Option<PathBuf>,

    /// Legacy helper command; selects the remote helper strategy when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sftp_command: Option<String>,

    #[serde(flatten)]
    pub adapter: AdapterConfig,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_RUNNER_COMMAND.to_string(),
            extra_arguments: Vec::new(),
            playbook_file: PathBuf::new(),
            inventory_file: None,
            sftp_command: None,
            adapter: AdapterConfig::default(),
        }
    }
}

impl ProvisionerConfig {
    /// Adapter settings with the legacy `sftp_command` folded in
    pub fn adapter_config(&self) -> AdapterConfig {
        let mut adapter = self.adapter.clone();
        if self.sftp_command.is_some() && adapter.sftp == SftpStrategy::Native {
            adapter.sftp = SftpStrategy::remote_helper(self.sftp_command.as_deref());
        }
        adapter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdapterConfig::default();
        assert_eq!(config.preferred_port(), DEFAULT_PORT);
        assert_eq!(config.user, DEFAULT_USER);
        assert_eq!(config.sftp, SftpStrategy::Native);
    }

    #[test]
    fn test_strategy_deserialization() {
        let native: SftpStrategy = serde_json::from_str(r#"{"type":"native"}"#).unwrap();
        assert_eq!(native, SftpStrategy::Native);

        let remote: SftpStrategy = serde_json::from_str(r#"{"type":"remote_helper"}"#).unwrap();
        assert_eq!(remote, SftpStrategy::remote_helper(None));

        let local: SftpStrategy = serde_json::from_str(
            r#"{"type":"local_helper","program":"/usr/lib/openssh/sftp-server"}"#,
        )
        .unwrap();
        assert_eq!(
            local,
            SftpStrategy::LocalHelper {
                program: "/usr/lib/openssh/sftp-server".to_string(),
                args: vec![],
            }
        );
    }

    #[test]
    fn test_provisioner_config_flattens_adapter() {
        let config: ProvisionerConfig = serde_json::from_str(
            r#"{
                "playbook_file": "site.yml",
                "local_port": 2300,
                "sftp_command": "/usr/libexec/sftp-server"
            }"#,
        )
        .unwrap();

        assert_eq!(config.command, DEFAULT_RUNNER_COMMAND);
        assert_eq!(config.adapter.local_port, 2300);
        assert_eq!(
            config.adapter_config().sftp,
            SftpStrategy::RemoteHelper {
                command: "/usr/libexec/sftp-server".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_port_rejected() {
        let result: Result<ProvisionerConfig, _> =
            serde_json::from_str(r#"{"local_port": 70000}"#);
        assert!(result.is_err());
    }
}
