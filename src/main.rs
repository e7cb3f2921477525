//! Binary entry point for the comm-adapter CLI.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use comm_adapter::communicator::LocalCommunicator;
use comm_adapter::config::ConfigError;
use comm_adapter::identity::IdentityError;
use comm_adapter::provisioner::ProvisionError;
use comm_adapter::{
    Adapter, AdapterConfig, AdapterError, Communicator, Identity, Provisioner, ProvisionerConfig,
    SftpStrategy, TracingObserver,
};

#[derive(Debug, Parser)]
#[command(
    name = "comm-adapter",
    about = "Loopback SSH/SFTP endpoint that drives commands and file transfers through a backend",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the local machine over a loopback SSH endpoint until Ctrl-C
    Serve(ServeArgs),
    /// Run a playbook through the adapter, as described by a JSON config
    Provision(ProvisionArgs),
}

#[derive(Debug, clap::Args)]
struct ServeArgs {
    /// Preferred port; the next free one above it is used when taken
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Login name clients must use
    #[arg(long, env = "COMM_ADAPTER_USER")]
    user: Option<String>,

    /// Authorized client public key (OpenSSH format)
    #[arg(long, requires = "host_key")]
    authorized_key: Option<PathBuf>,

    /// Host private key (OpenSSH format)
    #[arg(long, requires = "authorized_key")]
    host_key: Option<PathBuf>,

    /// How the sftp subsystem is served
    #[arg(long, value_enum, default_value_t = SftpMode::Native)]
    sftp: SftpMode,

    /// SFTP server command for the helper modes
    #[arg(long)]
    sftp_command: Option<String>,

    /// Working directory for commands and relative paths
    #[arg(long)]
    workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SftpMode {
    Native,
    RemoteHelper,
    LocalHelper,
}

#[derive(Debug, clap::Args)]
struct ProvisionArgs {
    /// JSON provisioner configuration
    #[arg(long, short)]
    config: PathBuf,

    /// Working directory for the local backend
    #[arg(long)]
    workdir: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid arguments: {0}")]
    Arguments(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Provision(args) => provision(args).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

fn communicator(workdir: Option<PathBuf>) -> Arc<dyn Communicator> {
    match workdir {
        Some(dir) => Arc::new(LocalCommunicator::with_workdir(dir)),
        None => Arc::new(LocalCommunicator::new()),
    }
}

fn adapter_config(args: &ServeArgs) -> Result<AdapterConfig, CliError> {
    let sftp = match args.sftp {
        SftpMode::Native => SftpStrategy::Native,
        SftpMode::RemoteHelper => SftpStrategy::remote_helper(args.sftp_command.as_deref()),
        SftpMode::LocalHelper => {
            let command = args.sftp_command.as_deref().ok_or_else(|| {
                CliError::Arguments("--sftp local-helper needs --sftp-command".to_string())
            })?;
            let mut words = command.split_whitespace().map(str::to_string);
            let program = words.next().ok_or_else(|| {
                CliError::Arguments("--sftp-command is empty".to_string())
            })?;
            SftpStrategy::LocalHelper {
                program,
                args: words.collect(),
            }
        }
    };

    let mut config = AdapterConfig {
        local_port: args.port,
        ssh_authorized_key_file: args.authorized_key.clone(),
        ssh_host_key_file: args.host_key.clone(),
        sftp,
        ..Default::default()
    };
    if let Some(user) = &args.user {
        config.user = user.clone();
    }
    Ok(config)
}

async fn serve(args: ServeArgs) -> Result<(), CliError> {
    let config = adapter_config(&args)?;
    let identity = Identity::from_config(&config)?;
    info!(
        "client key: {} (user {})",
        identity.private_key_file().display(),
        config.user
    );

    let running = Adapter::new(config, &identity, communicator(args.workdir))
        .with_observer(Arc::new(TracingObserver))
        .start()
        .await?;

    let handle = running.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.terminate();
        }
    });

    running.join().await?;
    Ok(())
}

async fn provision(args: ProvisionArgs) -> Result<(), CliError> {
    let config = ProvisionerConfig::load(&args.config)?;
    let provisioner = Arc::new(Provisioner::new());

    let cancel = provisioner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling");
            cancel.cancel();
        }
    });

    provisioner
        .provision(
            &config,
            communicator(args.workdir),
            Arc::new(TracingObserver),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("comm-adapter").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let Command::Serve(args) = parse(&["serve"]).command else {
            panic!("expected serve");
        };
        let config = adapter_config(&args).unwrap();
        assert_eq!(config.local_port, 0);
        assert_eq!(config.sftp, SftpStrategy::Native);
        assert_eq!(config.user, AdapterConfig::default().user);
    }

    #[test]
    fn test_local_helper_splits_command() {
        let Command::Serve(args) = parse(&[
            "serve",
            "--sftp",
            "local-helper",
            "--sftp-command",
            "/usr/lib/sftp-server -e",
        ])
        .command
        else {
            panic!("expected serve");
        };
        let config = adapter_config(&args).unwrap();
        assert_eq!(
            config.sftp,
            SftpStrategy::LocalHelper {
                program: "/usr/lib/sftp-server".to_string(),
                args: vec!["-e".to_string()],
            }
        );
    }

    #[test]
    fn test_local_helper_requires_command() {
        let Command::Serve(args) = parse(&["serve", "--sftp", "local-helper"]).command else {
            panic!("expected serve");
        };
        assert!(matches!(
            adapter_config(&args),
            Err(CliError::Arguments(_))
        ));
    }

    #[test]
    fn test_key_files_go_together() {
        let parsed = Cli::try_parse_from(["comm-adapter", "serve", "--host-key", "/tmp/k"]);
        assert!(parsed.is_err());
    }
}
