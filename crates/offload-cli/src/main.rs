//! offload CLI
//!
//! Prepare a host, probe it, run commands on it, and move files to and from
//! it using the stored configuration.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::{WrapErr, bail};
use offload_core::{ClientContext, Credentials, HostProfile, Reachability, TomlConfigStore};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "offload")]
#[command(about = "Run work on a remote host over SSH", long_about = None)]
struct Cli {
    /// Configuration file; defaults to $OFFLOAD_CONFIG, ./offload.toml,
    /// then the user configuration directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the host and login in the configuration file
    Prepare {
        /// Address of the host, or of the first host to scan
        address: String,
        #[arg(long, default_value_t = 22)]
        port: u16,
        /// Connection attempts per call
        #[arg(long, default_value_t = 1)]
        attempts: u32,
        /// Number of consecutive IPv4 addresses to scan
        #[arg(long, default_value_t = 1)]
        scan: u8,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, conflicts_with = "key")]
        password: Option<String>,
        /// Private key file
        #[arg(long)]
        key: Option<PathBuf>,
    },
    /// Check whether the configured host answers
    Probe,
    /// Run a shell command on the host, or locally if it is unreachable
    Run {
        /// Print the output only once the command finished
        #[arg(long)]
        quiet: bool,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Fetch a remote file
    Pull {
        remote: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a local file to a remote path
    Push { local: PathBuf, remote: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let store = cli
        .config
        .map_or_else(TomlConfigStore::discover, TomlConfigStore::new);
    let context = ClientContext::load(&store)
        .wrap_err_with(|| format!("failed to load {}", store.path().display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&context.execution().log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(config = %store.path().display(), "configuration loaded");

    let mut status = 0;
    match cli.command {
        Commands::Prepare {
            address,
            port,
            attempts,
            scan,
            user,
            password,
            key,
        } => {
            context.prepare_profile(HostProfile::new(address, port, attempts).with_scan(scan));
            match (user, password, key) {
                (Some(user), Some(password), None) => {
                    context.set_credentials(Credentials::password(user, password));
                }
                (Some(user), None, Some(key)) => {
                    context.set_credentials(Credentials::key_file(user, key));
                }
                (None, None, None) => {}
                _ => bail!("--user needs exactly one of --password or --key"),
            }
            context.save(&store)?;
            println!("saved to {}", store.path().display());
        }
        Commands::Probe => {
            let locator = context.sessions().locator();
            let Some(profile) = locator.profile() else {
                bail!("no host configured in {}", store.path().display());
            };
            match locator.probe(&profile).await {
                Reachability::Reachable { address } => {
                    println!("{address}:{} reachable", profile.port);
                }
                Reachability::Unreachable => {
                    println!("{}:{} unreachable", profile.address, profile.port);
                    status = 1;
                }
            }
        }
        Commands::Run { quiet, command } => {
            let output = context.run_command(&command.join(" "), !quiet).await?;
            if quiet {
                print!("{}", output.output);
            }
            status = output.status.unwrap_or(1);
        }
        Commands::Pull { remote, output } => {
            let data = context.pull(&remote).await?;
            match output {
                Some(path) => std::fs::write(&path, data)
                    .wrap_err_with(|| format!("failed to write {}", path.display()))?,
                None => std::io::stdout().write_all(&data)?,
            }
        }
        Commands::Push { local, remote } => {
            let data = std::fs::read(&local)
                .wrap_err_with(|| format!("failed to read {}", local.display()))?;
            context.push(&data, &remote).await?;
        }
    }

    context.reset().await?;
    std::io::stdout().flush()?;
    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}
