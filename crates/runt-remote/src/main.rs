//! runt-remote: manage remote kernel hosts from the command line.
//!
//! Every command runs on the shared SSH loop. Failures exit with the code
//! of their error kind so scripts can tell a refused connection from a
//! missing file.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use remote_client::config::default_config_path;
use remote_client::{
    dispatcher, AgentClient, AsyncDispatcher, AuthMethod, ConfigStore, HostConfig,
    KeyringSecretStore, KnownHostsPolicy, Orchestrator, Platform, RemoteError, Secret,
    SecretKind, SecretStore, SshFactory, REMOTE_LOOP,
};
use tabled::{settings::Style, Table, Tabled};

/// How long the loops get to wind down at exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "runt-remote")]
#[command(author, version, about = "Run Jupyter kernels on remote hosts over SSH", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Host store (default: ~/.config/runt/remote-hosts.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage configured hosts
    Hosts {
        #[command(subcommand)]
        command: HostCommands,
    },
    /// Connect, install and start the agent, then print its local address
    Connect {
        /// Host id or name
        host: String,
        /// Keep the port forward open until interrupted
        #[arg(long)]
        wait: bool,
    },
    /// Start a new kernel and write its connection file
    StartKernel {
        /// Host id or name
        host: String,
    },
    /// List kernels running on a host
    Kernels {
        /// Host id or name
        host: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Show whether a kernel is alive
    KernelInfo { host: String, kernel_id: String },
    /// Shut down a kernel
    DeleteKernel { host: String, kernel_id: String },
    /// List a remote directory
    Ls {
        host: String,
        path: String,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print a remote file to stdout
    Cat { host: String, path: String },
    /// Upload a local file
    Put {
        host: String,
        local: PathBuf,
        remote: String,
    },
    /// Stop the agent and close the SSH session
    Stop {
        host: String,
        /// Stop the agent but keep the session open
        #[arg(long)]
        keep_session: bool,
    },
}

#[derive(Subcommand, Debug)]
enum HostCommands {
    /// List configured hosts
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Add a host
    Add {
        /// Display name
        name: String,
        /// Address to connect to
        address: String,
        #[arg(short, long, default_value = "")]
        username: String,
        #[arg(short, long, default_value_t = 22)]
        port: u16,
        /// password, key-file or config-file
        #[arg(long, default_value = "password")]
        auth: String,
        /// Private key for key-file auth
        #[arg(long)]
        key: Option<PathBuf>,
        /// ssh_config file for config-file auth
        #[arg(long)]
        ssh_config: Option<PathBuf>,
        /// linux, macos, windows or other
        #[arg(long, default_value = "linux")]
        platform: String,
        /// Reject host keys missing from known_hosts
        #[arg(long)]
        strict_host_keys: bool,
    },
    /// Remove a host and its stored secrets
    Remove { host: String },
    /// Store a password or key passphrase in the OS credential store
    SetPassword {
        host: String,
        /// Store the key passphrase instead of the login password
        #[arg(long)]
        passphrase: bool,
    },
}

#[derive(Tabled)]
struct HostRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TARGET")]
    target: String,
    #[tabled(rename = "AUTH")]
    auth: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl From<&HostConfig> for HostRow {
    fn from(host: &HostConfig) -> Self {
        HostRow {
            name: host.name.clone(),
            target: host.display_target(),
            auth: auth_label(host.auth_method).to_string(),
            status: host.status.to_string(),
            id: host.id.clone(),
        }
    }
}

#[derive(Tabled)]
struct KernelRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "SHELL")]
    shell_port: u16,
    #[tabled(rename = "IOPUB")]
    iopub_port: u16,
    #[tabled(rename = "STDIN")]
    stdin_port: u16,
    #[tabled(rename = "CTRL")]
    control_port: u16,
    #[tabled(rename = "HB")]
    hb_port: u16,
}

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TYPE")]
    file_type: String,
    #[tabled(rename = "SIZE")]
    size: u64,
}

fn auth_label(method: AuthMethod) -> &'static str {
    match method {
        AuthMethod::Password => "password",
        AuthMethod::KeyFile => "key-file",
        AuthMethod::ConfigFile => "config-file",
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let code = match run_on_loop(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    };

    dispatcher::close_all(Some(SHUTDOWN_TIMEOUT));
    std::process::exit(code);
}

fn run_on_loop(cli: Cli) -> Result<()> {
    let dispatcher = AsyncDispatcher::new(REMOTE_LOOP)?;
    dispatcher.block_on(run(cli))?
}

/// Exit code for a failed command. Errors from outside the library exit 1.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RemoteError>())
        .map(|e| e.kind().exit_code())
        .unwrap_or(1)
}

async fn run(cli: Cli) -> Result<()> {
    let path = cli.config.unwrap_or_else(default_config_path);
    let store = Arc::new(ConfigStore::open(path)?);
    let secrets: Arc<dyn SecretStore> = Arc::new(KeyringSecretStore::default());

    let orchestrator = Orchestrator::new(SshFactory::new(secrets.clone()), store.clone());

    match cli.command {
        Commands::Hosts { command } => hosts(command, &store, secrets.as_ref()),
        Commands::Connect { host, wait } => connect(&orchestrator, &host, wait).await,
        Commands::StartKernel { host } => start_kernel(&orchestrator, &host).await,
        Commands::Kernels { host, json } => {
            let client = orchestrator.ensure_server(&host).await?;
            list_kernels(&client, json).await
        }
        Commands::KernelInfo { host, kernel_id } => {
            let client = orchestrator.ensure_server(&host).await?;
            let status = client
                .kernels()
                .info(&kernel_id)
                .await?
                .ok_or_else(|| RemoteError::NotFound(format!("kernel {}", kernel_id)))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::DeleteKernel { host, kernel_id } => {
            let client = orchestrator.ensure_server(&host).await?;
            if !client.kernels().delete(&kernel_id).await? {
                return Err(RemoteError::NotFound(format!("kernel {}", kernel_id)).into());
            }
            if let Some(entry) = orchestrator.store().find(&host) {
                orchestrator
                    .connection_files()
                    .remove(&entry.id, &kernel_id)
                    .await?;
            }
            println!("Deleted kernel {}", kernel_id);
            Ok(())
        }
        Commands::Ls { host, path, json } => {
            let client = orchestrator.ensure_server(&host).await?;
            list_dir(&client, &path, json).await
        }
        Commands::Cat { host, path } => {
            let client = orchestrator.ensure_server(&host).await?;
            let data = client.files().read_bytes(&path).await?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
            Ok(())
        }
        Commands::Put {
            host,
            local,
            remote,
        } => {
            let data = tokio::fs::read(&local)
                .await
                .with_context(|| format!("Failed to read {}", local.display()))?;
            let client = orchestrator.ensure_server(&host).await?;
            let written = client.files().write_bytes(&remote, &data).await?;
            println!("Wrote {} bytes to {}", written, remote);
            Ok(())
        }
        Commands::Stop { host, keep_session } => {
            if keep_session {
                orchestrator.stop_server(&host).await?;
            } else {
                orchestrator.close_connection(&host).await?;
            }
            println!("Stopped {}", host);
            Ok(())
        }
    }
}

// ============================================================================
// Host management
// ============================================================================

fn hosts(command: HostCommands, store: &ConfigStore, secrets: &dyn SecretStore) -> Result<()> {
    match command {
        HostCommands::List { json } => {
            let hosts = store.hosts();
            if json {
                println!("{}", serde_json::to_string_pretty(&hosts)?);
            } else if hosts.is_empty() {
                println!("No hosts configured.");
            } else {
                let rows: Vec<HostRow> = hosts.iter().map(HostRow::from).collect();
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
            Ok(())
        }
        HostCommands::Add {
            name,
            address,
            username,
            port,
            auth,
            key,
            ssh_config,
            platform,
            strict_host_keys,
        } => {
            let auth: AuthMethod = auth.parse()?;
            let platform: Platform = platform.parse()?;
            let mut host = HostConfig::new(name, address, username, auth)
                .with_port(port)
                .with_platform(platform);
            if let Some(key) = key {
                host = host.with_key_path(key);
            }
            if let Some(path) = ssh_config {
                host = host.with_config_path(path);
            }
            if strict_host_keys {
                host = host.with_known_hosts(KnownHostsPolicy::Strict);
            }
            host.validate()?;
            let id = host.id.clone();
            store.upsert(host)?;
            info!("[runt-remote] Added host {}", id);
            println!("{}", id);
            if auth == AuthMethod::Password {
                println!("Run `runt-remote hosts set-password {}` to store its password.", id);
            }
            Ok(())
        }
        HostCommands::Remove { host } => {
            let entry = find_host(store, &host)?;
            store.remove(&entry.id)?;
            if let Err(e) = secrets.delete_all(&entry.id) {
                debug!("[runt-remote] No secrets removed for {}: {}", entry.id, e);
            }
            println!("Removed {}", entry.name);
            Ok(())
        }
        HostCommands::SetPassword { host, passphrase } => {
            let entry = find_host(store, &host)?;
            let kind = if passphrase {
                SecretKind::Passphrase
            } else {
                SecretKind::Password
            };
            eprint!("{} for {}: ", capitalize(kind.as_str()), entry.display_target());
            let _ = io::stderr().flush();
            let value = rpassword::read_password()?;
            if value.is_empty() {
                return Err(anyhow!("Empty {}; nothing stored", kind.as_str()));
            }
            secrets.set(&entry.id, kind, &Secret::new(value))?;
            println!("Stored {} for {}", kind.as_str(), entry.name);
            Ok(())
        }
    }
}

fn find_host(store: &ConfigStore, id_or_name: &str) -> Result<HostConfig> {
    store
        .find(id_or_name)
        .ok_or_else(|| RemoteError::Config(format!("unknown host '{}'", id_or_name)).into())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ============================================================================
// Agent commands
// ============================================================================

async fn connect(orchestrator: &Orchestrator<SshFactory>, host: &str, wait: bool) -> Result<()> {
    let client = orchestrator.ensure_server(host).await?;
    println!("{}", client.base_url());
    if wait {
        eprintln!("Forwarding; press Ctrl-C to stop.");
        tokio::signal::ctrl_c().await?;
        orchestrator.close_connection(host).await?;
    }
    Ok(())
}

async fn start_kernel(orchestrator: &Orchestrator<SshFactory>, host: &str) -> Result<()> {
    let descriptor = orchestrator.start_new_kernel_ensure_server(host).await?;
    let host_id = find_host(orchestrator.store(), host)?.id;
    let path = orchestrator
        .connection_files()
        .path_for(&host_id, &descriptor.id)?;
    println!("{}", descriptor.id);
    println!("Connection file: {}", path.display());
    Ok(())
}

async fn list_kernels(client: &AgentClient, json: bool) -> Result<()> {
    let kernels = client.kernels().list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&kernels)?);
        return Ok(());
    }
    if kernels.is_empty() {
        println!("No running kernels found.");
        return Ok(());
    }
    let rows: Vec<KernelRow> = kernels
        .iter()
        .map(|k| KernelRow {
            id: k.id.clone(),
            shell_port: k.connection_info.shell_port,
            iopub_port: k.connection_info.iopub_port,
            stdin_port: k.connection_info.stdin_port,
            control_port: k.connection_info.control_port,
            hb_port: k.connection_info.hb_port,
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

async fn list_dir(client: &AgentClient, path: &str, json: bool) -> Result<()> {
    let mut entries = client.files().ls(path).await?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    let rows: Vec<EntryRow> = entries
        .iter()
        .map(|e| EntryRow {
            name: e.name.clone(),
            file_type: format!("{:?}", e.file_type).to_lowercase(),
            size: e.size,
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}
