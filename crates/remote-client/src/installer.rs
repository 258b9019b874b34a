//! Detect, version-check and install the remote agent.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::Platform;
use crate::error::{RemoteError, Result};
use crate::flight::SingleFlight;
use crate::shell::{RemoteShell, RunOptions};

/// Environment the agent is installed into on the remote host.
pub const SERVER_ENV: &str = "spyder-remote";
pub const SERVER_PACKAGE: &str = "spyder-remote-services";
pub const SERVER_BINARY: &str = "spyder-server";
pub const MIN_SERVER_VERSION: &str = "1.0.0";
pub const MAX_SERVER_VERSION: &str = "2.0.0";

pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

const POSIX_MAMBA: &str = "/${HOME}/.local/bin/micromamba";

/// Commands run on the remote host, per platform.
#[derive(Debug, Clone, Copy)]
pub struct AgentCommands {
    platform: Platform,
}

impl AgentCommands {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    fn server(&self, args: &str) -> String {
        match self.platform {
            Platform::Windows => format!(
                "powershell -NoProfile -Command \"& $env:USERPROFILE\\.local\\bin\\micromamba.exe run -n {} {} {}\"",
                SERVER_ENV, SERVER_BINARY, args
            ),
            _ => format!("{} run -n {} {} {}", POSIX_MAMBA, SERVER_ENV, SERVER_BINARY, args)
                .trim_end()
                .to_string(),
        }
    }

    pub fn probe(&self) -> String {
        self.server("--help")
    }

    pub fn version(&self) -> String {
        self.server("--version")
    }

    pub fn start(&self) -> String {
        self.server("")
    }

    pub fn info(&self) -> String {
        self.server("info")
    }

    /// Bootstrap script for this platform. Re-running it upgrades in place.
    pub fn install(&self) -> Result<String> {
        let spec = format!(
            "{}>={},<{}",
            SERVER_PACKAGE, MIN_SERVER_VERSION, MAX_SERVER_VERSION
        );
        match self.platform {
            Platform::Linux | Platform::Macos => Ok(format!(
                r#"set -e
mkdir -p "${{HOME}}/.local/bin"
if [ ! -x "${{HOME}}/.local/bin/micromamba" ]; then
  case "$(uname -s)-$(uname -m)" in
    Linux-x86_64) arch=linux-64 ;;
    Linux-aarch64) arch=linux-aarch64 ;;
    Linux-ppc64le) arch=linux-ppc64le ;;
    Darwin-x86_64) arch=osx-64 ;;
    Darwin-arm64) arch=osx-arm64 ;;
    *) echo "unsupported architecture: $(uname -s)-$(uname -m)" >&2; exit 1 ;;
  esac
  curl -Ls "https://micro.mamba.pm/api/micromamba/${{arch}}/latest" | tar -xvj -C "${{HOME}}/.local" bin/micromamba
fi
"${{HOME}}/.local/bin/micromamba" create -y -n {env} -c conda-forge "{spec}"
"#,
                env = SERVER_ENV,
                spec = spec
            )),
            Platform::Windows => Ok(format!(
                r#"powershell -NoProfile -ExecutionPolicy Bypass -Command "$ErrorActionPreference = 'Stop'; $bin = Join-Path $env:USERPROFILE '.local\bin'; New-Item -ItemType Directory -Force -Path $bin | Out-Null; $mamba = Join-Path $bin 'micromamba.exe'; if (-not (Test-Path $mamba)) {{ Invoke-WebRequest -Uri 'https://github.com/mamba-org/micromamba-releases/releases/latest/download/micromamba-win-64' -OutFile $mamba }}; & $mamba create -y -n {env} -c conda-forge '{spec}'; exit $LASTEXITCODE""#,
                env = SERVER_ENV,
                spec = spec
            )),
            Platform::Other => Err(RemoteError::UnsupportedPlatform {
                platform: self.platform.to_string(),
            }),
        }
    }
}

/// Dotted numeric version. Missing components compare as zero and any
/// non-numeric suffix on a component is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion(Vec<u64>);

impl ServerVersion {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('v');
        let mut parts = Vec::new();
        for component in s.split('.') {
            let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                break;
            }
            parts.push(digits.parse().ok()?);
            if digits.len() != component.len() {
                break;
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(Self(parts))
        }
    }
}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

enum Gate {
    Supported(String),
    NeedsInstall,
}

/// Ensures the agent is installed on one host.
pub struct Installer<S: RemoteShell> {
    shell: Arc<S>,
    commands: AgentCommands,
    install_timeout: Duration,
    installed: Mutex<Option<String>>,
    flight: SingleFlight<String>,
}

impl<S: RemoteShell> Installer<S> {
    pub fn new(shell: Arc<S>, platform: Platform) -> Self {
        Self {
            shell,
            commands: AgentCommands::new(platform),
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
            installed: Mutex::new(None),
            flight: SingleFlight::new(),
        }
    }

    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    pub fn commands(&self) -> AgentCommands {
        self.commands
    }

    /// Version confirmed by the last successful check, if any.
    pub fn installed_version(&self) -> Option<String> {
        self.installed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Forget the cached check, e.g. after the connection was replaced.
    pub fn reset(&self) {
        *self.installed.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Make sure a supported agent is installed and return its version.
    pub async fn ensure_installed(&self) -> Result<String> {
        if let Some(version) = self.installed_version() {
            return Ok(version);
        }
        let shell = self.shell.clone();
        let commands = self.commands;
        let timeout = self.install_timeout;
        let version = self
            .flight
            .run(move || check_and_install(shell, commands, timeout))
            .await?;
        *self.installed.lock().unwrap_or_else(|e| e.into_inner()) = Some(version.clone());
        Ok(version)
    }
}

async fn check_and_install<S: RemoteShell>(
    shell: Arc<S>,
    commands: AgentCommands,
    timeout: Duration,
) -> Result<String> {
    match version_gate(&*shell, &commands).await? {
        Gate::Supported(version) => {
            info!("[installer] Supported server version {}", version);
            return Ok(version);
        }
        Gate::NeedsInstall => {}
    }

    let script = commands.install()?;
    info!("[installer] Installing {} on {}", SERVER_PACKAGE, shell.host_id());
    match shell
        .run(&script, RunOptions::checked().with_timeout(timeout))
        .await
    {
        Ok(_) => {}
        Err(RemoteError::ProcessError { stderr, .. }) => {
            warn!("[installer] Installation script failed: {}", stderr);
            return Err(RemoteError::InstallFailed { stderr });
        }
        Err(e) => return Err(e),
    }

    match version_gate(&*shell, &commands).await? {
        Gate::Supported(version) => {
            info!("[installer] Installed server version {}", version);
            Ok(version)
        }
        Gate::NeedsInstall => Err(RemoteError::InstallFailed {
            stderr: "server is still missing or outdated after installation".into(),
        }),
    }
}

async fn version_gate<S: RemoteShell>(shell: &S, commands: &AgentCommands) -> Result<Gate> {
    match shell.run(&commands.probe(), RunOptions::default()).await {
        Ok(output) if output.success() => {}
        Ok(output) => {
            debug!(
                "[installer] Probe exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            );
            return Ok(Gate::NeedsInstall);
        }
        Err(RemoteError::ProcessError { stderr, .. }) => {
            debug!("[installer] Probe failed: {}", stderr.trim());
            return Ok(Gate::NeedsInstall);
        }
        Err(e) => return Err(e),
    }

    let output = match shell.run(&commands.version(), RunOptions::checked()).await {
        Ok(output) => output,
        Err(RemoteError::ProcessError { stderr, .. }) => {
            warn!("[installer] Issue checking server version: {}", stderr.trim());
            return Ok(Gate::NeedsInstall);
        }
        Err(e) => return Err(e),
    };

    let Some(raw) = output.last_line().map(str::to_string) else {
        return Ok(Gate::NeedsInstall);
    };
    let Some(found) = ServerVersion::parse(&raw) else {
        warn!("[installer] Unparseable server version '{}'", raw);
        return Ok(Gate::NeedsInstall);
    };

    let max = ServerVersion::parse(MAX_SERVER_VERSION).unwrap_or(ServerVersion(vec![u64::MAX]));
    let min = ServerVersion::parse(MIN_SERVER_VERSION).unwrap_or(ServerVersion(vec![0]));
    if found >= max {
        return Err(RemoteError::VersionMismatch {
            found: raw,
            max: MAX_SERVER_VERSION.to_string(),
        });
    }
    if found < min {
        warn!(
            "[installer] Server version {} is below {}, upgrading",
            raw, MIN_SERVER_VERSION
        );
        return Ok(Gate::NeedsInstall);
    }
    Ok(Gate::Supported(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let v = |s| ServerVersion::parse(s).unwrap();
        assert!(v("1.0.0") < v("2.0.0"));
        assert!(v("1.10.0") > v("1.9.3"));
        assert_eq!(v("1.2").cmp(&v("1.2.0")), Ordering::Equal);
        assert_eq!(v("v1.4.0rc1"), v("1.4.0"));
        assert!(ServerVersion::parse("dev").is_none());
    }

    #[test]
    fn test_commands_per_platform() {
        let linux = AgentCommands::new(Platform::Linux);
        assert_eq!(
            linux.info(),
            "/${HOME}/.local/bin/micromamba run -n spyder-remote spyder-server info"
        );
        assert_eq!(
            linux.start(),
            "/${HOME}/.local/bin/micromamba run -n spyder-remote spyder-server"
        );
        let script = linux.install().unwrap();
        assert!(script.contains("spyder-remote-services>=1.0.0,<2.0.0"));

        let windows = AgentCommands::new(Platform::Windows);
        assert!(windows.install().unwrap().starts_with("powershell"));

        let err = AgentCommands::new(Platform::Other).install().unwrap_err();
        assert!(matches!(err, RemoteError::UnsupportedPlatform { platform } if platform == "other"));
    }
}
