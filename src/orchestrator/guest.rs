//! Provisioning a guest environment and running commands inside it

use crate::{
    context::{BackendSettings, GUEST_HOME},
    errors::OrchestratorError,
    events::{EventBus, TerminalEvent},
};
use regex::Regex;
use std::{
    ffi::OsStr,
    fmt,
    path::{Path, PathBuf},
    process::{Output, Stdio},
};
use tokio::{io::AsyncWriteExt, process::Command};

/// How a distro alias was chosen
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AliasOrigin {
    /// Already installed, and it's the one we asked for
    Preferred,
    /// Installed just now
    Installed,
    /// Some other installed distro, capabilities may be reduced
    Fallback,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DistroAlias {
    pub name: String,
    pub origin: AliasOrigin,
}

/// One record from the distro tool's listing
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DistroRecord {
    pub alias: String,
    pub installed: bool,
}

/// Parse `Alias:` / `Installed:` records out of a distro listing
pub fn parse_distro_list(listing: &str) -> Vec<DistroRecord> {
    lazy_static! {
        static ref ALIAS: Regex = Regex::new(r"^[ \t]*Alias:[ \t]*([^ \t\r\n]+)").unwrap();
        static ref INSTALLED: Regex = Regex::new(r"^[ \t]*Installed:[ \t]*([^ \t\r\n]+)").unwrap();
    }
    let mut records: Vec<DistroRecord> = Vec::new();
    for line in listing.lines() {
        if let Some(captures) = ALIAS.captures(line) {
            records.push(DistroRecord {
                alias: captures[1].to_string(),
                installed: false,
            });
        } else if let Some(captures) = INSTALLED.captures(line) {
            if let Some(record) = records.last_mut() {
                record.installed = captures[1].eq_ignore_ascii_case("yes");
            }
        }
    }
    records
}

/// Is `alias` the preferred one, or a variant like `ubuntu-lts` / `ubuntu_22`
pub fn matches_preferred(alias: &str, preferred: &str) -> bool {
    match alias.strip_prefix(preferred) {
        Some("") => true,
        Some(rest) => rest.starts_with(|c| c == '-' || c == '_' || c == '.') && rest.len() > 1,
        None => false,
    }
}

/// An installed alias matching the preferred name, if there is one
pub fn find_preferred(records: &[DistroRecord], preferred: &str) -> Option<String> {
    let installed = records.iter().filter(|r| r.installed);
    let mut candidates = installed.filter(|r| matches_preferred(&r.alias, preferred));
    candidates.next().map(|r| r.alias.clone())
}

/// Any installed alias at all
pub fn find_fallback(records: &[DistroRecord]) -> Option<String> {
    records
        .iter()
        .find(|r| r.installed)
        .map(|r| r.alias.clone())
}

/// A provisioned guest that can run commands
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Guest {
    Container { engine: PathBuf, name: String },
    Distro { tool: PathBuf, alias: DistroAlias },
}

impl fmt::Display for Guest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guest::Container { name, .. } => write!(f, "container {}", name),
            Guest::Distro { alias, .. } => write!(f, "distro {}", alias.name),
        }
    }
}

impl Guest {
    fn command<S: AsRef<OsStr>>(&self, args: &[S]) -> Command {
        let mut command = match self {
            Guest::Container { engine, name } => {
                let mut command = Command::new(engine);
                command.arg("exec").arg("-i").arg(name);
                command
            }
            Guest::Distro { tool, alias } => {
                let mut command = Command::new(tool);
                command.arg("login").arg(&alias.name).arg("--");
                command
            }
        };
        command.args(args);
        command
    }

    /// Run a command inside the guest, optionally feeding it stdin
    pub async fn run<S: AsRef<OsStr>>(
        &self,
        args: &[S],
        input: Option<&[u8]>,
    ) -> Result<Output, OrchestratorError> {
        let mut command = self.command(args);
        command
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        log::debug!("in {}: {:?}", self, command);
        let mut child = command.spawn()?;
        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
        Ok(child.wait_with_output().await?)
    }
}

/// Run a host tool to completion, capturing its output
pub async fn run_tool<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
) -> Result<Output, OrchestratorError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    log::debug!("running {:?}", command);
    Ok(command.output().await?)
}

/// The last few lines of stderr, for error messages
pub fn stderr_tail(output: &Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

async fn list_distros(tool: &Path) -> Result<Vec<DistroRecord>, OrchestratorError> {
    let listing = run_tool(tool, &["list"]).await?;
    // some versions print the listing on stderr
    let mut text = String::from_utf8_lossy(&listing.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&listing.stderr));
    let records = parse_distro_list(&text);
    log::debug!("distro listing: {:?}", records);
    Ok(records)
}

/// Find an already installed distro, preferred first, without installing one
pub async fn find_distro(
    tool: &Path,
    settings: &BackendSettings,
) -> Result<Option<Guest>, OrchestratorError> {
    let records = list_distros(tool).await?;
    let alias = match find_preferred(&records, &settings.preferred_alias) {
        Some(name) => Some(DistroAlias {
            name,
            origin: AliasOrigin::Preferred,
        }),
        None => find_fallback(&records).map(|name| DistroAlias {
            name,
            origin: AliasOrigin::Fallback,
        }),
    };
    Ok(alias.map(|alias| Guest::Distro {
        tool: tool.to_path_buf(),
        alias,
    }))
}

/// Find or install a distro for the guest
pub async fn provision_distro(
    tool: &Path,
    settings: &BackendSettings,
    events: &EventBus,
) -> Result<Guest, OrchestratorError> {
    let preferred = &settings.preferred_alias;
    let records = list_distros(tool).await?;
    let alias = if let Some(name) = find_preferred(&records, preferred) {
        DistroAlias {
            name,
            origin: AliasOrigin::Preferred,
        }
    } else {
        events.emit(TerminalEvent::status(format!("installing distro {}", preferred)));
        let install = run_tool(tool, &["install", preferred.as_str()]).await?;
        if install.status.success() {
            DistroAlias {
                name: preferred.clone(),
                origin: AliasOrigin::Installed,
            }
        } else {
            log::warn!("distro install failed: {}", stderr_tail(&install));
            match find_fallback(&records) {
                Some(name) => {
                    events.emit(TerminalEvent::warning(format!(
                        "could not install {}, falling back to {}; some capabilities may be reduced",
                        preferred, name
                    )));
                    DistroAlias {
                        name,
                        origin: AliasOrigin::Fallback,
                    }
                }
                None => {
                    return Err(OrchestratorError::Provision(format!(
                        "no distro installed and `install {}` failed: {}",
                        preferred,
                        stderr_tail(&install)
                    )))
                }
            }
        }
    };
    log::info!("using distro {} ({:?})", alias.name, alias.origin);
    Ok(Guest::Distro {
        tool: tool.to_path_buf(),
        alias,
    })
}

/// Dockerfile used when the image can be neither found nor pulled
pub fn dockerfile(settings: &BackendSettings) -> String {
    let command: Vec<String> = settings
        .service_command
        .split_whitespace()
        .map(|word| format!("{:?}", word))
        .collect();
    format!(
        "FROM {base}\n\
         ENV DEBIAN_FRONTEND=noninteractive\n\
         RUN apt-get update && apt-get install -y --no-install-recommends \\\n    \
         git curl ca-certificates python3 build-essential \\\n    \
         && apt-get clean && rm -rf /var/lib/apt/lists/*\n\
         RUN curl -fsSL https://code-server.dev/install.sh | sh\n\
         RUN useradd -m -s /bin/bash developer && \\\n    \
         mkdir -p {home}/workspace {home}/.rootbox && \\\n    \
         chown -R developer:developer {home}\n\
         USER developer\n\
         WORKDIR {home}/workspace\n\
         EXPOSE {port}\n\
         CMD [{command}]\n",
        base = settings.container_base_image,
        home = GUEST_HOME,
        port = settings.ide_port,
        command = command.join(", "),
    )
}

/// Make sure the image exists and the named container is running
pub async fn provision_container(
    engine: &Path,
    settings: &BackendSettings,
    workspace: &Path,
    build_dir: &Path,
    events: &EventBus,
) -> Result<Guest, OrchestratorError> {
    let image = settings.container_image.as_str();
    let inspect = run_tool(engine, &["image", "inspect", image]).await?;
    if !inspect.status.success() {
        events.emit(TerminalEvent::status(format!("pulling image {}", image)));
        let pull = run_tool(engine, &["pull", image]).await?;
        if !pull.status.success() {
            events.emit(TerminalEvent::status(format!("building image {}", image)));
            tokio::fs::create_dir_all(build_dir).await?;
            tokio::fs::write(build_dir.join("Dockerfile"), dockerfile(settings)).await?;
            let build = run_tool(
                engine,
                &[
                    OsStr::new("build"),
                    OsStr::new("-t"),
                    OsStr::new(image),
                    build_dir.as_os_str(),
                ],
            )
            .await?;
            if !build.status.success() {
                return Err(OrchestratorError::Provision(format!(
                    "image build failed: {}",
                    stderr_tail(&build)
                )));
            }
        }
    }

    let name = settings.container_name.as_str();
    let existing = run_tool(engine, &["container", "inspect", name]).await?;
    let started = if existing.status.success() {
        run_tool(engine, &["start", name]).await?
    } else {
        tokio::fs::create_dir_all(workspace).await?;
        let publish = format!("{0}:{0}", settings.ide_port);
        let mut mount = workspace.as_os_str().to_owned();
        mount.push(format!(":{}/workspace", GUEST_HOME));
        run_tool(
            engine,
            &[
                OsStr::new("run"),
                OsStr::new("-d"),
                OsStr::new("--name"),
                OsStr::new(name),
                OsStr::new("-p"),
                OsStr::new(&publish),
                OsStr::new("-v"),
                mount.as_os_str(),
                OsStr::new(image),
                OsStr::new("sleep"),
                OsStr::new("infinity"),
            ],
        )
        .await?
    };
    if !started.status.success() {
        return Err(OrchestratorError::Provision(format!(
            "container {} did not start: {}",
            name,
            stderr_tail(&started)
        )));
    }
    Ok(Guest::Container {
        engine: engine.to_path_buf(),
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "
Supported distributions:

  * Alpine Linux

    Alias: alpine
    Installed: yes
    Comment: Rolling release branch (edge).

  * Debian

    Alias: debian
    Installed: no

  * Ubuntu

    Alias: ubuntu-lts
    Installed: yes
";

    #[test]
    fn listing() {
        let records = parse_distro_list(LISTING);
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0],
            DistroRecord {
                alias: "alpine".into(),
                installed: true
            }
        );
        assert!(!records[1].installed);
        assert_eq!(records[2].alias, "ubuntu-lts");
    }

    #[test]
    fn preferred_naming() {
        assert!(matches_preferred("ubuntu", "ubuntu"));
        assert!(matches_preferred("ubuntu-lts", "ubuntu"));
        assert!(matches_preferred("ubuntu_22", "ubuntu"));
        assert!(matches_preferred("ubuntu.oldstable", "ubuntu"));
        assert!(!matches_preferred("ubuntustudio", "ubuntu"));
        assert!(!matches_preferred("ubuntu-", "ubuntu"));
        assert!(!matches_preferred("debian", "ubuntu"));
    }

    #[test]
    fn selection_order() {
        let records = parse_distro_list(LISTING);
        assert_eq!(find_preferred(&records, "ubuntu").as_deref(), Some("ubuntu-lts"));
        assert_eq!(find_preferred(&records, "debian"), None);
        assert_eq!(find_fallback(&records).as_deref(), Some("alpine"));
        assert_eq!(find_fallback(&[]), None);
    }

    #[test]
    fn dockerfile_mentions_settings() {
        let settings = BackendSettings::default();
        let text = dockerfile(&settings);
        assert!(text.starts_with("FROM ubuntu:24.04\n"));
        assert!(text.contains("EXPOSE 8080\n"));
        assert!(text.contains(r#"CMD ["code-server", "--bind-addr", "0.0.0.0:8080", "--auth", "none"]"#));
    }

    #[test]
    fn container_exec_prefix() {
        let guest = Guest::Container {
            engine: "/usr/bin/docker".into(),
            name: "box".into(),
        };
        let command = guest.command(&["true"]);
        let line = format!("{:?}", command.as_std());
        assert!(line.contains("exec"));
        assert!(line.contains("box"));
    }
}
