//! Choosing how the guest will be isolated, based on what's installed

use crate::{context::Context, events::TerminalEvent};
use std::{
    ffi::OsStr,
    fmt,
    path::{Path, PathBuf},
};

/// The isolation strategy available on this host
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Backend {
    /// A container engine such as docker or podman
    ContainerEngine { engine: PathBuf },
    /// A userspace distribution manager such as proot-distro
    UserspaceDistro { tool: PathBuf },
    /// Nothing usable, the workspace lives directly on the host
    Local,
}

impl Backend {
    pub fn is_local(&self) -> bool {
        matches!(self, Backend::Local)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backend::ContainerEngine { .. } => "container",
            Backend::UserspaceDistro { .. } => "userspace-distro",
            Backend::Local => "local",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::ContainerEngine { engine } => write!(f, "container engine {:?}", engine),
            Backend::UserspaceDistro { tool } => write!(f, "userspace distro tool {:?}", tool),
            Backend::Local => f.write_str("local mode"),
        }
    }
}

/// Look for an executable on `search_path`
pub fn find_executable(name: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    match which::which_in(name, search_path, Path::new("/")) {
        Ok(path) => {
            log::debug!("found {} at {:?}", name, path);
            Some(path)
        }
        Err(err) => {
            log::trace!("no {} on search path, {}", name, err);
            None
        }
    }
}

/// Pick a backend: container engines first, then distro tools, then local
///
/// Probing is cheap and never cached, the host may change between calls.
pub fn probe(context: &Context) -> Backend {
    let search_path = context.executable_search_path();
    let search_path = search_path.as_deref();
    for name in &context.backend.container_engines {
        if let Some(engine) = find_executable(name, search_path) {
            return Backend::ContainerEngine { engine };
        }
    }
    for name in &context.backend.distro_tools {
        if let Some(tool) = find_executable(name, search_path) {
            return Backend::UserspaceDistro { tool };
        }
    }
    Backend::Local
}

/// Warning emitted when [probe()] finds nothing
pub fn unavailable_warning(context: &Context) -> TerminalEvent {
    let mut names = context.backend.container_engines.clone();
    names.extend(context.backend.distro_tools.iter().cloned());
    TerminalEvent::warning(format!(
        "no isolation backend found (looked for {}), using local mode",
        names.join(", ")
    ))
}
