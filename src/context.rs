//! Configuration shared by every component
//!
//! One [Context] is built up front and handed to each constructor, so nothing
//! reaches for process-wide state.

use crate::{errors::ConfigError, rootfs::RootfsInstallation};
use std::{
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

const ALPINE_VERSION: &str = "3.19";
const ALPINE_RELEASE: &str = "3.19.0";

/// Guest path of the developer's home directory
pub const GUEST_HOME: &str = "/home/developer";

/// Determine the default per-user directory for installed data
///
/// Typically this returns `$HOME/.local/share/rootbox`, but it may return
/// `$XDG_DATA_HOME/rootbox` if the per-user data directory has been set, and
/// it can be customized directly via the `$ROOTBOX_HOME` environment
/// variable.
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
    match env::var("ROOTBOX_HOME") {
        Ok(s) => Ok(Path::new(&s).to_path_buf()),
        Err(_) => {
            let mut buf = match env::var("XDG_DATA_HOME") {
                Ok(s) => Ok(Path::new(&s).to_path_buf()),
                Err(_) => match env::var("HOME") {
                    Ok(s) => Ok(Path::new(&s).join(".local").join("share")),
                    Err(_) => Err(ConfigError::NoDefaultDataDir),
                },
            };
            if let Ok(buf) = &mut buf {
                buf.push("rootbox");
            }
            buf
        }
    }
}

/// Determine the default per-user cache directory for downloads
///
/// `$ROOTBOX_CACHE`, else `$XDG_CACHE_HOME/rootbox`, else
/// `$HOME/.cache/rootbox`.
pub fn default_cache_dir() -> Result<PathBuf, ConfigError> {
    match env::var("ROOTBOX_CACHE") {
        Ok(s) => Ok(Path::new(&s).to_path_buf()),
        Err(_) => {
            let mut buf = match env::var("XDG_CACHE_HOME") {
                Ok(s) => Ok(Path::new(&s).to_path_buf()),
                Err(_) => match env::var("HOME") {
                    Ok(s) => Ok(Path::new(&s).join(".cache")),
                    Err(_) => Err(ConfigError::NoDefaultCacheDir),
                },
            };
            if let Ok(buf) = &mut buf {
                buf.push("rootbox");
            }
            buf
        }
    }
}

fn guest_arch() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else if cfg!(target_arch = "arm") {
        "armv7"
    } else {
        "x86_64"
    }
}

/// Where the rootfs comes from and what a complete one looks like
#[derive(Clone, Debug)]
pub struct RootfsSettings {
    pub image_url: Url,
    pub checksum_url: Url,
    /// Paths relative to the rootfs that must exist for it to count as
    /// installed
    pub required_binaries: Vec<PathBuf>,
}

impl RootfsSettings {
    fn new() -> Result<Self, ConfigError> {
        let arch = guest_arch();
        let image = format!(
            "https://dl-cdn.alpinelinux.org/alpine/v{}/releases/{}/alpine-minirootfs-{}-{}.tar.gz",
            ALPINE_VERSION, arch, ALPINE_RELEASE, arch
        );
        let checksum = format!("{}.sha256", image);
        Ok(RootfsSettings {
            image_url: Url::parse(&image)?,
            checksum_url: Url::parse(&checksum)?,
            required_binaries: vec![PathBuf::from("bin/sh")],
        })
    }
}

/// Which isolation tools to look for and how to run the guest service
#[derive(Clone, Debug)]
pub struct BackendSettings {
    pub container_engines: Vec<String>,
    pub distro_tools: Vec<String>,
    pub preferred_alias: String,
    pub container_image: String,
    pub container_name: String,
    /// Base image used when the container image has to be built locally
    pub container_base_image: String,
    pub ide_port: u16,
    /// Command line the control script runs in the background on `start`
    pub service_command: String,
    /// Guest path of the control script
    pub control_script: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            container_engines: vec!["docker".into(), "podman".into()],
            distro_tools: vec!["proot-distro".into()],
            preferred_alias: "ubuntu".into(),
            container_image: "rootbox-ide:latest".into(),
            container_name: "rootbox-ide".into(),
            container_base_image: "ubuntu:24.04".into(),
            ide_port: 8080,
            service_command: "code-server --bind-addr 0.0.0.0:8080 --auth none".into(),
            control_script: format!("{}/.rootbox/service.sh", GUEST_HOME),
        }
    }
}

/// Readiness polling budget
#[derive(Clone, Debug)]
pub struct HealthSettings {
    pub url: Url,
    pub attempts: u32,
    pub interval: Duration,
    /// Connect and read timeout for each attempt
    pub timeout: Duration,
}

impl HealthSettings {
    fn for_port(port: u16) -> Result<Self, ConfigError> {
        Ok(HealthSettings {
            url: Url::parse(&format!("http://127.0.0.1:{}/", port))?,
            attempts: 30,
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(2),
        })
    }
}

/// How the interactive shell is launched and supervised
#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// Explicit isolation wrapper, skipping the search for `wrapper_names`
    pub wrapper: Option<PathBuf>,
    pub wrapper_names: Vec<String>,
    pub guest_home: String,
    pub user: String,
    pub shell: String,
    pub term: String,
    pub path: String,
    pub lang: String,
    pub input_wait_attempts: u32,
    pub input_wait_interval: Duration,
    /// Longest a single write to the shell's stdin may stall
    pub write_timeout: Duration,
    /// How long `stop()` waits for a graceful exit before killing
    pub stop_grace: Duration,
    pub history_limit: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            wrapper: None,
            wrapper_names: vec!["proot".into()],
            guest_home: GUEST_HOME.into(),
            user: "developer".into(),
            shell: "/bin/sh".into(),
            term: "xterm-256color".into(),
            path: "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into(),
            lang: "C.UTF-8".into(),
            input_wait_attempts: 50,
            input_wait_interval: Duration::from_millis(100),
            write_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(3),
            history_limit: 100,
        }
    }
}

/// Everything the components need to know about their surroundings
#[derive(Clone, Debug)]
pub struct Context {
    /// App-private root for the installation and local workspace
    pub data_dir: PathBuf,
    /// Scratch space for downloads
    pub cache_dir: PathBuf,
    /// Executable search path, `$PATH` when unset
    pub search_path: Option<OsString>,
    pub rootfs: RootfsSettings,
    pub backend: BackendSettings,
    pub health: HealthSettings,
    pub session: SessionSettings,
    pub event_capacity: usize,
}

impl Context {
    /// Construct a context with default options
    pub fn new() -> Result<Context, ConfigError> {
        Context::builder().build()
    }

    /// Construct a context with custom options, via ContextBuilder
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Directory holding `rootfs/` and the bootstrap script
    pub fn install_dir(&self) -> PathBuf {
        self.data_dir.join("guest")
    }

    /// Host directory shared with the guest as its workspace
    pub fn workspace_dir(&self) -> PathBuf {
        self.data_dir.join("workspace")
    }

    pub fn installation(&self) -> RootfsInstallation {
        RootfsInstallation::new(
            self.install_dir(),
            &self.session.guest_home,
            self.rootfs.required_binaries.clone(),
        )
    }

    /// Executable search path, defaulting to the process `$PATH`
    pub fn executable_search_path(&self) -> Option<OsString> {
        self.search_path.clone().or_else(|| env::var_os("PATH"))
    }

    /// Apply settings from a parsed overrides file
    pub fn apply(&mut self, overrides: &ContextOverrides) -> Result<(), ConfigError> {
        if let Some(dir) = &overrides.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(dir) = &overrides.cache_dir {
            self.cache_dir = dir.clone();
        }
        if let Some(path) = &overrides.search_path {
            self.search_path = Some(OsString::from(path));
        }
        if let Some(url) = &overrides.image_url {
            self.rootfs.image_url = url.clone();
        }
        if let Some(url) = &overrides.checksum_url {
            self.rootfs.checksum_url = url.clone();
        }
        if let Some(alias) = &overrides.preferred_alias {
            self.backend.preferred_alias = alias.clone();
        }
        if let Some(image) = &overrides.container_image {
            self.backend.container_image = image.clone();
        }
        if let Some(command) = &overrides.service_command {
            self.backend.service_command = command.clone();
        }
        if let Some(port) = overrides.ide_port {
            self.backend.ide_port = port;
            if overrides.health_url.is_none() {
                self.health.url = Url::parse(&format!("http://127.0.0.1:{}/", port))?;
            }
        }
        if let Some(url) = &overrides.health_url {
            self.health.url = url.clone();
        }
        if let Some(attempts) = overrides.health_attempts {
            self.health.attempts = attempts;
        }
        if let Some(ms) = overrides.health_interval_ms {
            self.health.interval = Duration::from_millis(ms);
        }
        if let Some(wrapper) = &overrides.wrapper {
            self.session.wrapper = Some(wrapper.clone());
        }
        Ok(())
    }
}

/// Optional settings read from a JSON file
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextOverrides {
    pub data_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub search_path: Option<String>,
    pub image_url: Option<Url>,
    pub checksum_url: Option<Url>,
    pub preferred_alias: Option<String>,
    pub container_image: Option<String>,
    pub service_command: Option<String>,
    pub ide_port: Option<u16>,
    pub health_url: Option<Url>,
    pub health_attempts: Option<u32>,
    pub health_interval_ms: Option<u64>,
    pub wrapper: Option<PathBuf>,
}

impl ContextOverrides {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Builder for configuring custom [Context] instances
#[derive(Debug, Default)]
pub struct ContextBuilder {
    data_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    search_path: Option<OsString>,
    overrides: Option<ContextOverrides>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Change the app-private data directory
    ///
    /// The default can be determined with [default_data_dir()]
    pub fn data_dir(mut self, dir: &Path) -> Self {
        self.data_dir = Some(dir.to_path_buf());
        self
    }

    /// Change the download cache directory
    ///
    /// The default can be determined with [default_cache_dir()]
    pub fn cache_dir(mut self, dir: &Path) -> Self {
        self.cache_dir = Some(dir.to_path_buf());
        self
    }

    /// Search for isolation tools on this path instead of `$PATH`
    pub fn search_path<S: Into<OsString>>(mut self, path: S) -> Self {
        self.search_path = Some(path.into());
        self
    }

    /// Apply overrides, typically from [ContextOverrides::from_file()]
    pub fn overrides(mut self, overrides: ContextOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Construct a Context using the parameters from this Builder
    pub fn build(self) -> Result<Context, ConfigError> {
        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };
        let cache_dir = match self.cache_dir {
            Some(dir) => dir,
            None => default_cache_dir()?,
        };
        let backend = BackendSettings::default();
        let mut context = Context {
            data_dir,
            cache_dir,
            search_path: self.search_path,
            rootfs: RootfsSettings::new()?,
            health: HealthSettings::for_port(backend.ide_port)?,
            backend,
            session: SessionSettings::default(),
            event_capacity: crate::events::DEFAULT_CAPACITY,
        };
        if let Some(overrides) = &self.overrides {
            context.apply(overrides)?;
        }
        log::debug!("using data directory {:?}", context.data_dir);
        Ok(context)
    }
}
