//! Verified, idempotent installation of the guest root filesystem

pub mod digest;
pub mod fetch;
pub mod tar;

use self::{
    fetch::{Fetch, RootfsArtifact},
    tar::{ensure_dir_within, prepare_destination},
};
use crate::{
    assets::{AssetSource, BundledAssets, BOOTSTRAP_SCRIPT},
    errors::InstallError,
    events::{EventBus, TerminalEvent},
};
use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task;

/// File inside the rootfs whose presence means the install completed
pub const MARKER_FILE: &str = ".rootbox_installed";

/// Directories every guest needs, relative to the rootfs
const GUEST_DIRS: &[&str] = &["dev", "proc", "sys", "tmp"];

/// Where an installation lives on the host, and how to tell it's complete
#[derive(Clone, Debug)]
pub struct RootfsInstallation {
    install_dir: PathBuf,
    rootfs_dir: PathBuf,
    marker: PathBuf,
    bootstrap_script: PathBuf,
    guest_home: PathBuf,
    required_binaries: Vec<PathBuf>,
}

impl RootfsInstallation {
    pub fn new(install_dir: PathBuf, guest_home: &str, required_binaries: Vec<PathBuf>) -> Self {
        let rootfs_dir = install_dir.join("rootfs");
        RootfsInstallation {
            marker: rootfs_dir.join(MARKER_FILE),
            bootstrap_script: install_dir.join(BOOTSTRAP_SCRIPT),
            guest_home: PathBuf::from(guest_home.trim_start_matches('/')),
            rootfs_dir,
            install_dir,
            required_binaries,
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn rootfs_dir(&self) -> &Path {
        &self.rootfs_dir
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn bootstrap_script(&self) -> &Path {
        &self.bootstrap_script
    }

    /// Host path of a guest-absolute path
    pub fn host_path(&self, guest_path: &str) -> PathBuf {
        self.rootfs_dir.join(guest_path.trim_start_matches('/'))
    }

    /// Host path of the developer's home directory
    pub fn guest_home(&self) -> PathBuf {
        self.rootfs_dir.join(&self.guest_home)
    }

    /// True when the marker is present and every required binary exists
    ///
    /// Binaries are checked without following symlinks. A guest `bin/sh` is
    /// usually an absolute link to `/bin/busybox`, which means nothing on the
    /// host.
    pub fn is_installed(&self) -> bool {
        if !self.marker.is_file() {
            return false;
        }
        self.required_binaries.iter().all(|binary| {
            let present = fs::symlink_metadata(self.rootfs_dir.join(binary)).is_ok();
            if !present {
                log::warn!("install marker present but {:?} is missing", binary);
            }
            present
        })
    }
}

/// Removes a scratch file when dropped
#[derive(Debug)]
struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.0) {
            if err.kind() != io::ErrorKind::NotFound {
                log::warn!("could not remove {:?}, {}", self.0, err);
            }
        }
    }
}

/// Fetches, verifies, extracts and configures a rootfs
#[derive(Debug)]
pub struct Installer<F> {
    installation: RootfsInstallation,
    fetcher: F,
    assets: Arc<dyn AssetSource>,
    events: EventBus,
}

impl<F: Fetch> Installer<F> {
    pub fn new(installation: RootfsInstallation, fetcher: F, events: EventBus) -> Self {
        Installer {
            installation,
            fetcher,
            assets: Arc::new(BundledAssets),
            events,
        }
    }

    /// Use a different source for the bootstrap script
    pub fn with_assets(mut self, assets: Arc<dyn AssetSource>) -> Self {
        self.assets = assets;
        self
    }

    pub fn installation(&self) -> &RootfsInstallation {
        &self.installation
    }

    pub fn is_installed(&self) -> bool {
        self.installation.is_installed()
    }

    /// Make sure a complete rootfs is installed
    ///
    /// Does nothing when it already is. A failed attempt leaves no partial
    /// rootfs behind.
    pub async fn install(&self) -> Result<(), InstallError> {
        match self.install_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let message = if err.is_security() {
                    "rootfs rejected"
                } else {
                    "rootfs installation failed"
                };
                self.events.emit(TerminalEvent::failure(message, &err));
                Err(err)
            }
        }
    }

    async fn install_inner(&self) -> Result<(), InstallError> {
        if self.is_installed() {
            self.events
                .emit(TerminalEvent::status("rootfs already installed"));
            return Ok(());
        }

        match self.fetch_and_unpack().await {
            Ok(()) => {
                self.events.emit(TerminalEvent::status("rootfs installed"));
                Ok(())
            }
            Err(err) => {
                // including whatever an interrupted earlier attempt left
                self.remove_partial().await;
                Err(err)
            }
        }
    }

    async fn fetch_and_unpack(&self) -> Result<(), InstallError> {
        self.events.emit(TerminalEvent::status("downloading rootfs"));
        let artifact = self.fetcher.fetch().await?;

        self.events.emit(TerminalEvent::status("verifying rootfs checksum"));
        let found = digest::file_sha256(artifact.archive()).await?;
        if !found.eq_ignore_ascii_case(artifact.checksum()) {
            return Err(InstallError::ChecksumMismatch {
                expected: artifact.checksum().to_string(),
                found,
            });
        }
        self.unpack(&artifact).await
    }

    async fn unpack(&self, artifact: &RootfsArtifact) -> Result<(), InstallError> {
        let rootfs = self.installation.rootfs_dir().to_path_buf();
        // anything already here is left over from an interrupted install
        if fs::symlink_metadata(&rootfs).is_ok() {
            log::info!("removing incomplete rootfs at {:?}", rootfs);
            tokio::fs::remove_dir_all(&rootfs).await?;
        }
        tokio::fs::create_dir_all(&rootfs).await?;

        self.events.emit(TerminalEvent::status("extracting rootfs"));
        let mut tar_name = artifact.archive().as_os_str().to_owned();
        tar_name.push(".tar");
        let scratch = ScratchFile(PathBuf::from(tar_name));
        let size = self::tar::decompress(artifact.archive(), &scratch.0).await?;
        log::debug!("decompressed {} bytes of tar", size);
        let tar_path = scratch.0.clone();
        let extract_root = rootfs.clone();
        task::spawn_blocking(move || self::tar::extract(&tar_path, &extract_root)).await??;
        drop(scratch);

        self.events.emit(TerminalEvent::status("configuring rootfs"));
        let bootstrap = self
            .assets
            .read(BOOTSTRAP_SCRIPT)
            .map_err(|source| InstallError::Asset {
                name: BOOTSTRAP_SCRIPT.to_string(),
                source,
            })?;
        let installation = self.installation.clone();
        task::spawn_blocking(move || configure(&installation, &bootstrap)).await?
    }

    async fn remove_partial(&self) {
        for result in [
            remove_tree(self.installation.rootfs_dir()).await,
            remove_file(self.installation.bootstrap_script()).await,
        ] {
            if let Err(err) = result {
                log::error!("cleanup after failed install: {}", err);
            }
        }
    }

    /// Delete the installation, rootfs and all
    ///
    /// Uninstalling something that isn't there succeeds.
    pub async fn uninstall(&self) -> Result<(), InstallError> {
        self.events.emit(TerminalEvent::status("removing rootfs"));
        remove_tree(self.installation.install_dir()).await?;
        Ok(())
    }
}

async fn remove_tree(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn remove_file(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Lay out the guest directories, drop in the bootstrap script, and write the
/// marker last
fn configure(installation: &RootfsInstallation, bootstrap: &[u8]) -> Result<(), InstallError> {
    let root = fs::canonicalize(installation.rootfs_dir())?;
    let home = installation.guest_home.clone();
    let dirs = GUEST_DIRS
        .iter()
        .map(PathBuf::from)
        .chain(vec![home.clone(), home.join("projects")]);
    for dir in dirs {
        let path = root.join(&dir);
        ensure_dir_within(&root, &path)?;
        fs::create_dir_all(&path)?;
    }

    let script = installation.bootstrap_script();
    fs::write(script, bootstrap)?;
    fs::set_permissions(script, fs::Permissions::from_mode(0o755))?;

    let marker = root.join(MARKER_FILE);
    prepare_destination(&marker)?;
    fs::write(&marker, concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), "\n"))?;
    log::info!("rootfs configured at {:?}", root);
    Ok(())
}
