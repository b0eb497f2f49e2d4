//! Error types you might see while installing, orchestrating, or running a
//! session

use std::path::PathBuf;
use thiserror::Error;

/// Errors while fetching a rootfs archive or its checksum
#[derive(Error, Debug)]
pub enum DownloadError {
    /// network request error
    #[error("network request error: {0}")]
    Network(#[from] reqwest::Error),

    /// server answered with a non-success status
    #[error("download of {url} failed with status {status}")]
    Status {
        url: url::Url,
        status: reqwest::StatusCode,
    },

    /// checksum body was empty
    #[error("checksum response was empty")]
    EmptyChecksum,

    /// checksum body did not start with a sha256 hex digest
    #[error("checksum response is not a sha256 hex digest: {0:?}")]
    MalformedChecksum(String),

    /// storage io error
    #[error("storage io error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Errors during rootfs installation
///
/// Checksum mismatches and path traversal attempts are security errors, see
/// [InstallError::is_security()]. They are always fatal to the install and
/// never retried automatically.
#[derive(Error, Debug)]
pub enum InstallError {
    /// the archive could not be fetched
    #[error("rootfs download failed: {0}")]
    Download(#[from] DownloadError),

    /// calculated digest of the downloaded archive is not what we asked for
    #[error("rootfs checksum mismatch, expected {expected}, found {found}")]
    ChecksumMismatch { expected: String, found: String },

    /// an archive entry would land outside the rootfs
    #[error("archive entry escapes the rootfs: {0:?}")]
    PathTraversal(PathBuf),

    /// hard link refers to a file that was not extracted before it
    #[error("hard link target missing: {0:?}")]
    MissingLinkTarget(PathBuf),

    /// tar file format error
    #[error("tar file format error: {0}")]
    TarFile(String),

    /// a bundled asset could not be read
    #[error("bundled asset {name:?} unavailable: {source}")]
    Asset {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// storage io error
    #[error("storage io error: {0}")]
    Storage(#[from] std::io::Error),

    /// asynchronous task failed during installation
    #[error("asynchronous task failed during installation: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl InstallError {
    /// Is this a checksum or path traversal failure
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            InstallError::ChecksumMismatch { .. } | InstallError::PathTraversal(_)
        )
    }
}

/// Errors from backend provisioning and the guest service lifecycle
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// rootfs installation failed on the userspace-distro path
    #[error("rootfs installation failed: {0}")]
    Install(#[from] InstallError),

    /// guest environment could not be created or configured
    #[error("guest environment could not be provisioned: {0}")]
    Provision(String),

    /// guest service failed to launch
    #[error("guest service failed to start: {0}")]
    Start(String),

    /// readiness endpoint never answered with success
    #[error("guest service not ready after {attempts} health checks")]
    HealthTimeout { attempts: u32 },

    /// control script exited unsuccessfully
    #[error("control script `{verb}` exited with {code:?}: {stderr}")]
    ControlScript {
        verb: String,
        code: Option<i32>,
        stderr: String,
    },

    /// no guest is provisioned (local mode, or not initialized)
    #[error("no guest environment is provisioned")]
    NoGuest,

    /// network client error
    #[error("network client error: {0}")]
    Network(#[from] reqwest::Error),

    /// io error
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
}

/// Errors from the interactive shell session
#[derive(Error, Debug)]
pub enum SessionError {
    /// isolation wrapper binary is missing
    #[error("isolation wrapper not found: {0}")]
    WrapperMissing(String),

    /// rootfs is not (completely) installed
    #[error("rootfs is not installed at {0:?}")]
    RootfsMissing(PathBuf),

    /// no live shell process
    #[error("shell session is not running")]
    NotRunning,

    /// shell input stream did not become ready in time
    #[error("shell input not ready after {attempts} attempts")]
    InputNotReady { attempts: u32 },

    /// io error while talking to the shell
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
}

/// Errors from the completion cache layer
#[derive(Error, Debug)]
pub enum CompletionError {
    /// provider name is not one we know how to talk to
    #[error("unsupported inference provider: {0:?}")]
    UnsupportedProvider(String),

    /// the completion service failed
    #[error("completion service failed: {message}")]
    Service {
        message: String,
        status: Option<u16>,
    },
}

/// Errors loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// can't determine where to keep installed data
    #[error("can't determine where to keep installed data")]
    NoDefaultDataDir,

    /// can't determine where to cache downloads
    #[error("can't determine where to cache downloads")]
    NoDefaultCacheDir,

    /// invalid url in configuration
    #[error("invalid url in configuration: {0}")]
    Url(#[from] url::ParseError),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// io error reading configuration
    #[error("io error reading configuration: {0}")]
    IO(#[from] std::io::Error),
}
