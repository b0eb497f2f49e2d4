//! Read-only access to files bundled with the application

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

/// Name of the bootstrap script asset copied into every installation
pub const BOOTSTRAP_SCRIPT: &str = "bootstrap.sh";

/// Directory of UI assets copied into the local workspace in local mode
pub const WEBIDE_DIR: &str = "webide";

static BUNDLED: &[(&str, &[u8])] = &[
    (BOOTSTRAP_SCRIPT, include_bytes!("../assets/bootstrap.sh")),
    ("webide/index.html", include_bytes!("../assets/webide/index.html")),
];

/// Source of bundled, read-only assets
pub trait AssetSource: fmt::Debug + Send + Sync {
    /// Read one asset by its slash-separated name
    fn read(&self, name: &str) -> io::Result<Vec<u8>>;

    /// Names of the assets directly inside `dir`, relative to `dir`
    fn list(&self, dir: &str) -> io::Result<Vec<String>>;
}

/// Assets compiled into the binary
#[derive(Clone, Copy, Debug, Default)]
pub struct BundledAssets;

impl AssetSource for BundledAssets {
    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        BUNDLED
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, data)| data.to_vec())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }

    fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Ok(BUNDLED
            .iter()
            .filter_map(|(n, _)| n.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }
}

/// Assets read from a directory on disk, for overriding the bundled ones
#[derive(Clone, Debug)]
pub struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        DirAssets {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let mut path = self.root.clone();
        for part in name.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad asset name {:?}", name),
                ));
            }
            path.push(part);
        }
        Ok(path)
    }
}

impl AssetSource for DirAssets {
    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(name)?)
    }

    fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.resolve(dir)?)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}
