use crate::errors::InstallError;
use async_compression::tokio::write::GzipDecoder;
use std::{
    fs,
    io::{self, Read},
    os::unix::fs::{symlink, PermissionsExt},
    path::{Component, Path, PathBuf},
};
use tar::{Archive, Entry, EntryType};
use tokio::io::AsyncWriteExt;

/// What came out of one archive
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExtractStats {
    pub directories: usize,
    pub files: usize,
    pub symlinks: usize,
    pub hardlinks: usize,
    pub skipped: usize,
}

/// Decompress a gzip archive into a plain tar file
pub async fn decompress(archive: &Path, tar_path: &Path) -> Result<u64, InstallError> {
    let mut input = tokio::fs::File::open(archive).await?;
    let output = tokio::fs::File::create(tar_path).await?;
    let mut decoder = GzipDecoder::new(output);
    let result = async {
        let size = tokio::io::copy(&mut input, &mut decoder).await?;
        decoder.shutdown().await?;
        Ok::<u64, io::Error>(size)
    }
    .await;
    match result {
        Ok(size) => Ok(size),
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            Err(InstallError::TarFile(format!("gzip stream: {}", err)))
        }
        Err(err) => Err(err.into()),
    }
}

/// Extract a plain tar file below `root`, which must already exist
///
/// This does blocking io, run it with `spawn_blocking`.
pub fn extract(tar_path: &Path, root: &Path) -> Result<ExtractStats, InstallError> {
    let canonical_root = fs::canonicalize(root)?;
    let mut stats = ExtractStats::default();
    let mut archive = Archive::new(fs::File::open(tar_path)?);
    for entry in archive.entries().map_err(tar_error)? {
        let entry = entry.map_err(tar_error)?;
        extract_entry(&canonical_root, entry, &mut stats)?;
    }
    log::debug!("extracted {:?} into {:?}", stats, root);
    Ok(stats)
}

fn tar_error(err: io::Error) -> InstallError {
    InstallError::TarFile(err.to_string())
}

fn extract_entry<R: Read>(
    root: &Path,
    mut entry: Entry<'_, R>,
    stats: &mut ExtractStats,
) -> Result<(), InstallError> {
    let kind = entry.header().entry_type();
    let raw_path = entry.path().map_err(tar_error)?.into_owned();
    let relative = normalize(&raw_path)?;
    if relative.as_os_str().is_empty() {
        // the archive's own "./" entry
        return Ok(());
    }
    let dest = root.join(&relative);
    ensure_within(root, &dest)?;
    let mode = entry.header().mode().map_err(tar_error)? & 0o777;

    match kind {
        EntryType::Directory => {
            match fs::symlink_metadata(&dest) {
                Ok(meta) if meta.is_dir() => (),
                Ok(_) => {
                    fs::remove_file(&dest)?;
                    fs::create_dir_all(&dest)?;
                }
                Err(_) => fs::create_dir_all(&dest)?,
            }
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode | 0o700))?;
            stats.directories += 1;
        }
        EntryType::Regular | EntryType::Continuous => {
            prepare_destination(&dest)?;
            let mut file = fs::File::create(&dest)?;
            io::copy(&mut entry, &mut file)?;
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode | 0o600))?;
            stats.files += 1;
        }
        EntryType::Symlink => {
            let target = match entry.link_name().map_err(tar_error)? {
                Some(target) => target.into_owned(),
                None => {
                    return Err(InstallError::TarFile(format!(
                        "symlink without target: {:?}",
                        raw_path
                    )))
                }
            };
            prepare_destination(&dest)?;
            symlink(&target, &dest)?;
            stats.symlinks += 1;
        }
        EntryType::Link => {
            let target = match entry.link_name().map_err(tar_error)? {
                Some(target) => root.join(normalize(&target)?),
                None => {
                    return Err(InstallError::TarFile(format!(
                        "hard link without target: {:?}",
                        raw_path
                    )))
                }
            };
            ensure_within(root, &target)?;
            let target_meta = match fs::symlink_metadata(&target) {
                Ok(meta) => meta,
                Err(_) => return Err(InstallError::MissingLinkTarget(target)),
            };
            prepare_destination(&dest)?;
            if let Err(err) = fs::hard_link(&target, &dest) {
                log::debug!("hard link {:?} failed ({}), copying instead", dest, err);
                if target_meta.file_type().is_symlink() {
                    // copying would follow the link, maybe out of the rootfs
                    symlink(fs::read_link(&target)?, &dest)?;
                } else {
                    fs::copy(&target, &dest)?;
                }
            }
            stats.hardlinks += 1;
        }
        EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName
        | EntryType::GNULongLink => {
            log::trace!("skipping tar metadata entry {:?}", raw_path);
        }
        _ => {
            log::warn!(
                "skipping unsupported tar entry type {:?} at {:?}",
                kind,
                raw_path
            );
            stats.skipped += 1;
        }
    }
    Ok(())
}

/// Resolve `.` and `..` without touching the filesystem
///
/// Leading `/` is dropped so absolute names land inside the root. A `..` that
/// would climb above the root is a traversal attempt.
pub fn normalize(path: &Path) -> Result<PathBuf, InstallError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => (),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(InstallError::PathTraversal(path.to_path_buf()));
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Ok(out)
}

/// The deepest existing ancestor of `dest` must resolve inside `root`
///
/// `root` is already canonical. Symlinks planted by earlier entries are
/// followed by the canonicalization, so they can't redirect writes.
pub(crate) fn ensure_within(root: &Path, dest: &Path) -> Result<(), InstallError> {
    check_existing_ancestor(root, dest.parent(), dest)
}

/// Like [ensure_within()], but `dir` itself is also followed if it exists
pub(crate) fn ensure_dir_within(root: &Path, dir: &Path) -> Result<(), InstallError> {
    check_existing_ancestor(root, Some(dir), dir)
}

fn check_existing_ancestor(
    root: &Path,
    start: Option<&Path>,
    dest: &Path,
) -> Result<(), InstallError> {
    let mut ancestor = start;
    while let Some(dir) = ancestor {
        if fs::symlink_metadata(dir).is_ok() {
            return match fs::canonicalize(dir) {
                Ok(resolved) if resolved.starts_with(root) => Ok(()),
                _ => Err(InstallError::PathTraversal(dest.to_path_buf())),
            };
        }
        ancestor = dir.parent();
    }
    Err(InstallError::PathTraversal(dest.to_path_buf()))
}

/// Create the parent directories and clear out whatever is at `dest`
pub(crate) fn prepare_destination(dest: &Path) -> Result<(), InstallError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(dest)?,
        Ok(_) => fs::remove_file(dest)?,
        Err(_) => (),
    }
    Ok(())
}
