//! Remembering the shell's working directory across restarts
//!
//! The guest shell writes `pwd` into a file under its home directory after
//! every command. The host reads it back when the session starts again.

use crate::rootfs::RootfsInstallation;
use std::{fs, io, path::PathBuf};

/// Name of the shell function that records the working directory
pub const HOOK: &str = "__rootbox_save_cwd";

/// Per-user state directory, relative to the guest home
pub const STATE_DIR: &str = ".rootbox";

const CWD_FILE: &str = "cwd";
const SNIPPET_FILE: &str = "session.sh";

/// Quote a string for a POSIX shell
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Host-side view of the persisted working directory
#[derive(Clone, Debug)]
pub struct CwdStore {
    rootfs: PathBuf,
    state_dir: PathBuf,
    guest_home: String,
}

impl CwdStore {
    pub fn new(installation: &RootfsInstallation) -> Self {
        let home = installation.guest_home();
        let guest_home = match home.strip_prefix(installation.rootfs_dir()) {
            Ok(relative) => format!("/{}", relative.display()),
            Err(_) => "/".to_string(),
        };
        CwdStore {
            rootfs: installation.rootfs_dir().to_path_buf(),
            state_dir: home.join(STATE_DIR),
            guest_home,
        }
    }

    /// Host path of the file holding the last working directory
    pub fn file(&self) -> PathBuf {
        self.state_dir.join(CWD_FILE)
    }

    /// Host path of the snippet sourced when the shell starts
    pub fn snippet_file(&self) -> PathBuf {
        self.state_dir.join(SNIPPET_FILE)
    }

    pub fn guest_home(&self) -> &str {
        &self.guest_home
    }

    /// The persisted directory, if it still names a directory in the rootfs
    pub fn load(&self) -> Option<String> {
        let text = fs::read_to_string(self.file()).ok()?;
        let dir = text.trim_end_matches(|c| c == '\n' || c == '\r');
        if !dir.starts_with('/') {
            log::debug!("ignoring relative persisted cwd {:?}", dir);
            return None;
        }
        let host = self.rootfs.join(dir.trim_start_matches('/'));
        let root = fs::canonicalize(&self.rootfs).ok()?;
        match fs::canonicalize(&host) {
            Ok(resolved) if resolved.starts_with(&root) && resolved.is_dir() => {
                Some(dir.to_string())
            }
            _ => {
                log::debug!("persisted cwd {:?} is not a directory in the rootfs", dir);
                None
            }
        }
    }

    /// Where a new shell should start
    pub fn initial_dir(&self) -> String {
        self.load().unwrap_or_else(|| self.guest_home.clone())
    }

    /// Write the snippet that enters `initial_dir` and installs the hook
    pub fn write_snippet(&self, initial_dir: &str) -> io::Result<()> {
        fs::create_dir_all(&self.state_dir)?;
        fs::write(self.snippet_file(), snippet(initial_dir))
    }
}

/// Shell text sourced at the start of every session
///
/// Paths go through `$HOME` so the snippet doesn't care where the rootfs
/// sits on the host.
pub fn snippet(initial_dir: &str) -> String {
    format!(
        "{hook}() {{ pwd > \"$HOME/{state}/{file}\" 2>/dev/null; }}\n\
         cd {dir} 2>/dev/null || cd \"$HOME\"\n\
         PROMPT_COMMAND={hook}\n\
         {hook}\n",
        hook = HOOK,
        state = STATE_DIR,
        file = CWD_FILE,
        dir = shell_quote(initial_dir),
    )
}

/// First line written to a new shell
pub fn source_line() -> String {
    format!(". \"$HOME/{}/{}\"\n", STATE_DIR, SNIPPET_FILE)
}

/// Line written after every command so the directory is saved even when the
/// shell has no prompt hooks
pub fn hook_line() -> String {
    format!("{} 2>/dev/null\n", HOOK)
}
