use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const FILE_UNLOCKED: u8 = 1;
const PARENT_UNLOCKED: u8 = 2;

#[cfg(unix)]
fn set_writable(path: &Path, writable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    let mode = perms.mode();
    perms.set_mode(if writable { mode | 0o200 } else { mode & !0o222 });
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_writable(path: &Path, writable: bool) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(!writable);
    fs::set_permissions(path, perms)
}

fn is_readonly(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.permissions().readonly())
        .unwrap_or(false)
}

pub fn set_path_readonly(path: &Path) -> io::Result<()> {
    set_writable(path, false)
}

pub fn unset_path_readonly(path: &Path) -> io::Result<()> {
    set_writable(path, true)
}

/// Makes a read-only destination (and its parent directory) writable for
/// the lifetime of the guard.
///
/// Whatever was unlocked is locked again when the guard drops, including
/// when the owning future is cancelled.
#[derive(Debug)]
pub struct PathUnlock {
    path: PathBuf,
    unlocked: u8,
}

impl PathUnlock {
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let mut guard = Self {
            path: path.to_path_buf(),
            unlocked: 0,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if parent.exists() && is_readonly(parent) {
                unset_path_readonly(parent)?;
                guard.unlocked |= PARENT_UNLOCKED;
            }
        }
        if path.exists() && is_readonly(path) {
            unset_path_readonly(path)?;
            guard.unlocked |= FILE_UNLOCKED;
        }
        Ok(guard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when anything had to be unlocked.
    pub fn changed(&self) -> bool {
        self.unlocked != 0
    }

    fn relock(&mut self) -> io::Result<()> {
        let unlocked = std::mem::take(&mut self.unlocked);
        let mut result = Ok(());
        if unlocked & FILE_UNLOCKED != 0 && self.path.exists() {
            result = set_path_readonly(&self.path);
        }
        if unlocked & PARENT_UNLOCKED != 0 {
            if let Some(parent) = self.path.parent() {
                let parent_result = set_path_readonly(parent);
                if result.is_ok() {
                    result = parent_result;
                }
            }
        }
        result
    }

    /// Restores the original permissions now, reporting failures.
    pub fn restore(mut self) -> io::Result<()> {
        self.relock()
    }
}

impl Drop for PathUnlock {
    fn drop(&mut self) {
        if let Err(error) = self.relock() {
            tracing::warn!(path = %self.path.display(), %error, "failed to restore read-only flag");
        }
    }
}
