//! The per-invocation state directory.
//!
//! Holds the documented entries (`lock`, `child_pid`, `api.sock`, `netns`);
//! drivers keep private files under `<state>/<driverName>/`. The directory
//! lives for the parent's entire lifetime and is removed at termination.

use crate::errors::StateDirError;
use nix::fcntl::{Flock, FlockArg};
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

pub const STATE_FILE_LOCK: &str = "lock";
/// Decimal pid number text, mode 0444.
pub const STATE_FILE_CHILD_PID: &str = "child_pid";
/// REST API socket.
pub const STATE_FILE_API_SOCK: &str = "api.sock";
/// Bind-mount of the child's detached network namespace.
pub const STATE_FILE_NETNS: &str = "netns";

/// Take the exclusive advisory lock on `<state>/lock`.
///
/// The lock is held for as long as the returned guard is alive. A holder
/// elsewhere turns into a busy error telling the user to pick another
/// directory.
pub fn lock_state_dir(dir: &Path) -> Result<Flock<File>, StateDirError> {
    let lock_path = dir.join(STATE_FILE_LOCK);
    let file = File::create(&lock_path).map_err(|source| StateDirError::Io {
        path: lock_path.clone(),
        source,
    })?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock)
        .map_err(|(_, _)| StateDirError::Busy(lock_path))
}

/// Take a shared advisory lock on the directory itself.
///
/// This inhibits systemd-tmpfiles from aging out a `/tmp/<state>` directory
/// while the parent is alive. Distinct from the `lock` file, which stays for
/// compatibility with existing consumers. Failure is only worth a warning.
pub fn inhibit_tmpfiles_cleanup(dir: &Path) -> Option<Flock<File>> {
    let file = match File::open(dir) {
        Ok(file) => file,
        Err(err) => {
            log::warn!("failed to open the state dir {}: {}", dir.display(), err);
            return None;
        }
    };
    match Flock::lock(file, FlockArg::LockSharedNonblock) {
        Ok(guard) => Some(guard),
        Err((_, errno)) => {
            log::warn!("failed to lock the state dir {}: {}", dir.display(), errno);
            None
        }
    }
}

/// Create the directory if needed and delete everything in it except `lock`.
///
/// A previous execution that crashed can leave residual sockets or a stale
/// `child_pid`; this recovers the directory to a clean slate under the same
/// exclusive lock the parent will take.
pub fn init_state_dir(dir: &Path) -> Result<(), StateDirError> {
    fs::create_dir_all(dir).map_err(|source| StateDirError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let _lock = lock_state_dir(dir)?;
    let entries = fs::read_dir(dir).map_err(|source| StateDirError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| StateDirError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_name() == STATE_FILE_LOCK {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|source| StateDirError::Io { path, source })?;
    }
    Ok(())
}

/// Verify the directory is absolute and exists.
pub fn check_state_dir(dir: &Path) -> Result<(), StateDirError> {
    if !dir.is_absolute() {
        return Err(StateDirError::NotAbsolute(dir.to_path_buf()));
    }
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        _ => Err(StateDirError::Inaccessible(dir.to_path_buf())),
    }
}

/// Create a unique state directory under the system temp dir.
/// Used when the user does not pass `--state-dir`.
pub fn create_default_state_dir() -> io::Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix("rootlesskit")
        .tempdir_in(std::env::temp_dir())?;
    // Ownership passes to the parent lifecycle, which removes it on exit.
    Ok(dir.into_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_removes_everything_but_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        fs::write(dir.join(STATE_FILE_LOCK), b"").unwrap();
        fs::write(dir.join(STATE_FILE_CHILD_PID), b"12345").unwrap();
        fs::write(dir.join(STATE_FILE_API_SOCK), b"").unwrap();
        fs::create_dir(dir.join("builtin")).unwrap();
        fs::write(dir.join("builtin").join("ctrl.sock"), b"").unwrap();

        init_state_dir(dir).unwrap();

        let names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![STATE_FILE_LOCK.to_string()]);
    }

    #[test]
    fn init_creates_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sub");
        init_state_dir(&dir).unwrap();
        assert!(dir.join(STATE_FILE_LOCK).exists());
    }

    #[test]
    fn second_lock_is_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let _held = lock_state_dir(dir).unwrap();
        let err = lock_state_dir(dir).unwrap_err();
        assert!(matches!(err, StateDirError::Busy(_)));
    }

    #[test]
    fn relative_state_dir_rejected() {
        let err = check_state_dir(Path::new("relative/state")).unwrap_err();
        assert!(matches!(err, StateDirError::NotAbsolute(_)));
    }
}
