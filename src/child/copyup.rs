//! The tmpfs+symlink copy-up engine.
//!
//! Makes a directory writable inside the child without touching the host:
//! the original is bind-mounted aside, a tmpfs goes over the directory, the
//! bind is moved to a `.ro-*` subdirectory of the tmpfs, and every original
//! entry reappears as a symlink into it. Writes land in the tmpfs; reads of
//! untouched entries still hit the host content through the bind.

use crate::errors::LifecycleError;
use nix::mount::{mount, MsFlags};
use std::{
    fs,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

pub fn copy_up(dirs: &[PathBuf]) -> Result<Vec<PathBuf>, LifecycleError> {
    if dirs.is_empty() {
        return Ok(Vec::new());
    }
    // bind0 lives outside the state dir so /run can be copied up even when
    // the state dir is under /run.
    let bind0 = tempfile::Builder::new()
        .prefix("rootlesskit-b")
        .tempdir_in("/tmp")?;
    let mut copied = Vec::new();
    for dir in dirs {
        copy_up_one(dir, bind0.path())?;
        copied.push(dir.clone());
    }
    Ok(copied)
}

fn copy_up_one(dir: &Path, bind0: &Path) -> Result<(), LifecycleError> {
    if dir == Path::new("/tmp") {
        return Err(LifecycleError::Usage(
            "/tmp cannot be copied up".to_string(),
        ));
    }
    let mount_err = |target: &Path, fstype: &'static str, errno| LifecycleError::Mount {
        target: target.to_path_buf(),
        fstype,
        errno,
    };
    mount(
        Some(dir),
        bind0,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|errno| mount_err(dir, "bind", errno))?;
    mount(
        Some("none"),
        dir,
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|errno| mount_err(dir, "tmpfs", errno))?;
    let bind1 = tempfile::Builder::new()
        .prefix(".ro")
        .tempdir_in(dir)?
        .into_path();
    mount(
        Some(bind0),
        &bind1,
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .map_err(|errno| mount_err(&bind1, "move", errno))?;

    let bind1_name = PathBuf::from(bind1.file_name().unwrap());
    for entry in fs::read_dir(&bind1)? {
        let entry = entry?;
        let name = entry.file_name();
        let link_src = if entry.file_type()?.is_symlink() {
            fs::read_link(entry.path())?
        } else {
            bind1_name.join(&name)
        };
        let link_dst = dir.join(&name);
        // `mount` may have dropped an mtab into the fresh tmpfs already.
        if link_dst.exists() || link_dst.is_symlink() {
            if link_dst.is_dir() && !link_dst.is_symlink() {
                fs::remove_dir_all(&link_dst)?;
            } else {
                fs::remove_file(&link_dst)?;
            }
        }
        symlink(&link_src, &link_dst)?;
    }
    log::debug!("copied up {}", dir.display());
    Ok(())
}
