//! Single-flight run lock: a non-blocking exclusive `flock()` on a lock file.
//!
//! The lock is released when the guard drops or the process exits, so a
//! crashed run never wedges the next one. It is host-local; fleet-wide
//! single-flight needs the lock file on storage every host shares.

#![allow(missing_docs)]

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::core::errors::{IngestError, Result};

/// Held for the duration of one run.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    #[cfg(unix)]
    _guard: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl RunLock {
    /// Take the lock or fail immediately with [`IngestError::LockBusy`].
    pub fn try_acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| IngestError::io(parent, e))?;
        }
        let file = open_lock_file(path)?;

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::fcntl::{Flock, FlockArg};

            #[allow(deprecated)]
            let mut guard = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(
                |(_file, errno)| {
                    if errno == Errno::EWOULDBLOCK {
                        IngestError::LockBusy {
                            path: path.to_path_buf(),
                        }
                    } else {
                        IngestError::Runtime {
                            details: format!("failed to lock {}: {errno}", path.display()),
                        }
                    }
                },
            )?;
            write_owner(&mut guard, path);
            Ok(Self {
                path: path.to_path_buf(),
                _guard: guard,
            })
        }

        #[cfg(not(unix))]
        {
            let mut file = file;
            write_owner(&mut file, path);
            Ok(Self {
                path: path.to_path_buf(),
                _file: file,
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(|e| IngestError::io(path, e))
}

/// Record the holder's pid for operators. Best-effort.
fn write_owner(file: &mut File, path: &Path) {
    use std::io::{Seek, SeekFrom, Write};

    let result = file
        .set_len(0)
        .and_then(|()| file.seek(SeekFrom::Start(0)))
        .and_then(|_| writeln!(file, "{}", std::process::id()));
    if let Err(e) = result {
        eprintln!("[GPI-LOCK] could not record pid in {}: {e}", path.display());
    }
}
