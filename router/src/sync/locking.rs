use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use sha2::{Digest, Sha256};
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Failed to open lock file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Lock file {0} is held by another job router with the same name")]
    Held(PathBuf),
    #[error("Failed to lock {path}: {errno}")]
    Lock { path: PathBuf, errno: Errno },
}

/// Exclusive advisory lock guaranteeing a single router per identity
///
/// The lock is released when the value is dropped or the process exits.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

impl InstanceLock {
    /// `<directory>/<sha256 of identity>.job_router.lock`
    pub fn lock_path(identity: &str, directory: &Path) -> PathBuf {
        let digest = hex::encode(Sha256::digest(identity.as_bytes()));

        directory.join(format!("{digest}.job_router.lock"))
    }

    pub fn acquire(identity: &str, directory: &Path) -> Result<Self, LockError> {
        let path = Self::lock_path(identity, directory);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Open {
                path: path.clone(),
                source,
            })?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                info!(lock = ?path, identity, "Acquired instance lock");
                Ok(Self { path, file })
            }
            Err(Errno::EWOULDBLOCK) => Err(LockError::Held(path)),
            Err(errno) => Err(LockError::Lock { path, errno }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        match flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            Ok(()) => debug!(lock = ?self.path, "Released instance lock"),
            Err(error) => error!(error = ?error, "Failed to release instance lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_instance_with_same_identity_is_refused() {
        let directory = tempfile::tempdir().unwrap();

        let first = InstanceLock::acquire("jobrouter", directory.path()).unwrap();
        assert!(matches!(
            InstanceLock::acquire("jobrouter", directory.path()),
            Err(LockError::Held(_))
        ));
        // different identities do not contend
        assert!(InstanceLock::acquire("other", directory.path()).is_ok());

        drop(first);
        assert!(InstanceLock::acquire("jobrouter", directory.path()).is_ok());
    }

    #[test]
    fn lock_path_is_a_digest_of_the_identity() {
        let path = InstanceLock::lock_path("jobrouter", Path::new("/tmp"));
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();

        assert!(file_name.ends_with(".job_router.lock"));
        assert_eq!(file_name.len(), 64 + ".job_router.lock".len());
        assert_ne!(path, InstanceLock::lock_path("other", Path::new("/tmp")));
    }

    #[test]
    fn missing_directory_fails_to_open() {
        let directory = tempfile::tempdir().unwrap();

        assert!(matches!(
            InstanceLock::acquire("jobrouter", &directory.path().join("missing")),
            Err(LockError::Open { .. })
        ));
    }
}
