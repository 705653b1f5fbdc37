//! Content-addressed predownload cache.
//!
//! Grounded on the teacher's `pool.rs`: a content-addressed pool directory
//! (files named by checksum) plus atomic write discipline (`.part` file,
//! `fsync`, rename into place) and an flock-guarded lock file protecting
//! concurrent writers, adapted from checksum-hardlink pooling (not needed
//! here, since the predownload cache has a single writer per path) down to
//! its write-once/read-many core.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use openssl::hash::{Hasher, MessageDigest};

use crate::error::TransferError;

fn sha256_hex(data: &[u8]) -> Result<String, TransferError> {
    let mut hasher =
        Hasher::new(MessageDigest::sha256()).map_err(|e| TransferError::Internal(e.to_string()))?;
    hasher
        .update(data)
        .map_err(|e| TransferError::Internal(e.to_string()))?;
    let digest = hasher.finish().map_err(|e| TransferError::Internal(e.to_string()))?;
    Ok(hex::encode(digest))
}

/// A lock guard over the cache root, held for the duration of a write.
/// Dropping it releases the flock.
pub struct CacheLockGuard {
    _lock: File,
}

/// A single on-disk predownload cache rooted at `root`, storing files keyed
/// by their sha256 digest under `root/sha256/<hex>`.
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub fn open(root: &Path) -> Result<Self, TransferError> {
        fs::create_dir_all(root.join("sha256")).map_err(|e| TransferError::Internal(e.to_string()))?;
        Ok(Self { root: root.to_path_buf() })
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn lock(&self) -> Result<CacheLockGuard, TransferError> {
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.lock_path())
            .map_err(|e| TransferError::Internal(e.to_string()))?;
        flock(lock.as_raw_fd(), FlockArg::LockExclusive).map_err(|e| TransferError::Internal(e.to_string()))?;
        Ok(CacheLockGuard { _lock: lock })
    }

    fn path_for(&self, sha256_hex: &str) -> PathBuf {
        self.root.join("sha256").join(sha256_hex)
    }

    pub fn contains(&self, sha256_hex: &str) -> bool {
        self.path_for(sha256_hex).exists()
    }

    /// Read back a cached entry, verifying its digest still matches the
    /// file name (guards against on-disk corruption, not just trusting the
    /// path).
    pub fn get_verified(&self, sha256_hex: &str) -> Result<Option<Vec<u8>>, TransferError> {
        let path = self.path_for(sha256_hex);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).map_err(|e| TransferError::Internal(e.to_string()))?;
        if sha256_hex_of(&data)? != sha256_hex {
            return Err(TransferError::Internal(format!(
                "cache entry {sha256_hex} failed digest verification"
            )));
        }
        Ok(Some(data))
    }

    /// Store `data` under its own sha256 digest, returning the digest used.
    /// Writes go through a sibling `.part` file, fsynced, then renamed into
    /// place so a reader never observes a half-written entry.
    pub fn put(&self, _guard: &CacheLockGuard, data: &[u8]) -> Result<String, TransferError> {
        let digest = sha256_hex(data)?;
        let target = self.path_for(&digest);
        if target.exists() {
            return Ok(digest);
        }

        let part = target.with_extension("part");
        {
            let mut file = File::create(&part).map_err(|e| TransferError::Internal(e.to_string()))?;
            file.write_all(data).map_err(|e| TransferError::Internal(e.to_string()))?;
            file.sync_all().map_err(|e| TransferError::Internal(e.to_string()))?;
            let mut perms = file
                .metadata()
                .map_err(|e| TransferError::Internal(e.to_string()))?
                .permissions();
            perms.set_mode(0o644);
            file.set_permissions(perms)
                .map_err(|e| TransferError::Internal(e.to_string()))?;
        }
        fs::rename(&part, &target).map_err(|e| TransferError::Internal(e.to_string()))?;
        Ok(digest)
    }

    /// Remove cache entries not present in `keep` (a set of sha256 hex
    /// digests), freeing space for entries no longer referenced by any
    /// repository.
    pub fn gc(&self, _guard: &CacheLockGuard, keep: &[String]) -> Result<(usize, u64), TransferError> {
        let mut removed_count = 0usize;
        let mut removed_bytes = 0u64;
        let dir = self.root.join("sha256");
        for entry in fs::read_dir(&dir).map_err(|e| TransferError::Internal(e.to_string()))? {
            let entry = entry.map_err(|e| TransferError::Internal(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.iter().any(|k| k == &name) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| TransferError::Internal(e.to_string()))?;
            removed_bytes += meta.len();
            removed_count += 1;
            fs::remove_file(entry.path()).map_err(|e| TransferError::Internal(e.to_string()))?;
        }
        Ok((removed_count, removed_bytes))
    }
}

fn sha256_hex_of(data: &[u8]) -> Result<String, TransferError> {
    sha256_hex(data)
}
