//! Cached cluster roots, shared across tests and test processes.
//!
//! A snapshot is a directory in a worker-shared cache, keyed by a
//! caller-chosen identity string. Building one is expensive, so access is
//! serialized by a compound lock: an in-process mutex taken first, then an
//! exclusive file lock, in that fixed order. Releasing happens in reverse.
//! Taking the file lock first would let two threads deadlock with each
//! holding one half of the pair.
//!
//! `initialized.marker` existence is the single source of truth for whether
//! a snapshot is usable. A crashed run leaves no marker, so the next run
//! discards whatever partial payload exists and rebuilds. The marker's
//! contents carry a compatibility tag so a cached snapshot built for a
//! different cluster shape is rebuilt rather than reused.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::Mutex;
use parking_lot::RawMutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::errors::StorageError;
use crate::process::CommandRunner;
use crate::process::RunSpec;
use crate::Result;

const LOCK_FILE_NAME: &str = "initializing.flock";
const MARKER_FILE_NAME: &str = "initialized.marker";
const PAYLOAD_DIR_NAME: &str = "snapshot";

/// Directory cache of initialized cluster roots, keyed by identity string.
#[derive(Debug)]
pub struct SnapshotStore {
    cache_root: PathBuf,
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SnapshotStore {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Handle for the snapshot with this identity. Cheap; nothing is locked
    /// or created until [`SnapshotDir::lock`].
    pub fn snapshot_dir(&self, ident: &str) -> SnapshotDir {
        let thread_lock = self
            .thread_locks
            .lock()
            .entry(ident.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        SnapshotDir {
            ident: ident.to_owned(),
            path: self.cache_root.join(ident),
            thread_lock,
        }
    }
}

/// One identity's slot in the cache.
#[derive(Debug)]
pub struct SnapshotDir {
    ident: String,
    path: PathBuf,
    thread_lock: Arc<Mutex<()>>,
}

impl SnapshotDir {
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Acquire the compound lock, blocking on contention.
    ///
    /// Thread mutex first, file lock second. Both halves block rather than
    /// error; contention here is the expected case when parallel tests want
    /// the same snapshot.
    pub fn lock(&self) -> Result<SnapshotDirLocked<'_>> {
        std::fs::create_dir_all(&self.path).map_err(|source| StorageError::Path {
            path: self.path.clone(),
            source,
        })?;
        debug!("Waiting for snapshot lock: {}", self.ident);
        let thread_guard = self.thread_lock.lock_arc();
        let lock_path = self.path.join(LOCK_FILE_NAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StorageError::Path {
                path: lock_path.clone(),
                source,
            })?;
        lock_file
            .lock_exclusive()
            .map_err(|source| StorageError::Path {
                path: lock_path,
                source,
            })?;
        debug!("Acquired snapshot lock: {}", self.ident);
        Ok(SnapshotDirLocked {
            dir: self,
            lock_file,
            _thread_guard: thread_guard,
        })
    }
}

/// Exclusive access to a snapshot slot.
///
/// Dropping releases the file lock before the thread mutex, the reverse of
/// acquisition order.
pub struct SnapshotDirLocked<'a> {
    dir: &'a SnapshotDir,
    // Field order is drop order: the file closes (releasing the flock)
    // before the thread mutex unlocks.
    lock_file: File,
    _thread_guard: ArcMutexGuard<RawMutex, ()>,
}

impl fmt::Debug for SnapshotDirLocked<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotDirLocked")
            .field("dir", &self.dir)
            .field("lock_file", &self.lock_file)
            .finish_non_exhaustive()
    }
}

impl SnapshotDirLocked<'_> {
    pub fn ident(&self) -> &str {
        &self.dir.ident
    }

    /// The payload directory holding the cached cluster root.
    pub fn path(&self) -> PathBuf {
        self.dir.path.join(PAYLOAD_DIR_NAME)
    }

    fn marker_path(&self) -> PathBuf {
        self.dir.path.join(MARKER_FILE_NAME)
    }

    /// Usable iff the marker exists and its tag matches the requested
    /// cluster shape. A mismatched tag reads as uninitialized so the caller
    /// rebuilds instead of reusing an incompatible payload.
    pub fn is_initialized(&self, tag: &str) -> bool {
        let marker = self.marker_path();
        match std::fs::read_to_string(&marker) {
            Ok(contents) if contents.trim() == tag => true,
            Ok(contents) => {
                warn!(
                    "Snapshot {} marker tag mismatch: cached `{}`, want `{tag}`",
                    self.dir.ident,
                    contents.trim()
                );
                false
            }
            Err(_) => false,
        }
    }

    pub fn set_initialized(&self, tag: &str) -> Result<()> {
        let marker = self.marker_path();
        std::fs::write(&marker, tag).map_err(|source| StorageError::Path {
            path: marker,
            source,
        })?;
        info!("Snapshot {} marked initialized", self.dir.ident);
        Ok(())
    }

    /// Discard the payload and marker so the slot reads as absent. Safe on
    /// an already-empty slot.
    pub fn clear(&self) -> Result<()> {
        let marker = self.marker_path();
        if marker.exists() {
            std::fs::remove_file(&marker).map_err(|source| StorageError::Path {
                path: marker,
                source,
            })?;
        }
        let payload = self.path();
        if payload.exists() {
            info!("Discarding stale snapshot payload: {}", payload.display());
            std::fs::remove_dir_all(&payload).map_err(|source| StorageError::Path {
                path: payload,
                source,
            })?;
        }
        Ok(())
    }
}

impl Drop for SnapshotDirLocked<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.lock_file) {
            warn!("Failed to release snapshot lock {}: {e}", self.dir.ident);
        }
        debug!("Released snapshot lock: {}", self.dir.ident);
    }
}

/// Copy-on-write cloning of snapshot payloads via overlay mounts.
///
/// Upper and work directories for each mount live under the worker's overlay
/// state directory. Mounting requires passwordless sudo, which is why the
/// whole mode sits behind a worker-context flag.
#[derive(Debug)]
pub struct OverlayState {
    state_dir: PathBuf,
}

impl OverlayState {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn upper_dir(&self, ident: &str) -> PathBuf {
        self.state_dir.join(ident).join("upper")
    }

    fn work_dir(&self, ident: &str) -> PathBuf {
        self.state_dir.join(ident).join("work")
    }

    /// Mount `lower` read-only under `dst` with a fresh writable upper
    /// layer. A stale mount at `dst` from a crashed run is unmounted first.
    pub async fn mount(
        &self,
        runner: &CommandRunner,
        ident: &str,
        lower: &Path,
        dst: &Path,
    ) -> Result<()> {
        if overlay_mounts_beneath(dst)?.contains(&dst.to_path_buf()) {
            warn!("Unmounting stale overlay at {}", dst.display());
            self.unmount(runner, dst).await?;
        }
        let upper = self.upper_dir(ident);
        let work = self.work_dir(ident);
        for dir in [upper.as_path(), work.as_path(), dst] {
            std::fs::create_dir_all(dir).map_err(|source| StorageError::Path {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        info!("Mounting overlay at {}: {options}", dst.display());
        runner
            .run(
                RunSpec::new("sudo")
                    .args(["mount", "-t", "overlay", "overlay", "-o"])
                    .arg(options)
                    .arg(dst.display().to_string()),
            )
            .await?;
        Ok(())
    }

    pub async fn unmount(&self, runner: &CommandRunner, dst: &Path) -> Result<()> {
        runner
            .run(RunSpec::new("sudo").arg("umount").arg(dst.display().to_string()))
            .await?;
        Ok(())
    }

    /// Unmount `mountpoint` and move the accumulated upper layer to `dst`,
    /// so the writes made through the overlay become plain directory
    /// contents at the destination.
    pub async fn unmount_and_move(
        &self,
        runner: &CommandRunner,
        ident: &str,
        mountpoint: &Path,
        dst: &Path,
    ) -> Result<()> {
        self.unmount(runner, mountpoint).await?;
        let upper = self.upper_dir(ident);
        if dst.exists() {
            std::fs::remove_dir_all(dst).map_err(|source| StorageError::Path {
                path: dst.to_path_buf(),
                source,
            })?;
        }
        std::fs::rename(&upper, dst).map_err(|source| StorageError::Path {
            path: upper,
            source,
        })?;
        let work = self.work_dir(ident);
        if work.exists() {
            std::fs::remove_dir_all(&work).map_err(|source| StorageError::Path {
                path: work,
                source,
            })?;
        }
        Ok(())
    }

    /// Unmount every overlay still mounted beneath `root`; error if any
    /// unmount fails or mounts remain afterwards.
    pub async fn unmount_all_beneath(&self, runner: &CommandRunner, root: &Path) -> Result<()> {
        for mountpoint in overlay_mounts_beneath(root)? {
            self.unmount(runner, &mountpoint).await?;
        }
        let leftover = overlay_mounts_beneath(root)?;
        if !leftover.is_empty() {
            return Err(StorageError::Overlay(format!(
                "overlay mounts remain beneath {}: {leftover:?}",
                root.display()
            ))
            .into());
        }
        Ok(())
    }
}

/// Overlay mountpoints at or beneath `root`, from `/proc/mounts`.
pub fn overlay_mounts_beneath(root: &Path) -> Result<Vec<PathBuf>> {
    let mounts =
        std::fs::read_to_string("/proc/mounts").map_err(|source| StorageError::Path {
            path: PathBuf::from("/proc/mounts"),
            source,
        })?;
    let mut found = Vec::new();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let mountpoint = fields.next();
        let fstype = fields.next();
        if let (Some(mountpoint), Some("overlay")) = (mountpoint, fstype) {
            let mountpoint = PathBuf::from(mountpoint);
            if mountpoint.starts_with(root) {
                found.push(mountpoint);
            }
        }
    }
    Ok(found)
}
