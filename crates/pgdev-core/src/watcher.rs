//! Change watcher for the migration directory.
//!
//! Backed by inotify. Every directory under the watched root gets a watch,
//! and directories created later are watched as they appear. A reader thread
//! blocks on the inotify descriptor and hands changed paths to a debounce
//! task, which delivers them once the tree has been quiet for the debounce
//! period, one [`ChangeEvent`] per file, in path order. Deletions are not
//! reported.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Depth of the queue between the reader thread and the debounce task.
const RAW_QUEUE_DEPTH: usize = 256;

/// A file under the watched directory was created or rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Path of the changed file.
    pub path: PathBuf,
}

/// Timing of the change watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchPolicy {
    /// Quiet period required before pending changes are delivered.
    pub debounce: Duration,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(750),
        }
    }
}

/// A running watcher. Dropping it stops the reader and the debounce task.
#[derive(Debug)]
pub struct ChangeWatcher {
    dir: PathBuf,
    reader: os::Reader,
    task: JoinHandle<()>,
}

impl ChangeWatcher {
    /// Start watching `dir`, delivering events on `tx`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be watched, including on
    /// platforms without inotify.
    pub fn start(
        dir: &Path,
        policy: WatchPolicy,
        tx: mpsc::Sender<ChangeEvent>,
    ) -> io::Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_DEPTH);
        let reader = os::Reader::spawn(dir, raw_tx)?;
        debug!(dir = %dir.display(), "watching for changes");
        let task = tokio::spawn(debounce(raw_rx, policy, tx));
        Ok(Self {
            dir: dir.to_path_buf(),
            reader,
            task,
        })
    }

    /// The watched directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stop watching.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.reader.stop();
        self.task.abort();
    }
}

/// Collect raw paths until nothing arrives for `policy.debounce`, then
/// deliver them.
async fn debounce(
    mut raw: mpsc::Receiver<PathBuf>,
    policy: WatchPolicy,
    tx: mpsc::Sender<ChangeEvent>,
) {
    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
    loop {
        let next = if pending.is_empty() {
            raw.recv().await
        } else {
            match tokio::time::timeout(policy.debounce, raw.recv()).await {
                Ok(next) => next,
                Err(_quiet) => {
                    if !flush(&mut pending, &tx).await {
                        return;
                    }
                    continue;
                }
            }
        };
        match next {
            Some(path) => {
                pending.insert(path);
            }
            None => {
                if !pending.is_empty() {
                    flush(&mut pending, &tx).await;
                }
                debug!("change reader exited, watcher stopping");
                return;
            }
        }
    }
}

/// Deliver and clear `pending`. Returns `false` once the receiver is gone.
async fn flush(pending: &mut BTreeSet<PathBuf>, tx: &mpsc::Sender<ChangeEvent>) -> bool {
    debug!(count = pending.len(), "delivering changes");
    for path in std::mem::take(pending) {
        if tx.send(ChangeEvent { path }).await.is_err() {
            debug!("change receiver dropped, watcher exiting");
            return false;
        }
    }
    true
}

/// Whether a change event concerns a migration file under `migration_dir`.
///
/// Hidden files and editor backups (`*~`, `*.swp`) are ignored.
pub fn is_migration_change(event: &ChangeEvent, migration_dir: &Path) -> bool {
    if !event.path.starts_with(migration_dir) {
        return false;
    }
    let Some(name) = event.path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !(name.starts_with('.') || name.ends_with('~') || name.ends_with(".swp"))
}

// ---------------------------------------------------------------------------
// inotify reader
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
mod os {
    use std::collections::HashMap;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use nix::errno::Errno;
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};
    use tokio::sync::mpsc;
    use tracing::{debug, warn};

    /// Watched directories by descriptor.
    type Dirs = HashMap<WatchDescriptor, PathBuf>;

    fn watch_mask() -> AddWatchFlags {
        AddWatchFlags::IN_CREATE | AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO
    }

    /// Owns the inotify descriptor shared with the thread blocked on it.
    #[derive(Debug)]
    pub(super) struct Reader {
        inotify: Arc<Inotify>,
        root: WatchDescriptor,
        stopping: Arc<AtomicBool>,
    }

    impl Reader {
        /// Watch the tree under `dir` and start the reader thread.
        pub(super) fn spawn(dir: &Path, raw_tx: mpsc::Sender<PathBuf>) -> io::Result<Self> {
            let inotify = Arc::new(Inotify::init(InitFlags::IN_CLOEXEC)?);
            let mut dirs = Dirs::new();
            let root = watch_tree(&inotify, dir, &mut dirs)?;
            debug!(dir = %dir.display(), directories = dirs.len(), "inotify watches added");

            let stopping = Arc::new(AtomicBool::new(false));
            let thread_inotify = Arc::clone(&inotify);
            let thread_stopping = Arc::clone(&stopping);
            let _detached = std::thread::Builder::new()
                .name(String::from("pgdev-watch"))
                .spawn(move || read_loop(&thread_inotify, root, dirs, &thread_stopping, &raw_tx))?;

            Ok(Self {
                inotify,
                root,
                stopping,
            })
        }

        /// Let the reader thread exit.
        pub(super) fn stop(&self) {
            self.stopping.store(true, Ordering::Release);
            // Removing the root watch queues IN_IGNORED, which unblocks the read.
            if let Err(e) = self.inotify.rm_watch(self.root) {
                debug!(error = %e, "root watch already removed");
            }
        }
    }

    /// Watch `dir` and every directory below it. Returns the watch of `dir`.
    fn watch_tree(inotify: &Inotify, dir: &Path, dirs: &mut Dirs) -> io::Result<WatchDescriptor> {
        let wd = inotify.add_watch(dir, watch_mask())?;
        dirs.insert(wd, dir.to_path_buf());
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                watch_tree(inotify, &entry.path(), dirs)?;
            }
        }
        Ok(wd)
    }

    fn read_loop(
        inotify: &Inotify,
        root: WatchDescriptor,
        mut dirs: Dirs,
        stopping: &AtomicBool,
        raw_tx: &mpsc::Sender<PathBuf>,
    ) {
        loop {
            let events = match inotify.read_events() {
                Ok(events) => events,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "inotify read failed, watcher exiting");
                    return;
                }
            };
            if stopping.load(Ordering::Acquire) {
                return;
            }

            for event in events {
                if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                    warn!("inotify queue overflow, changes may be missed");
                    continue;
                }
                if event.mask.contains(AddWatchFlags::IN_IGNORED) {
                    if event.wd == root {
                        debug!("watched directory removed, watcher exiting");
                        return;
                    }
                    dirs.remove(&event.wd);
                    continue;
                }
                let Some(path) = changed_path(&dirs, &event) else {
                    continue;
                };
                if event.mask.contains(AddWatchFlags::IN_ISDIR) {
                    if let Err(e) = watch_tree(inotify, &path, &mut dirs) {
                        warn!(dir = %path.display(), error = %e, "cannot watch new directory");
                    }
                    continue;
                }
                if raw_tx.blocking_send(path).is_err() {
                    debug!("debounce task gone, watcher exiting");
                    return;
                }
            }
        }
    }

    fn changed_path(dirs: &Dirs, event: &InotifyEvent) -> Option<PathBuf> {
        let dir = dirs.get(&event.wd)?;
        event.name.as_ref().map(|name| dir.join(name))
    }
}

#[cfg(not(target_os = "linux"))]
mod os {
    use std::io;
    use std::path::{Path, PathBuf};

    use tokio::sync::mpsc;

    #[derive(Debug)]
    pub(super) struct Reader;

    impl Reader {
        pub(super) fn spawn(_dir: &Path, _raw_tx: mpsc::Sender<PathBuf>) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "change watching needs inotify (linux only)",
            ))
        }

        pub(super) const fn stop(&self) {}
    }
}
