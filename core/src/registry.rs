//! Durable mapping from endpoint name to "how to launch this endpoint".
//!
//! The store is a single JSON object shared by every peerlink process of the
//! user. It is opened per operation and never held open across calls. Writers
//! take a short-lived lock file, re-read the store, apply their change and
//! atomically rename a fresh copy over it; contention is retried a bounded
//! number of times and otherwise dropped. Nothing in here is fatal to the
//! caller: failures surface as `false` or an empty result.

use crate::config::IpcConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A lock file older than this is assumed to belong to a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(10);

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

type Store = BTreeMap<String, LaunchInfo>;

/// How the recorded command starts the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchKind {
    /// `command[0]` is an interpreter and `command[1]` the script it runs.
    Script,
    /// `command[0]` is the executable itself.
    Binary,
}

/// Launch recipe persisted for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchInfo {
    pub kind: LaunchKind,
    pub command: Vec<String>,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl LaunchInfo {
    /// Recipe that relaunches the running process with the same arguments
    /// from the same working directory.
    pub fn current() -> io::Result<Self> {
        let exe = env::current_exe()?;
        let mut command = vec![exe.to_string_lossy().into_owned()];
        command.extend(env::args().skip(1));
        Ok(Self {
            kind: LaunchKind::Binary,
            command,
            working_directory: env::current_dir()?,
            registered_at: None,
            pid: None,
        })
    }

    pub fn binary<I, S>(executable: impl AsRef<Path>, args: I, working_directory: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = vec![executable.as_ref().to_string_lossy().into_owned()];
        command.extend(args.into_iter().map(Into::into));
        Self {
            kind: LaunchKind::Binary,
            command,
            working_directory: working_directory.into(),
            registered_at: None,
            pid: None,
        }
    }

    pub fn script<I, S>(
        interpreter: impl AsRef<Path>,
        script: impl AsRef<Path>,
        args: I,
        working_directory: impl Into<PathBuf>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = vec![
            interpreter.as_ref().to_string_lossy().into_owned(),
            script.as_ref().to_string_lossy().into_owned(),
        ];
        command.extend(args.into_iter().map(Into::into));
        Self {
            kind: LaunchKind::Script,
            command,
            working_directory: working_directory.into(),
            registered_at: None,
            pid: None,
        }
    }

    /// The file whose presence decides whether this recipe is still usable.
    pub fn executable(&self) -> Option<&Path> {
        let index = match self.kind {
            LaunchKind::Binary => 0,
            LaunchKind::Script => 1,
        };
        self.command.get(index).map(Path::new)
    }

    /// False when the recorded executable is gone from disk.
    pub fn is_launchable(&self) -> bool {
        self.executable().map(Path::exists).unwrap_or(false)
    }
}

/// Handle on the shared registry file.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    write_attempts: u32,
    retry_backoff: Duration,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let defaults = IpcConfig::default();
        Self {
            path: path.into(),
            write_attempts: defaults.registry_write_attempts,
            retry_backoff: defaults.registry_retry_backoff(),
        }
    }

    pub fn from_config(config: &IpcConfig) -> Self {
        Self {
            path: config.registry_path.clone(),
            write_attempts: config.registry_write_attempts.max(1),
            retry_backoff: config.registry_retry_backoff(),
        }
    }

    /// Overrides the contention policy used by writers.
    pub fn with_retry(mut self, write_attempts: u32, retry_backoff: Duration) -> Self {
        self.write_attempts = write_attempts.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists `launch_info` for `endpoint_name`, replacing any prior entry.
    ///
    /// Returns whether the write landed. A `false` is informational only: the
    /// endpoint keeps running, it just cannot be woken by name until a later
    /// registration succeeds.
    pub fn register_self(&self, endpoint_name: &str, launch_info: &LaunchInfo) -> bool {
        let mut entry = launch_info.clone();
        entry.registered_at = Some(Utc::now());
        entry.pid = Some(std::process::id());

        match self.modify(|store| {
            store.insert(endpoint_name.to_string(), entry.clone());
        }) {
            Ok(()) => {
                debug!(endpoint = %endpoint_name, path = %self.path.display(), "Registered launch info");
                true
            }
            Err(e) => {
                warn!(endpoint = %endpoint_name, error = %e, "Registry write failed, endpoint will not be wakeable");
                false
            }
        }
    }

    /// Spawns the recorded command for `endpoint_name` as a detached process.
    ///
    /// Returns `true` once the process has been started; it does not wait for
    /// the endpoint to come online. Entries whose executable has disappeared
    /// are pruned and reported as `false`.
    pub fn launch_target(&self, endpoint_name: &str) -> bool {
        let Some(info) = self.get(endpoint_name) else {
            debug!(endpoint = %endpoint_name, "No registry entry to launch");
            return false;
        };

        if !info.is_launchable() {
            info!(
                endpoint = %endpoint_name,
                executable = ?info.executable(),
                "Target not found on disk, pruning registry entry"
            );
            self.remove(endpoint_name);
            return false;
        }

        match spawn_detached(&info) {
            Ok(pid) => {
                info!(endpoint = %endpoint_name, pid, "Launched endpoint");
                true
            }
            Err(e) => {
                warn!(endpoint = %endpoint_name, error = %e, "Launch failed");
                false
            }
        }
    }

    /// Snapshot of every entry. Unreadable stores read as empty.
    pub fn entries(&self) -> BTreeMap<String, LaunchInfo> {
        match self.read_store() {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read registry");
                BTreeMap::new()
            }
        }
    }

    pub fn get(&self, endpoint_name: &str) -> Option<LaunchInfo> {
        self.entries().remove(endpoint_name)
    }

    /// Deletes one entry. Returns whether an entry was removed.
    pub fn remove(&self, endpoint_name: &str) -> bool {
        match self.modify(|store| store.remove(endpoint_name).is_some()) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(endpoint = %endpoint_name, error = %e, "Failed to prune registry entry");
                false
            }
        }
    }

    /// Removes every entry whose executable no longer exists.
    pub fn prune_missing(&self) -> Vec<String> {
        let result = self.modify(|store| {
            let stale: Vec<String> = store
                .iter()
                .filter(|(_, info)| !info.is_launchable())
                .map(|(name, _)| name.clone())
                .collect();
            for name in &stale {
                store.remove(name);
            }
            stale
        });

        match result {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!(error = %e, "Failed to prune registry");
                Vec::new()
            }
        }
    }

    fn read_store(&self) -> io::Result<Store> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Store::new()),
            Err(e) => return Err(e),
        };

        if content.trim().is_empty() {
            return Ok(Store::new());
        }

        match serde_json::from_str(&content) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Registry is corrupt, treating as empty");
                Ok(Store::new())
            }
        }
    }

    fn write_store(&self, store: &Store) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(store)?;
        let temp = self.sibling(&format!(
            "{}.{}.tmp",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let result = fs::write(&temp, json).and_then(|_| fs::rename(&temp, &self.path));
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }

    /// Locked read-modify-write with bounded retries on contention.
    fn modify<R>(&self, mut apply: impl FnMut(&mut Store) -> R) -> io::Result<R> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut last_error = None;
        for attempt in 1..=self.write_attempts {
            let outcome = self.lock().and_then(|_guard| {
                let mut store = self.read_store()?;
                let result = apply(&mut store);
                self.write_store(&store)?;
                Ok(result)
            });

            match outcome {
                Ok(result) => return Ok(result),
                Err(e) if is_transient(&e) => {
                    debug!(attempt, error = %e, "Registry busy, retrying");
                    last_error = Some(e);
                    thread::sleep(self.retry_backoff);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| io::Error::new(ErrorKind::WouldBlock, "registry busy")))
    }

    fn lock(&self) -> io::Result<LockGuard> {
        let path = self.sibling("lock");
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(LockGuard { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if is_stale(&path) {
                    let aside = self.sibling(&format!(
                        "lock.{}.{}.stale",
                        std::process::id(),
                        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
                    ));
                    clear_stale_lock(&path, &aside);
                }
                Err(io::Error::new(ErrorKind::WouldBlock, "registry locked by another writer"))
            }
            Err(e) => Err(e),
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry.json".into());
        name.push(".");
        name.push(suffix);
        self.path.with_file_name(name)
    }
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(lock: &Path) -> bool {
    fs::metadata(lock)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

/// Moves a stale lock to `aside` and deletes it there. Only one writer can win
/// the rename; if the file it moved turns out to be fresh (another writer
/// replaced the stale lock in between), it is linked back into place.
fn clear_stale_lock(lock: &Path, aside: &Path) -> bool {
    if fs::rename(lock, aside).is_err() {
        return false;
    }
    if is_stale(aside) {
        warn!(path = %lock.display(), "Removed stale registry lock");
        let _ = fs::remove_file(aside);
        return true;
    }
    // hard_link never clobbers a lock taken after the rename.
    if let Err(e) = fs::hard_link(aside, lock) {
        debug!(error = %e, "Could not restore a live registry lock");
    }
    let _ = fs::remove_file(aside);
    false
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::PermissionDenied | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// Starts `info.command` in its own process group with null stdio. The child
/// is reaped on a background thread so it never lingers as a zombie; the
/// spawner does not wait for it otherwise.
fn spawn_detached(info: &LaunchInfo) -> io::Result<u32> {
    let (program, args) = info
        .command
        .split_first()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "empty launch command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&info.working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();

    if let Err(e) = thread::Builder::new()
        .name(format!("peerlink-reap-{}", pid))
        .spawn(move || {
            let _ = child.wait();
        })
    {
        debug!(pid, error = %e, "Could not start reaper thread");
    }

    Ok(pid)
}
