//! Sandbox lifecycle: the trait seams every isolation backend implements,
//! plus the process-backed default used for local runs and tests.
//!
//! The orchestrator's resource-safety contract lives at this boundary: every
//! `acquire` must be matched by a `release` on every control-flow path. The
//! helpers at the bottom (`acquire_many`/`release_all`) keep that property
//! easy to uphold from the orchestration code.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parley_common::error::SystemError;
use parley_common::types::{Digest, RunStats};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::storage::FileStore;

/// Captured stdout of the last process run in a sandbox. The manager's
/// verdict is read from this file.
pub const STDOUT_FILE: &str = "stdout.txt";
/// Captured stderr of the last process run in a sandbox.
pub const STDERR_FILE: &str = "stderr.txt";

#[derive(Debug, Clone, Default)]
pub struct RunLimits {
    pub cpu: Option<Duration>,
    pub wall: Option<Duration>,
    /// Address-space ceiling in bytes.
    pub memory: Option<u64>,
}

/// One process launch inside a sandbox.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub command: Vec<String>,
    pub limits: RunLimits,
    /// Extra directories the process may traverse. Isolating backends
    /// enforce this allow-list; the process backend records it only.
    pub allow_dirs: Vec<PathBuf>,
    /// Name of a provisioned file to redirect to stdin.
    pub stdin: Option<String>,
}

/// How a process left its sandbox. Anything but `Exited(0)` breaks the
/// participant's contract; internal sandbox failures are `SystemError`s,
/// never a disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    WallClockTimedOut,
    MemoryExceeded,
}

impl Disposition {
    pub fn is_clean(&self) -> bool {
        matches!(self, Disposition::Exited(0))
    }
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub disposition: Disposition,
    pub stats: RunStats,
}

#[async_trait]
pub trait RunningProcess: Send {
    /// Block until the process terminates by any means.
    async fn wait(self: Box<Self>) -> Result<Execution, SystemError>;
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn path(&self) -> &Path;

    /// Materialize a blob inside the sandbox under `name`.
    async fn provision(&self, name: &str, digest: &Digest, executable: bool)
        -> Result<(), SystemError>;

    /// Start a process. Must return as soon as the process exists: it must
    /// never block on the process's own I/O (a named-pipe open in the child
    /// blocks until its peer appears, and the peers are started after this
    /// call returns).
    async fn start(&self, spec: RunSpec) -> Result<Box<dyn RunningProcess>, SystemError>;

    async fn file_exists(&self, name: &str) -> bool;

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, SystemError>;

    /// Copy a sandbox file into the blob store.
    async fn export(&self, name: &str, description: &str) -> Result<Digest, SystemError>;

    /// Destroy the sandbox. Idempotent.
    async fn release(&self) -> Result<(), SystemError>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn Sandbox>, SystemError>;
}

/// Process-backed sandbox: a temp directory and plain child processes with
/// rlimits. It limits resources but does not confine filesystem or network
/// access; deployments that run untrusted code plug an isolating backend
/// into the same traits.
pub struct LocalSandboxProvider {
    root: PathBuf,
    store: FileStore,
}

impl LocalSandboxProvider {
    pub fn new(root: impl Into<PathBuf>, store: FileStore) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn acquire(&self) -> Result<Arc<dyn Sandbox>, SystemError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| SystemError::Sandbox(format!("cannot create sandbox root: {err}")))?;
        let dir = tempfile::Builder::new()
            .prefix("box-")
            .tempdir_in(&self.root)
            .map_err(|err| SystemError::Sandbox(format!("cannot create sandbox dir: {err}")))?;
        debug!(path = %dir.path().display(), "sandbox acquired");
        Ok(Arc::new(LocalSandbox {
            path: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
            store: self.store.clone(),
        }))
    }
}

pub struct LocalSandbox {
    path: PathBuf,
    // Kept so an unreleased sandbox is still removed on drop.
    dir: Mutex<Option<TempDir>>,
    store: FileStore,
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn provision(
        &self,
        name: &str,
        digest: &Digest,
        executable: bool,
    ) -> Result<(), SystemError> {
        use std::os::unix::fs::PermissionsExt;

        let dest = self.path.join(name);
        self.store.fetch_to(digest, &dest).await?;
        let mode = if executable { 0o755 } else { 0o644 };
        tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|err| SystemError::Sandbox(format!("chmod {name}: {err}")))?;
        Ok(())
    }

    async fn start(&self, spec: RunSpec) -> Result<Box<dyn RunningProcess>, SystemError> {
        let program = spec
            .command
            .first()
            .ok_or_else(|| SystemError::Sandbox("empty command".to_string()))?;

        let stdin = match &spec.stdin {
            Some(name) => {
                let file = std::fs::File::open(self.path.join(name))
                    .map_err(|err| SystemError::Sandbox(format!("stdin {name}: {err}")))?;
                Stdio::from(file)
            }
            None => Stdio::null(),
        };
        let stdout = std::fs::File::create(self.path.join(STDOUT_FILE))
            .map_err(|err| SystemError::Sandbox(format!("stdout capture: {err}")))?;
        let stderr = std::fs::File::create(self.path.join(STDERR_FILE))
            .map_err(|err| SystemError::Sandbox(format!("stderr capture: {err}")))?;

        let mut command = tokio::process::Command::new(self.path.join(program));
        command
            .args(&spec.command[1..])
            .current_dir(&self.path)
            .stdin(stdin)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        let limits = spec.limits.clone();
        unsafe {
            command.pre_exec(move || apply_rlimits(&limits));
        }

        let child = command
            .spawn()
            .map_err(|err| SystemError::Sandbox(format!("spawn {program}: {err}")))?;
        debug!(program = %program, path = %self.path.display(), "process started");
        Ok(Box::new(LocalProcess {
            child,
            started: Instant::now(),
            wall: spec.limits.wall,
        }))
    }

    async fn file_exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.path.join(name))
            .await
            .unwrap_or(false)
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, SystemError> {
        tokio::fs::read(self.path.join(name))
            .await
            .map_err(|err| SystemError::Sandbox(format!("read {name}: {err}")))
    }

    async fn export(&self, name: &str, description: &str) -> Result<Digest, SystemError> {
        self.store.put_file(&self.path.join(name), description).await
    }

    async fn release(&self) -> Result<(), SystemError> {
        let taken = self.dir.lock().unwrap().take();
        if let Some(dir) = taken {
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || dir.close())
                .await
                .map_err(|err| SystemError::Sandbox(format!("release join: {err}")))?
                .map_err(|err| SystemError::Sandbox(format!("release {}: {err}", path.display())))?;
            debug!(path = %self.path.display(), "sandbox released");
        }
        Ok(())
    }
}

struct LocalProcess {
    child: tokio::process::Child,
    started: Instant,
    wall: Option<Duration>,
}

impl LocalProcess {
    fn stats(&self) -> RunStats {
        RunStats {
            wall_time_ms: self.started.elapsed().as_millis() as u64,
            // The process backend has no per-child accounting; isolating
            // backends fill these in.
            cpu_time_ms: None,
            memory_kib: None,
        }
    }
}

#[async_trait]
impl RunningProcess for LocalProcess {
    async fn wait(mut self: Box<Self>) -> Result<Execution, SystemError> {
        let status = match self.wall {
            Some(wall) => match tokio::time::timeout(wall, self.child.wait()).await {
                Ok(waited) => {
                    waited.map_err(|err| SystemError::Sandbox(format!("wait: {err}")))?
                }
                Err(_) => {
                    let _ = self.child.start_kill();
                    let _ = self.child.wait().await;
                    return Ok(Execution {
                        disposition: Disposition::WallClockTimedOut,
                        stats: self.stats(),
                    });
                }
            },
            None => self
                .child
                .wait()
                .await
                .map_err(|err| SystemError::Sandbox(format!("wait: {err}")))?,
        };

        use std::os::unix::process::ExitStatusExt;
        let disposition = match status.signal() {
            // The CPU rlimit delivers SIGXCPU at the soft limit.
            Some(libc::SIGXCPU) => Disposition::TimedOut,
            Some(signal) => Disposition::Signaled(signal),
            None => Disposition::Exited(status.code().unwrap_or(-1)),
        };
        Ok(Execution {
            disposition,
            stats: self.stats(),
        })
    }
}

fn apply_rlimits(limits: &RunLimits) -> std::io::Result<()> {
    unsafe {
        if let Some(cpu) = limits.cpu {
            let secs = cpu.as_secs_f64().ceil().max(1.0) as libc::rlim_t;
            let lim = libc::rlimit {
                rlim_cur: secs,
                rlim_max: secs + 1,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &lim) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        if let Some(memory) = limits.memory {
            let lim = libc::rlimit {
                rlim_cur: memory as libc::rlim_t,
                rlim_max: memory as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &lim) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Acquire `count` sandboxes or none: on failure, everything already
/// acquired is released before the error is returned.
pub async fn acquire_many(
    provider: &dyn SandboxProvider,
    count: usize,
) -> Result<Vec<Arc<dyn Sandbox>>, SystemError> {
    let mut acquired = Vec::with_capacity(count);
    for _ in 0..count {
        match provider.acquire().await {
            Ok(sandbox) => acquired.push(sandbox),
            Err(err) => {
                release_all(&acquired).await;
                return Err(err);
            }
        }
    }
    Ok(acquired)
}

/// Best-effort release of every sandbox; failures are logged, not returned,
/// so one stuck release never leaks the others.
pub async fn release_all(sandboxes: &[Arc<dyn Sandbox>]) {
    for sandbox in sandboxes {
        if let Err(err) = sandbox.release().await {
            warn!(path = %sandbox.path().display(), %err, "failed to release sandbox");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn provider_with_store() -> (tempfile::TempDir, LocalSandboxProvider, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store")).unwrap();
        let provider = LocalSandboxProvider::new(dir.path().join("boxes"), store.clone());
        (dir, provider, store)
    }

    #[tokio::test]
    async fn provision_export_and_release() {
        let (_dir, provider, store) = provider_with_store().await;
        let digest = store.put_bytes(b"payload\n", "fixture").await.unwrap();

        let sandbox = provider.acquire().await.unwrap();
        sandbox.provision("data.txt", &digest, false).await.unwrap();
        assert!(sandbox.file_exists("data.txt").await);
        assert_eq!(sandbox.read_file("data.txt").await.unwrap(), b"payload\n");

        let exported = sandbox.export("data.txt", "round trip").await.unwrap();
        assert_eq!(exported, digest);

        let path = sandbox.path().to_path_buf();
        assert!(path.exists());
        sandbox.release().await.unwrap();
        assert!(!path.exists());
        // release is idempotent
        sandbox.release().await.unwrap();
    }

    #[tokio::test]
    async fn clean_exit_and_captured_stdout() {
        let (_dir, provider, store) = provider_with_store().await;
        let script = store
            .put_bytes(b"#!/bin/sh\necho hi\n", "script")
            .await
            .unwrap();

        let sandbox = provider.acquire().await.unwrap();
        sandbox.provision("run.sh", &script, true).await.unwrap();
        let process = sandbox
            .start(RunSpec {
                command: vec!["./run.sh".to_string()],
                limits: RunLimits {
                    wall: Some(Duration::from_secs(5)),
                    ..Default::default()
                },
                allow_dirs: Vec::new(),
                stdin: None,
            })
            .await
            .unwrap();
        let execution = process.wait().await.unwrap();
        assert_eq!(execution.disposition, Disposition::Exited(0));
        assert_eq!(sandbox.read_file(STDOUT_FILE).await.unwrap(), b"hi\n");
        sandbox.release().await.unwrap();
    }

    #[tokio::test]
    async fn wall_clock_limit_kills_the_process() {
        let (_dir, provider, store) = provider_with_store().await;
        let script = store
            .put_bytes(b"#!/bin/sh\nsleep 5\n", "sleeper")
            .await
            .unwrap();

        let sandbox = provider.acquire().await.unwrap();
        sandbox.provision("run.sh", &script, true).await.unwrap();
        let process = sandbox
            .start(RunSpec {
                command: vec!["./run.sh".to_string()],
                limits: RunLimits {
                    wall: Some(Duration::from_millis(200)),
                    ..Default::default()
                },
                allow_dirs: Vec::new(),
                stdin: None,
            })
            .await
            .unwrap();
        let execution = process.wait().await.unwrap();
        assert_eq!(execution.disposition, Disposition::WallClockTimedOut);
        sandbox.release().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_many_releases_on_failure() {
        struct FlakyProvider {
            inner: LocalSandboxProvider,
            capacity: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl SandboxProvider for FlakyProvider {
            async fn acquire(&self) -> Result<Arc<dyn Sandbox>, SystemError> {
                if self
                    .capacity
                    .fetch_update(
                        std::sync::atomic::Ordering::SeqCst,
                        std::sync::atomic::Ordering::SeqCst,
                        |n| n.checked_sub(1),
                    )
                    .is_err()
                {
                    return Err(SystemError::Sandbox("no capacity".to_string()));
                }
                self.inner.acquire().await
            }
        }

        let (dir, inner, _store) = provider_with_store().await;
        let provider = FlakyProvider {
            inner,
            capacity: std::sync::atomic::AtomicUsize::new(2),
        };

        assert!(acquire_many(&provider, 3).await.is_err());
        // The two sandboxes that were acquired must be gone again.
        let boxes_root = dir.path().join("boxes");
        let remaining = std::fs::read_dir(&boxes_root)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(remaining, 0);
    }
}
