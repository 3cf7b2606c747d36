//! Scripted sandbox doubles for exercising the orchestration paths without
//! an isolation backend: every failure mode the classifier distinguishes can
//! be injected here, and acquire/release parity is observable.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parley_common::error::SystemError;
use parley_common::types::{Digest, RunStats};

use crate::sandbox::{
    Disposition, Execution, RunSpec, RunningProcess, Sandbox, SandboxProvider,
};
use crate::storage::FileStore;

pub fn clean_exit() -> Execution {
    execution(Disposition::Exited(0))
}

pub fn execution(disposition: Disposition) -> Execution {
    Execution {
        disposition,
        stats: RunStats {
            wall_time_ms: 10,
            ..Default::default()
        },
    }
}

/// Hands out a fixed queue of scripted sandboxes; acquisition fails once the
/// queue is exhausted. `acquired`/`released` counters back the
/// every-acquire-has-a-release assertions.
pub struct MockProvider {
    queue: Mutex<VecDeque<Arc<MockSandbox>>>,
    pub acquired: AtomicUsize,
    pub released: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(sandboxes: Vec<Arc<MockSandbox>>, released: Arc<AtomicUsize>) -> Self {
        Self {
            queue: Mutex::new(sandboxes.into()),
            acquired: AtomicUsize::new(0),
            released,
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    async fn acquire(&self) -> Result<Arc<dyn Sandbox>, SystemError> {
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            Some(sandbox) => {
                self.acquired.fetch_add(1, Ordering::SeqCst);
                Ok(sandbox)
            }
            None => Err(SystemError::Sandbox("no sandbox capacity".to_string())),
        }
    }
}

pub struct MockSandbox {
    path: PathBuf,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    /// Every RunSpec this sandbox was asked to start.
    pub launched: Mutex<Vec<RunSpec>>,
    wait_result: Mutex<Option<Result<Execution, SystemError>>>,
    fail_provision: bool,
    fail_start: bool,
    released: Arc<AtomicUsize>,
    release_flag: AtomicBool,
}

impl MockSandbox {
    pub fn new(name: &str, released: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            path: PathBuf::from(format!("/mock/{name}")),
            files: Mutex::new(HashMap::new()),
            launched: Mutex::new(Vec::new()),
            wait_result: Mutex::new(None),
            fail_provision: false,
            fail_start: false,
            released,
            release_flag: AtomicBool::new(false),
        })
    }

    pub fn with_wait(self: Arc<Self>, result: Result<Execution, SystemError>) -> Arc<Self> {
        *self.wait_result.lock().unwrap() = Some(result);
        self
    }

    pub fn with_file(self: Arc<Self>, name: &str, content: &[u8]) -> Arc<Self> {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_vec());
        self
    }

    pub fn failing_provision(name: &str, released: Arc<AtomicUsize>) -> Arc<Self> {
        let mut sandbox = Self::new(name, released);
        Arc::get_mut(&mut sandbox).unwrap().fail_provision = true;
        sandbox
    }

    pub fn failing_start(name: &str, released: Arc<AtomicUsize>) -> Arc<Self> {
        let mut sandbox = Self::new(name, released);
        Arc::get_mut(&mut sandbox).unwrap().fail_start = true;
        sandbox
    }

    pub fn provisioned_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn launched_specs(&self) -> Vec<RunSpec> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn provision(
        &self,
        name: &str,
        digest: &Digest,
        _executable: bool,
    ) -> Result<(), SystemError> {
        if self.fail_provision {
            return Err(SystemError::Sandbox(format!("cannot provision {name}")));
        }
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), format!("blob:{digest}").into_bytes());
        Ok(())
    }

    async fn start(&self, spec: RunSpec) -> Result<Box<dyn RunningProcess>, SystemError> {
        self.launched.lock().unwrap().push(spec);
        if self.fail_start {
            return Err(SystemError::Sandbox("cannot start process".to_string()));
        }
        let result = self
            .wait_result
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Ok(clean_exit()));
        Ok(Box::new(MockProcess { result }))
    }

    async fn file_exists(&self, name: &str) -> bool {
        self.files.lock().unwrap().contains_key(name)
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>, SystemError> {
        self.files
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| SystemError::Sandbox(format!("read {name}: no such file")))
    }

    async fn export(&self, name: &str, _description: &str) -> Result<Digest, SystemError> {
        let files = self.files.lock().unwrap();
        let bytes = files
            .get(name)
            .ok_or_else(|| SystemError::Sandbox(format!("export {name}: no such file")))?;
        Ok(FileStore::digest_bytes(bytes))
    }

    async fn release(&self) -> Result<(), SystemError> {
        if !self.release_flag.swap(true, Ordering::SeqCst) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MockProcess {
    result: Result<Execution, SystemError>,
}

#[async_trait]
impl RunningProcess for MockProcess {
    async fn wait(self: Box<Self>) -> Result<Execution, SystemError> {
        self.result
    }
}
