//! Channel allocation: one directory per contestant holding the named-pipe
//! pair it shares with the manager.
//!
//! A pair exists for exactly one evaluation attempt. Visibility is scoped by
//! the directory: a sandbox that is not granted the directory cannot reach
//! the pipes, which is what keeps one contestant's channel out of the
//! other's hands.

use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use parley_common::error::SystemError;
use tempfile::TempDir;
use tracing::debug;

/// Two unidirectional named pipes plus their enclosing directory. Names are
/// from the manager's perspective: it reads `in<k>` and writes `out<k>`.
/// The directory is removed on `close` (or on drop, as a backstop).
#[derive(Debug)]
pub struct ChannelPair {
    dir: TempDir,
    fifo_in: PathBuf,
    fifo_out: PathBuf,
}

impl ChannelPair {
    /// Create the directory and both pipes with the cross-sandbox permission
    /// profile: directory traversable by any uid (0755), pipes readable and
    /// writable by any uid (0666). Failure here is a system fault and must
    /// abort the evaluation before any process starts.
    pub fn allocate(root: &Path, index: usize) -> Result<Self, SystemError> {
        let dir = tempfile::Builder::new()
            .prefix("chan-")
            .tempdir_in(root)
            .map_err(SystemError::Channel)?;
        let fifo_in = dir.path().join(format!("in{index}"));
        let fifo_out = dir.path().join(format!("out{index}"));
        for fifo in [&fifo_in, &fifo_out] {
            mkfifo(fifo.as_path(), Mode::from_bits_truncate(0o666))
                .map_err(|errno| SystemError::Channel(io::Error::from_raw_os_error(errno as i32)))?;
            // umask may have narrowed the mkfifo mode
            std::fs::set_permissions(fifo, Permissions::from_mode(0o666))
                .map_err(SystemError::Channel)?;
        }
        std::fs::set_permissions(dir.path(), Permissions::from_mode(0o755))
            .map_err(SystemError::Channel)?;
        debug!(dir = %dir.path().display(), "allocated channel pair");
        Ok(Self {
            dir,
            fifo_in,
            fifo_out,
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn fifo_in(&self) -> &Path {
        &self.fifo_in
    }

    pub fn fifo_out(&self) -> &Path {
        &self.fifo_out
    }

    /// Remove the directory and everything in it. Dropping the pair removes
    /// it as well; this form surfaces the error.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}
