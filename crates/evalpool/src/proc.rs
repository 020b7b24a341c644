//! Parent-side representation of one worker process.
//!
//! A `WorkerProc` owns the child and both pipe ends. The parent ends are
//! non-blocking so every transfer can honor its deadline; the worker keeps
//! its own ends blocking. Exactly one thread touches the pipes at a time:
//! whoever holds the handle the worker is attached to, or the reaper once
//! the worker is on the close list.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::PollFlags;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, error, warn};

use crate::pool::Pool;
use crate::wire;

const LOG_TARGET: &str = "evalpool::proc";

/// Width of the active-buffer argument handed to the worker.
const ACTIVE_BUFFER_WIDTH: usize = 100;

/// Teardown grace period used when the owning pool is already gone.
const FALLBACK_WAIT_MS: u64 = 100;

#[derive(Debug)]
pub(crate) struct WorkerProc {
    child: Child,
    pid: u32,
    reader: ChildStdout,
    writer: Option<ChildStdin>,
    pool: Weak<Pool>,
    /// Absolute idle expiry; `None` when idle reaping is disabled.
    pub(crate) expire: Option<Instant>,
}

impl WorkerProc {
    /// Spawns a worker for `handle_id`, wiring up both protocol pipes.
    ///
    /// The pool name is passed through verbatim, including any
    /// `:user[:group]` suffix the worker resolves on its side.
    pub(crate) fn spawn(
        exec: &Path,
        pool_name: &str,
        handle_id: &str,
        pool: &Arc<Pool>,
        idle_ms: u64,
    ) -> io::Result<WorkerProc> {
        let mut child = Command::new(exec)
            .arg(pool_name)
            .arg(handle_id)
            .arg(" ".repeat(ACTIVE_BUFFER_WIDTH))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let writer = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker stdin not captured"))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker stdout not captured"))?;
        wire::set_nonblocking(writer.as_raw_fd()).map_err(io::Error::from)?;
        wire::set_nonblocking(reader.as_raw_fd()).map_err(io::Error::from)?;
        let pid = child.id();
        debug!(target: LOG_TARGET, pid, pool = pool_name, handle = handle_id, "spawned worker");
        let mut proc = WorkerProc {
            child,
            pid,
            reader,
            writer: Some(writer),
            pool: Arc::downgrade(pool),
            expire: None,
        };
        proc.set_expire(idle_ms);
        Ok(proc)
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Rewrites the idle expiry from the pool's idle timeout.
    pub(crate) fn set_expire(&mut self, idle_ms: u64) {
        self.expire = if idle_ms > 0 {
            Some(Instant::now() + Duration::from_millis(idle_ms))
        } else {
            None
        };
    }

    pub(crate) fn reader_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    pub(crate) fn writer_fd(&self) -> Option<BorrowedFd<'_>> {
        self.writer.as_ref().map(|w| w.as_fd())
    }

    /// Closes the parent's write end; the worker sees EOF and exits its loop.
    pub(crate) fn close_write(&mut self) {
        self.writer = None;
    }

    /// The owning pool's teardown grace period.
    pub(crate) fn wait_timeout_ms(&self) -> u64 {
        self.pool
            .upgrade()
            .map(|p| p.config_snapshot().wait_timeout_ms)
            .unwrap_or(FALLBACK_WAIT_MS)
    }

    /// Waits up to `ms` for the read end to become readable, which after
    /// [`close_write`](Self::close_write) signals that the worker exited.
    pub(crate) fn wait_exit(&self, ms: u64) -> bool {
        matches!(
            wire::wait_fd(self.reader_fd(), PollFlags::POLLIN, Some(wire::clamp_ms(ms))),
            Ok(true)
        )
    }

    /// Sends `sig` to the worker; a vanished child is not an error.
    pub(crate) fn kill(&self, sig: Signal) {
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), sig) {
            if e != Errno::ESRCH {
                error!(target: LOG_TARGET, pid = self.pid, signal = ?sig, errno = %e, "kill failed");
            }
        }
    }

    /// Reaps the exited child.
    pub(crate) fn reap(&mut self) {
        if let Err(e) = self.child.wait() {
            warn!(target: LOG_TARGET, pid = self.pid, error = %e, "wait on worker failed");
        }
    }
}
