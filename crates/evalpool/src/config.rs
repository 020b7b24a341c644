//! Pool configuration: full snapshots and partial updates.

use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Name of the worker executable shipped with this crate.
pub const WORKER_BIN_NAME: &str = "evalpool-worker";

/// Configuration shared by every handle of one pool.
///
/// All timeouts are in milliseconds. `idle_timeout_ms = 0` disables idle
/// reaping entirely: workers then live until the pool shrinks or an RPC
/// failure tears them down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Path of the worker executable.
    pub exec: PathBuf,
    /// Script evaluated once on each fresh worker, right after spawn.
    pub init: Option<String>,
    /// Script evaluated on every release, before the handle returns to the
    /// free list.
    pub reinit: Option<String>,
    /// Advisory lower pool bound; clamped to `max`, never warmed up eagerly.
    pub min: usize,
    /// Upper bound on concurrently reserved handles.
    pub max: usize,
    /// Bound on waiting for a reservation.
    pub get_timeout_ms: u64,
    /// Default bound on waiting for an evaluation reply; 0 waits forever.
    pub eval_timeout_ms: u64,
    /// Per-write bound while sending a request.
    pub send_timeout_ms: u64,
    /// Per-read bound while receiving a reply.
    pub recv_timeout_ms: u64,
    /// Grace period per escalation step when tearing a worker down.
    pub wait_timeout_ms: u64,
    /// Idle time after which a pooled worker is reaped; 0 disables.
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            exec: default_worker_path(),
            init: None,
            reinit: None,
            min: 0,
            max: 5,
            get_timeout_ms: 500,
            eval_timeout_ms: 500,
            send_timeout_ms: 100,
            recv_timeout_ms: 100,
            wait_timeout_ms: 100,
            idle_timeout_ms: 0,
        }
    }
}

/// Resolves the default worker executable once: the `evalpool-worker`
/// binary next to the current executable.
pub fn default_worker_path() -> PathBuf {
    static PATH: OnceLock<PathBuf> = OnceLock::new();
    PATH.get_or_init(|| {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BIN_NAME)))
            .unwrap_or_else(|| PathBuf::from(WORKER_BIN_NAME))
    })
    .clone()
}

/// A partial configuration update; `None` fields are left untouched.
///
/// Setting `init` or `reinit` to an empty string clears the script.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolOptions {
    pub exec: Option<PathBuf>,
    pub init: Option<String>,
    pub reinit: Option<String>,
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub get_timeout_ms: Option<u64>,
    pub eval_timeout_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub recv_timeout_ms: Option<u64>,
    pub wait_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

impl PoolOptions {
    /// True when no field would change anything; a pure query.
    pub fn is_empty(&self) -> bool {
        self.exec.is_none()
            && self.init.is_none()
            && self.reinit.is_none()
            && self.min.is_none()
            && self.max.is_none()
            && self.get_timeout_ms.is_none()
            && self.eval_timeout_ms.is_none()
            && self.send_timeout_ms.is_none()
            && self.recv_timeout_ms.is_none()
            && self.wait_timeout_ms.is_none()
            && self.idle_timeout_ms.is_none()
    }

    /// Applies the update in place, clamping `min` to `max`.
    ///
    /// Returns true when the idle timeout changed, so the caller can rewrite
    /// worker expiries and wake the reaper.
    pub(crate) fn apply(&self, cfg: &mut PoolConfig) -> bool {
        if let Some(v) = &self.exec {
            cfg.exec = v.clone();
        }
        if let Some(v) = &self.init {
            cfg.init = non_empty(v);
        }
        if let Some(v) = &self.reinit {
            cfg.reinit = non_empty(v);
        }
        if let Some(v) = self.min {
            cfg.min = v;
        }
        if let Some(v) = self.max {
            cfg.max = v;
        }
        if let Some(v) = self.get_timeout_ms {
            cfg.get_timeout_ms = v;
        }
        if let Some(v) = self.eval_timeout_ms {
            cfg.eval_timeout_ms = v;
        }
        if let Some(v) = self.send_timeout_ms {
            cfg.send_timeout_ms = v;
        }
        if let Some(v) = self.recv_timeout_ms {
            cfg.recv_timeout_ms = v;
        }
        let mut idle_changed = false;
        if let Some(v) = self.wait_timeout_ms {
            cfg.wait_timeout_ms = v;
        }
        if let Some(v) = self.idle_timeout_ms {
            idle_changed = cfg.idle_timeout_ms != v;
            cfg.idle_timeout_ms = v;
        }
        if cfg.min > cfg.max {
            cfg.min = cfg.max;
        }
        idle_changed
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
