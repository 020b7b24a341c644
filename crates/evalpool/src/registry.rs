//! Process-wide pool registry and worker close list.
//!
//! One lock covers the pool table, the close list and the reaper state.
//! Lock order: this lock is always taken before any pool lock, never after.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use crate::config::PoolConfig;
use crate::pool::Pool;
use crate::proc::WorkerProc;
use crate::reaper::{self, ReaperState};

pub(crate) struct Registry {
    pub(crate) state: Mutex<RegistryState>,
    pub(crate) cond: Condvar,
}

pub(crate) struct RegistryState {
    pub(crate) pools: HashMap<String, Arc<Pool>>,
    pub(crate) close_list: VecDeque<WorkerProc>,
    pub(crate) reaper: ReaperState,
}

pub(crate) fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        state: Mutex::new(RegistryState {
            pools: HashMap::new(),
            close_list: VecDeque::new(),
            reaper: ReaperState::Stopped,
        }),
        cond: Condvar::new(),
    })
}

/// Looks up a pool by name, creating it with default configuration on
/// first use.
pub(crate) fn get_pool(name: &str) -> Arc<Pool> {
    let reg = registry();
    let mut st = reg.state.lock().expect("registry lock poisoned");
    st.pools
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(Pool::new(name.to_string(), PoolConfig::default())))
        .clone()
}

/// Queues a detached worker for teardown and wakes the reaper.
///
/// The write end is closed here, so a healthy worker sees EOF and exits on
/// its own before the reaper ever has to signal it.
pub(crate) fn queue_close(mut worker: WorkerProc) {
    worker.close_write();
    {
        let reg = registry();
        let mut st = reg.state.lock().expect("registry lock poisoned");
        st.close_list.push_back(worker);
    }
    reaper::wakeup();
}

/// Tears the whole subsystem down: every pool's idle workers are moved to
/// the close list, the pools are dropped from the registry, and the caller
/// blocks until the reaper has drained the list and stopped.
pub fn shutdown() {
    let reg = registry();
    let mut st = reg.state.lock().expect("registry lock poisoned");
    let pools: Vec<Arc<Pool>> = st.pools.drain().map(|(_, pool)| pool).collect();
    for pool in &pools {
        for mut worker in pool.drain_free_workers() {
            worker.close_write();
            st.close_list.push_back(worker);
        }
    }
    let start = st.reaper == ReaperState::Stopped && !st.close_list.is_empty();
    drop(st);

    if start {
        reaper::wakeup();
    }

    let mut st = reg.state.lock().expect("registry lock poisoned");
    if st.reaper == ReaperState::Running {
        st.reaper = ReaperState::Stopping;
        reg.cond.notify_all();
        while st.reaper != ReaperState::Stopped {
            st = reg.cond.wait(st).expect("registry lock poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_pool_creates_once() {
        let a = get_pool("registry-same-pool");
        let b = get_pool("registry-same-pool");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_shutdown_drops_pools() {
        let _ = get_pool("registry-shutdown-pool");
        shutdown();
        // Other tests may repopulate the registry concurrently; the pool we
        // created must at least be gone.
        let st = registry().state.lock().expect("registry lock poisoned");
        assert!(!st.pools.contains_key("registry-shutdown-pool"));
    }
}
