//! Named pools of interchangeable worker handles.
//!
//! A pool owns a free list of idle handles and a table of handles with an
//! RPC in flight. Reservations are serialized by a single-waiter flag: one
//! caller at a time owns the right to wait for availability, so concurrent
//! reservations cannot starve each other. The condition variable may wake
//! spuriously; fairness is re-established on every loop.
//!
//! Availability accounting: `avail = max − reserved`. It may dip negative
//! right after `max` is lowered and corrects itself as reservations return,
//! because a handle returned while `avail ≤ 0` is closed instead of pooled.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::{PoolConfig, PoolOptions};
use crate::error::PoolError;
use crate::handle::Proxy;
use crate::proc::WorkerProc;
use crate::reaper;
use crate::registry;

#[derive(Debug)]
pub(crate) struct Pool {
    name: String,
    state: Mutex<PoolState>,
    cond: Condvar,
}

#[derive(Debug)]
struct PoolState {
    cfg: PoolConfig,
    free: VecDeque<Proxy>,
    /// Handle id → script currently in flight, for introspection.
    running: HashMap<String, String>,
    avail: i64,
    next_id: u64,
    waiting: bool,
}

impl Pool {
    pub(crate) fn new(name: String, cfg: PoolConfig) -> Self {
        let avail = cfg.max as i64;
        Self {
            name,
            state: Mutex::new(PoolState {
                cfg,
                free: VecDeque::new(),
                running: HashMap::new(),
                avail,
                next_id: 0,
                waiting: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config_snapshot(&self) -> PoolConfig {
        self.state.lock().expect("pool lock poisoned").cfg.clone()
    }

    /// Reserves `nwant` handles, waiting up to `timeout_ms` (default: the
    /// pool's get timeout).
    ///
    /// The returned handles have no session bookkeeping and possibly no
    /// worker yet; the session layer probes and installs them. On any error
    /// nothing is reserved.
    pub(crate) fn get(
        self: &Arc<Self>,
        nwant: usize,
        timeout_ms: Option<u64>,
    ) -> Result<Vec<Proxy>, PoolError> {
        let mut st = self.state.lock().expect("pool lock poisoned");
        let wait = timeout_ms.unwrap_or(st.cfg.get_timeout_ms);
        let deadline = Instant::now() + Duration::from_millis(wait);

        // Become the single reservation waiter.
        while st.waiting {
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::NoHandle {
                    pool: self.name.clone(),
                    reason: "queue timeout",
                });
            }
            let (guard, _) = self
                .cond
                .wait_timeout(st, deadline - now)
                .expect("pool lock poisoned");
            st = guard;
        }
        st.waiting = true;

        // Wait for availability; pools too small fail without waiting.
        let mut timed_out = false;
        while st.cfg.max >= nwant && st.avail < nwant as i64 {
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(st, deadline - now)
                .expect("pool lock poisoned");
            st = guard;
        }

        let outcome = if st.cfg.max == 0 {
            Err("pool disabled")
        } else if st.cfg.max < nwant {
            Err("insufficient handles")
        } else if timed_out {
            Err("proxy timeout")
        } else {
            Ok(())
        };

        let result = match outcome {
            Err(reason) => Err(PoolError::NoHandle {
                pool: self.name.clone(),
                reason,
            }),
            Ok(()) => {
                st.avail -= nwant as i64;
                let mut handles = Vec::with_capacity(nwant);
                for _ in 0..nwant {
                    let proxy = match st.free.pop_front() {
                        Some(p) => p,
                        None => {
                            let id = format!("proxy{}", st.next_id);
                            st.next_id += 1;
                            Proxy::new(id, Arc::clone(self))
                        }
                    };
                    handles.push(proxy);
                }
                Ok(handles)
            }
        };

        st.waiting = false;
        self.cond.notify_all();
        result
    }

    /// Returns a handle to its pool.
    ///
    /// With room left (`avail > 0` after the increment) the worker's idle
    /// expiry is refreshed and the handle joins the free-list tail, so idle
    /// workers rotate and expire evenly. Otherwise the pool was shrunk and
    /// the handle is closed instead.
    pub(crate) fn put(mut proxy: Proxy) {
        let pool = Arc::clone(proxy.pool());
        let mut st = pool.state.lock().expect("pool lock poisoned");
        st.avail += 1;
        if st.avail > 0 {
            let idle_ms = st.cfg.idle_timeout_ms;
            if let Some(worker) = proxy.worker_mut() {
                worker.set_expire(idle_ms);
            }
            st.free.push_back(proxy);
            pool.cond.notify_all();
        } else {
            pool.cond.notify_all();
            drop(st);
            proxy.close();
        }
    }

    /// Applies a configuration update and echoes the resulting config.
    ///
    /// `avail` is recomputed against the running count, idle expiries are
    /// rewritten when the idle timeout changed, and all idle handles are
    /// drained so the new configuration takes effect for every worker.
    pub(crate) fn apply_options(&self, opts: &PoolOptions) -> PoolConfig {
        if opts.is_empty() {
            return self.config_snapshot();
        }
        let mut wake_reaper = false;
        let (echo, drained) = {
            let mut st = self.state.lock().expect("pool lock poisoned");
            let nrun = st.cfg.max as i64 - st.avail;
            let idle_changed = opts.apply(&mut st.cfg);
            st.avail = st.cfg.max as i64 - nrun;
            if idle_changed {
                let idle_ms = st.cfg.idle_timeout_ms;
                for proxy in st.free.iter_mut() {
                    if let Some(worker) = proxy.worker_mut() {
                        worker.set_expire(idle_ms);
                    }
                }
                wake_reaper = true;
            }
            let drained: Vec<Proxy> = st.free.drain(..).collect();
            self.cond.notify_all();
            (st.cfg.clone(), drained)
        };
        for mut proxy in drained {
            proxy.close();
        }
        if wake_reaper {
            reaper::wakeup();
        }
        echo
    }

    pub(crate) fn register_running(&self, id: &str, script: &str) {
        let mut st = self.state.lock().expect("pool lock poisoned");
        st.running.insert(id.to_string(), script.to_string());
    }

    pub(crate) fn unregister_running(&self, id: &str) {
        let mut st = self.state.lock().expect("pool lock poisoned");
        st.running.remove(id);
    }

    pub(crate) fn running_scripts(&self) -> Vec<(String, String)> {
        let st = self.state.lock().expect("pool lock poisoned");
        st.running
            .iter()
            .map(|(id, script)| (id.clone(), script.clone()))
            .collect()
    }

    /// One reaper pass over this pool's free list.
    ///
    /// Detaches workers whose expiry has passed and returns them, along with
    /// the earliest future wakeup this pool calls for: `now + t_idle` as the
    /// upper bound, refined by each attached worker's own expiry.
    pub(crate) fn sweep(&self, now: Instant) -> (Vec<WorkerProc>, Option<Instant>) {
        let mut st = self.state.lock().expect("pool lock poisoned");
        let idle_ms = st.cfg.idle_timeout_ms;
        let mut next = if idle_ms > 0 {
            Some(now + Duration::from_millis(idle_ms))
        } else {
            None
        };
        let mut expired = Vec::new();
        for proxy in st.free.iter_mut() {
            let worker_expiry = proxy.worker_mut().and_then(|w| w.expire);
            if let Some(expiry) = worker_expiry {
                if expiry <= now {
                    if let Some(worker) = proxy.take_worker() {
                        expired.push(worker);
                    }
                } else {
                    next = Some(next.map_or(expiry, |t| t.min(expiry)));
                }
            }
        }
        (expired, next)
    }

    /// Detaches every free-list worker for shutdown, dropping the handles.
    pub(crate) fn drain_free_workers(&self) -> Vec<WorkerProc> {
        let mut st = self.state.lock().expect("pool lock poisoned");
        let mut workers = Vec::new();
        for mut proxy in st.free.drain(..) {
            if let Some(worker) = proxy.take_worker() {
                workers.push(worker);
            }
        }
        workers
    }

    #[cfg(test)]
    fn avail(&self) -> i64 {
        self.state.lock().expect("pool lock poisoned").avail
    }
}

/// Applies `opts` to the named pool (created on demand) and echoes the
/// resulting configuration.
pub fn configure(pool: &str, opts: &PoolOptions) -> PoolConfig {
    registry::get_pool(pool).apply_options(opts)
}

/// The named pool's current configuration.
pub fn pool_config(pool: &str) -> PoolConfig {
    registry::get_pool(pool).config_snapshot()
}

/// Handles of the named pool with an evaluation in flight, as
/// `(handle id, script)` pairs.
pub fn active(pool: &str) -> Vec<(String, String)> {
    registry::get_pool(pool).running_scripts()
}
