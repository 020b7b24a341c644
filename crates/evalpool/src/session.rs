//! Per-caller bookkeeping of held handles.
//!
//! A session owns the handles it has reserved and a per-pool hold count.
//! The hold count is the deadlock guard: a caller that already holds
//! handles from a pool may not reserve from it again, because the second
//! reservation could wait forever on handles only the caller itself can
//! return.

use std::collections::HashMap;

use crate::error::PoolError;
use crate::handle::Proxy;
use crate::pool::Pool;
use crate::registry;
use crate::rpc;

/// One caller's view of the proxy subsystem.
///
/// Sessions are not shared between threads; every handle a session holds is
/// exclusively owned, so all I/O on the underlying workers is naturally
/// serialized.
#[derive(Default)]
pub struct Session {
    handles: HashMap<String, Proxy>,
    counts: HashMap<String, usize>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `nwant` handles from the named pool.
    ///
    /// Every returned handle has been probed: its worker answered a ping,
    /// or was spawned (running the pool's init script) on the spot. If any
    /// probe fails, every handle reserved by this call is returned to the
    /// pool and the error is reported — the reservation is all or nothing.
    pub fn get(
        &mut self,
        pool_name: &str,
        nwant: usize,
        timeout_ms: Option<u64>,
    ) -> Result<Vec<String>, PoolError> {
        if self.counts.get(pool_name).copied().unwrap_or(0) > 0 {
            return Err(PoolError::Deadlock(pool_name.to_string()));
        }
        let pool = registry::get_pool(pool_name);
        let mut acquired = pool.get(nwant, timeout_ms)?;

        let mut probe_err = None;
        for proxy in acquired.iter_mut() {
            if let Err(e) = rpc::check(proxy) {
                probe_err = Some(e);
                break;
            }
        }
        if let Some(e) = probe_err {
            for proxy in acquired {
                Pool::put(proxy);
            }
            return Err(e);
        }

        let ids: Vec<String> = acquired.iter().map(|p| p.id().to_string()).collect();
        self.counts.insert(pool_name.to_string(), nwant);
        for proxy in acquired {
            self.handles.insert(proxy.id().to_string(), proxy);
        }
        Ok(ids)
    }

    /// Evaluates `script` against a held handle, respawning its worker
    /// first if an earlier failure tore it down.
    pub fn evaluate(
        &mut self,
        id: &str,
        script: &str,
        timeout_ms: Option<u64>,
    ) -> Result<String, PoolError> {
        let proxy = self.lookup(id)?;
        rpc::ensure_worker(proxy)?;
        rpc::call(proxy, Some(script), timeout_ms)
    }

    /// Sends the empty request; success means the worker is alive (one is
    /// spawned first if needed).
    pub fn ping(&mut self, id: &str) -> Result<(), PoolError> {
        let proxy = self.lookup(id)?;
        rpc::ensure_worker(proxy)?;
        rpc::call(proxy, None, None).map(|_| ())
    }

    /// Releases a held handle back to its pool.
    ///
    /// The pool's reinit script, if any, runs first; its failure is
    /// reported but the handle is returned to the pool regardless.
    pub fn release(&mut self, id: &str) -> Result<(), PoolError> {
        let mut proxy = self
            .handles
            .remove(id)
            .ok_or_else(|| PoolError::UnknownHandle(id.to_string()))?;
        let pool_name = proxy.pool().name().to_string();
        if let Some(count) = self.counts.get_mut(&pool_name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(&pool_name);
            }
        }
        let reinit = proxy.pool().config_snapshot().reinit;
        let result = match reinit {
            Some(script) if proxy.has_worker() => {
                rpc::call(&mut proxy, Some(&script), None).map(|_| ())
            }
            _ => Ok(()),
        };
        Pool::put(proxy);
        result
    }

    /// Releases every held handle, ignoring reinit failures.
    pub fn cleanup(&mut self) {
        let ids: Vec<String> = self.handles.keys().cloned().collect();
        for id in ids {
            let _ = self.release(&id);
        }
    }

    /// Ids of all handles this session currently holds.
    pub fn handles(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    fn lookup(&mut self, id: &str) -> Result<&mut Proxy, PoolError> {
        self.handles
            .get_mut(id)
            .ok_or_else(|| PoolError::UnknownHandle(id.to_string()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}
