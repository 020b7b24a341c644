//! Reservable proxy handles.

use std::sync::Arc;

use crate::pool::Pool;
use crate::proc::WorkerProc;
use crate::registry;

/// A reservable token bound to at most one worker for the duration of a
/// reservation.
///
/// The id is stable for the pool's lifetime (`proxy<n>`); the request and
/// response buffers are reused across calls. A handle without an attached
/// worker acquires one (by spawning) before any RPC.
#[derive(Debug)]
pub struct Proxy {
    id: String,
    pool: Arc<Pool>,
    pub(crate) worker: Option<WorkerProc>,
    pub(crate) req_buf: Vec<u8>,
    pub(crate) res_buf: Vec<u8>,
}

impl Proxy {
    pub(crate) fn new(id: String, pool: Arc<Pool>) -> Self {
        Self {
            id,
            pool,
            worker: None,
            req_buf: Vec::new(),
            res_buf: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub(crate) fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub(crate) fn worker_mut(&mut self) -> Option<&mut WorkerProc> {
        self.worker.as_mut()
    }

    pub(crate) fn take_worker(&mut self) -> Option<WorkerProc> {
        self.worker.take()
    }

    /// Detaches the worker, if any, and hands it to the reaper.
    pub(crate) fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            registry::queue_close(worker);
        }
    }
}
