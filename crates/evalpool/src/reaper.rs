//! The reaper: a lazily started background thread that closes idle-expired
//! workers and drains the close list with signal escalation.
//!
//! A queued worker has already lost its write end, so a healthy one exits
//! as soon as it reads EOF. The escalation only engages when the worker is
//! wedged mid-evaluation: wait the pool's grace period for the read end to
//! become readable, then SIGTERM, wait again, then SIGKILL, wait again, and
//! finally abandon the process as a zombie rather than block forever.

use std::sync::MutexGuard;
use std::time::Instant;

use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::proc::WorkerProc;
use crate::registry::{registry, RegistryState};

const LOG_TARGET: &str = "evalpool::reaper";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaperState {
    Stopped,
    Running,
    Stopping,
}

/// Wakes the reaper, starting its thread on first use.
///
/// The stopped→running transition happens under the registry lock before
/// the thread is spawned, so concurrent wakeups can never start a second
/// reaper. Work queued before the thread reaches its loop is not lost: the
/// close list is re-checked at the top of every iteration.
pub(crate) fn wakeup() {
    let reg = registry();
    let mut st = reg.state.lock().expect("registry lock poisoned");
    match st.reaper {
        ReaperState::Running | ReaperState::Stopping => {
            reg.cond.notify_all();
        }
        ReaperState::Stopped => {
            st.reaper = ReaperState::Running;
            std::thread::Builder::new()
                .name("evalpool-reaper".to_string())
                .spawn(reaper_main)
                .expect("failed to spawn reaper thread");
        }
    }
}

fn reaper_main() {
    let reg = registry();
    let mut st: MutexGuard<'_, RegistryState> =
        reg.state.lock().expect("registry lock poisoned");
    debug!(target: LOG_TARGET, "reaper started");

    loop {
        if st.close_list.is_empty() {
            let now = Instant::now();
            let pools: Vec<_> = st.pools.values().cloned().collect();
            let mut wakeup_at: Option<Instant> = None;
            for pool in &pools {
                // Pool locks nest under the registry lock, in that order only.
                let (expired, next) = pool.sweep(now);
                for mut worker in expired {
                    worker.close_write();
                    st.close_list.push_back(worker);
                }
                if let Some(t) = next {
                    wakeup_at = Some(wakeup_at.map_or(t, |cur| cur.min(t)));
                }
            }
            if st.close_list.is_empty() {
                if st.reaper == ReaperState::Stopping {
                    break;
                }
                match wakeup_at {
                    Some(t) => {
                        let dur = t.saturating_duration_since(Instant::now());
                        if dur.is_zero() {
                            continue;
                        }
                        let (guard, _) = reg
                            .cond
                            .wait_timeout(st, dur)
                            .expect("registry lock poisoned");
                        st = guard;
                    }
                    None => {
                        st = reg.cond.wait(st).expect("registry lock poisoned");
                    }
                }
                continue;
            }
        }

        if let Some(mut worker) = st.close_list.pop_front() {
            // Closing may take up to three grace periods; release the lock.
            drop(st);
            close_worker(&mut worker);
            st = reg.state.lock().expect("registry lock poisoned");
        }
    }

    st.reaper = ReaperState::Stopped;
    reg.cond.notify_all();
    debug!(target: LOG_TARGET, "reaper exiting");
}

fn close_worker(worker: &mut WorkerProc) {
    let grace_ms = worker.wait_timeout_ms();
    let pid = worker.pid();
    let mut zombie = false;
    if !worker.wait_exit(grace_ms) {
        warn!(target: LOG_TARGET, pid, "worker won't exit, sending SIGTERM");
        worker.kill(Signal::SIGTERM);
        if !worker.wait_exit(grace_ms) {
            warn!(target: LOG_TARGET, pid, "worker won't die, sending SIGKILL");
            worker.kill(Signal::SIGKILL);
            if !worker.wait_exit(grace_ms) {
                zombie = true;
            }
        }
    }
    if zombie {
        warn!(target: LOG_TARGET, pid, "abandoning zombie worker");
    } else {
        worker.reap();
    }
}
