//! End-to-end tests against real worker processes.
//!
//! Every test uses its own pool name: pools are process-wide and the test
//! threads run in parallel.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use evalpool::{active, configure, ErrorCode, PoolError, PoolOptions, Session};

fn worker_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_evalpool-worker"))
}

/// Configures a pool to use the freshly built worker binary, with
/// I/O timeouts wide enough for heavily loaded test machines.
fn setup(pool: &str, mut opts: PoolOptions) {
    opts.exec = Some(worker_exe());
    opts.eval_timeout_ms = opts.eval_timeout_ms.or(Some(2_000));
    opts.send_timeout_ms = opts.send_timeout_ms.or(Some(1_000));
    opts.recv_timeout_ms = opts.recv_timeout_ms.or(Some(1_000));
    configure(pool, &opts);
}

fn pid_gone(pid: u32) -> bool {
    matches!(kill(Pid::from_raw(pid as i32), None::<Signal>), Err(Errno::ESRCH))
}

fn wait_for_pid_gone(pid: u32, within: Duration) {
    let deadline = Instant::now() + within;
    while !pid_gone(pid) {
        assert!(
            Instant::now() < deadline,
            "worker pid {pid} still alive after {within:?}"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_basic_eval_round_trip() {
    setup("basic", PoolOptions { max: Some(2), ..Default::default() });
    let mut session = Session::new();

    let ids = session.get("basic", 1, Some(2_000)).expect("get");
    assert_eq!(ids, ["proxy0"]);
    let result = session
        .evaluate("proxy0", "sum 1 2", Some(2_000))
        .expect("evaluate");
    assert_eq!(result, "3");
    session.release("proxy0").expect("release");

    // Nothing changed, nothing expired: the same handle comes back.
    let ids = session.get("basic", 1, Some(2_000)).expect("get again");
    assert_eq!(ids, ["proxy0"]);
    session.release("proxy0").expect("release");
}

#[test]
fn test_ping_answers_empty() {
    setup("ping", PoolOptions { max: Some(1), ..Default::default() });
    let mut session = Session::new();
    let ids = session.get("ping", 1, Some(2_000)).expect("get");
    session.ping(&ids[0]).expect("ping");
    session.release(&ids[0]).expect("release");
}

#[test]
fn test_large_script_and_result() {
    setup("large", PoolOptions { max: Some(1), ..Default::default() });
    let mut session = Session::new();
    let ids = session.get("large", 1, Some(2_000)).expect("get");

    // Larger than the codec's vectored read-ahead, both directions.
    let blob = "x".repeat(10_000);
    let result = session
        .evaluate(&ids[0], &format!("echo {blob}"), Some(5_000))
        .expect("evaluate");
    assert_eq!(result, blob);
    session.release(&ids[0]).expect("release");
}

#[test]
fn test_script_error_preserves_blobs() {
    setup("script-err", PoolOptions { max: Some(1), ..Default::default() });
    let mut session = Session::new();
    let ids = session.get("script-err", 1, Some(2_000)).expect("get");

    let err = session
        .evaluate(&ids[0], "fail boom", Some(2_000))
        .expect_err("fail must fail");
    assert_matches!(
        &err,
        PoolError::Script { code: Some(code), info: Some(_), message }
            if code == "FAIL" && message == "boom"
    );

    // A script failure does not cost the handle its worker.
    let result = session.evaluate(&ids[0], "sum 2 2", Some(2_000)).expect("evaluate");
    assert_eq!(result, "4");
    session.release(&ids[0]).expect("release");
}

#[test]
fn test_deadlock_guard() {
    setup("deadlock", PoolOptions { max: Some(3), ..Default::default() });
    let mut session = Session::new();

    let ids = session.get("deadlock", 1, Some(2_000)).expect("get");
    let err = session.get("deadlock", 1, Some(2_000)).expect_err("must deadlock");
    assert_matches!(err, PoolError::Deadlock(pool) if pool == "deadlock");

    session.release(&ids[0]).expect("release");
    let ids = session.get("deadlock", 1, Some(2_000)).expect("get after release");
    session.release(&ids[0]).expect("release");
}

#[test]
fn test_eval_timeout_closes_worker_and_ping_respawns() {
    setup("timeout", PoolOptions { max: Some(1), ..Default::default() });
    let mut session = Session::new();
    let ids = session.get("timeout", 1, Some(2_000)).expect("get");

    let old_pid: u32 = session
        .evaluate(&ids[0], "pid", Some(2_000))
        .expect("pid")
        .parse()
        .expect("numeric pid");

    let err = session
        .evaluate(&ids[0], "sleep 1500", Some(50))
        .expect_err("must time out");
    assert_matches!(err, PoolError::Rpc { code: ErrorCode::Timeout, .. });

    // The wedged worker is escalated to SIGTERM by the reaper.
    wait_for_pid_gone(old_pid, Duration::from_secs(3));

    // The handle recovers by spawning a fresh worker.
    session.ping(&ids[0]).expect("ping respawns");
    let new_pid: u32 = session
        .evaluate(&ids[0], "pid", Some(2_000))
        .expect("pid")
        .parse()
        .expect("numeric pid");
    assert_ne!(old_pid, new_pid);
    session.release(&ids[0]).expect("release");
}

#[test]
fn test_pool_shrink_returns_handles_lazily() {
    setup("shrink", PoolOptions { max: Some(3), ..Default::default() });
    let mut session = Session::new();
    let ids = session.get("shrink", 3, Some(2_000)).expect("get");
    assert_eq!(ids.len(), 3);

    setup("shrink", PoolOptions { max: Some(1), ..Default::default() });

    // Active reservations are untouched; a second caller cannot get in yet.
    let mut other = Session::new();
    let err = other.get("shrink", 1, Some(300)).expect_err("still over limit");
    assert_matches!(err, PoolError::NoHandle { reason: "proxy timeout", .. });

    // The first two returns are absorbed by the deficit.
    session.release(&ids[0]).expect("release");
    session.release(&ids[1]).expect("release");
    let err = other.get("shrink", 1, Some(300)).expect_err("avail still zero");
    assert_matches!(err, PoolError::NoHandle { reason: "proxy timeout", .. });

    session.release(&ids[2]).expect("release");
    let got = other.get("shrink", 1, Some(2_000)).expect("get after releases");
    assert_eq!(got.len(), 1);
    other.release(&got[0]).expect("release");
}

#[test]
fn test_idle_reap_replaces_worker() {
    setup(
        "idle",
        PoolOptions {
            max: Some(1),
            idle_timeout_ms: Some(100),
            ..Default::default()
        },
    );
    let mut session = Session::new();
    let ids = session.get("idle", 1, Some(2_000)).expect("get");
    let old_pid: u32 = session
        .evaluate(&ids[0], "pid", Some(2_000))
        .expect("pid")
        .parse()
        .expect("numeric pid");
    session.release(&ids[0]).expect("release");

    // Idle for longer than the idle timeout: the worker process goes away.
    wait_for_pid_gone(old_pid, Duration::from_secs(3));

    // A subsequent reservation spawns a fresh worker.
    let ids = session.get("idle", 1, Some(2_000)).expect("get after reap");
    let new_pid: u32 = session
        .evaluate(&ids[0], "pid", Some(2_000))
        .expect("pid")
        .parse()
        .expect("numeric pid");
    assert_ne!(old_pid, new_pid);
    session.release(&ids[0]).expect("release");
}

#[test]
fn test_truncated_reply_is_invalid() {
    // A fake worker that answers with a frame whose payload is a 7-byte
    // torso of a response header, then lingers.
    let mut script = tempfile::NamedTempFile::new().expect("temp file");
    script
        .write_all(b"#!/bin/sh\nprintf '\\000\\000\\000\\007ABCDEFG'\nsleep 2\n")
        .expect("write script");
    let path = script.into_temp_path();
    let mut perms = std::fs::metadata(&path).expect("stat").permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");

    configure(
        "truncated",
        &PoolOptions {
            exec: Some(path.to_path_buf()),
            max: Some(1),
            ..Default::default()
        },
    );
    let mut session = Session::new();
    let err = session.get("truncated", 1, Some(2_000)).expect_err("probe must fail");
    assert_matches!(err, PoolError::Rpc { code: ErrorCode::Invalid, .. });
    assert!(session.handles().is_empty());
}

#[test]
fn test_worker_exit_is_a_pipe_failure() {
    // A worker that exits immediately never answers the probe ping.
    configure(
        "earlyexit",
        &PoolOptions {
            exec: Some(PathBuf::from("/bin/true")),
            max: Some(1),
            ..Default::default()
        },
    );
    let mut session = Session::new();
    let err = session.get("earlyexit", 1, Some(2_000)).expect_err("probe must fail");
    // Whether the send or the receive notices first depends on timing.
    assert_matches!(
        err,
        PoolError::Rpc { code: ErrorCode::RecvFail | ErrorCode::SendFail, .. }
    );
}

#[test]
fn test_init_script_runs_once_per_worker() {
    setup(
        "init",
        PoolOptions {
            max: Some(1),
            init: Some("sum 1 1".to_string()),
            ..Default::default()
        },
    );
    let mut session = Session::new();
    let ids = session.get("init", 1, Some(2_000)).expect("get");
    let result = session.evaluate(&ids[0], "echo up", Some(2_000)).expect("evaluate");
    assert_eq!(result, "up");
    session.release(&ids[0]).expect("release");
}

#[test]
fn test_init_failure_fails_the_reservation() {
    setup(
        "init-fail",
        PoolOptions {
            max: Some(1),
            init: Some("fail not today".to_string()),
            ..Default::default()
        },
    );
    let mut session = Session::new();
    let err = session.get("init-fail", 1, Some(2_000)).expect_err("init must fail");
    assert_matches!(
        err,
        PoolError::Script { message, .. } if message.contains("during worker init")
    );
    assert!(session.handles().is_empty());
}

#[test]
fn test_reinit_failure_does_not_block_release() {
    setup(
        "reinit",
        PoolOptions {
            max: Some(1),
            reinit: Some("fail exhausted".to_string()),
            ..Default::default()
        },
    );
    let mut session = Session::new();
    let ids = session.get("reinit", 1, Some(2_000)).expect("get");
    let err = session.release(&ids[0]).expect_err("reinit failure is reported");
    assert_matches!(err, PoolError::Script { .. });

    // The handle made it back to the pool regardless.
    assert!(session.handles().is_empty());
    let ids = session.get("reinit", 1, Some(2_000)).expect("get again");
    assert_eq!(ids.len(), 1);
}

#[test]
fn test_active_lists_in_flight_script() {
    setup("active", PoolOptions { max: Some(1), ..Default::default() });
    let mut session = Session::new();
    let ids = session.get("active", 1, Some(2_000)).expect("get");
    let id = ids[0].clone();

    let worker_thread = std::thread::spawn(move || {
        session
            .evaluate(&id, "sleep 400", Some(3_000))
            .expect("evaluate");
        session
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    let expected = (ids[0].clone(), "sleep 400".to_string());
    loop {
        if active("active").contains(&expected) {
            break;
        }
        assert!(Instant::now() < deadline, "script never showed up in active list");
        std::thread::sleep(Duration::from_millis(10));
    }

    let mut session = worker_thread.join().expect("join");
    assert!(active("active").is_empty());
    session.release(&ids[0]).expect("release");
}

#[test]
fn test_cleanup_releases_everything() {
    setup("cleanup", PoolOptions { max: Some(2), ..Default::default() });
    let mut session = Session::new();
    let ids = session.get("cleanup", 2, Some(2_000)).expect("get");
    assert_eq!(ids.len(), 2);
    assert_eq!(session.handles().len(), 2);

    session.cleanup();
    assert!(session.handles().is_empty());

    // The deadlock guard is cleared along with the handles.
    let ids = session.get("cleanup", 1, Some(2_000)).expect("get after cleanup");
    session.release(&ids[0]).expect("release");
}

#[test]
fn test_reservation_bounds() {
    setup("bounds", PoolOptions { max: Some(2), ..Default::default() });
    let mut session = Session::new();

    // More handles than the pool can ever grant: immediate failure.
    let start = Instant::now();
    let err = session.get("bounds", 5, Some(10_000)).expect_err("too many");
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_matches!(err, PoolError::NoHandle { reason: "insufficient handles", .. });

    setup("bounds-off", PoolOptions { max: Some(0), ..Default::default() });
    let err = session.get("bounds-off", 1, Some(500)).expect_err("disabled");
    assert_matches!(err, PoolError::NoHandle { reason: "pool disabled", .. });
}

#[test]
fn test_configure_echoes_current_config() {
    let echo = configure(
        "echo-cfg",
        &PoolOptions {
            exec: Some(worker_exe()),
            max: Some(4),
            eval_timeout_ms: Some(750),
            init: Some("echo ready".to_string()),
            ..Default::default()
        },
    );
    assert_eq!(echo.max, 4);
    assert_eq!(echo.eval_timeout_ms, 750);
    assert_eq!(echo.init.as_deref(), Some("echo ready"));
    assert_eq!(echo.exec, worker_exe());
    // Untouched options echo their defaults.
    assert_eq!(echo.send_timeout_ms, 100);
}
