//! The single-call RPC engine: one request down the pipe, one reply back.
//!
//! Exactly one request is ever in flight per worker; the next request's
//! bytes cannot start until the previous reply has been read in full. Every
//! failure below the evaluator (send, eval deadline, receive, decode) closes
//! the worker — it is never reused after a protocol-level fault.

use std::sync::Arc;

use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{ErrorCode, PoolError};
use crate::handle::Proxy;
use crate::proc::WorkerProc;
use crate::wire::{self, WireError};

use nix::poll::PollFlags;

const LOG_TARGET: &str = "evalpool::rpc";

/// Runs one evaluation against the handle's worker.
///
/// `script = None` is the ping: a zero-length request answered with an
/// empty success. `eval_timeout_ms` bounds the wait for the reply to start
/// (default: the pool's eval timeout; 0 disables the bound).
///
/// On success the worker's result string is returned. A worker-reported
/// failure surfaces as [`PoolError::Script`] with the error blobs preserved
/// and leaves the worker attached; an RPC-level failure surfaces as
/// [`PoolError::Rpc`] and hands the worker to the reaper.
pub(crate) fn call(
    proxy: &mut Proxy,
    script: Option<&str>,
    eval_timeout_ms: Option<u64>,
) -> Result<String, PoolError> {
    let cfg = proxy.pool().config_snapshot();
    if proxy.worker.is_none() {
        return Err(PoolError::Rpc {
            code: ErrorCode::Dead,
            message: "no running worker".to_string(),
        });
    }

    let text = script.unwrap_or("");
    wire::encode_request(&mut proxy.req_buf, text.as_bytes());
    proxy.pool().register_running(proxy.id(), text);

    let outcome = match proxy.worker.as_ref() {
        Some(worker) => run_call(worker, &proxy.req_buf, &mut proxy.res_buf, &cfg, eval_timeout_ms),
        None => Err((ErrorCode::Dead, "no running worker".to_string())),
    };

    proxy.pool().unregister_running(proxy.id());
    proxy.req_buf.clear();
    proxy.res_buf.clear();

    match outcome {
        Ok(resp) => {
            if resp.code == wire::RESULT_OK {
                Ok(resp.result)
            } else {
                Err(PoolError::Script {
                    code: resp.error_code,
                    info: resp.error_info,
                    message: resp.result,
                })
            }
        }
        Err((code, message)) => {
            debug!(
                target: LOG_TARGET,
                handle = proxy.id(),
                code = code.as_str(),
                %message,
                "proxy call failed"
            );
            proxy.close();
            Err(PoolError::Rpc { code, message })
        }
    }
}

fn run_call(
    worker: &WorkerProc,
    request: &[u8],
    response: &mut Vec<u8>,
    cfg: &PoolConfig,
    eval_timeout_ms: Option<u64>,
) -> Result<wire::Response, (ErrorCode, String)> {
    let wfd = match worker.writer_fd() {
        Some(fd) => fd,
        None => return Err((ErrorCode::SendFail, "write end closed".to_string())),
    };
    if let Err(e) = wire::send_frame(wfd, request, Some(wire::clamp_ms(cfg.send_timeout_ms))) {
        return Err((ErrorCode::SendFail, e.to_string()));
    }

    let eval_ms = eval_timeout_ms.unwrap_or(cfg.eval_timeout_ms);
    if eval_ms > 0 {
        match wire::wait_fd(
            worker.reader_fd(),
            PollFlags::POLLIN,
            Some(wire::clamp_ms(eval_ms)),
        ) {
            Ok(true) => {}
            Ok(false) => {
                return Err((
                    ErrorCode::Timeout,
                    "timeout waiting for response".to_string(),
                ))
            }
            Err(e) => return Err((ErrorCode::RecvFail, e.to_string())),
        }
    }

    match wire::recv_frame(
        worker.reader_fd(),
        response,
        Some(wire::clamp_ms(cfg.recv_timeout_ms)),
    ) {
        Ok(()) => {}
        Err(WireError::Closed) => return Err((ErrorCode::RecvFail, "pipe closed".to_string())),
        Err(WireError::Timeout) => {
            return Err((ErrorCode::RecvFail, "timeout reading response".to_string()))
        }
        Err(e) => return Err((ErrorCode::RecvFail, e.to_string())),
    }

    wire::decode_response(response)
        .map_err(|e| (ErrorCode::Invalid, format!("invalid proxy response: {e}")))
}

/// Spawns a worker for a handle that has none, then runs the pool's init
/// script as its first evaluation.
///
/// Spawn failure is [`ErrorCode::Exec`]; an init failure closes the fresh
/// worker and surfaces the init error.
pub(crate) fn ensure_worker(proxy: &mut Proxy) -> Result<(), PoolError> {
    if proxy.worker.is_some() {
        return Ok(());
    }
    let cfg = proxy.pool().config_snapshot();
    let pool = Arc::clone(proxy.pool());
    let worker = WorkerProc::spawn(
        &cfg.exec,
        pool.name(),
        proxy.id(),
        &pool,
        cfg.idle_timeout_ms,
    )
    .map_err(|e| PoolError::Rpc {
        code: ErrorCode::Exec,
        message: format!("worker spawn failed: {e}"),
    })?;
    proxy.worker = Some(worker);

    if let Some(init) = cfg.init.as_deref() {
        if let Err(e) = call(proxy, Some(init), None) {
            proxy.close();
            return Err(annotate_init_error(e));
        }
    }
    Ok(())
}

/// The reservation-time probe: ping an attached worker, closing it if the
/// ping fails, then make sure a live worker is attached.
pub(crate) fn check(proxy: &mut Proxy) -> Result<(), PoolError> {
    if proxy.worker.is_some() && call(proxy, None, None).is_err() {
        // RPC failures already detached the worker; close covers the rest.
        proxy.close();
    }
    ensure_worker(proxy)
}

fn annotate_init_error(e: PoolError) -> PoolError {
    match e {
        PoolError::Rpc { code, message } => PoolError::Rpc {
            code,
            message: format!("{message} (during worker init)"),
        },
        PoolError::Script { code, info, message } => PoolError::Script {
            code,
            info,
            message: format!("{message} (during worker init)"),
        },
        other => other,
    }
}
