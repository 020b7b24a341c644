//! Pipe frame codec for the worker protocol.
//!
//! Both directions use the same framing: a 4-byte big-endian payload length
//! followed by that many bytes. The request payload is a fixed header
//! (script length + protocol version) followed by the script bytes; the
//! response payload is a fixed header (result code + three blob lengths)
//! followed by the error-code, error-info and result blobs in that order.
//!
//! ## Nul convention
//!
//! The error-code and error-info blobs are nul-terminated and their declared
//! lengths *include* the terminator; the result blob carries no terminator
//! and its declared length excludes one. The decoder strips the terminator,
//! so callers on both sides only ever see the bare strings.
//!
//! ## Deadline discipline
//!
//! [`send_frame`] and [`recv_frame`] operate on descriptors that may be
//! non-blocking (the parent side) or blocking (the worker side). Partial
//! reads and writes advance and continue; `EINTR` is retried transparently;
//! `EAGAIN` waits for readiness via `poll` up to the caller's timeout. A
//! timeout and a peer close are reported as distinct errors.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::uio::{readv, writev};
use thiserror::Error;

/// Protocol major version; a worker rejects any other value as fatal.
pub const PROTOCOL_MAJOR: u16 = 1;
/// Protocol minor version; a worker rejects any other value as fatal.
pub const PROTOCOL_MINOR: u16 = 1;

/// Byte length of the request header (script length + major + minor).
pub const REQUEST_HEADER_LEN: usize = 8;
/// Byte length of the response header (code + three blob lengths).
pub const RESPONSE_HEADER_LEN: usize = 16;

/// Result code for a successful evaluation.
pub const RESULT_OK: u32 = 0;

/// How much of a frame body the first vectored read tries to pull in
/// together with the length prefix.
const READ_AHEAD: usize = 4096;

/// Errors produced by the frame codec and its I/O helpers.
#[derive(Debug, Error)]
pub enum WireError {
    /// The deadline elapsed before the descriptor became ready.
    #[error("timed out waiting for the pipe")]
    Timeout,

    /// The peer closed its end before a complete frame was transferred.
    #[error("pipe closed")]
    Closed,

    /// The frame contents do not describe a valid request or response.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The request header carries a protocol version this build does not speak.
    #[error("protocol version mismatch: got {major}.{minor}")]
    Version { major: u16, minor: u16 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Evaluator result code; [`RESULT_OK`] on success.
    pub code: u32,
    /// Machine-readable error code blob, present on failure.
    pub error_code: Option<String>,
    /// Human-oriented error info blob, present on failure.
    pub error_info: Option<String>,
    /// Result string on success, error message on failure.
    pub result: String,
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

/// Clamps a millisecond configuration value into `poll` range.
pub(crate) fn clamp_ms(ms: u64) -> u32 {
    ms.min(i32::MAX as u64) as u32
}

/// Puts a descriptor into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Waits for `events` on `fd` for up to `timeout_ms` (`None` = forever).
///
/// Returns `Ok(true)` when the descriptor is ready, `Ok(false)` on timeout.
/// Interrupted polls are retried with the full timeout, matching the
/// per-wait (not absolute) semantics of the configured timeouts.
pub(crate) fn wait_fd(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    timeout_ms: Option<u32>,
) -> Result<bool, WireError> {
    let timeout: i32 = match timeout_ms {
        None => -1,
        Some(ms) => ms.min(i32::MAX as u32) as i32,
    };
    loop {
        let mut fds = [PollFd::new(&fd, events)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(WireError::Io(e.into())),
        }
    }
}

/// Writes a length-prefixed frame.
///
/// The prefix and payload go out through one vectored write where possible;
/// partial writes advance both slices. On a non-blocking descriptor, each
/// `EAGAIN` waits up to `timeout_ms` for writability before retrying.
pub fn send_frame(
    fd: BorrowedFd<'_>,
    payload: &[u8],
    timeout_ms: Option<u32>,
) -> Result<(), WireError> {
    let prefix = (payload.len() as u32).to_be_bytes();
    let total = prefix.len() + payload.len();
    let mut done = 0usize;
    while done < total {
        let res = if done < prefix.len() {
            let iov = [IoSlice::new(&prefix[done..]), IoSlice::new(payload)];
            writev(fd, &iov)
        } else {
            let iov = [IoSlice::new(&payload[done - prefix.len()..])];
            writev(fd, &iov)
        };
        match res {
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                if !wait_fd(fd, PollFlags::POLLOUT, timeout_ms)? {
                    return Err(WireError::Timeout);
                }
            }
            Err(e) => return Err(WireError::Io(e.into())),
        }
    }
    Ok(())
}

/// Reads one length-prefixed frame into `buf` (cleared first).
///
/// The first read is vectored so a single syscall can fetch the length
/// prefix together with the leading portion of the body. EOF before a
/// complete frame is [`WireError::Closed`], distinct from a timeout.
pub fn recv_frame(
    fd: BorrowedFd<'_>,
    buf: &mut Vec<u8>,
    timeout_ms: Option<u32>,
) -> Result<(), WireError> {
    buf.clear();
    let mut prefix = [0u8; 4];
    let mut head = 0usize;
    let mut scratch = [0u8; READ_AHEAD];
    let mut spilled = 0usize;

    while head < prefix.len() {
        let res = {
            let (p, s) = (&mut prefix[head..], &mut scratch[spilled..]);
            let mut iov = [IoSliceMut::new(p), IoSliceMut::new(s)];
            readv(fd, &mut iov)
        };
        match res {
            Ok(0) => return Err(WireError::Closed),
            Ok(n) => {
                let into_prefix = n.min(4 - head);
                head += into_prefix;
                spilled += n - into_prefix;
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                if !wait_fd(fd, PollFlags::POLLIN, timeout_ms)? {
                    return Err(WireError::Timeout);
                }
            }
            Err(e) => return Err(WireError::Io(e.into())),
        }
    }

    let len = be32(&prefix) as usize;
    if spilled > len {
        return Err(WireError::Malformed(format!(
            "frame declares {len} bytes but {spilled} arrived"
        )));
    }
    buf.extend_from_slice(&scratch[..spilled]);
    buf.resize(len, 0);

    let mut off = spilled;
    while off < len {
        match nix::unistd::read(fd.as_raw_fd(), &mut buf[off..]) {
            Ok(0) => return Err(WireError::Closed),
            Ok(n) => off += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                if !wait_fd(fd, PollFlags::POLLIN, timeout_ms)? {
                    return Err(WireError::Timeout);
                }
            }
            Err(e) => return Err(WireError::Io(e.into())),
        }
    }
    Ok(())
}

/// Encodes a request payload (header + script) into `buf` (cleared first).
///
/// An empty script encodes the ping request.
pub fn encode_request(buf: &mut Vec<u8>, script: &[u8]) {
    buf.clear();
    buf.extend_from_slice(&(script.len() as u32).to_be_bytes());
    buf.extend_from_slice(&PROTOCOL_MAJOR.to_be_bytes());
    buf.extend_from_slice(&PROTOCOL_MINOR.to_be_bytes());
    buf.extend_from_slice(script);
}

/// Decodes a request payload, returning the script bytes.
///
/// A version mismatch is reported as [`WireError::Version`]; the worker
/// treats it as fatal.
pub fn decode_request(payload: &[u8]) -> Result<&[u8], WireError> {
    if payload.len() < REQUEST_HEADER_LEN {
        return Err(WireError::Malformed(format!(
            "request shorter than header: {} bytes",
            payload.len()
        )));
    }
    let len = be32(&payload[0..4]) as usize;
    let major = be16(&payload[4..6]);
    let minor = be16(&payload[6..8]);
    if major != PROTOCOL_MAJOR || minor != PROTOCOL_MINOR {
        return Err(WireError::Version { major, minor });
    }
    if payload.len() - REQUEST_HEADER_LEN != len {
        return Err(WireError::Malformed(format!(
            "request declares {len} script bytes, carries {}",
            payload.len() - REQUEST_HEADER_LEN
        )));
    }
    Ok(&payload[REQUEST_HEADER_LEN..])
}

/// Encodes a response payload into `buf` (cleared first).
pub fn encode_response(
    buf: &mut Vec<u8>,
    code: u32,
    error_code: Option<&str>,
    error_info: Option<&str>,
    result: &str,
) {
    buf.clear();
    let clen = error_code.map_or(0, |s| s.len() + 1);
    let ilen = error_info.map_or(0, |s| s.len() + 1);
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&(clen as u32).to_be_bytes());
    buf.extend_from_slice(&(ilen as u32).to_be_bytes());
    buf.extend_from_slice(&(result.len() as u32).to_be_bytes());
    if let Some(s) = error_code {
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }
    if let Some(s) = error_info {
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }
    buf.extend_from_slice(result.as_bytes());
}

/// Decodes a response payload.
///
/// Frames shorter than the header, or whose declared blob lengths do not
/// add up to the payload length, are rejected as malformed.
pub fn decode_response(payload: &[u8]) -> Result<Response, WireError> {
    if payload.len() < RESPONSE_HEADER_LEN {
        return Err(WireError::Malformed(format!(
            "response shorter than header: {} bytes",
            payload.len()
        )));
    }
    let code = be32(&payload[0..4]);
    let clen = be32(&payload[4..8]) as u64;
    let ilen = be32(&payload[8..12]) as u64;
    let rlen = be32(&payload[12..16]) as u64;
    if RESPONSE_HEADER_LEN as u64 + clen + ilen + rlen != payload.len() as u64 {
        return Err(WireError::Malformed(format!(
            "response blob lengths {clen}+{ilen}+{rlen} do not match {} payload bytes",
            payload.len()
        )));
    }
    let body = &payload[RESPONSE_HEADER_LEN..];
    let (code_blob, body) = body.split_at(clen as usize);
    let (info_blob, result_blob) = body.split_at(ilen as usize);
    Ok(Response {
        code,
        error_code: blob_to_string(code_blob),
        error_info: blob_to_string(info_blob),
        result: String::from_utf8_lossy(result_blob).into_owned(),
    })
}

/// Converts a nul-terminated blob into a string, stripping the terminator.
fn blob_to_string(blob: &[u8]) -> Option<String> {
    if blob.is_empty() {
        return None;
    }
    let end = if blob.last() == Some(&0) { blob.len() - 1 } else { blob.len() };
    Some(String::from_utf8_lossy(&blob[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use std::os::fd::BorrowedFd;
    use std::time::{Duration, Instant};

    fn bfd(raw: &impl AsRawFd) -> BorrowedFd<'_> {
        // Test-only shortcut; the readers/writers outlive every use.
        unsafe { BorrowedFd::borrow_raw(raw.as_raw_fd()) }
    }

    // ── Request codec ─────────────────────────────────────────────────────────

    #[test]
    fn test_request_round_trip() {
        let mut buf = Vec::new();
        encode_request(&mut buf, b"sum 1 2");
        assert_eq!(buf.len(), REQUEST_HEADER_LEN + 7);
        let script = decode_request(&buf).expect("decode request");
        assert_eq!(script, b"sum 1 2");
    }

    #[test]
    fn test_request_ping_is_empty() {
        let mut buf = Vec::new();
        encode_request(&mut buf, b"");
        assert_eq!(buf.len(), REQUEST_HEADER_LEN);
        let script = decode_request(&buf).expect("decode ping");
        assert!(script.is_empty());
    }

    #[test]
    fn test_request_rejects_version_mismatch() {
        let mut buf = Vec::new();
        encode_request(&mut buf, b"x");
        buf[4] = 0xFF;
        assert_matches!(
            decode_request(&buf),
            Err(WireError::Version { major: 0xFF01, .. })
        );
    }

    #[test]
    fn test_request_rejects_short_payload() {
        assert_matches!(decode_request(&[0u8; 7]), Err(WireError::Malformed(_)));
    }

    #[test]
    fn test_request_rejects_length_disagreement() {
        let mut buf = Vec::new();
        encode_request(&mut buf, b"abc");
        buf.truncate(buf.len() - 1);
        assert_matches!(decode_request(&buf), Err(WireError::Malformed(_)));
    }

    // ── Response codec ────────────────────────────────────────────────────────

    #[test]
    fn test_response_success_round_trip() {
        let mut buf = Vec::new();
        encode_response(&mut buf, RESULT_OK, None, None, "3");
        assert_eq!(buf.len(), RESPONSE_HEADER_LEN + 1);
        let resp = decode_response(&buf).expect("decode response");
        assert_eq!(resp.code, RESULT_OK);
        assert_eq!(resp.error_code, None);
        assert_eq!(resp.error_info, None);
        assert_eq!(resp.result, "3");
    }

    #[test]
    fn test_response_error_blob_lengths_include_nul() {
        let mut buf = Vec::new();
        encode_response(&mut buf, 1, Some("ERR"), Some("info"), "msg");
        // clen = 4 ("ERR\0"), ilen = 5 ("info\0"), rlen = 3 ("msg").
        assert_eq!(be32(&buf[4..8]), 4);
        assert_eq!(be32(&buf[8..12]), 5);
        assert_eq!(be32(&buf[12..16]), 3);
        assert_eq!(buf[RESPONSE_HEADER_LEN + 3], 0);
        let resp = decode_response(&buf).expect("decode response");
        assert_eq!(resp.code, 1);
        assert_eq!(resp.error_code.as_deref(), Some("ERR"));
        assert_eq!(resp.error_info.as_deref(), Some("info"));
        assert_eq!(resp.result, "msg");
    }

    #[test]
    fn test_response_rejects_truncated_header() {
        // Seven bytes, as produced by a broken worker mid-write.
        assert_matches!(decode_response(&[0u8; 7]), Err(WireError::Malformed(_)));
    }

    #[test]
    fn test_response_rejects_inconsistent_lengths() {
        let mut buf = Vec::new();
        encode_response(&mut buf, 1, Some("ERR"), None, "msg");
        buf[7] = 0xFF;
        assert_matches!(decode_response(&buf), Err(WireError::Malformed(_)));
    }

    // ── Framed transfer over real pipes ───────────────────────────────────────

    #[test]
    fn test_frame_round_trip_over_pipe() {
        let (reader, mut writer) = os_pipe::pipe().expect("pipe");
        let mut payload = Vec::new();
        encode_request(&mut payload, b"echo hello");
        let sent = payload.clone();
        let t = std::thread::spawn(move || {
            let fd = unsafe { BorrowedFd::borrow_raw(writer.as_raw_fd()) };
            send_frame(fd, &sent, Some(1_000)).expect("send");
            writer.flush().expect("flush");
        });
        let mut got = Vec::new();
        recv_frame(bfd(&reader), &mut got, Some(1_000)).expect("recv");
        t.join().expect("sender thread");
        assert_eq!(got, payload);
    }

    #[test]
    fn test_large_frame_crosses_read_ahead_boundary() {
        let (reader, writer) = os_pipe::pipe().expect("pipe");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let sent = payload.clone();
        let t = std::thread::spawn(move || {
            let fd = unsafe { BorrowedFd::borrow_raw(writer.as_raw_fd()) };
            send_frame(fd, &sent, Some(5_000)).expect("send");
        });
        let mut got = Vec::new();
        recv_frame(bfd(&reader), &mut got, Some(5_000)).expect("recv");
        t.join().expect("sender thread");
        assert_eq!(got, payload);
    }

    #[test]
    fn test_recv_times_out_on_silent_pipe() {
        let (reader, _writer) = os_pipe::pipe().expect("pipe");
        set_nonblocking(reader.as_raw_fd()).expect("nonblocking");
        let start = Instant::now();
        let mut got = Vec::new();
        assert_matches!(
            recv_frame(bfd(&reader), &mut got, Some(50)),
            Err(WireError::Timeout)
        );
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_recv_reports_eof_as_closed() {
        let (reader, writer) = os_pipe::pipe().expect("pipe");
        drop(writer);
        let mut got = Vec::new();
        assert_matches!(
            recv_frame(bfd(&reader), &mut got, Some(50)),
            Err(WireError::Closed)
        );
    }
}
