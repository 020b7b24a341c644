//! The main loop that runs inside each worker process.
//!
//! Invocation: `<exec> <pool>[:user[:group]] <handle-id> [<active-buffer>]`.
//! The protocol travels over the inherited stdin/stdout pair; before the
//! loop starts, both are duplicated to private descriptors and the standard
//! ones are rebound (stdin to `/dev/null`, stdout to stderr) so that script
//! I/O cannot corrupt the framing.
//!
//! The optional active-buffer argument exists for command lines whose argv
//! is observable from outside. Argv is not mutable from portable Rust, so
//! the current script is surfaced through a `tracing` debug line instead;
//! the argument is still accepted and sized the same way.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use nix::unistd::{initgroups, setgid, setgroups, setuid, Gid, Group, Uid, User};
use thiserror::Error;
use tracing::debug;

use crate::evaluator::Evaluator;
use crate::wire::{self, WireError};

const LOG_TARGET: &str = "evalpool::worker";

/// Fatal worker conditions; each one ends the process with a log line.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("usage: {0} <pool>[:user[:group]] <handle-id> [<active-buffer>]")]
    Usage(String),

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Parsed worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Bare pool name, without any user/group suffix.
    pub pool: String,
    /// User to switch to, by name or numeric uid.
    pub user: Option<String>,
    /// Group to switch to, by name or numeric gid.
    pub group: Option<String>,
    /// Handle id this worker serves.
    pub handle_id: String,
    /// Width of the active-buffer argument; 0 when absent or too short.
    pub active_width: usize,
}

/// Parses `argv` (including the program name at index 0).
///
/// The pool argument may carry `:user[:group]`; an active-buffer argument
/// shorter than 9 bytes is ignored, matching the original command line
/// contract.
pub fn parse_worker_args<I>(args: I) -> Result<WorkerArgs, WorkerError>
where
    I: IntoIterator<Item = String>,
{
    let argv: Vec<String> = args.into_iter().collect();
    if argv.len() < 3 || argv.len() > 4 {
        let program = argv
            .first()
            .cloned()
            .unwrap_or_else(|| "evalpool-worker".to_string());
        return Err(WorkerError::Usage(program));
    }
    let mut parts = argv[1].splitn(3, ':');
    let pool = parts.next().unwrap_or_default().to_string();
    let user = parts.next().map(str::to_string).filter(|s| !s.is_empty());
    let group = parts.next().map(str::to_string).filter(|s| !s.is_empty());
    let active_width = argv
        .get(3)
        .map(|s| s.len())
        .filter(|&len| len > 8)
        .unwrap_or(0);
    Ok(WorkerArgs {
        pool,
        user,
        group,
        handle_id: argv[2].clone(),
        active_width,
    })
}

/// Runs the worker main loop until the parent closes its write end.
///
/// Performs the descriptor rebind and the optional privilege drop, then
/// serves one request at a time: ping requests answer success-empty, any
/// other script goes through `evaluator`. A protocol version mismatch is
/// fatal; EOF is the clean exit.
pub fn run_worker<E: Evaluator>(args: &WorkerArgs, evaluator: &mut E) -> Result<(), WorkerError> {
    let fds = setup_protocol_fds()?;
    drop_privileges(args.user.as_deref(), args.group.as_deref())?;

    let mut request = Vec::new();
    let mut response = Vec::new();
    loop {
        match wire::recv_frame(fds.read.as_fd(), &mut request, None) {
            Ok(()) => {}
            Err(WireError::Closed) => break,
            Err(e) => return Err(e.into()),
        }
        if request.len() < wire::REQUEST_HEADER_LEN {
            break;
        }
        let script = wire::decode_request(&request)?;
        if script.is_empty() {
            wire::encode_response(&mut response, wire::RESULT_OK, None, None, "");
        } else {
            let text = String::from_utf8_lossy(script).into_owned();
            if let Some(banner) = active_banner(args.active_width, &text) {
                debug!(target: LOG_TARGET, handle = %args.handle_id, script = %banner, "evaluating");
            }
            let out = evaluator.eval(&text);
            wire::encode_response(
                &mut response,
                out.code,
                out.error_code.as_deref(),
                out.error_info.as_deref(),
                &out.result,
            );
        }
        if wire::send_frame(fds.write.as_fd(), &response, None).is_err() {
            break;
        }
    }
    Ok(())
}

struct ProtocolFds {
    read: OwnedFd,
    write: OwnedFd,
}

/// Moves the protocol off the standard descriptors.
///
/// Stdin/stdout are duplicated to fresh descriptors for the framing; fd 0
/// is rebound to `/dev/null` and fd 1 to a dup of stderr.
fn setup_protocol_fds() -> io::Result<ProtocolFds> {
    // SAFETY: dup returns fresh descriptors exclusively owned from here on.
    let read = unsafe {
        let fd = libc::dup(libc::STDIN_FILENO);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        OwnedFd::from_raw_fd(fd)
    };
    // SAFETY: as above.
    let write = unsafe {
        let fd = libc::dup(libc::STDOUT_FILENO);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        OwnedFd::from_raw_fd(fd)
    };
    let devnull = File::open("/dev/null")?;
    // SAFETY: both dup2 targets stay open for the life of the process.
    unsafe {
        if libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(ProtocolFds { read, write })
}

/// Applies the `:user[:group]` suffix: supplementary groups, then gid,
/// then uid. Resolution failure or switch failure is fatal.
fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<(), WorkerError> {
    if user.is_none() && group.is_none() {
        return Ok(());
    }

    let resolved_user = match user {
        Some(name) => Some(resolve_user(name)?),
        None => None,
    };
    let mut gid = resolved_user.as_ref().map(|(_, gid, _)| *gid);
    if let Some(name) = group {
        gid = Some(resolve_group(name)?);
    }

    match &resolved_user {
        Some((_, _, Some(login))) => {
            let cname = CString::new(login.as_str())
                .map_err(|_| WorkerError::UnknownUser(login.clone()))?;
            let base = gid.unwrap_or_else(Gid::current);
            initgroups(&cname, base).map_err(errno_to_io)?;
        }
        // Numeric uid, or a group-only switch: no login to take
        // supplementary groups from, so drop them all.
        _ => setgroups(&[]).map_err(errno_to_io)?,
    }
    if let Some(gid) = gid {
        if gid != Gid::current() {
            setgid(gid).map_err(errno_to_io)?;
        }
    }
    if let Some((uid, _, _)) = resolved_user {
        if uid != Uid::current() {
            setuid(uid).map_err(errno_to_io)?;
        }
    }
    Ok(())
}

/// Resolves a user by name, or numerically with a mandatory round-trip
/// through the uid lookup. The login name is `None` for numeric values, in
/// which case supplementary groups are not inherited.
fn resolve_user(name: &str) -> Result<(Uid, Gid, Option<String>), WorkerError> {
    if let Ok(Some(user)) = User::from_name(name) {
        return Ok((user.uid, user.gid, Some(user.name)));
    }
    let uid: libc::uid_t = name
        .parse()
        .map_err(|_| WorkerError::UnknownUser(name.to_string()))?;
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => Ok((user.uid, user.gid, None)),
        _ => Err(WorkerError::UnknownUser(name.to_string())),
    }
}

fn resolve_group(name: &str) -> Result<Gid, WorkerError> {
    if let Ok(Some(group)) = Group::from_name(name) {
        return Ok(group.gid);
    }
    let gid: libc::gid_t = name
        .parse()
        .map_err(|_| WorkerError::UnknownGroup(name.to_string()))?;
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => Ok(group.gid),
        _ => Err(WorkerError::UnknownGroup(name.to_string())),
    }
}

fn errno_to_io(e: nix::errno::Errno) -> WorkerError {
    WorkerError::Io(e.into())
}

/// Formats the active-script diagnostic the way the argv buffer would show
/// it: braces around a prefix that fits the buffer, with an ellipsis
/// marker when truncated. Returns `None` when no buffer was supplied.
pub(crate) fn active_banner(width: usize, script: &str) -> Option<String> {
    if width == 0 {
        return None;
    }
    let max = width.saturating_sub(8);
    if script.len() <= max {
        return Some(format!("{{{script}}}"));
    }
    let mut end = max.min(script.len());
    while end > 0 && !script.is_char_boundary(end) {
        end -= 1;
    }
    Some(format!("{{{} ...}}", &script[..end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_minimal_command_line() {
        let args = parse_worker_args(argv(&["evalpool-worker", "mypool", "proxy0"]))
            .expect("parse");
        assert_eq!(args.pool, "mypool");
        assert_eq!(args.handle_id, "proxy0");
        assert_eq!(args.user, None);
        assert_eq!(args.group, None);
        assert_eq!(args.active_width, 0);
    }

    #[test]
    fn test_parse_user_and_group_suffix() {
        let args = parse_worker_args(argv(&["w", "mypool:alice:staff", "proxy3"]))
            .expect("parse");
        assert_eq!(args.pool, "mypool");
        assert_eq!(args.user.as_deref(), Some("alice"));
        assert_eq!(args.group.as_deref(), Some("staff"));
    }

    #[test]
    fn test_parse_user_only_suffix() {
        let args = parse_worker_args(argv(&["w", "mypool:1001", "proxy0"])).expect("parse");
        assert_eq!(args.pool, "mypool");
        assert_eq!(args.user.as_deref(), Some("1001"));
        assert_eq!(args.group, None);
    }

    #[test]
    fn test_parse_active_buffer_width() {
        let wide = " ".repeat(100);
        let args =
            parse_worker_args(argv(&["w", "p", "proxy0", &wide])).expect("parse");
        assert_eq!(args.active_width, 100);

        // Too short to be useful; treated as absent.
        let args = parse_worker_args(argv(&["w", "p", "proxy0", "12345678"])).expect("parse");
        assert_eq!(args.active_width, 0);
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        assert_matches!(
            parse_worker_args(argv(&["w", "pool-only"])),
            Err(WorkerError::Usage(_))
        );
        assert_matches!(
            parse_worker_args(argv(&["w", "p", "id", "buf", "extra"])),
            Err(WorkerError::Usage(_))
        );
    }

    #[test]
    fn test_active_banner_short_script() {
        assert_eq!(active_banner(100, "sum 1 2").as_deref(), Some("{sum 1 2}"));
        assert_eq!(active_banner(0, "sum 1 2"), None);
    }

    #[test]
    fn test_active_banner_truncates_with_ellipsis() {
        let script = "x".repeat(50);
        let banner = active_banner(20, &script).expect("banner");
        assert_eq!(banner, format!("{{{} ...}}", "x".repeat(12)));
    }
}
