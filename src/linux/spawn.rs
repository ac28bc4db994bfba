//! Child-side bring-up and the one-shot error channel back to the parent.
//!
//! The parent creates a close-on-exec pipe before `fork`. Between `fork`
//! and `execvp` the child may write a single `(errno, context)` frame to it
//! to report a failed setup step; on a successful `execvp` both ends vanish
//! through their close-on-exec flags and the parent reads EOF.

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use std::ffi::CStr;
use std::fs::File;
use std::io::Read;
use std::os::fd::{OwnedFd, RawFd};
use std::time::Duration;

/// Per-run execution options.
///
/// A `None` standard-stream descriptor closes that stream in the tracee; a
/// present one is `dup2`-ed over it (the descriptor itself is borrowed and
/// stays open in the caller). `None` limits disable the corresponding
/// ceiling.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    pub stdin_fd: Option<RawFd>,
    pub stdout_fd: Option<RawFd>,
    pub stderr_fd: Option<RawFd>,
    pub time_limit: Option<Duration>,
    pub memory_limit: Option<u64>,
}

const ERROR_FRAME_CONTEXT_MAX: usize = 128;

/// Writes the error frame and exits. Stack buffer only: the child of a
/// possibly multi-threaded parent must not touch the allocator.
fn report_and_exit(error_fd: RawFd, errno: Errno, context: &str) -> ! {
    let mut frame = [0u8; 4 + ERROR_FRAME_CONTEXT_MAX];
    frame[..4].copy_from_slice(&(errno as i32).to_le_bytes());
    let len = context.len().min(ERROR_FRAME_CONTEXT_MAX);
    frame[4..4 + len].copy_from_slice(&context.as_bytes()[..len]);
    unsafe {
        libc::write(error_fd, frame.as_ptr().cast(), 4 + len);
        libc::_exit(255);
    }
}

/// Renders the frame read from the error pipe, or an empty string if the
/// child never wrote one (clean exec, signal death, timer kill).
pub(crate) fn receive_error_message(error_pipe: OwnedFd) -> String {
    let mut bytes = Vec::new();
    if File::from(error_pipe).read_to_end(&mut bytes).is_err() || bytes.len() < 4 {
        return String::new();
    }
    let errno = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let context = String::from_utf8_lossy(&bytes[4..]);
    format!("{context}: {}", Errno::from_raw(errno).desc())
}

/// Runs in the child between `fork` and `execvp`; never returns.
///
/// Order matters: streams first so later failures are reportable against
/// the final stdio, then the working directory, rlimits, the self-trace
/// request, and finally the exec. Every step but the exec reports failure
/// through the pipe; the exec does too, since returning from `execvp` is
/// itself the failure.
///
/// `argv` must be NUL-terminated pointers whose backing `CString`s were
/// built before `fork`; nothing here allocates.
pub(crate) fn run_child(
    exec: &CStr,
    argv: &[*const libc::c_char],
    options: &Options,
    working_dir: &CStr,
    error_fd: RawFd,
) -> ! {
    unsafe {
        // The parent blocked every signal around fork; the tracee must not
        // inherit that mask through execvp.
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        if libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut()) == -1 {
            report_and_exit(error_fd, Errno::last(), "sigprocmask(SIG_SETMASK)");
        }

        let streams = [
            (options.stdin_fd, 0, "dup2(stdin)"),
            (options.stdout_fd, 1, "dup2(stdout)"),
            (options.stderr_fd, 2, "dup2(stderr)"),
        ];
        for (source, target, context) in streams {
            match source {
                Some(fd) => {
                    if libc::dup2(fd, target) == -1 {
                        report_and_exit(error_fd, Errno::last(), context);
                    }
                }
                None => {
                    libc::close(target);
                }
            }
        }

        if libc::chdir(working_dir.as_ptr()) == -1 {
            report_and_exit(error_fd, Errno::last(), "chdir()");
        }

        let no_core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_CORE, &no_core) == -1 {
            report_and_exit(error_fd, Errno::last(), "setrlimit(RLIMIT_CORE)");
        }
        if let Some(limit) = options.memory_limit {
            let address_space = libc::rlimit {
                rlim_cur: limit,
                rlim_max: limit,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &address_space) == -1 {
                report_and_exit(error_fd, Errno::last(), "setrlimit(RLIMIT_AS)");
            }
        }

        if let Err(errno) = ptrace::traceme() {
            report_and_exit(error_fd, errno, "ptrace(PTRACE_TRACEME)");
        }

        // The post-exec SIGTRAP is the tracee's initial stop.
        libc::execvp(exec.as_ptr(), argv.as_ptr());
        report_and_exit(error_fd, Errno::last(), "execvp()");
    }
}
