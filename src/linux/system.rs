use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, SigSet, SigmaskHow};
use nix::unistd::Pid;

/// Raw `wait(2)` status word plus the usual `WIF*` predicates.
///
/// The kernel encoding is kept as-is so callers can hand the word to code
/// that expects the classic format; the methods are the only sanctioned way
/// to pick it apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitStatus(pub i32);

/// Stop signal reported for a syscall stop under `PTRACE_O_TRACESYSGOOD`.
pub const SYSCALL_STOP_SIG: i32 = libc::SIGTRAP | 0x80;

impl WaitStatus {
    pub fn exited(self) -> bool {
        libc::WIFEXITED(self.0)
    }

    pub fn exit_code(self) -> i32 {
        libc::WEXITSTATUS(self.0)
    }

    pub fn signaled(self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    pub fn term_signal(self) -> i32 {
        libc::WTERMSIG(self.0)
    }

    pub fn stopped(self) -> bool {
        libc::WIFSTOPPED(self.0)
    }

    pub fn stop_signal(self) -> i32 {
        libc::WSTOPSIG(self.0)
    }

    /// Tracee is stopped at a syscall boundary (entry or exit).
    pub fn is_syscall_stop(self) -> bool {
        self.stopped() && self.stop_signal() == SYSCALL_STOP_SIG
    }

    /// The process is gone, one way or the other.
    pub fn dead(self) -> bool {
        self.exited() || self.signaled()
    }
}

/// Blocking `waitpid` that keeps the raw status word and restarts on `EINTR`.
pub fn waitpid(pid: Pid) -> Result<WaitStatus> {
    loop {
        let mut status = 0;
        let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        if rc == -1 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(errno).with_context(|| format!("failed to waitpid for process {pid}"));
        }
        return Ok(WaitStatus(status));
    }
}

/// Blocks every signal for the current thread, restoring the previous mask
/// when dropped. Every exit path of the supervisor setup goes through the
/// restore.
pub struct SignalMaskGuard {
    old_mask: SigSet,
}

impl SignalMaskGuard {
    pub fn block_all() -> Result<Self> {
        let mut old_mask = SigSet::empty();
        signal::sigprocmask(
            SigmaskHow::SIG_SETMASK,
            Some(&SigSet::all()),
            Some(&mut old_mask),
        )
        .context("failed to block signals")?;
        Ok(SignalMaskGuard { old_mask })
    }
}

impl Drop for SignalMaskGuard {
    fn drop(&mut self) {
        let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.old_mask), None);
    }
}

pub fn page_size() -> u64 {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        -1 => 4096,
        size => size as u64,
    }
}
