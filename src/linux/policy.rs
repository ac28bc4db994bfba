use crate::linux::tracing::{Arch, TracedProcess};
use anyhow::Result;
use nix::libc;

/// Per-run syscall filter consulted by the supervisor at every syscall
/// entry and exit of the tracee.
///
/// `Ok(false)` is a policy denial: the supervisor kills the tracee and
/// reports [`SyscallPolicy::error_message`] (or a generated
/// `forbidden syscall ...` line when that is empty). `Err` is reserved for
/// tracing-layer failures while inspecting the tracee.
pub trait SyscallPolicy {
    /// Decides whether the syscall the tracee is entering may proceed. The
    /// policy may read (and clobber) tracee registers and memory through
    /// `process`; the tracee is stopped for the duration of the call.
    fn on_entry(&mut self, process: &mut TracedProcess, syscall: i64) -> Result<bool>;

    /// Decides whether the tracee may continue after a finished syscall.
    fn on_exit(&mut self, process: &mut TracedProcess, syscall: i64) -> Result<bool>;

    /// Message explaining the most recent denial, or empty.
    fn error_message(&self) -> &str;
}

pub(crate) fn open_syscall(arch: Arch) -> i64 {
    match arch {
        Arch::I386 => 5,
        Arch::X8664 => 2,
    }
}

pub(crate) fn lseek_syscall(arch: Arch) -> i64 {
    match arch {
        Arch::I386 => 19,
        Arch::X8664 => 8,
    }
}

/// `_llseek`, the second seek entry point of the 32-bit ABI. Funnelled
/// through the same check as `lseek`.
pub(crate) const LLSEEK_SYSCALL_I386: i64 = 140;

pub(crate) fn tgkill_syscall(arch: Arch) -> i64 {
    match arch {
        Arch::I386 => 270,
        Arch::X8664 => 234,
    }
}

pub(crate) fn brk_syscall(arch: Arch) -> i64 {
    match arch {
        Arch::I386 => 45,
        Arch::X8664 => 12,
    }
}

/// Argument rule for `open`: the pathname (argument 1) must be a literal
/// member of `allowed_files`.
///
/// A disallowed-but-readable pathname does not deny: the pointer is
/// clobbered to NULL so the kernel fails the call with `EFAULT` and the
/// tracee sees an ordinary error return. Only an unreadable pathname
/// denies, since there is nothing to judge.
pub fn check_open(process: &mut TracedProcess, allowed_files: &[String]) -> Result<bool> {
    let regs = process.get_registers()?;
    let Some(path) = process.read_cstring(regs.arg_addr(1), libc::PATH_MAX as usize) else {
        tracing::debug!(pid = %process.pid(), "open with unreadable pathname");
        return Ok(false);
    };
    if allowed_files
        .iter()
        .any(|allowed| allowed.as_bytes() == path.as_slice())
    {
        tracing::trace!(pid = %process.pid(), path = %String::from_utf8_lossy(&path), "open allowed");
        return Ok(true);
    }
    tracing::trace!(pid = %process.pid(), path = %String::from_utf8_lossy(&path), "open pathname clobbered");
    process.clobber_arg(1, 0)?;
    Ok(true)
}

/// Argument rule for `lseek`/`_llseek`: seeking the standard streams is a
/// denial; any other descriptor is clobbered to -1 so the call fails with
/// `EBADF` in the tracee.
pub fn check_lseek(process: &mut TracedProcess) -> Result<bool> {
    let regs = process.get_registers()?;
    let fd = regs.arg(1);
    if (0..=2).contains(&fd) {
        return Ok(false);
    }
    process.clobber_arg(1, -1)?;
    Ok(true)
}

/// Argument rule for `tgkill`: only self-directed signals are allowed,
/// i.e. both the tgid and tid arguments must equal the tracee's pid.
pub fn check_tgkill(process: &mut TracedProcess) -> Result<bool> {
    let regs = process.get_registers()?;
    let pid = i64::from(process.pid().as_raw());
    Ok(regs.arg(1) == pid && regs.arg(2) == pid)
}

/// Syscalls admitted unconditionally on i386. Sorted; looked up by binary
/// search.
#[rustfmt::skip]
static ALLOWED_SYSCALLS_I386: [i64; 78] = [
    1, 3, 4, 6, 13, 20, 24, 27, 29, 45, 47, 49, 50, 67, 72, 73, 76, 77, 78,
    82, 90, 91, 100, 108, 118, 125, 142, 143, 144, 145, 146, 148, 150, 151,
    152, 153, 162, 163, 168, 174, 175, 176, 177, 179, 180, 181, 184, 187,
    191, 192, 197, 199, 200, 201, 202, 219, 224, 231, 232, 239, 240, 244,
    250, 252, 265, 266, 267, 269, 272, 308, 309, 312, 323, 328, 333, 334,
    355, 376,
];

/// Syscalls admitted unconditionally on x86_64.
#[rustfmt::skip]
static ALLOWED_SYSCALLS_X86_64: [i64; 64] = [
    0, 1, 3, 5, 7, 9, 10, 11, 12, 13, 14, 17, 18, 19, 20, 23, 25, 26, 28,
    34, 35, 37, 39, 40, 60, 73, 74, 75, 96, 97, 98, 102, 104, 107, 108,
    125, 127, 128, 130, 138, 149, 150, 151, 152, 186, 193, 196, 201, 202,
    211, 221, 228, 229, 230, 231, 270, 271, 274, 284, 290, 295, 296, 318,
    325,
];

fn allowed_syscalls(arch: Arch) -> &'static [i64] {
    match arch {
        Arch::I386 => &ALLOWED_SYSCALLS_I386,
        Arch::X8664 => &ALLOWED_SYSCALLS_X86_64,
    }
}

#[derive(Clone, Copy, Debug)]
struct LimitedSyscall {
    syscall: i64,
    remaining: i32,
}

const LIMITED_SYSCALLS_I386: [(i64, i32); 5] = [
    (11, 1),  // execve
    (33, 1),  // access
    (85, 1),  // readlink
    (122, 1), // uname
    (243, 1), // set_thread_area
];

const LIMITED_SYSCALLS_X86_64: [(i64, i32); 6] = [
    (21, 1),  // access
    (59, 1),  // execve
    (63, 1),  // uname
    (89, 1),  // readlink
    (158, 1), // arch_prctl
    (205, 1), // set_thread_area
];

const UNSUCCESSFUL_BRK_LIMIT: u32 = 128;

/// The stock policy: per-arch allow-list, bounded-count syscalls, and the
/// argument-checked specials for `open`, `lseek`/`_llseek` and `tgkill`,
/// plus the unsuccessful-`brk` ceiling at syscall exit.
///
/// State is scoped to one run; build a fresh policy per `run` call.
pub struct DefaultPolicy {
    allowed_files: Vec<String>,
    limited: [Vec<LimitedSyscall>; 2],
    unsuccessful_brk_calls: u32,
    error_message: String,
}

impl DefaultPolicy {
    pub fn new() -> Self {
        Self::with_allowed_files(Vec::new())
    }

    /// A policy that additionally permits `open` on exactly the given
    /// pathnames (matched literally against the string the tracee passed).
    pub fn with_allowed_files(allowed_files: Vec<String>) -> Self {
        let limited = |table: &[(i64, i32)]| -> Vec<LimitedSyscall> {
            table
                .iter()
                .map(|&(syscall, remaining)| LimitedSyscall { syscall, remaining })
                .collect()
        };
        DefaultPolicy {
            allowed_files,
            limited: [
                limited(&LIMITED_SYSCALLS_I386),
                limited(&LIMITED_SYSCALLS_X86_64),
            ],
            unsuccessful_brk_calls: 0,
            error_message: String::new(),
        }
    }

    fn consume_limited(&mut self, arch: Arch, syscall: i64) -> Option<bool> {
        for entry in &mut self.limited[arch.index()] {
            if entry.syscall == syscall {
                entry.remaining -= 1;
                return Some(entry.remaining >= 0);
            }
        }
        None
    }
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallPolicy for DefaultPolicy {
    fn on_entry(&mut self, process: &mut TracedProcess, syscall: i64) -> Result<bool> {
        let arch = process.arch();
        if allowed_syscalls(arch).binary_search(&syscall).is_ok() {
            return Ok(true);
        }
        if let Some(allowed) = self.consume_limited(arch, syscall) {
            return Ok(allowed);
        }
        if syscall == open_syscall(arch) {
            return check_open(process, &self.allowed_files);
        }
        if syscall == lseek_syscall(arch) || (arch == Arch::I386 && syscall == LLSEEK_SYSCALL_I386)
        {
            return check_lseek(process);
        }
        if syscall == tgkill_syscall(arch) {
            let allowed = check_tgkill(process)?;
            if !allowed {
                self.error_message = "tgkill to foreign process".to_owned();
            }
            return Ok(allowed);
        }
        Ok(false)
    }

    fn on_exit(&mut self, process: &mut TracedProcess, syscall: i64) -> Result<bool> {
        if syscall != brk_syscall(process.arch()) {
            return Ok(true);
        }
        let regs = process.get_registers()?;
        // The kernel reports brk failure by returning the old break, i.e.
        // something other than the requested address.
        if regs.return_value() != regs.arg(1) {
            self.unsuccessful_brk_calls += 1;
            if self.unsuccessful_brk_calls > UNSUCCESSFUL_BRK_LIMIT {
                self.error_message = "brk failed too many times".to_owned();
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn error_message(&self) -> &str {
        &self.error_message
    }
}
