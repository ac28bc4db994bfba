use crate::linux::policy::SyscallPolicy;
use crate::linux::spawn::{self, Options};
use crate::linux::string_table;
use crate::linux::system::{self, SignalMaskGuard, WaitStatus};
use crate::linux::timer::{RunTimer, WallClockTimer};
use crate::linux::tracing::{Arch, TracedProcess, VmSampler};
use anyhow::{Context, Result};
use nix::fcntl::OFlag;
use nix::libc;
use nix::unistd::{self, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

/// Verdict of one sandboxed run.
#[derive(Clone, Debug)]
pub struct ExitStat {
    /// Raw `wait(2)` status word of the tracee's final state.
    pub status: WaitStatus,
    /// Wall-clock time between supervisor attach and verdict.
    pub runtime: Duration,
    /// Peak observed virtual memory size, in bytes. Zero if no
    /// address-space-changing syscall ever completed.
    pub vm_peak: u64,
    /// Denial or setup-failure explanation; empty on a clean run, on plain
    /// signal deaths and on timer kills.
    pub message: String,
}

/// Runs `exec` under tracing with the stock wall-clock timer.
///
/// `args` become `argv[1..]`; `argv[0]` is `exec` itself. The tracee is
/// assumed to stay single-threaded; clone-family stops are not subscribed
/// to. Returns `Err` only for supervisor-side failures (the tracee is
/// killed and reaped first); every tracee-side outcome, including policy
/// kills and limit deaths, is an `Ok(ExitStat)`.
pub fn run<P: SyscallPolicy>(
    exec: &str,
    args: &[String],
    options: &Options,
    working_dir: &Path,
    policy: &mut P,
) -> Result<ExitStat> {
    run_with_timer::<P, WallClockTimer>(exec, args, options, working_dir, policy)
}

/// [`run`], parameterised over the timer object.
pub fn run_with_timer<P: SyscallPolicy, T: RunTimer>(
    exec: &str,
    args: &[String],
    options: &Options,
    working_dir: &Path,
    policy: &mut P,
) -> Result<ExitStat> {
    // Everything the child needs is materialised before fork; the child
    // itself must not allocate.
    let exec_c = CString::new(exec).context("exec path contains a NUL byte")?;
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(exec_c.clone());
    for arg in args {
        argv.push(CString::new(arg.as_str()).context("argument contains a NUL byte")?);
    }
    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|arg| arg.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let working_dir_c = CString::new(working_dir.as_os_str().as_bytes())
        .context("working directory contains a NUL byte")?;

    let (error_read, error_write) =
        unistd::pipe2(OFlag::O_CLOEXEC).context("failed to create the error pipe")?;

    // Signals stay blocked from just before fork until supervisor setup is
    // complete; the guard restores the mask on every path out.
    let mask_guard = SignalMaskGuard::block_all()?;

    match unsafe { unistd::fork() }.context("fork() failed")? {
        ForkResult::Child => {
            drop(error_read);
            spawn::run_child(
                &exec_c,
                &argv_ptrs,
                options,
                &working_dir_c,
                error_write.as_raw_fd(),
            )
        }
        ForkResult::Parent { child } => {
            drop(error_write);
            supervise::<P, T>(child, error_read, options, policy, mask_guard)
        }
    }
}

/// Kills and reaps the tracee if no report path has done so, including on
/// error unwinding. Exists so no exit path can leak a zombie.
struct ReapGuard {
    pid: Pid,
    disarmed: bool,
}

impl ReapGuard {
    fn new(pid: Pid) -> Self {
        ReapGuard {
            pid,
            disarmed: false,
        }
    }

    fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for ReapGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        let _ = nix::sys::signal::kill(self.pid, nix::sys::signal::Signal::SIGKILL);
        while let Ok(status) = system::waitpid(self.pid) {
            if status.dead() {
                break;
            }
        }
    }
}

fn supervise<P: SyscallPolicy, T: RunTimer>(
    pid: Pid,
    error_pipe: OwnedFd,
    options: &Options,
    policy: &mut P,
    mask_guard: SignalMaskGuard,
) -> Result<ExitStat> {
    // Initial stop: the SIGTRAP the kernel delivers once execvp of a
    // PTRACE_TRACEME child completes. An exit instead means bring-up
    // failed before exec and the pipe carries the reason.
    let status = system::waitpid(pid)?;
    tracing::debug!(%pid, status = status.0, "tracee reached its initial stop");
    if status.dead() {
        return Ok(ExitStat {
            status,
            runtime: Duration::ZERO,
            vm_peak: 0,
            message: spawn::receive_error_message(error_pipe),
        });
    }

    let guard = ReapGuard::new(pid);
    let mut process = TracedProcess::new(pid);

    // Configure tracing, probe the architecture, open the VM observer, arm
    // the timer. A failure anywhere in here unwinds through the guard.
    process.init()?;
    process.detect_arch()?;
    let vm = VmSampler::open(pid)?;
    let timer = T::start(pid, options.time_limit);
    drop(mask_guard);

    let mut run = RunContext {
        process,
        timer,
        vm,
        vm_pages: 0,
        status,
        error_pipe: Some(error_pipe),
        guard,
    };
    run.drive(policy)
}

/// Why one trip through the supervisor loop ended.
enum Step {
    /// Syscall completed and both policy decisions passed.
    Continue,
    /// Tracee exited or died of a signal; report as-is.
    Report,
    /// Policy denied this syscall at entry or exit.
    Deny(i64),
}

struct RunContext<T: RunTimer> {
    process: TracedProcess,
    timer: T,
    vm: VmSampler,
    vm_pages: u64,
    status: WaitStatus,
    error_pipe: Option<OwnedFd>,
    guard: ReapGuard,
}

/// Syscalls after which the address space may have changed, the only
/// points at which the VM observer is consulted.
fn changes_address_space(arch: Arch, syscall: i64) -> bool {
    match arch {
        Arch::I386 => matches!(syscall, 45 | 90 | 163 | 192), // brk, mmap, mremap, mmap2
        Arch::X8664 => matches!(syscall, 9 | 12 | 25),        // mmap, brk, mremap
    }
}

impl<T: RunTimer> RunContext<T> {
    fn drive<P: SyscallPolicy>(&mut self, policy: &mut P) -> Result<ExitStat> {
        loop {
            match self.step(policy) {
                Ok(Step::Continue) => {}
                Ok(Step::Report) => return self.exit_normally(),
                Ok(Step::Deny(syscall)) => return self.kill_for(policy, syscall),
                Err(error) => {
                    // The tracee may have died under us (timer kill, OOM)
                    // between the stop and our inspection of it. Probe: a
                    // stale ESRCH is reaped and reported, anything else is
                    // a real supervisor failure.
                    if self.process.is_lost() {
                        tracing::debug!(pid = %self.process.pid(), "tracee lost mid-loop, reaping");
                        self.reap();
                        return self.exit_normally();
                    }
                    return Err(error);
                }
            }
        }
    }

    /// One full syscall: entry stop, entry decision, exit stop, VM sample,
    /// exit decision.
    fn step<P: SyscallPolicy>(&mut self, policy: &mut P) -> Result<Step> {
        if self.wait_for_syscall()? {
            return Ok(Step::Report);
        }
        let syscall = self.process.peek_syscall_number()?;
        if !policy.on_entry(&mut self.process, syscall)? {
            tracing::debug!(pid = %self.process.pid(), syscall, "syscall denied at entry");
            return Ok(Step::Deny(syscall));
        }
        if self.wait_for_syscall()? {
            return Ok(Step::Report);
        }
        if changes_address_space(self.process.arch(), syscall) {
            let pages = self.vm.sample()?;
            self.vm_pages = self.vm_pages.max(pages);
        }
        if !policy.on_exit(&mut self.process, syscall)? {
            tracing::debug!(pid = %self.process.pid(), syscall, "syscall denied at exit");
            return Ok(Step::Deny(syscall));
        }
        Ok(Step::Continue)
    }

    /// Resumes the tracee and consumes stops until the next syscall
    /// boundary. `Ok(true)` means the tracee is dead and already waited.
    ///
    /// Benign stop signals (SIGSTOP, SIGTRAP, SIGCONT) are swallowed;
    /// anything else is re-injected with PTRACE_CONT so the tracee
    /// observes it. A failed resume is ignored on purpose: the tracee has
    /// just died and the next wait reports how.
    fn wait_for_syscall(&mut self) -> Result<bool> {
        loop {
            let _ = self.process.resume_syscall();
            let status = self.process.wait()?;
            self.status = status;
            if status.stopped() {
                if status.is_syscall_stop() {
                    return Ok(false);
                }
                match status.stop_signal() {
                    libc::SIGSTOP | libc::SIGTRAP | libc::SIGCONT => {}
                    signal => {
                        tracing::trace!(pid = %self.process.pid(), signal, "re-injecting signal");
                        let _ = self.process.resume_signal(signal);
                    }
                }
            } else if status.dead() {
                self.guard.disarm();
                return Ok(true);
            }
        }
    }

    /// SIGKILL the tracee and wait until the status reflects termination.
    fn reap(&mut self) {
        self.process.kill();
        while let Ok(status) = system::waitpid(self.process.pid()) {
            self.status = status;
            if status.dead() {
                break;
            }
        }
        self.guard.disarm();
    }

    fn vm_peak_bytes(&self) -> u64 {
        self.vm_pages * system::page_size()
    }

    /// Verdict for a tracee that terminated by itself (or was killed by
    /// the timer). A nonzero status may carry a frame on the error pipe;
    /// a clean exit never does.
    fn exit_normally(&mut self) -> Result<ExitStat> {
        let runtime = self.timer.stop_and_get_runtime();
        let message = if self.status.0 != 0 {
            self.error_pipe
                .take()
                .map(spawn::receive_error_message)
                .unwrap_or_default()
        } else {
            String::new()
        };
        Ok(ExitStat {
            status: self.status,
            runtime,
            vm_peak: self.vm_peak_bytes(),
            message,
        })
    }

    /// Verdict for a policy denial: stop the clock, kill and reap the
    /// tracee, pick the message.
    fn kill_for<P: SyscallPolicy>(&mut self, policy: &P, syscall: i64) -> Result<ExitStat> {
        let runtime = self.timer.stop_and_get_runtime();
        self.reap();

        let mut message = policy.error_message().to_owned();
        if message.is_empty() {
            message = match string_table::syscall_name(self.process.arch(), syscall) {
                Some(name) => format!("forbidden syscall {syscall}: {name}()"),
                None => format!("forbidden syscall {syscall}"),
            };
        }
        tracing::debug!(pid = %self.process.pid(), %message, "tracee killed by policy");

        Ok(ExitStat {
            status: self.status,
            runtime,
            vm_peak: self.vm_peak_bytes(),
            message,
        })
    }
}
