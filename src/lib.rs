//! A ptrace-based process sandbox for Linux/x86_64.
//!
//! `tracebox` launches an untrusted program under kernel tracing, stops it
//! at every syscall entry and exit, and asks a [`SyscallPolicy`] whether
//! the call may proceed. Wall-clock and address-space ceilings are
//! enforced alongside, and every run ends in a structured [`ExitStat`]
//! verdict: normal exit, signal death, limit kill, or forbidden syscall.
//!
//! ```no_run
//! use tracebox::{run, DefaultPolicy, Options};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let options = Options {
//!     time_limit: Some(Duration::from_secs(2)),
//!     memory_limit: Some(64 << 20),
//!     ..Options::default()
//! };
//! let mut policy = DefaultPolicy::new();
//! let verdict = run("./solution", &[], &options, Path::new("."), &mut policy)?;
//! if verdict.status.exited() && verdict.status.exit_code() == 0 {
//!     println!("ran for {:?}, peak {} bytes", verdict.runtime, verdict.vm_peak);
//! } else {
//!     println!("rejected: {}", verdict.message);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The tracee is assumed to be a single task: clone-family ptrace events
//! are not subscribed to. The sandbox is not a container — there is no
//! namespace or cgroup isolation here, only syscall filtering and resource
//! ceilings.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use linux::{
    policy::{check_lseek, check_open, check_tgkill, DefaultPolicy, SyscallPolicy},
    running::{run, run_with_timer, ExitStat},
    spawn::Options,
    system::WaitStatus,
    timer::{RunTimer, WallClockTimer},
    tracing::{Arch, Registers, TracedProcess, UserRegs32, VmSampler},
};
