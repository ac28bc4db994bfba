//! Shared helpers for the end-to-end tests: the fixture path and a few
//! purpose-built policies.
//!
//! The stock `DefaultPolicy` tables predate `openat`-era glibc, so any
//! modern dynamically linked binary dies during startup under it (one test
//! pins that down). The scenario tests therefore run under permissive or
//! selectively restrictive policies built on the same argument checks.

use anyhow::Result;
use std::path::Path;
use tracebox::{check_lseek, check_open, check_tgkill, ExitStat, Options, SyscallPolicy, TracedProcess};

pub fn fixture() -> &'static str {
    env!("CARGO_BIN_EXE_tracee-fixture")
}

/// Options wiring all three standard streams to `/dev/null`, for fixtures
/// whose own descriptors must not land on 0–2. The returned file must
/// outlive the run.
pub fn devnull_options() -> (std::fs::File, Options) {
    use std::os::fd::AsRawFd;
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .unwrap();
    let fd = devnull.as_raw_fd();
    let options = Options {
        stdin_fd: Some(fd),
        stdout_fd: Some(fd),
        stderr_fd: Some(fd),
        ..Options::default()
    };
    (devnull, options)
}

/// Runs the fixture with `args` under `policy`, panicking on supervisor
/// failures (the tests only expect tracee-side outcomes).
pub fn run_fixture(policy: &mut impl SyscallPolicy, args: &[&str], options: &Options) -> ExitStat {
    let args: Vec<String> = args.iter().map(|&arg| arg.to_owned()).collect();
    tracebox::run(fixture(), &args, options, Path::new("."), policy)
        .expect("sandbox run failed on the supervisor side")
}

/// Admits every syscall.
pub struct Permissive;

impl SyscallPolicy for Permissive {
    fn on_entry(&mut self, _process: &mut TracedProcess, _syscall: i64) -> Result<bool> {
        Ok(true)
    }

    fn on_exit(&mut self, _process: &mut TracedProcess, _syscall: i64) -> Result<bool> {
        Ok(true)
    }

    fn error_message(&self) -> &str {
        ""
    }
}

/// Admits everything except one syscall number.
pub struct DenyOne(pub i64);

impl SyscallPolicy for DenyOne {
    fn on_entry(&mut self, _process: &mut TracedProcess, syscall: i64) -> Result<bool> {
        Ok(syscall != self.0)
    }

    fn on_exit(&mut self, _process: &mut TracedProcess, _syscall: i64) -> Result<bool> {
        Ok(true)
    }

    fn error_message(&self) -> &str {
        ""
    }
}

/// Admits everything, but routes `open(2)` through the stock pathname
/// check with the given allow-list.
pub struct OpenFilter(pub Vec<String>);

impl SyscallPolicy for OpenFilter {
    fn on_entry(&mut self, process: &mut TracedProcess, syscall: i64) -> Result<bool> {
        if syscall == libc::SYS_open {
            return check_open(process, &self.0);
        }
        Ok(true)
    }

    fn on_exit(&mut self, _process: &mut TracedProcess, _syscall: i64) -> Result<bool> {
        Ok(true)
    }

    fn error_message(&self) -> &str {
        ""
    }
}

/// Admits everything, but routes `lseek(2)` through the stock fd check.
pub struct LseekFilter;

impl SyscallPolicy for LseekFilter {
    fn on_entry(&mut self, process: &mut TracedProcess, syscall: i64) -> Result<bool> {
        if syscall == libc::SYS_lseek {
            return check_lseek(process);
        }
        Ok(true)
    }

    fn on_exit(&mut self, _process: &mut TracedProcess, _syscall: i64) -> Result<bool> {
        Ok(true)
    }

    fn error_message(&self) -> &str {
        ""
    }
}

/// Admits everything, but routes `tgkill(2)` through the self-signal
/// check.
#[derive(Default)]
pub struct TgkillFilter {
    message: String,
}

impl SyscallPolicy for TgkillFilter {
    fn on_entry(&mut self, process: &mut TracedProcess, syscall: i64) -> Result<bool> {
        if syscall == libc::SYS_tgkill {
            let allowed = check_tgkill(process)?;
            if !allowed {
                self.message = "tgkill to foreign process".to_owned();
            }
            return Ok(allowed);
        }
        Ok(true)
    }

    fn on_exit(&mut self, _process: &mut TracedProcess, _syscall: i64) -> Result<bool> {
        Ok(true)
    }

    fn error_message(&self) -> &str {
        &self.message
    }
}

/// Admits everything, with a bounded budget for `execve(2)`.
pub struct ExecBudget(pub i32);

impl SyscallPolicy for ExecBudget {
    fn on_entry(&mut self, _process: &mut TracedProcess, syscall: i64) -> Result<bool> {
        if syscall == libc::SYS_execve {
            self.0 -= 1;
            return Ok(self.0 >= 0);
        }
        Ok(true)
    }

    fn on_exit(&mut self, _process: &mut TracedProcess, _syscall: i64) -> Result<bool> {
        Ok(true)
    }

    fn error_message(&self) -> &str {
        ""
    }
}

/// Admits every entry but applies the stock exit-side `brk` accounting.
pub struct BrkWatch(pub tracebox::DefaultPolicy);

impl SyscallPolicy for BrkWatch {
    fn on_entry(&mut self, _process: &mut TracedProcess, _syscall: i64) -> Result<bool> {
        Ok(true)
    }

    fn on_exit(&mut self, process: &mut TracedProcess, syscall: i64) -> Result<bool> {
        self.0.on_exit(process, syscall)
    }

    fn error_message(&self) -> &str {
        self.0.error_message()
    }
}
