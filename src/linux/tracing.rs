use crate::linux::system::{self, WaitStatus};
use anyhow::{bail, ensure, Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::libc::c_void;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::mem::MaybeUninit;

/// Bitness of the tracee, decided once from the ELF class of its executable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    I386,
    X8664,
}

impl Arch {
    pub(crate) fn index(self) -> usize {
        match self {
            Arch::I386 => 0,
            Arch::X8664 => 1,
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.write_str(match self {
            Arch::I386 => "i386",
            Arch::X8664 => "x86_64",
        })
    }
}

/// General-purpose register block of a 32-bit tracee, in the layout
/// `PTRACE_GETREGSET` uses for `NT_PRSTATUS` on such a task.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UserRegs32 {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub xds: u32,
    pub xes: u32,
    pub xfs: u32,
    pub xgs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub xcs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub xss: u32,
}

/// Arch-tagged snapshot of the tracee's general-purpose registers.
///
/// Snapshots are plain values: mutate a copy, then write the whole block
/// back with [`TracedProcess::set_registers`].
#[derive(Clone)]
pub enum Registers {
    I386(UserRegs32),
    X8664(libc::user_regs_struct),
}

impl Registers {
    /// Number of the syscall the tracee is entering or leaving.
    pub fn syscall_number(&self) -> i64 {
        match self {
            Registers::I386(regs) => regs.orig_eax as i32 as i64,
            Registers::X8664(regs) => regs.orig_rax as i64,
        }
    }

    /// Syscall argument registers, 1-based, sign-extended to 64 bits so the
    /// policy layer handles both bitnesses uniformly.
    pub fn arg(&self, index: usize) -> i64 {
        match self {
            Registers::I386(regs) => {
                let value = match index {
                    1 => regs.ebx,
                    2 => regs.ecx,
                    3 => regs.edx,
                    4 => regs.esi,
                    5 => regs.edi,
                    6 => regs.ebp,
                    _ => panic!("syscall argument index out of range: {index}"),
                };
                value as i32 as i64
            }
            Registers::X8664(regs) => {
                let value = match index {
                    1 => regs.rdi,
                    2 => regs.rsi,
                    3 => regs.rdx,
                    4 => regs.r10,
                    5 => regs.r8,
                    6 => regs.r9,
                    _ => panic!("syscall argument index out of range: {index}"),
                };
                value as i64
            }
        }
    }

    /// Syscall argument as a tracee address. Unlike [`Self::arg`], the
    /// 32-bit registers are zero-extended: a stack pointer like
    /// `0xbfff_f000` is a high 32-bit address, not a negative value.
    pub fn arg_addr(&self, index: usize) -> u64 {
        match self {
            Registers::I386(_) => self.arg(index) as u32 as u64,
            Registers::X8664(_) => self.arg(index) as u64,
        }
    }

    pub fn set_arg(&mut self, index: usize, value: i64) {
        match self {
            Registers::I386(regs) => {
                let slot = match index {
                    1 => &mut regs.ebx,
                    2 => &mut regs.ecx,
                    3 => &mut regs.edx,
                    4 => &mut regs.esi,
                    5 => &mut regs.edi,
                    6 => &mut regs.ebp,
                    _ => panic!("syscall argument index out of range: {index}"),
                };
                *slot = value as u32;
            }
            Registers::X8664(regs) => {
                let slot = match index {
                    1 => &mut regs.rdi,
                    2 => &mut regs.rsi,
                    3 => &mut regs.rdx,
                    4 => &mut regs.r10,
                    5 => &mut regs.r8,
                    6 => &mut regs.r9,
                    _ => panic!("syscall argument index out of range: {index}"),
                };
                *slot = value as u64;
            }
        }
    }

    pub fn return_value(&self) -> i64 {
        match self {
            Registers::I386(regs) => regs.eax as i32 as i64,
            Registers::X8664(regs) => regs.rax as i64,
        }
    }

    pub fn instruction_pointer(&self) -> u64 {
        match self {
            Registers::I386(regs) => regs.eip as u64,
            Registers::X8664(regs) => regs.rip,
        }
    }
}

/// A process running under our tracing. Identified by its pid plus the
/// architecture tag, which is probed once after the initial stop and is
/// immutable afterwards.
pub struct TracedProcess {
    pid: Pid,
    arch: Option<Arch>,
}

impl TracedProcess {
    pub fn new(pid: Pid) -> Self {
        TracedProcess { pid, arch: None }
    }

    #[cfg(test)]
    pub(crate) fn with_arch(pid: Pid, arch: Arch) -> Self {
        TracedProcess {
            pid,
            arch: Some(arch),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Architecture tag. Must not be called before [`Self::detect_arch`].
    pub fn arch(&self) -> Arch {
        self.arch
            .expect("tracee architecture must be probed before use")
    }

    /// Reads the ELF class byte of `/proc/<pid>/exe`. Runs after the
    /// tracee's initial stop, i.e. once the target image is in place, and
    /// only once per tracee.
    pub fn detect_arch(&mut self) -> Result<Arch> {
        if let Some(arch) = self.arch {
            return Ok(arch);
        }
        let path = self.procfs_path("exe");
        let mut file = File::open(&path).with_context(|| format!("failed to open {path}"))?;
        file.seek(SeekFrom::Start(4))
            .with_context(|| format!("failed to seek in {path}"))?;
        let mut class = [0u8; 1];
        file.read_exact(&mut class)
            .with_context(|| format!("failed to read ELF class from {path}"))?;
        let arch = match class[0] {
            1 => Arch::I386,
            2 => Arch::X8664,
            other => bail!("unsupported architecture (ELF class {other})"),
        };
        tracing::debug!(pid = %self.pid, %arch, "tracee architecture detected");
        self.arch = Some(arch);
        Ok(arch)
    }

    fn procfs_path(&self, name: &str) -> String {
        format!("/proc/{}/{name}", self.pid)
    }

    /// Configures the tracing options the supervisor relies on: syscall
    /// stops distinguishable from signal stops, and a kernel-side kill of
    /// the tracee should the supervisor itself die.
    pub fn init(&self) -> Result<()> {
        ptrace::setoptions(
            self.pid,
            ptrace::Options::PTRACE_O_TRACESYSGOOD | ptrace::Options::PTRACE_O_EXITKILL,
        )
        .context("failed to set ptrace options")
    }

    /// Resumes the tracee until the next syscall boundary. Failure is
    /// deliberately ignored by callers in the stop loop: it means the
    /// tracee has just died and the next `wait` will report how.
    pub fn resume_syscall(&self) -> Result<()> {
        ptrace::syscall(self.pid, None).context("failed to ptrace-resume the tracee")
    }

    /// Resumes the tracee delivering `signal`. Raw `libc` because the
    /// supervisor forwards whatever number `wait` reported, including
    /// realtime signals outside `nix`'s `Signal` enum.
    pub fn resume_signal(&self, signal: i32) -> Result<()> {
        if unsafe {
            libc::ptrace(
                libc::PTRACE_CONT,
                self.pid.as_raw(),
                std::ptr::null_mut::<c_void>(),
                signal as *mut c_void,
            )
        } == -1
        {
            return Err(std::io::Error::last_os_error())
                .context("failed to ptrace-resume the tracee with a signal");
        }
        Ok(())
    }

    pub fn wait(&self) -> Result<WaitStatus> {
        system::waitpid(self.pid)
    }

    /// Syscall-number peek via `PTRACE_PEEKUSER`, avoiding a full regset
    /// fetch. The native `orig_rax` slot is valid for 32-bit tracees too:
    /// x86_64 kernels expose the user area in 64-bit layout either way.
    pub fn peek_syscall_number(&self) -> Result<i64> {
        let offset = std::mem::offset_of!(libc::user_regs_struct, orig_rax);
        let value = ptrace::read_user(self.pid, offset as ptrace::AddressType)
            .context("failed to peek the syscall number")?;
        Ok(value as i64)
    }

    /// Probe used when a tracing call has failed mid-loop: `ESRCH` here
    /// means the tracee is already dying and should be reaped, anything
    /// else means the original error was real.
    pub fn is_lost(&self) -> bool {
        matches!(
            ptrace::read_user(self.pid, std::ptr::null_mut()),
            Err(Errno::ESRCH)
        )
    }

    pub fn get_registers(&self) -> Result<Registers> {
        match self.arch() {
            Arch::I386 => Ok(Registers::I386(self.getregset::<UserRegs32>()?)),
            Arch::X8664 => Ok(Registers::X8664(
                self.getregset::<libc::user_regs_struct>()?,
            )),
        }
    }

    pub fn set_registers(&self, regs: &Registers) -> Result<()> {
        match regs {
            Registers::I386(regs) => self.setregset(regs),
            Registers::X8664(regs) => self.setregset(regs),
        }
    }

    fn getregset<T>(&self) -> Result<T> {
        let mut data = MaybeUninit::<T>::uninit();
        let mut iovec = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut c_void,
            iov_len: std::mem::size_of::<T>(),
        };
        if unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as *mut c_void,
                &mut iovec,
            )
        } == -1
        {
            return Err(std::io::Error::last_os_error())
                .context("failed to read registers of the tracee");
        }
        ensure!(
            iovec.iov_len == std::mem::size_of::<T>(),
            "register set size mismatch: kernel returned {} bytes, expected {}",
            iovec.iov_len,
            std::mem::size_of::<T>()
        );
        unsafe { Ok(data.assume_init()) }
    }

    fn setregset<T>(&self, regs: &T) -> Result<()> {
        let mut iovec = libc::iovec {
            iov_base: regs as *const T as *mut c_void,
            iov_len: std::mem::size_of::<T>(),
        };
        if unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as *mut c_void,
                &mut iovec,
            )
        } == -1
        {
            return Err(std::io::Error::last_os_error())
                .context("failed to store registers of the tracee");
        }
        ensure!(
            iovec.iov_len == std::mem::size_of::<T>(),
            "register set size mismatch on write"
        );
        Ok(())
    }

    /// Reads a NUL-terminated string from the tracee's address space, one
    /// word at a time via `PTRACE_PEEKDATA`, up to `max_len` bytes.
    ///
    /// `None` means a word read failed (typically `EFAULT` on a bogus
    /// pointer, which the kernel would reject as well). Hitting `max_len`
    /// before a NUL truncates rather than fails.
    pub fn read_cstring(&self, address: u64, max_len: usize) -> Option<Vec<u8>> {
        let word_size = std::mem::size_of::<libc::c_long>() as u64;
        let mut bytes = Vec::new();
        let mut addr = address;
        while bytes.len() < max_len {
            let word = ptrace::read(self.pid, addr as ptrace::AddressType).ok()?;
            for byte in word.to_ne_bytes() {
                if byte == 0 {
                    return Some(bytes);
                }
                bytes.push(byte);
                if bytes.len() == max_len {
                    return Some(bytes);
                }
            }
            addr += word_size;
        }
        Some(bytes)
    }

    /// Overwrites one argument register in place: full regset read,
    /// mutation, full write-back. Used to neutralise a call so the kernel
    /// fails it instead of us killing the tracee.
    pub fn clobber_arg(&self, index: usize, value: i64) -> Result<()> {
        let mut regs = self.get_registers()?;
        regs.set_arg(index, value);
        self.set_registers(&regs)
    }

    pub fn kill(&self) {
        // ESRCH just means we lost the race with the tracee's death.
        let _ = signal::kill(self.pid, Signal::SIGKILL);
    }
}

impl std::fmt::Debug for TracedProcess {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "traced process {}", self.pid)
    }
}

/// Peak-VM observer over `/proc/<pid>/statm`, held open for the lifetime of
/// a run. Sampled only around syscalls known to change the address space.
pub struct VmSampler {
    pid: Pid,
    statm: File,
}

impl VmSampler {
    pub fn open(pid: Pid) -> Result<Self> {
        let path = format!("/proc/{pid}/statm");
        let statm = File::open(&path).with_context(|| format!("failed to open {path}"))?;
        Ok(VmSampler { pid, statm })
    }

    /// Current virtual memory size in pages: the leading decimal field of
    /// `statm`, reread from offset zero each time.
    pub fn sample(&mut self) -> Result<u64> {
        self.statm
            .seek(SeekFrom::Start(0))
            .with_context(|| format!("failed to rewind /proc/{}/statm", self.pid))?;
        let mut buf = [0u8; 31];
        let len = self
            .statm
            .read(&mut buf)
            .with_context(|| format!("failed to read /proc/{}/statm", self.pid))?;
        ensure!(len > 0, "empty read from /proc/{}/statm", self.pid);

        let mut pages: u64 = 0;
        for &byte in &buf[..len] {
            if !byte.is_ascii_digit() {
                break;
            }
            pages = pages * 10 + u64::from(byte - b'0');
        }
        Ok(pages)
    }
}
