//! Raw-syscall tracee driven by the end-to-end tests.
//!
//! Each mode performs a tiny deterministic sequence of syscalls so the
//! tests can pin down exactly which call the policy saw. File-related
//! modes issue `SYS_open`/`SYS_lseek` directly: the libc wrappers route
//! through `openat` and would bypass the checks under test.

use std::env;
use std::ffi::CString;

fn main() {
    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("hello");
    match mode {
        "hello" => hello(),
        "spin" => loop {
            std::hint::spin_loop();
        },
        "alloc" => alloc_until_failure(),
        "socket" => {
            unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        }
        "open" => open_pair(&args[2], &args[3]),
        "lseek-file" => lseek_clobbered_file(),
        "lseek-stdout" => {
            unsafe {
                libc::syscall(
                    libc::SYS_lseek,
                    1 as libc::c_long,
                    0 as libc::c_long,
                    libc::SEEK_CUR as libc::c_long,
                )
            };
        }
        "exec-chain2" => exec_self(&args[0], "exec-chain1"),
        "exec-chain1" => exec_self(&args[0], "hello"),
        "tgkill-foreign" => {
            // tgid/tid 1 can never be this process.
            unsafe {
                libc::syscall(
                    libc::SYS_tgkill,
                    1 as libc::c_long,
                    1 as libc::c_long,
                    0 as libc::c_long,
                )
            };
        }
        "brk-flood" => {
            // Requests below the minimum break always fail, returning the
            // old break instead of the requested address.
            for _ in 0..200 {
                unsafe { libc::syscall(libc::SYS_brk, 4096 as libc::c_long) };
            }
        }
        _ => std::process::exit(64),
    }
    std::process::exit(0);
}

fn hello() {
    unsafe { libc::write(1, b"hi\n".as_ptr().cast(), 3) };
}

/// Maps and touches anonymous memory until the kernel refuses, then
/// aborts. Under RLIMIT_AS this dies of a signal near the ceiling; without
/// a limit it exits cleanly after 256 MiB.
fn alloc_until_failure() {
    const CHUNK: usize = 1 << 20;
    unsafe {
        for _ in 0..256 {
            let chunk = libc::mmap(
                std::ptr::null_mut(),
                CHUNK,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if chunk == libc::MAP_FAILED {
                libc::abort();
            }
            std::ptr::write_bytes(chunk.cast::<u8>(), 0xa5, CHUNK);
        }
    }
}

/// Opens `allowed` (must succeed) then `denied` (must fail with EFAULT,
/// the signature of a clobbered pathname pointer). Exit codes tell the
/// test which step misbehaved.
fn open_pair(allowed: &str, denied: &str) {
    let allowed = CString::new(allowed).unwrap();
    let denied = CString::new(denied).unwrap();
    unsafe {
        let fd =
            libc::syscall(libc::SYS_open, allowed.as_ptr(), libc::O_RDONLY as libc::c_long) as i32;
        if fd < 0 {
            std::process::exit(3);
        }
        libc::close(fd);

        let rc =
            libc::syscall(libc::SYS_open, denied.as_ptr(), libc::O_RDONLY as libc::c_long) as i32;
        if rc >= 0 {
            std::process::exit(4);
        }
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::EFAULT) {
            std::process::exit(5);
        }
    }
}

/// Seeks a real descriptor through `SYS_lseek`; the sandbox clobbers the
/// fd to -1, so EBADF is the expected outcome.
fn lseek_clobbered_file() {
    let path = CString::new("/dev/null").unwrap();
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_RDONLY);
        if fd < 0 {
            std::process::exit(3);
        }
        let rc = libc::syscall(
            libc::SYS_lseek,
            fd as libc::c_long,
            0 as libc::c_long,
            libc::SEEK_SET as libc::c_long,
        );
        if rc >= 0 {
            std::process::exit(4);
        }
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::EBADF) {
            std::process::exit(5);
        }
    }
}

fn exec_self(exe: &str, next_mode: &str) {
    let exe = CString::new(exe).unwrap();
    let mode = CString::new(next_mode).unwrap();
    let argv = [exe.as_ptr(), mode.as_ptr(), std::ptr::null()];
    unsafe { libc::execv(exe.as_ptr(), argv.as_ptr()) };
    // Reached only if the exec came back instead of being denied.
    std::process::exit(7);
}
