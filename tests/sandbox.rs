//! End-to-end scenarios: fixture programs run under the full supervisor.

mod common;

use common::*;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracebox::{DefaultPolicy, Options};

#[test]
fn happy_path_reports_output_runtime_and_memory() {
    let stdout = NamedTempFile::new().unwrap();
    let options = Options {
        stdout_fd: Some(stdout.as_file().as_raw_fd()),
        ..Options::default()
    };
    let verdict = run_fixture(&mut Permissive, &["hello"], &options);

    assert!(verdict.status.exited(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.exit_code(), 0);
    assert_eq!(verdict.message, "");
    assert!(verdict.runtime > Duration::ZERO);
    // Startup maps plenty of memory; the exit-side sampler must have seen it.
    assert!(verdict.vm_peak > 0);

    let mut output = String::new();
    stdout.reopen().unwrap().read_to_string(&mut output).unwrap();
    assert_eq!(output, "hi\n");
}

#[test]
fn forbidden_syscall_kills_with_a_named_message() {
    let verdict = run_fixture(&mut DenyOne(libc::SYS_socket), &["socket"], &Options::default());

    assert!(verdict.status.signaled(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.term_signal(), libc::SIGKILL);
    assert_eq!(verdict.message, "forbidden syscall 41: socket()");
    assert!(verdict.runtime > Duration::ZERO);
}

#[test]
fn open_is_allowed_by_list_and_clobbered_otherwise() {
    let allowed = NamedTempFile::new().unwrap();
    let denied = NamedTempFile::new().unwrap();
    let allowed_path = allowed.path().to_str().unwrap().to_owned();
    let denied_path = denied.path().to_str().unwrap().to_owned();

    let mut policy = OpenFilter(vec![allowed_path.clone()]);
    let verdict = run_fixture(
        &mut policy,
        &["open", &allowed_path, &denied_path],
        &Options::default(),
    );

    // The fixture exits nonzero if the allowed open failed (3), the denied
    // open succeeded (4), or the denied open failed with anything but
    // EFAULT (5). The tracee must survive the denied open.
    assert!(verdict.status.exited(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.exit_code(), 0, "message: {}", verdict.message);
    assert_eq!(verdict.message, "");
}

#[test]
fn lseek_on_a_file_descriptor_fails_in_the_tracee() {
    // Standard streams must be occupied, or the fixture's own open would
    // land on fd 0 and hit the std-stream rule instead of the clobber.
    let (_devnull, options) = devnull_options();
    let verdict = run_fixture(&mut LseekFilter, &["lseek-file"], &options);

    assert!(verdict.status.exited(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.exit_code(), 0, "message: {}", verdict.message);
}

#[test]
fn lseek_on_a_standard_stream_is_fatal() {
    let verdict = run_fixture(&mut LseekFilter, &["lseek-stdout"], &Options::default());

    assert!(verdict.status.signaled(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.term_signal(), libc::SIGKILL);
    assert_eq!(verdict.message, "forbidden syscall 8: lseek()");
}

#[test]
fn time_limit_kills_a_spinning_tracee() {
    let options = Options {
        time_limit: Some(Duration::from_millis(500)),
        ..Options::default()
    };
    let verdict = run_fixture(&mut Permissive, &["spin"], &options);

    assert!(verdict.status.signaled(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.term_signal(), libc::SIGKILL);
    assert_eq!(verdict.message, "");
    assert!(verdict.runtime >= Duration::from_millis(500));
    assert!(verdict.runtime < Duration::from_secs(10));
}

#[test]
fn no_time_limit_runs_to_natural_termination() {
    let verdict = run_fixture(&mut Permissive, &["hello"], &Options::default());
    assert!(verdict.status.exited());
    assert_eq!(verdict.status.exit_code(), 0);
}

#[test]
fn memory_limit_turns_allocation_into_signal_death() {
    let options = Options {
        memory_limit: Some(64 << 20),
        ..Options::default()
    };
    let verdict = run_fixture(&mut Permissive, &["alloc"], &options);

    // mmap failure makes the fixture abort; the peak was sampled on the
    // way up and must reflect the climb towards the ceiling.
    assert!(verdict.status.signaled(), "status: {:?}", verdict.status);
    assert_eq!(verdict.message, "");
    assert!(
        verdict.vm_peak >= 32 << 20,
        "vm_peak too small: {}",
        verdict.vm_peak
    );
}

#[test]
fn without_memory_limit_the_allocator_succeeds() {
    let verdict = run_fixture(&mut Permissive, &["alloc"], &Options::default());
    assert!(verdict.status.exited(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.exit_code(), 0);
    assert!(verdict.vm_peak >= 256 << 20);
}

#[test]
fn bounded_execve_budget_exhausts() {
    // Budget of one: the fixture's first re-exec passes, the second is
    // denied. The exec that started the tracee happens before tracing
    // decisions begin and does not count.
    let verdict = run_fixture(&mut ExecBudget(1), &["exec-chain2"], &Options::default());

    assert!(verdict.status.signaled(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.term_signal(), libc::SIGKILL);
    assert_eq!(verdict.message, "forbidden syscall 59: execve()");
}

#[test]
fn tgkill_to_a_foreign_process_is_fatal() {
    let mut policy = TgkillFilter::default();
    let verdict = run_fixture(&mut policy, &["tgkill-foreign"], &Options::default());

    assert!(verdict.status.signaled(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.term_signal(), libc::SIGKILL);
    assert_eq!(verdict.message, "tgkill to foreign process");
}

#[test]
fn brk_exhaustion_is_fatal_with_its_own_message() {
    let mut policy = BrkWatch(DefaultPolicy::new());
    let verdict = run_fixture(&mut policy, &["brk-flood"], &Options::default());

    assert!(verdict.status.signaled(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.term_signal(), libc::SIGKILL);
    assert_eq!(verdict.message, "brk failed too many times");
}

#[test]
fn default_policy_rejects_a_modern_dynamic_binary() {
    // The stock allow-list predates openat-era glibc: a current dynamic
    // binary cannot even finish loading without hitting a denial.
    let mut policy = DefaultPolicy::new();
    let verdict = run_fixture(&mut policy, &["hello"], &Options::default());

    assert!(verdict.status.signaled(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.term_signal(), libc::SIGKILL);
    assert!(
        verdict.message.starts_with("forbidden syscall"),
        "message: {}",
        verdict.message
    );
}

#[test]
fn exec_of_a_missing_binary_reports_the_setup_error() {
    let mut policy = Permissive;
    let verdict = tracebox::run(
        "/nonexistent/program",
        &[],
        &Options::default(),
        std::path::Path::new("."),
        &mut policy,
    )
    .unwrap();

    assert!(verdict.status.exited(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.exit_code(), 255);
    assert!(verdict.message.starts_with("execvp(): "), "message: {}", verdict.message);
    assert_eq!(verdict.runtime, Duration::ZERO);
}

#[test]
fn bad_working_directory_reports_chdir() {
    let mut policy = Permissive;
    let verdict = tracebox::run(
        fixture(),
        &[],
        &Options::default(),
        std::path::Path::new("/nonexistent/directory"),
        &mut policy,
    )
    .unwrap();

    assert!(verdict.status.exited(), "status: {:?}", verdict.status);
    assert_eq!(verdict.status.exit_code(), 255);
    assert!(verdict.message.starts_with("chdir(): "), "message: {}", verdict.message);
}

#[test]
fn back_to_back_runs_agree() {
    let first = run_fixture(&mut DenyOne(libc::SYS_socket), &["socket"], &Options::default());
    let second = run_fixture(&mut DenyOne(libc::SYS_socket), &["socket"], &Options::default());

    assert_eq!(first.status, second.status);
    assert_eq!(first.message, second.message);
}
