use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Wall-clock watchdog the supervisor is parameterised over.
///
/// `start` arms the timer against a tracee; once the limit elapses the
/// implementation must deliver `SIGKILL` to it. `stop_and_get_runtime`
/// cancels the pending kill and reports elapsed wall time; it is idempotent.
pub trait RunTimer {
    fn start(pid: Pid, limit: Option<Duration>) -> Self;
    fn stop_and_get_runtime(&mut self) -> Duration;
}

/// Default [`RunTimer`]: a helper thread parked on a channel with the limit
/// as its receive timeout. A real timeout kills the tracee; cancellation
/// (explicit or by dropping the timer) wakes the thread without killing.
///
/// A kill can still race the tracee's own death; that is fine, `SIGKILL` to
/// a dead pid is simply ignored and the supervisor treats every wait result
/// as possibly terminal.
pub struct WallClockTimer {
    started: Instant,
    runtime: Option<Duration>,
    cancel: Option<mpsc::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl RunTimer for WallClockTimer {
    fn start(pid: Pid, limit: Option<Duration>) -> Self {
        let started = Instant::now();
        let mut timer = WallClockTimer {
            started,
            runtime: None,
            cancel: None,
            watcher: None,
        };
        match limit {
            Some(limit) if !limit.is_zero() => {
                let (cancel, expiry) = mpsc::channel::<()>();
                let watcher = std::thread::spawn(move || {
                    if expiry.recv_timeout(limit) == Err(RecvTimeoutError::Timeout) {
                        tracing::debug!(%pid, ?limit, "time limit exceeded, killing tracee");
                        let _ = signal::kill(pid, Signal::SIGKILL);
                    }
                });
                timer.cancel = Some(cancel);
                timer.watcher = Some(watcher);
            }
            _ => {}
        }
        timer
    }

    fn stop_and_get_runtime(&mut self) -> Duration {
        if let Some(runtime) = self.runtime {
            return runtime;
        }
        let runtime = self.started.elapsed();
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
        self.runtime = Some(runtime);
        runtime
    }
}
