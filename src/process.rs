//! Child process spawning helpers shared by the Job Supervisor.
//!
//! Every job is its own process group leader (`process_group(0)`) so the
//! whole tree it spawns can be reached with a single negative-PID signal.
//! [`spawn_stopped`] holds the freshly-forked child at the gate between
//! fork and exec via a one-byte sync pipe, so the caller can attach the pid
//! to a cgroup before any of the job's own code runs
//! (SPEC_FULL §10.5 / §4.5 step 6).

use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::logstore::LogStore;

/// Kills the process group on drop unless [`disarm`](Self::disarm) was
/// called first. The Supervisor's reaper disarms it once it has already
/// reaped the child itself, so drop never double-signals a reclaimed pid.
pub struct ProcessGroupGuard {
    pgid: i32,
    armed: AtomicBool,
}

impl ProcessGroupGuard {
    fn new(pgid: i32) -> Self {
        ProcessGroupGuard {
            pgid,
            armed: AtomicBool::new(true),
        }
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Sends `signal` to the entire process group.
    pub fn signal(&self, signal: i32) {
        unsafe {
            libc::kill(-self.pgid, signal);
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed.load(Ordering::SeqCst) {
            unsafe {
                libc::kill(-self.pgid, libc::SIGKILL);
            }
        }
    }
}

/// A spawned child held at the fork/exec gate, plus the means to release it.
pub struct ChildHandle {
    pub child: Child,
    pub pid: i32,
    pub guard: ProcessGroupGuard,
    sync_write_fd: Option<RawFd>,
}

impl ChildHandle {
    /// Releases the child past the sync-pipe gate, letting it proceed to
    /// `execve`. Call after the pid has been attached to its cgroup.
    pub fn release(&mut self) -> io::Result<()> {
        let Some(fd) = self.sync_write_fd.take() else {
            return Ok(());
        };
        let byte = [0u8; 1];
        let rc = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        unsafe {
            libc::close(fd);
        }
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        // If the handle is dropped before release() was ever called (e.g.
        // cgroup attach failed), closing the write end lets the child's
        // blocking read return 0 and the child exit cleanly instead of
        // hanging forever at the gate.
        if let Some(fd) = self.sync_write_fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Spawns `command` with `args` as a new process group leader, held at the
/// fork/exec gate until [`ChildHandle::release`] is called.
pub fn spawn_stopped(command: &str, args: &[String]) -> io::Result<ChildHandle> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let [read_fd, write_fd] = fds;

    let mut cmd = Command::new(command);
    cmd.args(args);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());
    cmd.process_group(0);

    // SAFETY: the closure only calls async-signal-safe functions
    // (read/close) between fork and exec, as required by `pre_exec`.
    unsafe {
        cmd.pre_exec(move || {
            libc::close(write_fd);
            let mut buf = [0u8; 1];
            loop {
                let n = libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1);
                if n > 0 {
                    break;
                }
                if n == 0 {
                    // Parent dropped the handle without releasing; proceed
                    // rather than hang, so the child doesn't leak.
                    break;
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
            libc::close(read_fd);
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    unsafe {
        libc::close(read_fd);
    }
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("child exited before pid could be read"))?
        as i32;

    Ok(ChildHandle {
        child,
        pid,
        guard: ProcessGroupGuard::new(pid),
        sync_write_fd: Some(write_fd),
    })
}

/// Reads a child's stdout and stderr concurrently until both are closed,
/// appending every chunk to `log`, then waits for the process to exit.
pub async fn pump_and_wait(
    mut child: Child,
    log: LogStore,
) -> io::Result<std::process::ExitStatus> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut stdout_buf = [0u8; 8192];
    let mut stderr_buf = [0u8; 8192];

    loop {
        if stdout.is_none() && stderr.is_none() {
            break;
        }
        tokio::select! {
            result = async { stdout.as_mut().unwrap().read(&mut stdout_buf).await }, if stdout.is_some() => {
                match result {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => log.append(&stdout_buf[..n]).await,
                }
            }
            result = async { stderr.as_mut().unwrap().read(&mut stderr_buf).await }, if stderr.is_some() => {
                match result {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => log.append(&stderr_buf[..n]).await,
                }
            }
        }
    }

    child.wait().await
}

/// Encodes an exit status the way a POSIX shell would: `code` if the
/// process exited normally, `128 + signal` if it was killed by a signal.
pub fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(sig) = status.signal() {
        128 + sig
    } else {
        -1
    }
}
