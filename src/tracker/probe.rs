//! Process liveness and signal delivery.
//!
//! Workers are externally-owned processes known only by pid, so liveness is
//! a signal-0 probe and termination is SIGTERM-then-SIGKILL. The trait seam
//! exists so supervision and kill logic can be exercised against fake
//! processes in tests.

use async_trait::async_trait;

/// Signal-level access to a worker process.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    /// Whether the process exists. Must return promptly; callers wrap each
    /// probe in a timeout so one stalled check cannot delay the rest.
    async fn alive(&self, pid: u32) -> bool;

    /// Ask the process to exit (SIGTERM).
    async fn terminate(&self, pid: u32) -> std::io::Result<()>;

    /// Force the process down (SIGKILL).
    async fn kill(&self, pid: u32) -> std::io::Result<()>;
}

/// The real thing: raw signals via libc.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProbe;

fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[async_trait]
impl ProcessProbe for UnixProbe {
    async fn alive(&self, pid: u32) -> bool {
        match send_signal(pid, 0) {
            Ok(()) => true,
            // EPERM means the process exists but belongs to someone else.
            Err(err) => err.raw_os_error() == Some(libc::EPERM),
        }
    }

    async fn terminate(&self, pid: u32) -> std::io::Result<()> {
        send_signal(pid, libc::SIGTERM)
    }

    async fn kill(&self, pid: u32) -> std::io::Result<()> {
        send_signal(pid, libc::SIGKILL)
    }
}
