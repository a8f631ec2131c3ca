//! Pseudo-terminal bridge for the interactive shell stream.
//!
//! The PTY master is wrapped in `AsyncFd` and driven with raw reads and
//! writes; tokio's socket types assume socket semantics that a PTY fd does
//! not provide.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::pin::Pin;
use std::task::Poll;

use tokio::io::unix::AsyncFd;
use tokio::io::ReadBuf;
use tokio::process::{Child, Command};

use crate::error::{AgentError, AgentResult};
use crate::executor::{filtered_host_env, is_valid_env_name};

/// Shells a client may request.
pub const ALLOWED_SHELLS: &[&str] = &[
    "/bin/bash",
    "/bin/sh",
    "/bin/zsh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "bash",
    "sh",
    "zsh",
];

/// Read chunk size for master-side output.
pub const OUTPUT_CHUNK_SIZE: usize = 4096;

pub struct PtySession {
    pub stream: PtyStream,
    pub child: Child,
}

impl PtySession {
    /// Allocate a PTY with the given size and run `shell` on the slave side.
    pub fn spawn(
        shell: &str,
        env_overrides: &HashMap<String, String>,
        rows: u16,
        cols: u16,
    ) -> AgentResult<Self> {
        if !ALLOWED_SHELLS.contains(&shell) {
            return Err(AgentError::PermissionDenied(format!(
                "shell '{}' is not allowed",
                shell
            )));
        }

        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let mut master: libc::c_int = 0;
        let mut slave: libc::c_int = 0;
        let ret = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null(),
                &ws,
            )
        };
        if ret != 0 {
            return Err(AgentError::Internal(format!(
                "openpty failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let master_fd = unsafe { OwnedFd::from_raw_fd(master) };
        let slave_fd = unsafe { OwnedFd::from_raw_fd(slave) };

        // The master must be non-blocking for AsyncFd.
        unsafe {
            let flags = libc::fcntl(master_fd.as_raw_fd(), libc::F_GETFL);
            libc::fcntl(
                master_fd.as_raw_fd(),
                libc::F_SETFL,
                flags | libc::O_NONBLOCK,
            );
        }

        let stdin = slave_fd
            .try_clone()
            .map_err(|e| AgentError::Internal(format!("dup slave fd: {}", e)))?;
        let stdout = slave_fd
            .try_clone()
            .map_err(|e| AgentError::Internal(format!("dup slave fd: {}", e)))?;

        let mut cmd = Command::new(shell);
        cmd.env_clear();
        for (name, value) in filtered_host_env() {
            cmd.env(name, value);
        }
        for (name, value) in env_overrides {
            if is_valid_env_name(name) {
                cmd.env(name, value);
            }
        }
        cmd.env("TERM", "xterm-256color");
        cmd.stdin(std::process::Stdio::from(stdin))
            .stdout(std::process::Stdio::from(stdout))
            .stderr(std::process::Stdio::from(slave_fd));

        // The child becomes a session leader with the PTY slave as its
        // controlling terminal.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| AgentError::Internal(format!("failed to spawn {}: {}", shell, e)))?;

        let stream = PtyStream::new(master_fd)
            .map_err(|e| AgentError::Internal(format!("registering PTY master: {}", e)))?;

        Ok(Self { stream, child })
    }

    /// Apply a new terminal size to the PTY.
    pub fn resize(&self, rows: u16, cols: u16) -> AgentResult<()> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let ret = unsafe {
            libc::ioctl(
                self.stream.inner.get_ref().as_raw_fd(),
                libc::TIOCSWINSZ as _,
                &ws,
            )
        };
        if ret != 0 {
            return Err(AgentError::Internal(format!(
                "TIOCSWINSZ failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Tear the session down: kill the child if still running and reap it.
    pub async fn shutdown(mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

/// An async PTY master backed by `AsyncFd<OwnedFd>` with raw read/write.
///
/// Clones share the underlying fd, letting one task read output while
/// another writes input.
pub struct PtyStream {
    inner: std::sync::Arc<AsyncFd<OwnedFd>>,
}

impl Clone for PtyStream {
    fn clone(&self) -> Self {
        Self {
            inner: std::sync::Arc::clone(&self.inner),
        }
    }
}

impl PtyStream {
    fn new(fd: OwnedFd) -> std::io::Result<Self> {
        Ok(Self {
            inner: std::sync::Arc::new(AsyncFd::new(fd)?),
        })
    }
}

impl tokio::io::AsyncRead for PtyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            let mut guard = match self.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe {
                    libc::read(fd, unfilled.as_mut_ptr() as *mut libc::c_void, unfilled.len())
                };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // EIO means every slave side is closed: the child exited.
                // Surface it as EOF so readers terminate cleanly.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl tokio::io::AsyncWrite for PtyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            let mut guard = match self.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe {
                    libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
                };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn disallowed_shell_is_rejected() {
        let err = PtySession::spawn("/usr/bin/python3", &HashMap::new(), 24, 80);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn shell_echoes_through_pty() {
        let mut session = PtySession::spawn("/bin/sh", &HashMap::new(), 24, 80).unwrap();

        session
            .stream
            .write_all(b"echo pty-roundtrip-$((40+2))\n")
            .await
            .unwrap();

        let mut collected = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; OUTPUT_CHUNK_SIZE];
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), session.stream.read(&mut buf))
                .await
            {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if collected.contains("pty-roundtrip-42") {
                        break;
                    }
                }
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }
        assert!(
            collected.contains("pty-roundtrip-42"),
            "pty output was: {:?}",
            collected
        );

        session.shutdown().await;
    }

    #[tokio::test]
    async fn resize_succeeds_on_live_session() {
        let session = PtySession::spawn("/bin/sh", &HashMap::new(), 24, 80).unwrap();
        session.resize(50, 132).unwrap();
        session.shutdown().await;
    }

    #[tokio::test]
    async fn exit_surfaces_as_eof() {
        let mut session = PtySession::spawn("/bin/sh", &HashMap::new(), 24, 80).unwrap();
        session.stream.write_all(b"exit\n").await.unwrap();

        let mut buf = [0u8; OUTPUT_CHUNK_SIZE];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if tokio::time::Instant::now() >= deadline {
                panic!("no EOF after exit");
            }
            match tokio::time::timeout(Duration::from_millis(500), session.stream.read(&mut buf))
                .await
            {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }
        session.shutdown().await;
    }
}
