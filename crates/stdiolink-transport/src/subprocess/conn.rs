//! Connection over a helper process's stdio
//!
//! [`CommandConn`] spawns the helper with piped stdin/stdout and
//! manages its lifecycle from the stream side: each direction closes
//! independently, and the child is killed and reaped exactly once,
//! when (and only when) both directions have closed.

use crate::error::{Result, TransportError};
use crate::traits::{CancelFlag, Connection, Dialer, HalfCloseRead, HalfCloseStream, HalfCloseWrite};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Close/exit state of the connection, guarded by one lock
#[derive(Debug, Default)]
struct ConnState {
    read_closed: bool,
    write_closed: bool,
    process_exited: bool,
}

/// State shared between the two halves of a split connection
#[derive(Debug)]
struct Shared {
    program: String,
    // Kill/wait needs exclusive access to the child; it must not hold
    // the state lock while waiting for the process to die.
    child: tokio::sync::Mutex<Child>,
    state: Mutex<ConnState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Kill the child if both directions are closed and it has not been
/// killed yet. The `process_exited` flag is claimed under the lock
/// before the kill runs, so at most one caller ever signals the child;
/// the flag stays set even when the kill fails.
async fn kill_conditional(shared: &Shared) -> Result<()> {
    let claimed = {
        let mut state = shared.state();
        if state.read_closed && state.write_closed && !state.process_exited {
            state.process_exited = true;
            true
        } else {
            false
        }
    };
    if !claimed {
        return Ok(());
    }
    let mut child = shared.child.lock().await;
    child
        .kill()
        .await
        .map_err(|e| TransportError::Process(format!("kill {}: {}", shared.program, e)))
}

async fn close_read_inner(stdout: &mut Option<ChildStdout>, shared: &Shared) -> Result<()> {
    let already = shared.state().read_closed;
    if !already {
        // Dropping the pipe is the close; it cannot fail.
        stdout.take();
        shared.state().read_closed = true;
    }
    kill_conditional(shared).await
}

async fn close_write_inner(stdin: &mut Option<ChildStdin>, shared: &Shared) -> Result<()> {
    let already = shared.state().write_closed;
    if !already {
        if let Some(mut pipe) = stdin.take() {
            // Best-effort transition: a failed flush is logged, not
            // propagated, the pipe is gone either way.
            if let Err(e) = pipe.shutdown().await {
                warn!(program = %shared.program, "close_write: {}", e);
            }
        }
        shared.state().write_closed = true;
    }
    kill_conditional(shared).await
}

async fn read_inner(stdout: &mut Option<ChildStdout>, buf: &mut [u8]) -> Result<usize> {
    match stdout {
        Some(pipe) => pipe
            .read(buf)
            .await
            .map_err(|e| TransportError::io("read helper stdout", e)),
        None => Ok(0),
    }
}

async fn write_inner(stdin: &mut Option<ChildStdin>, buf: &[u8]) -> Result<usize> {
    match stdin {
        Some(pipe) => pipe
            .write(buf)
            .await
            .map_err(|e| TransportError::io("write helper stdin", e)),
        None => Err(TransportError::io(
            "write helper stdin",
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write side already closed"),
        )),
    }
}

/// Forward the helper's stderr to the log, one line at a time. The
/// output is diagnostic only and is never parsed.
async fn log_stderr(program: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(helper = %program, "{}", line);
    }
}

/// A duplex connection over a helper process's stdin/stdout
///
/// Reads come from the child's stdout, writes go to its stdin. The
/// child is signalled for termination exactly once, after both
/// [`close_read`](CommandConn::close_read) and
/// [`close_write`](CommandConn::close_write) have completed.
#[derive(Debug)]
pub struct CommandConn {
    shared: Arc<Shared>,
    stdout: Option<ChildStdout>,
    stdin: Option<ChildStdin>,
}

impl CommandConn {
    /// Spawn `program` with `args` and connect to its stdio
    ///
    /// The child inherits the caller's environment (the helper needs
    /// things like the ssh agent socket). Its stderr is drained to the
    /// log by a background task. Returns as soon as the process has
    /// started; no readiness handshake is performed.
    ///
    /// The helper cannot outlive the connection: the child is spawned
    /// with kill-on-drop, so dropping the handle (or its last split
    /// half) without a full close still terminates it, including a
    /// direction abandoned by the bridge's grace period.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] when the process cannot be
    /// started or its pipes are unavailable, or when `cancel` was set
    /// before the spawn.
    pub async fn dial(program: &str, args: &[String], cancel: Option<&CancelFlag>) -> Result<Self> {
        if let Some(flag) = cancel {
            if flag.is_cancelled() {
                return Err(TransportError::Spawn {
                    source: std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "dial cancelled before spawn",
                    ),
                });
            }
        }
        // Args are assumed to carry no secrets (plain-text passwords
        // are rejected at URL parse time).
        debug!(program, ?args, "starting connection helper");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn { source })?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::Spawn {
            source: std::io::Error::other("stdin pipe missing"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Spawn {
            source: std::io::Error::other("stdout pipe missing"),
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(program.to_string(), stderr));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                program: program.to_string(),
                child: tokio::sync::Mutex::new(child),
                state: Mutex::new(ConnState::default()),
            }),
            stdout: Some(stdout),
            stdin: Some(stdin),
        })
    }

    /// A [`Dialer`] that spawns `program` with `args` on every invocation
    pub fn dialer(program: impl Into<String>, args: Vec<String>) -> Dialer {
        let program = program.into();
        Arc::new(move |cancel: CancelFlag| {
            let program = program.clone();
            let args = args.clone();
            Box::pin(async move {
                let conn = CommandConn::dial(&program, &args, Some(&cancel)).await?;
                Ok(Box::new(conn) as Box<dyn Connection>)
            }) as BoxFuture<'static, Result<Box<dyn Connection>>>
        })
    }

    /// Read from the helper's stdout (0 = end-of-stream)
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        read_inner(&mut self.stdout, buf).await
    }

    /// Write to the helper's stdin
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        write_inner(&mut self.stdin, buf).await
    }

    /// Close the read direction; idempotent
    ///
    /// When this completes the last open direction, the child is
    /// killed and reaped; a kill failure surfaces here as
    /// [`TransportError::Process`].
    pub async fn close_read(&mut self) -> Result<()> {
        close_read_inner(&mut self.stdout, &self.shared).await
    }

    /// Close the write direction; idempotent
    ///
    /// Closing stdin is what signals end-of-stream to the helper. The
    /// same kill condition as [`close_read`](Self::close_read) applies.
    pub async fn close_write(&mut self) -> Result<()> {
        close_write_inner(&mut self.stdin, &self.shared).await
    }

    /// Close both directions, read side first
    ///
    /// Errors from either close are logged; the last one is returned.
    pub async fn close(&mut self) -> Result<()> {
        let mut last = Ok(());
        if let Err(e) = self.close_read().await {
            warn!("close: close_read: {}", e);
            last = Err(e);
        }
        if let Err(e) = self.close_write().await {
            warn!("close: close_write: {}", e);
            last = Err(e);
        }
        last
    }

    /// Placeholder local address (a pipe has no meaningful one)
    pub fn local_addr(&self) -> &'static str {
        "pipe:local"
    }

    /// Placeholder remote address
    pub fn remote_addr(&self) -> &'static str {
        "pipe:remote"
    }

    /// Accepted but not implemented: a process pipe has no portable
    /// deadline primitive
    pub fn set_deadline(&self, deadline: Duration) -> Result<()> {
        debug!(?deadline, "unimplemented call: set_deadline");
        Ok(())
    }

    /// Accepted but not implemented, see [`set_deadline`](Self::set_deadline)
    pub fn set_read_deadline(&self, deadline: Duration) -> Result<()> {
        debug!(?deadline, "unimplemented call: set_read_deadline");
        Ok(())
    }

    /// Accepted but not implemented, see [`set_deadline`](Self::set_deadline)
    pub fn set_write_deadline(&self, deadline: Duration) -> Result<()> {
        debug!(?deadline, "unimplemented call: set_write_deadline");
        Ok(())
    }
}

impl HalfCloseStream for CommandConn {
    fn into_split(self: Box<Self>) -> (Box<dyn HalfCloseRead>, Box<dyn HalfCloseWrite>) {
        (
            Box::new(CommandReadHalf {
                stdout: self.stdout,
                shared: Arc::clone(&self.shared),
            }),
            Box::new(CommandWriteHalf {
                stdin: self.stdin,
                shared: self.shared,
            }),
        )
    }
}

impl Connection for CommandConn {
    fn into_half_close(self: Box<Self>) -> Result<Box<dyn HalfCloseStream>> {
        Ok(self)
    }
}

/// Read half of a split [`CommandConn`]
pub struct CommandReadHalf {
    stdout: Option<ChildStdout>,
    shared: Arc<Shared>,
}

#[async_trait]
impl HalfCloseRead for CommandReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        read_inner(&mut self.stdout, buf).await
    }

    async fn close_read(&mut self) -> Result<()> {
        close_read_inner(&mut self.stdout, &self.shared).await
    }
}

/// Write half of a split [`CommandConn`]
pub struct CommandWriteHalf {
    stdin: Option<ChildStdin>,
    shared: Arc<Shared>,
}

#[async_trait]
impl HalfCloseWrite for CommandWriteHalf {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        write_inner(&mut self.stdin, buf).await
    }

    async fn close_write(&mut self) -> Result<()> {
        close_write_inner(&mut self.stdin, &self.shared).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_unknown_program_is_spawn_error() {
        let err = CommandConn::dial("definitely-not-a-real-helper-binary", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_dial_cancelled_before_spawn() {
        let flag = CancelFlag::new();
        flag.cancel();
        let err = CommandConn::dial("cat", &[], Some(&flag))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cat_echoes_until_stdin_closes() {
        let mut conn = CommandConn::dial("cat", &[], None).await.unwrap();
        let n = conn.write(b"hello").await.unwrap();
        assert_eq!(n, 5);
        conn.close_write().await.unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello");
        conn.close_read().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_only_after_both_directions_close() {
        let mut conn = CommandConn::dial("sleep", &["30".to_string()], None)
            .await
            .unwrap();

        conn.close_read().await.unwrap();
        assert!(!conn.shared.state().process_exited);

        // Second direction closing triggers the kill.
        conn.close_write().await.unwrap();
        assert!(conn.shared.state().process_exited);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_kills_at_most_once() {
        let mut conn = CommandConn::dial("sleep", &["30".to_string()], None)
            .await
            .unwrap();

        conn.close_read().await.unwrap();
        conn.close_read().await.unwrap();
        conn.close_write().await.unwrap();
        assert!(conn.shared.state().process_exited);

        // Further closes see the claimed exit flag and do nothing.
        conn.close_write().await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_split_halves_share_the_kill_condition() {
        let conn = CommandConn::dial("sleep", &["30".to_string()], None)
            .await
            .unwrap();
        let shared = Arc::clone(&conn.shared);
        let (mut read, mut write) = (Box::new(conn) as Box<dyn HalfCloseStream>).into_split();

        write.close_write().await.unwrap();
        assert!(!shared.state().process_exited);
        read.close_read().await.unwrap();
        assert!(shared.state().process_exited);
    }

    #[tokio::test]
    async fn test_dropped_connection_does_not_leak_the_helper() {
        let conn = CommandConn::dial("sleep", &["30".to_string()], None)
            .await
            .unwrap();
        let pid = conn
            .shared
            .child
            .lock()
            .await
            .id()
            .expect("child has a pid before it exits");

        // No close at all: the handle just goes away.
        drop(conn);

        // kill-on-drop delivery and reaping are asynchronous; poll.
        let pid = pid.to_string();
        for _ in 0..50 {
            let alive = std::process::Command::new("kill")
                .args(["-0", &pid])
                .status()
                .map(|status| status.success())
                .unwrap_or(false);
            if !alive {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("helper process {pid} survived its connection");
    }

    #[tokio::test]
    async fn test_deadlines_are_accepted_no_ops() {
        let mut conn = CommandConn::dial("cat", &[], None).await.unwrap();
        conn.set_deadline(Duration::from_secs(1)).unwrap();
        conn.set_read_deadline(Duration::from_secs(1)).unwrap();
        conn.set_write_deadline(Duration::from_secs(1)).unwrap();
        assert_eq!(conn.local_addr(), "pipe:local");
        assert_eq!(conn.remote_addr(), "pipe:remote");
        conn.close().await.unwrap();
    }
}
