//! Bidirectional bridge between two half-closable streams
//!
//! Runs one copy task per direction. A direction that drains to
//! end-of-stream closes its source's read side and its destination's
//! write side, so the opposite direction keeps running until it drains
//! too. When the bridge as a whole is finished is a policy choice, see
//! [`TerminationPolicy`].

use crate::error::{Result, TransportError};
use crate::traits::{
    CancelFlag, Dialer, HalfCloseRead, HalfCloseStream, HalfCloseWrite, PipeStream,
};
use std::fmt;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::debug;

/// When a bridge between two streams is considered finished
///
/// The two policies differ materially when one endpoint never signals
/// end-of-stream on its own (a daemon that holds its half of the
/// connection open after the client side has gone quiet). `WaitBoth`
/// guarantees loss-free draining but can hang on such an endpoint;
/// `Grace` treats the slower direction as abandoned once the timer
/// fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Complete only when both directions have completed; the first
    /// error observed is propagated
    WaitBoth,
    /// Complete when either direction finishes, then allow the other
    /// this long to finish before abandoning it (success, not error)
    Grace(Duration),
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        // Daemons commonly keep their half open indefinitely after the
        // client goes quiet; an unbounded wait would hang shutdown.
        Self::Grace(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl Direction {
    fn source(self) -> &'static str {
        match self {
            Self::LocalToRemote => "local",
            Self::RemoteToLocal => "remote",
        }
    }

    fn dest(self) -> &'static str {
        match self {
            Self::LocalToRemote => "remote",
            Self::RemoteToLocal => "local",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source(), self.dest())
    }
}

fn wrap(context: String, err: TransportError) -> TransportError {
    TransportError::io(context, std::io::Error::other(err))
}

/// Copy one direction until end-of-stream, then propagate the
/// half-close: the source's read side and the destination's write side
/// close; the opposite direction is untouched.
async fn copy_direction(
    mut from: Box<dyn HalfCloseRead>,
    mut to: Box<dyn HalfCloseWrite>,
    dir: Direction,
) -> Result<()> {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = from
            .read(&mut buf)
            .await
            .map_err(|e| wrap(format!("copy {dir}"), e))?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n])
            .await
            .map_err(|e| wrap(format!("copy {dir}"), e))?;
    }
    from.close_read()
        .await
        .map_err(|e| wrap(format!("close-read {}", dir.source()), e))?;
    to.close_write()
        .await
        .map_err(|e| wrap(format!("close-write {}", dir.dest()), e))?;
    debug!(direction = %dir, "copy direction finished");
    Ok(())
}

fn flatten(res: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match res {
        Ok(inner) => inner,
        Err(join_err) => Err(TransportError::io(
            "copy task",
            std::io::Error::other(join_err),
        )),
    }
}

/// Bridge two streams until the termination policy says the bridge is
/// done
///
/// Bytes within a direction are forwarded in receipt order; nothing is
/// ordered between the two directions. Callers cancel an in-flight
/// bridge by closing the underlying streams.
///
/// # Errors
///
/// A copy task's I/O or close failure, wrapped with the direction and
/// endpoint that failed. A direction abandoned by an elapsed grace
/// period is not an error.
pub async fn bridge(
    local: Box<dyn HalfCloseStream>,
    remote: Box<dyn HalfCloseStream>,
    policy: TerminationPolicy,
) -> Result<()> {
    let (local_read, local_write) = local.into_split();
    let (remote_read, remote_write) = remote.into_split();
    let mut out = tokio::spawn(copy_direction(
        local_read,
        remote_write,
        Direction::LocalToRemote,
    ));
    let mut back = tokio::spawn(copy_direction(
        remote_read,
        local_write,
        Direction::RemoteToLocal,
    ));

    match policy {
        TerminationPolicy::WaitBoth => {
            let (a, b) = tokio::join!(&mut out, &mut back);
            flatten(a)?;
            flatten(b)
        }
        TerminationPolicy::Grace(grace) => {
            let out_finished_first = tokio::select! {
                res = &mut out => {
                    flatten(res)?;
                    true
                }
                res = &mut back => {
                    flatten(res)?;
                    false
                }
            };
            let mut remaining = if out_finished_first { back } else { out };
            match tokio::time::timeout(grace, &mut remaining).await {
                Ok(res) => flatten(res),
                Err(_elapsed) => {
                    // The slower direction keeps draining in the
                    // background; the bridge is done.
                    debug!(?grace, "grace period elapsed, abandoning slower direction");
                    Ok(())
                }
            }
        }
    }
}

/// Dial a connection and assert the half-close capability
///
/// `cancel` aborts the dial before the helper spawns; pass `None` when
/// the caller has no cancellation source.
///
/// # Errors
///
/// The dial's own failure, or [`TransportError::Capability`] when the
/// dialed transport cannot close its directions independently.
pub async fn dial_half_close(
    dialer: &Dialer,
    cancel: Option<CancelFlag>,
) -> Result<Box<dyn HalfCloseStream>> {
    let conn = (dialer)(cancel.unwrap_or_default()).await?;
    conn.into_half_close()
}

/// Proxy this process's stdin/stdout to a dialed connection
///
/// This is the server-side entry point of the transport: the remote
/// helper command runs it so that its own stdio becomes one end of the
/// bridge. Blocks until the bridge terminates per `policy`. `cancel`
/// only covers the dial; once copying has started, cancellation means
/// closing the streams.
///
/// # Errors
///
/// Dial, capability, or bridge failures, wrapped with context.
pub async fn proxy_stdio(
    dialer: &Dialer,
    policy: TerminationPolicy,
    cancel: Option<CancelFlag>,
) -> Result<()> {
    let remote = dial_half_close(dialer, cancel).await?;
    let local: Box<dyn HalfCloseStream> =
        Box::new(PipeStream::new(tokio::io::stdin(), tokio::io::stdout()));
    bridge(local, remote, policy).await
}
