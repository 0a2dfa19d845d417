// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Connection-level timeouts.
//!
//! [`TimeoutListener`] wraps every accepted connection in a
//! [`TimeoutStream`] that enforces three deadlines: reading a request must
//! finish within [`READ_TIMEOUT`] of its first byte (and of accept, for a
//! connection's first request), writing a response must finish within
//! [`WRITE_TIMEOUT`], and a keep-alive connection may sit idle between
//! requests for at most [`IDLE_TIMEOUT`]. An expired deadline surfaces as
//! `io::ErrorKind::TimedOut`, which closes the connection; no HTTP status
//! is ever emitted for it, so the read endpoints' documented status set
//! stays closed.
//!
//! Request boundaries are inferred from the traffic pattern: the HTTP/1
//! server only reads while receiving a request or waiting for the next
//! one, so a completed response write marks the transition back to idle,
//! and the first byte after idle starts the next request's read deadline.

use axum::serve::Listener;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Instant, Sleep};
use tracing::warn;

/// Bound on reading one request.
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on writing one response.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on a keep-alive connection waiting for its next request.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// Back-off after a failed accept (out of file descriptors and the like).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

// What the connection is waiting for on the read side.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    // Receiving a request (or, right after accept, expecting the first).
    Request,
    // Between requests on a keep-alive connection.
    Idle,
}

/// A [`TcpStream`] with read, write, and idle deadlines.
pub struct TimeoutStream {
    inner: TcpStream,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
    phase: ReadPhase,
    read_deadline: Pin<Box<Sleep>>,
    read_armed: bool,
    write_deadline: Pin<Box<Sleep>>,
    write_armed: bool,
    // A response write completed since the last read.
    wrote: bool,
}

impl TimeoutStream {
    pub fn new(inner: TcpStream) -> Self {
        Self::with_timeouts(inner, READ_TIMEOUT, WRITE_TIMEOUT, IDLE_TIMEOUT)
    }

    fn with_timeouts(
        inner: TcpStream,
        read_timeout: Duration,
        write_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            idle_timeout,
            phase: ReadPhase::Request,
            read_deadline: Box::pin(sleep(read_timeout)),
            read_armed: false,
            write_deadline: Box::pin(sleep(write_timeout)),
            write_armed: false,
            wrote: false,
        }
    }
}

impl AsyncRead for TimeoutStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // A completed response means the previous request is done; the
        // connection idles until the next request's first byte, and the
        // write deadline re-arms for the next response.
        if this.wrote {
            this.wrote = false;
            this.phase = ReadPhase::Idle;
            this.read_armed = false;
            this.write_armed = false;
        }
        if !this.read_armed {
            let timeout = match this.phase {
                ReadPhase::Request => this.read_timeout,
                ReadPhase::Idle => this.idle_timeout,
            };
            this.read_deadline.as_mut().reset(Instant::now() + timeout);
            this.read_armed = true;
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if this.phase == ReadPhase::Idle && buf.filled().len() > before {
                    // First byte of the next request: the request read
                    // deadline takes over from the idle one.
                    this.phase = ReadPhase::Request;
                    this.read_deadline
                        .as_mut()
                        .reset(Instant::now() + this.read_timeout);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => {
                if this.read_deadline.as_mut().poll(cx).is_ready() {
                    let what = match this.phase {
                        ReadPhase::Request => "request read",
                        ReadPhase::Idle => "idle connection",
                    };
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{what} timed out"),
                    )));
                }
                Poll::Pending
            }
        }
    }
}

impl TimeoutStream {
    // Shared deadline bookkeeping for the write half.
    fn poll_write_op<T>(
        &mut self,
        cx: &mut Context<'_>,
        op: Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        match op {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => {
                if self.write_deadline.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "response write timed out",
                    )));
                }
                Poll::Pending
            }
        }
    }

    fn arm_write(&mut self) {
        if !self.write_armed {
            self.write_deadline
                .as_mut()
                .reset(Instant::now() + self.write_timeout);
            self.write_armed = true;
        }
    }
}

impl AsyncWrite for TimeoutStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.arm_write();
        let op = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(_)) = &op {
            this.wrote = true;
        }
        this.poll_write_op(cx, op)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.arm_write();
        let op = Pin::new(&mut this.inner).poll_flush(cx);
        this.poll_write_op(cx, op)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A [`TcpListener`] whose connections carry the server-side deadlines.
pub struct TimeoutListener {
    inner: TcpListener,
}

impl TimeoutListener {
    pub fn new(inner: TcpListener) -> Self {
        Self { inner }
    }
}

impl Listener for TimeoutListener {
    type Io = TimeoutStream;
    type Addr = SocketAddr;

    fn accept(&mut self) -> impl std::future::Future<Output = (Self::Io, Self::Addr)> + Send {
        async {
            loop {
                match self.inner.accept().await {
                    Ok((stream, addr)) => return (TimeoutStream::new(stream), addr),
                    Err(err) => {
                        warn!(error = %err, "error accepting connection");
                        sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}
