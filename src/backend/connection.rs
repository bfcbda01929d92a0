//! A single RESP connection to a backend store.
//!
//! ## Request Cycle
//!
//! ```text
//! request(cmd)
//!    │
//!    ├─> serialize + write + flush      (bounded by io timeout)
//!    │
//!    └─> loop:
//!          parse buffer ── complete ──> return reply
//!             │
//!          incomplete
//!             │
//!          read more bytes              (bounded by io timeout)
//! ```
//!
//! TCP is a stream protocol: a reply may arrive in pieces, so bytes
//! accumulate in a `BytesMut` until the parser reports a complete value.

use crate::backend::{BackendError, BackendTimeouts};
use crate::protocol::parser::MAX_BULK_SIZE;
use crate::protocol::{RespParser, RespValue};
use crate::session::ConnectionDescriptor;
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Replies larger than this are refused
const MAX_REPLY_BUFFER: usize = MAX_BULK_SIZE + 64 * 1024;

/// An established, authenticated connection.
#[derive(Debug)]
pub struct RespConnection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
    parser: RespParser,
    io_timeout: Duration,
    last_used: Instant,
}

impl RespConnection {
    /// Opens a TCP connection without any handshake.
    pub async fn connect(addr: &str, timeouts: &BackendTimeouts) -> Result<Self, BackendError> {
        let stream = bounded("dial", timeouts.dial, TcpStream::connect(addr)).await??;
        stream.set_nodelay(true)?;
        trace!(backend = %addr, "Dialed backend");

        Ok(Self {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: RespParser::for_replies(),
            io_timeout: timeouts.io,
            last_used: Instant::now(),
        })
    }

    /// Dials and prepares a connection for `descriptor`: `AUTH` when a
    /// credential is set, `SELECT` when the namespace is not 0.
    pub async fn establish(
        descriptor: &ConnectionDescriptor,
        timeouts: &BackendTimeouts,
    ) -> Result<Self, BackendError> {
        let mut conn = Self::connect(&descriptor.address(), timeouts).await?;

        if !descriptor.credential().is_empty() {
            let reply = conn
                .request(&RespValue::command(["AUTH", descriptor.credential()]))
                .await?;
            match reply {
                RespValue::Error(msg) => return Err(BackendError::Auth(msg)),
                RespValue::SimpleString(_) => {}
                other => {
                    return Err(BackendError::UnexpectedReply {
                        command: "AUTH",
                        reply: other.to_string(),
                    })
                }
            }
        }

        if descriptor.namespace() != 0 {
            let namespace = descriptor.namespace();
            let select = RespValue::command(["SELECT", namespace.to_string().as_str()]);
            let reply = conn.request(&select).await?;
            if let RespValue::Error(reason) = reply {
                return Err(BackendError::Select { namespace, reason });
            }
        }

        debug!(
            backend = %descriptor.address(),
            namespace = descriptor.namespace(),
            "Backend connection established"
        );
        Ok(conn)
    }

    /// Sends a command and waits for its reply.
    pub async fn request(&mut self, command: &RespValue) -> Result<RespValue, BackendError> {
        let bytes = command.serialize();
        let io_timeout = self.io_timeout;

        bounded("write", io_timeout, async {
            self.stream.write_all(&bytes).await?;
            self.stream.flush().await?;
            Ok::<_, std::io::Error>(())
        })
        .await??;

        let reply = self.read_reply().await?;
        self.last_used = Instant::now();
        Ok(reply)
    }

    async fn read_reply(&mut self) -> Result<RespValue, BackendError> {
        loop {
            if let Some((value, consumed)) = self.parser.parse(&self.buffer)? {
                self.buffer.advance(consumed);
                return Ok(value);
            }

            if self.buffer.len() >= MAX_REPLY_BUFFER {
                return Err(BackendError::Protocol(
                    crate::protocol::ParseError::MessageTooLarge {
                        size: self.buffer.len(),
                        max: MAX_REPLY_BUFFER,
                    },
                ));
            }
            if self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(INITIAL_BUFFER_SIZE);
            }

            let io_timeout = self.io_timeout;
            let n = bounded(
                "read",
                io_timeout,
                self.stream.get_mut().read_buf(&mut self.buffer),
            )
            .await??;
            if n == 0 {
                return Err(BackendError::Closed);
            }
        }
    }

    /// Time since the last completed request.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Marks the connection as used now.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Flushes and closes the write half.
    pub async fn shutdown(mut self) -> Result<(), BackendError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn bounded<F, T>(op: &'static str, after: Duration, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| BackendError::Timeout { op, after })
}
