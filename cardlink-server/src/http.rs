//! Async I/O half of the admin framer.
//!
//! Wraps a TLS stream with a read buffer and drives the incremental wire
//! codec from `cardlink_types::admin`. One [`AdminConnection`] lives per
//! session task; `read_request` is cancellation safe because all partial
//! input stays in the buffer.

use bytes::{Buf as _, BytesMut};
use cardlink_types::admin::{self, AdminRequest, Parsing};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::error::SessionError;

const READ_CHUNK: usize = 8 * 1024;

/// One framed admin connection.
pub(crate) struct AdminConnection<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AdminConnection<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Reads the next admin request off the wire.
    ///
    /// Returns [`SessionError::ConnectionClosed`] on a clean EOF between
    /// requests and [`SessionError::Transport`] on one inside a request.
    pub(crate) async fn read_request(&mut self) -> Result<AdminRequest, SessionError> {
        loop {
            if let Parsing::Done { value, offset } = admin::decode_request(&self.read_buf)? {
                self.read_buf.advance(offset);
                return Ok(value);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return if self.read_buf.is_empty() {
                    Err(SessionError::ConnectionClosed)
                } else {
                    Err(SessionError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "eof inside admin request",
                    )))
                };
            }
        }
    }

    /// Writes a `200 OK` carrying the next C-APDU.
    pub(crate) async fn write_command(
        &mut self,
        apdu: &[u8],
        keep_alive: bool,
    ) -> Result<(), SessionError> {
        self.write_buf.clear();
        admin::encode_command_response(apdu, keep_alive, &mut self.write_buf);
        self.flush_write_buf().await
    }

    /// Writes the terminal `204 No Content`.
    pub(crate) async fn write_no_content(&mut self) -> Result<(), SessionError> {
        self.write_buf.clear();
        admin::encode_no_content(&mut self.write_buf);
        self.flush_write_buf().await
    }

    /// Writes an error status. The connection is closed afterwards.
    pub(crate) async fn write_error(
        &mut self,
        status: u16,
        reason: &str,
    ) -> Result<(), SessionError> {
        self.write_buf.clear();
        admin::encode_error_response(status, reason, &mut self.write_buf);
        self.flush_write_buf().await
    }

    /// Sends `close_notify` and shuts the stream down.
    pub(crate) async fn shutdown(&mut self) {
        // peers that already dropped the socket are not an error here
        if let Err(err) = self.stream.shutdown().await {
            tracing::trace!("ignoring shutdown error: {err:?}");
        }
    }

    async fn flush_write_buf(&mut self) -> Result<(), SessionError> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }
}
