//! Server-side WebSocket endpoint.
//!
//! Takes over a raw byte stream after the HTTP upgrade, frames it per
//! RFC 6455, and dispatches message and control events to a [`Handler`]
//! while any number of tasks produce outbound frames through [`Conn`].

mod conn;
mod pool;

pub mod frame;
pub mod handshake;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use url::Url;

pub use conn::{Conn, QUEUE_CAPACITY};
pub use frame::{Frame, Opcode, Status, DEFAULT_MAX_PAYLOAD_SIZE};

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] tokio::io::Error),
    #[error("payload length {len} is over the maximum of {max}")]
    PayloadTooLarge { len: u64, max: usize },
    #[error("invalid payload length")]
    InvalidPayloadLength,
    #[error("reserved bits {0:#05b} set without a negotiated extension")]
    ReservedBits(u8),
    #[error("invalid opcode {0:#x}")]
    InvalidOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame payload of {0} bytes is over 125")]
    ControlPayloadTooLarge(u64),
    #[error("frame from client was not masked")]
    UnmaskedFrame,
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is in progress")]
    InterleavedMessage,
    #[error("read timed out")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("peer closed: {0}")]
    PeerClose(Close),
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("unexpected HTTP request: {0}")]
    UnexpectedRequest(String),
    #[error("invalid header line: {0}")]
    InvalidHeaderLine(String),
    #[error("missing or invalid header: {0}")]
    MissingOrInvalidHeader(&'static str),
    #[error("origin not allowed: {0:?}")]
    OriginNotAllowed(String),
}

impl Error {
    /// Codec and state-machine violations that warrant a 1002 close before
    /// teardown, as opposed to plain transport failures.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::PayloadTooLarge { .. }
                | Error::InvalidPayloadLength
                | Error::ReservedBits(_)
                | Error::InvalidOpcode(_)
                | Error::FragmentedControlFrame
                | Error::ControlPayloadTooLarge(_)
                | Error::UnmaskedFrame
                | Error::UnexpectedContinuation
                | Error::InterleavedMessage
        )
    }
}

/// Status and reason carried by a peer's close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub status: Status,
    pub reason: String,
}

impl fmt::Display for Close {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.reason)
    }
}

/// Per-connection key/value bag, filled by the upgrade glue and readable
/// from callbacks through [`Conn::user_value`].
pub type UserValues = HashMap<String, Arc<dyn Any + Send + Sync>>;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Connection callbacks. Every method has a no-op default, so an
/// implementation only overrides the events it cares about.
///
/// Callbacks run on the connection's supervisor task, one at a time, in
/// wire order. Payload slices are only valid for the duration of the call;
/// copy them out to retain them.
pub trait Handler: Send + Sync + 'static {
    /// Runs after the upgrade completes, before any frame is read.
    fn on_open<'a>(&'a self, conn: &'a Arc<Conn>) -> HandlerFuture<'a> {
        let _ = conn;
        Box::pin(async {})
    }

    /// Receives a fully reassembled message.
    fn on_message<'a>(
        &'a self,
        conn: &'a Arc<Conn>,
        is_binary: bool,
        data: &'a [u8],
    ) -> HandlerFuture<'a> {
        let _ = (conn, is_binary, data);
        Box::pin(async {})
    }

    /// Observes a ping payload. The pong reply is always sent regardless.
    fn on_ping<'a>(&'a self, conn: &'a Arc<Conn>, data: &'a [u8]) -> HandlerFuture<'a> {
        let _ = (conn, data);
        Box::pin(async {})
    }

    fn on_pong<'a>(&'a self, conn: &'a Arc<Conn>, data: &'a [u8]) -> HandlerFuture<'a> {
        let _ = (conn, data);
        Box::pin(async {})
    }

    /// Runs exactly once per connection, after the supervisor loop exits.
    /// `err` is `None` on a clean close; a peer close with a status code
    /// arrives as [`Error::PeerClose`].
    fn on_close<'a>(&'a self, conn: &'a Arc<Conn>, err: Option<&'a Error>) -> HandlerFuture<'a> {
        let _ = (conn, err);
        Box::pin(async {})
    }

    /// Reports a non-fatal error. Fatal errors become the close cause and
    /// go to [`Handler::on_close`] instead.
    fn on_error<'a>(&'a self, conn: &'a Arc<Conn>, err: &'a Error) -> HandlerFuture<'a> {
        let _ = (conn, err);
        Box::pin(async {})
    }

    /// Raw-frame override. Returning a future takes over the frame and
    /// suppresses the built-in state machine for it, autoresponses and the
    /// close handshake included. The default returns `None`.
    fn on_frame<'a>(
        &'a self,
        conn: &'a Arc<Conn>,
        frame: &'a mut Frame,
    ) -> Option<HandlerFuture<'a>> {
        let _ = (conn, frame);
        None
    }
}

struct DefaultHandler;

impl Handler for DefaultHandler {}

/// WebSocket endpoint configuration plus the callback dispatcher.
///
/// The server does not listen by itself; the host hands every upgraded
/// stream to [`Server::serve`], or lets [`Server::upgrade`] do the
/// handshake first on a raw TCP stream.
pub struct Server {
    origin: Option<Url>,
    protocols: Vec<String>,
    max_payload_size: usize,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    next_id: AtomicU64,
    handler: Arc<dyn Handler>,
}

impl Default for Server {
    fn default() -> Server {
        Server::new()
    }
}

impl Server {
    pub fn new() -> Server {
        Server {
            origin: None,
            protocols: Vec::new(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            read_timeout: None,
            write_timeout: None,
            next_id: AtomicU64::new(0),
            handler: Arc::new(DefaultHandler),
        }
    }

    /// Restricts connections to clients from this origin.
    pub fn origin(mut self, origin: Url) -> Server {
        self.origin = Some(origin);
        self
    }

    /// Supported subprotocols, in preference order.
    pub fn protocols<I, P>(mut self, protocols: I) -> Server
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_payload_size(mut self, max: usize) -> Server {
        self.max_payload_size = max;
        self
    }

    pub fn read_timeout(mut self, limit: Duration) -> Server {
        self.read_timeout = Some(limit);
        self
    }

    /// Deadline applied to each frame write.
    pub fn write_timeout(mut self, limit: Duration) -> Server {
        self.write_timeout = Some(limit);
        self
    }

    pub fn handler(mut self, handler: impl Handler) -> Server {
        self.handler = Arc::new(handler);
        self
    }

    pub(crate) fn allowed_origin(&self) -> Option<&Url> {
        self.origin.as_ref()
    }

    pub(crate) fn supported_protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Performs the opening handshake on a raw stream and serves the
    /// connection to completion.
    ///
    /// Frame bytes a client pipelined behind the upgrade request are handed
    /// from the handshake to the frame parser, so the first message may
    /// arrive in the same write as the request.
    pub async fn upgrade<S>(&self, mut stream: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let readahead = handshake::accept(self, &mut stream).await?;
        self.serve_conn(stream, UserValues::new(), readahead).await;
        Ok(())
    }

    /// Serves one upgraded connection to completion.
    ///
    /// The stream must be positioned at the first frame byte; upgrade glue
    /// that buffers its reads should go through [`Server::upgrade`] or hand
    /// over only what it has not consumed.
    ///
    /// Assigns the connection id, spawns the reader and writer tasks, runs
    /// the open callback, then supervises the connection until it closes.
    /// The close callback has run and both workers have terminated by the
    /// time this returns.
    pub async fn serve<S>(&self, stream: S, user_values: UserValues)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.serve_conn(stream, user_values, BytesMut::new()).await;
    }

    async fn serve_conn<S>(&self, stream: S, user_values: UserValues, readahead: BytesMut)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (connection, mut pipeline) = conn::spawn(
            stream,
            conn::Config {
                id,
                max_payload_size: self.max_payload_size,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                user_values,
                readahead,
            },
        );

        debug!(id, "connection open");
        self.handler.on_open(&connection).await;

        let cause = self.run(&connection, &mut pipeline).await;

        connection.shutdown();
        self.handler.on_close(&connection, cause.as_ref()).await;
        pipeline.finish().await;
        debug!(id, "connection closed");
    }

    async fn run(&self, connection: &Arc<Conn>, pipeline: &mut conn::Pipeline) -> Option<Error> {
        let mut cause = None;

        loop {
            tokio::select! {
                frame = pipeline.input.recv() => {
                    let Some(frame) = frame else { break };
                    if self.dispatch(connection, pipeline, frame, &mut cause).await {
                        break;
                    }
                }
                fault = pipeline.faults.recv() => {
                    let Some(err) = fault else { break };
                    if err.is_protocol() {
                        let _ = connection.try_write_frame(Frame::close(Status::ProtocolError, ""));
                    }
                    cause = Some(err);
                    break;
                }
                _ = connection.closer().cancelled() => break,
            }
        }

        cause
    }

    /// Routes one inbound frame: raw override first, then mask enforcement,
    /// then control dispatch or reassembly. Returns `true` when the
    /// supervisor loop should exit.
    async fn dispatch(
        &self,
        connection: &Arc<Conn>,
        pipeline: &mut conn::Pipeline,
        mut frame: Frame,
        cause: &mut Option<Error>,
    ) -> bool {
        let was_handled = {
            if let Some(handled) = self.handler.on_frame(connection, &mut frame) {
                handled.await;
                true
            } else {
                false
            }
        };
        if was_handled {
            frame::release(frame);
            return false;
        }

        if frame.is_masked() {
            frame.unmask();
        } else {
            frame::release(frame);
            return self
                .protocol_violation(connection, Error::UnmaskedFrame, cause)
                .await;
        }

        if frame.is_control() {
            self.handle_control(connection, frame, cause).await
        } else {
            self.handle_data(connection, pipeline, frame, cause).await
        }
    }

    async fn handle_control(
        &self,
        connection: &Arc<Conn>,
        frame: Frame,
        cause: &mut Option<Error>,
    ) -> bool {
        if frame.is_ping() {
            self.handler.on_ping(connection, frame.payload()).await;
            let _ = connection.write_frame(Frame::pong(frame.payload())).await;
            frame::release(frame);
            return false;
        }

        if frame.is_pong() {
            self.handler.on_pong(connection, frame.payload()).await;
            frame::release(frame);
            return false;
        }

        // Close handshake responder.
        let status = frame.status();
        if let Err(err) = std::str::from_utf8(frame.reason()) {
            self.handler
                .on_error(connection, &Error::InvalidUtf8(err))
                .await;
        }

        // A close that answers our own close frame is only an
        // acknowledgement; it carries no cause and gets no reply.
        if !connection.close_sent() {
            *cause = match status {
                Status::None => None,
                status => Some(Error::PeerClose(Close {
                    status,
                    reason: String::from_utf8_lossy(frame.reason()).into_owned(),
                })),
            };
            let _ = connection.write_frame(Frame::close(status, "")).await;
        }

        frame::release(frame);
        connection.shutdown();
        true
    }

    async fn handle_data(
        &self,
        connection: &Arc<Conn>,
        pipeline: &mut conn::Pipeline,
        frame: Frame,
        cause: &mut Option<Error>,
    ) -> bool {
        if frame.opcode() == Opcode::Continuation {
            let Some(mut reassembly) = pipeline.reassembly.take() else {
                frame::release(frame);
                return self
                    .protocol_violation(connection, Error::UnexpectedContinuation, cause)
                    .await;
            };

            reassembly.buf.extend_from_slice(frame.payload());
            let fin = frame.is_fin();
            frame::release(frame);

            if !fin {
                pipeline.reassembly = Some(reassembly);
                return false;
            }

            if !reassembly.buf.is_empty() {
                self.handler
                    .on_message(connection, reassembly.is_binary, &reassembly.buf)
                    .await;
            }
            pool::BUFFERS.release(reassembly.buf);
            return false;
        }

        if pipeline.reassembly.is_some() {
            frame::release(frame);
            return self
                .protocol_violation(connection, Error::InterleavedMessage, cause)
                .await;
        }

        let is_binary = frame.opcode() == Opcode::Binary;
        if frame.is_fin() {
            if !frame.payload().is_empty() {
                self.handler
                    .on_message(connection, is_binary, frame.payload())
                    .await;
            }
        } else {
            let mut buf = pool::BUFFERS.acquire();
            buf.extend_from_slice(frame.payload());
            pipeline.reassembly = Some(conn::Reassembly { is_binary, buf });
        }
        frame::release(frame);
        false
    }

    async fn protocol_violation(
        &self,
        connection: &Arc<Conn>,
        err: Error,
        cause: &mut Option<Error>,
    ) -> bool {
        debug!(id = connection.id(), error = %err, "closing after protocol violation");
        let _ = connection
            .write_frame(Frame::close(Status::ProtocolError, ""))
            .await;
        *cause = Some(err);
        connection.shutdown();
        true
    }
}
