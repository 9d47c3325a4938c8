use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::frame::{self, Frame, Status};
use crate::{pool, Error, UserValues};

/// Frames buffered per direction before producers block.
pub const QUEUE_CAPACITY: usize = 128;

// The mailbox holds at most one fault per worker; extra reports are dropped.
const FAULT_CAPACITY: usize = 2;

const READ_BUFFER_SIZE: usize = 4096;

/// Shared handle to one WebSocket connection.
///
/// Cheap to clone behind an `Arc`; any task may write through it
/// concurrently. Frames reach the wire in the order they are enqueued, and
/// writes block once the outbound queue holds [`QUEUE_CAPACITY`] frames.
pub struct Conn {
    id: u64,
    output: mpsc::Sender<Frame>,
    closer: CancellationToken,
    closed: AtomicBool,
    user_values: Mutex<UserValues>,
    max_payload_size: usize,
}

impl Conn {
    /// Unique identifier for the connection, assigned at upgrade time.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Returns the value stored under `key`, if it has the requested type.
    pub fn user_value<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let values = self.user_values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()?.downcast::<T>().ok()
    }

    pub fn set_user_value<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        let mut values = self.user_values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.into(), Arc::new(value));
    }

    /// Enqueues a text frame carrying `data`.
    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.write_frame(Frame::text(data)).await
    }

    /// Enqueues a binary frame carrying `data`.
    pub async fn write_binary(&self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.write_frame(Frame::binary(data)).await
    }

    /// Enqueues a ping. The peer's pong surfaces through the pong callback.
    pub async fn ping(&self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.write_frame(Frame::ping(data)).await
    }

    /// Enqueues an arbitrary frame, blocking while the outbound queue is
    /// full. This is the backpressure point shared by all producers.
    pub async fn write_frame(&self, frame: Frame) -> Result<(), Error> {
        match self.output.send(frame).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(frame)) => {
                frame::release(frame);
                Err(Error::ConnectionClosed)
            }
        }
    }

    pub(crate) fn try_write_frame(&self, frame: Frame) -> Result<(), Error> {
        match self.output.try_send(frame) {
            Ok(()) => Ok(()),
            Err(err) => {
                frame::release(err.into_inner());
                Err(Error::ConnectionClosed)
            }
        }
    }

    /// Starts the close handshake. The first call enqueues exactly one close
    /// frame and marks the connection as closing; later calls are no-ops.
    pub async fn close(&self, status: Status, reason: &str) -> Result<(), Error> {
        if self.closer.is_cancelled() || self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.write_frame(Frame::close(status, reason)).await;
        self.closer.cancel();
        result
    }

    /// True once a locally initiated close frame has been enqueued.
    pub(crate) fn close_sent(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown(&self) {
        self.closer.cancel();
    }

    pub(crate) fn closer(&self) -> &CancellationToken {
        &self.closer
    }
}

pub(crate) struct Config {
    pub id: u64,
    pub max_payload_size: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub user_values: UserValues,
    /// Bytes the upgrade glue consumed past the handshake request; the
    /// reader parses these before touching the socket.
    pub readahead: BytesMut,
}

/// Message fragments accumulated between a non-FIN data frame and its final
/// continuation. The buffer comes from the shared byte pool.
pub(crate) struct Reassembly {
    pub is_binary: bool,
    pub buf: Vec<u8>,
}

/// Supervisor-owned half of a connection: the inbound queue, the fault
/// mailbox, reassembly state, and the worker join handles.
pub(crate) struct Pipeline {
    pub input: mpsc::Receiver<Frame>,
    pub faults: mpsc::Receiver<Error>,
    pub reassembly: Option<Reassembly>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Pipeline {
    /// Tears the pipeline down. The closer latch must already be cancelled;
    /// dropping the inbound receiver unblocks a reader stuck on a full
    /// queue, and the latch unblocks the writer.
    pub(crate) async fn finish(mut self) {
        if let Some(reassembly) = self.reassembly.take() {
            pool::BUFFERS.release(reassembly.buf);
        }
        while let Ok(frame) = self.input.try_recv() {
            frame::release(frame);
        }
        drop(self.input);
        drop(self.faults);
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

/// Splits the socket and spawns the reader and writer tasks.
pub(crate) fn spawn<S>(stream: S, config: Config) -> (Arc<Conn>, Pipeline)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (input_tx, input_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (output_tx, output_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (fault_tx, fault_rx) = mpsc::channel(FAULT_CAPACITY);
    let closer = CancellationToken::new();

    let conn = Arc::new(Conn {
        id: config.id,
        output: output_tx,
        closer: closer.clone(),
        closed: AtomicBool::new(false),
        user_values: Mutex::new(config.user_values),
        max_payload_size: config.max_payload_size,
    });

    let reader = tokio::spawn(read_loop(
        read_half,
        config.readahead,
        input_tx,
        fault_tx.clone(),
        closer.clone(),
        config.max_payload_size,
        config.read_timeout,
    ));
    let writer = tokio::spawn(write_loop(
        write_half,
        output_rx,
        fault_tx,
        closer,
        config.write_timeout,
    ));

    let pipeline = Pipeline {
        input: input_rx,
        faults: fault_rx,
        reassembly: None,
        reader,
        writer,
    };

    (conn, pipeline)
}

async fn read_loop<R>(
    mut reader: R,
    readahead: BytesMut,
    input: mpsc::Sender<Frame>,
    faults: mpsc::Sender<Error>,
    closer: CancellationToken,
    max_payload_size: usize,
    read_timeout: Option<Duration>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = readahead;
    buf.reserve(READ_BUFFER_SIZE);

    'conn: loop {
        let mut frame = frame::acquire();

        loop {
            match frame::parse_frame_into(&mut buf, &mut frame, max_payload_size) {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    let _ = faults.try_send(err);
                    frame::release(frame);
                    break 'conn;
                }
            }

            let read = tokio::select! {
                read = read_some(&mut reader, &mut buf, read_timeout) => read,
                _ = closer.cancelled() => {
                    frame::release(frame);
                    break 'conn;
                }
            };
            match read {
                Ok(0) => {
                    let _ = faults.try_send(Error::Io(io::ErrorKind::UnexpectedEof.into()));
                    frame::release(frame);
                    break 'conn;
                }
                Ok(_) => {}
                Err(err) => {
                    let _ = faults.try_send(err);
                    frame::release(frame);
                    break 'conn;
                }
            }
        }

        let is_close = frame.is_close();
        if input.send(frame).await.is_err() {
            // Supervisor is gone; the frame was dropped with the channel.
            break;
        }
        if is_close {
            break;
        }
    }

    trace!("reader exiting");
}

async fn read_some<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    read_timeout: Option<Duration>,
) -> Result<usize, Error>
where
    R: AsyncRead + Unpin,
{
    match read_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read_buf(buf)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(Error::ReadTimeout),
        },
        None => Ok(reader.read_buf(buf).await?),
    }
}

async fn write_loop<W>(
    write_half: W,
    mut output: mpsc::Receiver<Frame>,
    faults: mpsc::Sender<Error>,
    closer: CancellationToken,
    write_timeout: Option<Duration>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(write_half);
    let mut scratch = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        tokio::select! {
            frame = output.recv() => {
                let Some(frame) = frame else { return };
                let is_close = frame.is_close();
                if let Err(err) = write_frame(&mut writer, &mut scratch, &frame, write_timeout).await {
                    let _ = faults.try_send(err);
                }
                frame::release(frame);
                if is_close {
                    trace!("writer exiting after close frame");
                    return;
                }
            }
            _ = closer.cancelled() => break,
        }
    }

    // The latch fired; drain whatever was enqueued before it so a pending
    // close reply still reaches the wire.
    while let Ok(frame) = output.try_recv() {
        let is_close = frame.is_close();
        let result = write_frame(&mut writer, &mut scratch, &frame, write_timeout).await;
        frame::release(frame);
        if result.is_err() || is_close {
            break;
        }
    }

    trace!("writer exiting");
}

async fn write_frame<W>(
    writer: &mut BufWriter<W>,
    scratch: &mut BytesMut,
    frame: &Frame,
    write_timeout: Option<Duration>,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    scratch.clear();
    frame::encode(frame, scratch);

    let io = async {
        writer.write_all(&scratch[..]).await?;
        // Flush per frame so the wire only ever sees whole frames.
        writer.flush().await
    };

    match write_timeout {
        Some(limit) => match tokio::time::timeout(limit, io).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::WriteTimeout),
        },
        None => io.await.map_err(Error::from),
    }
}
