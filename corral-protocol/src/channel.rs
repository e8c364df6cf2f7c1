//! Worker to supervisor message channel over an inherited pipe.
//!
//! The worker writes length-prefixed frames through [`WorkerChannel`]; the
//! supervisor reads them with [`MessageReader`].

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::unix::pipe,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    errors::ChannelError,
    protocol::{ENV_IPC_FD, MAX_MESSAGE_SIZE, WorkerMessage, decode_message, encode_message},
};

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Bounded channel capacity for the writer task.
const WRITER_CHANNEL_CAPACITY: usize = 64;

struct Outgoing {
    frame: Vec<u8>,
    flushed: Option<oneshot::Sender<()>>,
}

/// Clone-able sending half used by the worker.
#[derive(Clone)]
pub struct WorkerChannel {
    writer_tx: mpsc::Sender<Outgoing>,
}

impl WorkerChannel {
    /// Open the channel from the descriptor named in `CORRAL_IPC_FD`.
    pub fn from_env() -> Result<Self> {
        let value = std::env::var(ENV_IPC_FD).map_err(|_| ChannelError::MissingFd {
            name: ENV_IPC_FD,
        })?;
        let fd: RawFd = value.trim().parse().map_err(|_| ChannelError::InvalidFd {
            name: ENV_IPC_FD,
            value: value.clone(),
        })?;
        if fd < 0 {
            return Err(ChannelError::InvalidFd {
                name: ENV_IPC_FD,
                value,
            });
        }
        // SAFETY: the supervisor hands exactly this descriptor to the worker and
        // nothing else in the process owns it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::from_fd(owned)
    }

    /// Wrap the write end of a pipe. Must be called inside a tokio runtime.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let mut sender = pipe::Sender::from_owned_fd(fd).map_err(ChannelError::Open)?;
        let (writer_tx, mut writer_rx) = mpsc::channel::<Outgoing>(WRITER_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(out) = writer_rx.recv().await {
                if let Err(e) = sender.write_all(&out.frame).await {
                    debug!("IPC writer error: {}", e);
                    break;
                }
                if let Some(flushed) = out.flushed {
                    let _ = flushed.send(());
                }
            }
        });

        Ok(Self { writer_tx })
    }

    /// Queue a message for delivery.
    pub async fn send(&self, msg: &WorkerMessage) -> Result<()> {
        let frame = encode_message(msg)?;
        self.writer_tx
            .send(Outgoing { frame, flushed: None })
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Send a message and wait until it has been written to the pipe.
    pub async fn send_and_flush(&self, msg: &WorkerMessage) -> Result<()> {
        let frame = encode_message(msg)?;
        let (tx, rx) = oneshot::channel();
        self.writer_tx
            .send(Outgoing {
                frame,
                flushed: Some(tx),
            })
            .await
            .map_err(|_| ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)
    }
}

/// Capacity of the queue between the reader task and [`MessageReader::next`].
const READER_CHANNEL_CAPACITY: usize = 64;

/// Receiving half used by the supervisor.
///
/// Frames are read by a background task, so dropping a pending
/// [`next`](Self::next) (e.g. inside `select!`) never loses a partial frame.
pub struct MessageReader {
    messages: mpsc::Receiver<WorkerMessage>,
    reader_handle: JoinHandle<()>,
}

impl MessageReader {
    /// Wrap the read end of a pipe. Must be called inside a tokio runtime.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let receiver = pipe::Receiver::from_owned_fd(fd).map_err(ChannelError::Open)?;
        let (tx, messages) = mpsc::channel(READER_CHANNEL_CAPACITY);
        let reader_handle = tokio::spawn(read_frames(receiver, tx));
        Ok(Self {
            messages,
            reader_handle,
        })
    }

    /// Next well-formed message, or `None` once the worker side is gone.
    /// Cancel-safe.
    pub async fn next(&mut self) -> Option<WorkerMessage> {
        self.messages.recv().await
    }
}

impl Drop for MessageReader {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Read length-prefixed frames until EOF, an I/O error or an oversized
/// frame. Frames that fail to decode are skipped.
async fn read_frames(mut receiver: pipe::Receiver, tx: mpsc::Sender<WorkerMessage>) {
    loop {
        let mut len_buf = [0u8; 4];
        if let Err(e) = receiver.read_exact(&mut len_buf).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                debug!("Worker closed IPC channel (EOF)");
            } else {
                debug!("IPC reader error: {}", e);
            }
            return;
        }
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            debug!("Worker message exceeds maximum size ({} bytes)", msg_len);
            return;
        }

        let mut payload = vec![0u8; msg_len];
        if let Err(e) = receiver.read_exact(&mut payload).await {
            debug!("IPC reader error: {}", e);
            return;
        }

        match decode_message(&payload) {
            Ok(msg) => {
                if tx.send(msg).await.is_err() {
                    return;
                }
            }
            Err(e) => debug!("Ignoring malformed worker message: {}", e),
        }
    }
}
