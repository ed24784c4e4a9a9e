//! The owning transport pair (spec §4.2): a reader task plus a write-mutex
//! guarded sender, enforcing the single-reader invariant from spec §5.
//!
//! All failures are terminal for a transport (spec §4.2 "Failure model").
//! Once poisoned, every subsequent `send`/`recv` fails immediately rather
//! than attempting I/O again — there is no reconnection at this layer.

use crate::error::TransportError;
use sies_wire::{codec, DecodeOutcome, Encoding, Message, DEFAULT_MAX_FRAME_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Configuration for a transport pair.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub encoding: Encoding,
    pub max_frame_size: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Binary,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

struct Inner<W> {
    writer: Mutex<W>,
    inbound: Mutex<mpsc::Receiver<Result<Message, TransportError>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    poisoned: AtomicBool,
    config: TransportConfig,
}

/// An owning pair of (reader task, writer half) over the frame codec,
/// producing a stream of typed messages and accepting typed messages for
/// send (spec §4.2).
///
/// Cheap to clone: internally `Arc`-backed, so the Session/Worker loop that
/// reads it and the output pump that writes through it can share one handle.
pub struct Transport<W> {
    inner: Arc<Inner<W>>,
}

impl<W> Clone for Transport<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W> Transport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Construct the transport and spawn its reader task.
    ///
    /// The reader task calls `decode_frame` in a loop and delivers messages
    /// via an internal channel feeding exactly one consumer (spec §4.2
    /// `open`).
    pub fn open<R>(read_half: R, write_half: W, config: TransportConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let reader_task = tokio::spawn(reader_loop(read_half, config, tx));

        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(write_half),
                inbound: Mutex::new(rx),
                reader_task: Mutex::new(Some(reader_task)),
                poisoned: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Await the next message. Must be called by a single, consistent
    /// reader task for the transport's entire lifetime (spec §4.2, §5); a
    /// second concurrent caller trips the `try_lock` below and panics,
    /// since that is a programming error rather than a recoverable state.
    pub async fn recv(&self) -> Result<Message, TransportError> {
        if self.inner.poisoned.load(Ordering::SeqCst) {
            return Err(TransportError::Poisoned);
        }
        let mut guard = self.inner.inbound.try_lock().unwrap_or_else(|_| {
            panic!(
                "Transport::recv called by more than one task concurrently; \
                 violates the single-reader invariant"
            )
        });
        match guard.recv().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => {
                self.inner.poisoned.store(true, Ordering::SeqCst);
                Err(e)
            }
            None => {
                self.inner.poisoned.store(true, Ordering::SeqCst);
                Err(TransportError::Eof)
            }
        }
    }

    /// Serialize `msg` under the write mutex and hand it to the OS buffer.
    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if self.inner.poisoned.load(Ordering::SeqCst) {
            return Err(TransportError::Poisoned);
        }
        let mut writer = self.inner.writer.lock().await;
        let result = codec::write_frame(&mut *writer, msg, self.inner.config.encoding).await;
        if result.is_err() {
            self.inner.poisoned.store(true, Ordering::SeqCst);
        }
        result.map_err(TransportError::from)
    }

    /// Idempotent: stops the reader task, flushes and closes the writer
    /// half. Pending `recv` calls observe `Eof`.
    pub async fn close(&self) {
        self.inner.poisoned.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.reader_task.lock().await.take() {
            handle.abort();
        }
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn config(&self) -> TransportConfig {
        self.inner.config
    }
}

async fn reader_loop<R>(
    mut read_half: R,
    config: TransportConfig,
    tx: mpsc::Sender<Result<Message, TransportError>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let outcome = codec::decode_frame(&mut read_half, config.max_frame_size, config.encoding).await;
        match outcome {
            Ok(DecodeOutcome::Message(msg)) => {
                if tx.send(Ok(msg)).await.is_err() {
                    return;
                }
            }
            Ok(DecodeOutcome::Eof) => {
                // Clean closure: drop the sender so the next `recv` sees `None` -> Eof.
                return;
            }
            Err(e) => {
                let _ = tx.send(Err(TransportError::from(e))).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sies_wire::MessageBody;
    use tokio::io::duplex;

    fn ready() -> Message {
        Message::new(MessageBody::Ready {
            capabilities: vec!["exec".into()],
        })
    }

    #[tokio::test]
    async fn send_then_recv_round_trips() {
        let (client, server) = duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let client_transport = Transport::open(client_r, client_w, TransportConfig::default());
        let server_transport = Transport::open(server_r, server_w, TransportConfig::default());

        let msg = ready();
        client_transport.send(&msg).await.unwrap();
        let received = server_transport.recv().await.unwrap();
        assert_eq!(received.id, msg.id);
    }

    #[tokio::test]
    async fn close_causes_pending_recv_to_see_eof() {
        let (client, server) = duplex(4096);
        let (_client_r, client_w) = tokio::io::split(client);
        let (server_r, _server_w) = tokio::io::split(server);
        drop(client_w);

        let server_transport = Transport::open(server_r, tokio::io::sink(), TransportConfig::default());
        let err = server_transport.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::Eof));
    }

    #[tokio::test]
    async fn operations_after_close_fail_poisoned() {
        let (client, server) = duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (_server_r, _server_w) = tokio::io::split(server);

        let transport = Transport::open(client_r, client_w, TransportConfig::default());
        transport.close().await;
        let err = transport.send(&ready()).await.unwrap_err();
        assert!(matches!(err, TransportError::Poisoned));
    }
}
