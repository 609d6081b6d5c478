//! Length-delimited frames over a byte stream.
//!
//! Each transport runs a reader task and a writer task on the tokio runtime.
//! The reader only pushes raw frames into a channel; decoding happens later
//! on the thread calling `NetworkSystem::tick`.

use crate::error::{ProtocolError, Result};
use crate::service::system::ConnectionAcceptor;
use crate::transport::Transport;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, instrument, warn};

/// A framed stream with its worker tasks.
#[derive(Debug)]
pub struct StreamTransport {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl StreamTransport {
    /// Frame `stream` and start its workers. Must be called inside a tokio runtime.
    pub fn spawn<S>(stream: S, max_frame_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_size)
            .new_codec();
        let (mut sink, mut source) = Framed::new(stream, codec).split();

        let (in_tx, incoming) = mpsc::unbounded_channel();
        let (outgoing, out_rx) = mpsc::unbounded_channel::<Bytes>();
        let open = Arc::new(AtomicBool::new(true));

        let reader_open = open.clone();
        let reader = tokio::spawn(async move {
            while let Some(result) = source.next().await {
                match result {
                    Ok(frame) => {
                        if in_tx.send(frame.to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Stream read failed");
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::Release);
            debug!("Stream reader finished");
        });

        let writer_open = open.clone();
        tokio::spawn(async move {
            let mut frames = UnboundedReceiverStream::new(out_rx).map(Ok::<Bytes, std::io::Error>);
            if let Err(e) = sink.send_all(&mut frames).await {
                warn!(error = %e, "Stream write failed");
            }
            let _ = sink.close().await;
            writer_open.store(false, Ordering::Release);
            debug!("Stream writer finished");
        });

        Self {
            incoming,
            outgoing: Some(outgoing),
            open,
            reader,
        }
    }
}

impl Transport for StreamTransport {
    fn poll_incoming(&mut self, sink: &mut dyn FnMut(Vec<u8>)) {
        while let Ok(frame) = self.incoming.try_recv() {
            sink(frame);
        }
    }

    fn send_raw(&mut self, frame: &[u8]) -> Result<()> {
        let outgoing = self.outgoing.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        outgoing
            .send(Bytes::copy_from_slice(frame))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn close(&mut self, reason: &str) {
        // Dropping the sender lets the writer flush what is queued, then shut down.
        if self.outgoing.take().is_some() {
            debug!(%reason, "Closing stream transport");
        }
        self.reader.abort();
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.outgoing.is_some() && self.open.load(Ordering::Acquire)
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Connect to a host over TCP.
#[instrument(skip(addr))]
pub async fn connect_tcp<A: ToSocketAddrs>(addr: A, max_frame_size: usize) -> Result<StreamTransport> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    info!(peer = ?stream.peer_addr().ok(), "Connected to host");
    Ok(StreamTransport::spawn(stream, max_frame_size))
}

/// Accept TCP clients and hand them to a `NetworkSystem` until shutdown.
///
/// Runs on the tokio runtime; the system picks accepted transports up on its
/// next tick.
#[instrument(skip(listener, acceptor, shutdown_rx))]
pub async fn serve_tcp(
    listener: TcpListener,
    acceptor: ConnectionAcceptor,
    max_frame_size: usize,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()> {
    info!(address = ?listener.local_addr().ok(), "Listening for connections");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down listener");
                return Ok(());
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(error = %e, %peer, "Failed to set TCP_NODELAY");
                        }
                        debug!(%peer, "Accepted connection");
                        let transport = StreamTransport::spawn(stream, max_frame_size);
                        if acceptor.accept(Box::new(transport)).is_err() {
                            info!("Session dropped, stopping listener");
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
}
