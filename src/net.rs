//! Plain-TCP transport.
//!
//! Bridges a framed socket to the channel-based [`TransportHandle`] the
//! lifecycle controller consumes. TLS and bouncer-specific transports are
//! expected to live in the embedding application; they only need to
//! produce the same handle shape.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::collab::{Connector, TransportHandle};
use crate::error::ConnectError;
use crate::proto::line::LineCodec;

/// One instance per server endpoint; the lifecycle controller calls
/// [`Connector::connect`] once per attempt.
pub struct TcpConnector {
    addr: String,
    max_line_len: usize,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> TcpConnector {
        TcpConnector {
            addr: addr.into(),
            max_line_len: 512,
        }
    }

    /// Raise the per-line byte limit. Tag-heavy servers can exceed the
    /// classic 512.
    pub fn max_line_len(mut self, max_line_len: usize) -> TcpConnector {
        self.max_line_len = max_line_len;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<TransportHandle, ConnectError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "transport connected");

        let framed = Framed::new(stream, LineCodec::with_max_len(self.max_line_len));
        let (mut sink, mut lines) = framed.split();

        let (in_tx, in_rx) = mpsc::channel(256);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let stop = Arc::new(Notify::new());

        let read_stop = Arc::clone(&stop);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_stop.notified() => break,
                    item = lines.next() => match item {
                        Some(Ok(line)) => {
                            if in_tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        // The codec has already discarded the offending
                        // bytes; the stream stays usable.
                        Some(Err(err)) => warn!(error = %err, "dropping inbound line"),
                        None => break,
                    },
                }
            }
        });

        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        Ok(TransportHandle {
            incoming: in_rx,
            outgoing: out_tx,
            shutdown: Arc::new(move || stop.notify_one()),
        })
    }
}
