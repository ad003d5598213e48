//! Framed, ping-checked transport over a websocket.
//!
//! This module owns exactly the concerns of spec component 4.1: opening a
//! connection, splitting large payloads into ordered chunks and
//! reassembling them, awaiting a peer ack before `send` resolves, and
//! liveness via `ping`/`pong`. Everything above this layer (RPC framing,
//! method dispatch) is oblivious to chunking.

mod wire;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

pub use wire::WireMessage;

use crate::error::{HostError, Result};

/// Default chunk size for outbound frames, matching the upstream SDK's
/// websocket chunking.
pub const MAX_FRAME_BYTES: usize = 32 * 1024;

/// An event emitted by the transport as inbound traffic and liveness arrive.
#[derive(Debug)]
pub enum SocketEvent {
    /// A fully reassembled inbound payload.
    Message(Vec<u8>),
    /// The peer closed the connection, or a bounded read failed fatally.
    Closed { code: Option<u16>, reason: String },
}

/// What [`crate::rpc::RpcClient`] needs from a bound connection.
///
/// [`Transport`] is the only production implementation; the `test-support`
/// feature's fake communicator is the other, letting the RPC layer and
/// everything above it be driven without a real websocket.
#[async_trait::async_trait]
pub trait Communicator: Send + Sync {
    /// Send a fully-formed outbound payload, awaiting delivery.
    async fn send(&self, payload: &[u8]) -> Result<()>;
    /// Round-trip liveness check.
    async fn ping(&self) -> Result<()>;
    /// Close the connection without waiting for a peer ack.
    async fn close(&self);
    /// Stable identifier carried across reconnects.
    fn instance_id(&self) -> Uuid;
}

#[async_trait::async_trait]
impl Communicator for Transport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        Self::send(self, payload).await
    }

    async fn ping(&self) -> Result<()> {
        Self::ping(self).await
    }

    async fn close(&self) {
        Self::close(self).await;
    }

    fn instance_id(&self) -> Uuid {
        Self::instance_id(self)
    }
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

struct ReassemblyBuffer {
    total: u32,
    parts: Vec<Option<Vec<u8>>>,
}

/// A framed websocket transport. One instance per live connection; a new
/// instance is constructed on every reconnect, but `instance_id` is carried
/// forward by the caller so the peer can correlate the new socket with the
/// same logical host.
pub struct Transport {
    instance_id: Uuid,
    sink: Mutex<WsSink>,
    pending_acks: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    pending_pongs: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    send_timeout: Duration,
    ping_timeout: Duration,
    max_frame_bytes: usize,
}

impl Transport {
    /// Open a websocket connection and spawn the background reader task.
    ///
    /// # Errors
    /// Returns [`HostError::Timeout`] if the handshake does not complete
    /// within `connect_timeout`, or [`HostError::Transport`] if the peer
    /// refuses the connection.
    #[instrument(skip(api_key), fields(instance_id = %instance_id))]
    pub async fn connect(
        endpoint: &str,
        instance_id: Uuid,
        api_key: Option<&str>,
        connect_timeout: Duration,
        send_timeout: Duration,
        ping_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<(Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<SocketEvent>)> {
        let mut request = endpoint
            .into_client_request()
            .map_err(HostError::Transport)?;
        let headers = request.headers_mut();
        headers.insert(
            "x-instance-id",
            instance_id
                .to_string()
                .parse()
                .map_err(|_| HostError::Fatal("invalid instance id header".into()))?,
        );
        if let Some(key) = api_key {
            headers.insert(
                "x-api-key",
                key.parse()
                    .map_err(|_| HostError::Fatal("invalid api key header".into()))?,
            );
        }

        let (stream, _response) = timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| HostError::Timeout)??;

        let (sink, mut stream_read) = stream.split();
        let transport = Arc::new(Self {
            instance_id,
            sink: Mutex::new(sink),
            pending_acks: Mutex::new(HashMap::new()),
            pending_pongs: Mutex::new(HashMap::new()),
            send_timeout,
            ping_timeout,
            max_frame_bytes,
        });

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let reader_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            let mut buffers: HashMap<Uuid, ReassemblyBuffer> = HashMap::new();
            loop {
                let msg = match stream_read.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        warn!(error = %err, "transport read error");
                        let _ = events_tx.send(SocketEvent::Closed {
                            code: None,
                            reason: err.to_string(),
                        });
                        break;
                    }
                    None => {
                        let _ = events_tx.send(SocketEvent::Closed {
                            code: None,
                            reason: "stream ended".into(),
                        });
                        break;
                    }
                };

                match msg {
                    WsMessage::Binary(data) => {
                        let Ok(wire) = wire::decode(&data) else {
                            warn!("dropping malformed wire message");
                            continue;
                        };
                        reader_transport
                            .handle_inbound(wire, &mut buffers, &events_tx)
                            .await;
                    }
                    WsMessage::Close(frame) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        let _ = events_tx.send(SocketEvent::Closed { code, reason });
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok((transport, events_rx))
    }

    async fn handle_inbound(
        &self,
        wire: WireMessage,
        buffers: &mut HashMap<Uuid, ReassemblyBuffer>,
        events_tx: &tokio::sync::mpsc::UnboundedSender<SocketEvent>,
    ) {
        match wire {
            WireMessage::Chunk {
                message_id,
                seq,
                total,
                bytes,
            } => {
                let buffer = buffers.entry(message_id).or_insert_with(|| ReassemblyBuffer {
                    total,
                    parts: vec![None; total as usize],
                });
                if let Some(slot) = buffer.parts.get_mut(seq as usize) {
                    *slot = Some(bytes);
                }
                if buffer.parts.iter().all(Option::is_some) {
                    let Some(buffer) = buffers.remove(&message_id) else {
                        return;
                    };
                    let payload: Vec<u8> = buffer
                        .parts
                        .into_iter()
                        .flatten()
                        .flat_map(<[u8]>::to_vec)
                        .collect();
                    self.send_raw(&WireMessage::Ack { message_id }).await.ok();
                    let _ = events_tx.send(SocketEvent::Message(payload));
                }
            }
            WireMessage::Ack { message_id } => {
                if let Some(tx) = self.pending_acks.lock().await.remove(&message_id) {
                    let _ = tx.send(());
                }
            }
            WireMessage::Ping { nonce } => {
                self.send_raw(&WireMessage::Pong { nonce }).await.ok();
            }
            WireMessage::Pong { nonce } => {
                if let Some(tx) = self.pending_pongs.lock().await.remove(&nonce) {
                    let _ = tx.send(());
                }
            }
        }
    }

    async fn send_raw(&self, message: &WireMessage) -> Result<()> {
        let bytes = wire::encode(message)?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Binary(bytes.into()))
            .await
            .map_err(HostError::Transport)
    }

    /// Split `payload` into ordered chunks, send them, and await the peer's
    /// ack for the whole message.
    ///
    /// # Errors
    /// Returns [`HostError::Timeout`] if the ack does not arrive within
    /// `send_timeout`, or [`HostError::Transport`]/[`HostError::NotConnected`]
    /// if the underlying socket write fails.
    #[instrument(skip(self, payload))]
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let message_id = Uuid::new_v4();
        let chunk_size = self.max_frame_bytes.max(1);
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[]]
        } else {
            payload.chunks(chunk_size).collect()
        };
        let total = u32::try_from(chunks.len())
            .map_err(|_| HostError::Fatal("payload produced too many chunks".into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(message_id, tx);

        for (seq, chunk) in chunks.into_iter().enumerate() {
            let seq = u32::try_from(seq).map_err(|_| HostError::Fatal("chunk index overflow".into()))?;
            self.send_raw(&WireMessage::Chunk {
                message_id,
                seq,
                total,
                bytes: chunk.to_vec(),
            })
            .await?;
        }

        match timeout(self.send_timeout, rx).await {
            Ok(Ok(())) => {
                trace!(%message_id, "send acked");
                Ok(())
            }
            Ok(Err(_)) => Err(HostError::NotConnected),
            Err(_) => {
                self.pending_acks.lock().await.remove(&message_id);
                Err(HostError::Timeout)
            }
        }
    }

    /// Round-trip liveness check.
    ///
    /// # Errors
    /// Returns [`HostError::Timeout`] if no pong arrives within
    /// `ping_timeout`.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        let nonce = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending_pongs.lock().await.insert(nonce, tx);
        self.send_raw(&WireMessage::Ping { nonce }).await?;
        match timeout(self.ping_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HostError::NotConnected),
            Err(_) => {
                self.pending_pongs.lock().await.remove(&nonce);
                Err(HostError::Timeout)
            }
        }
    }

    /// Stable identifier carried across reconnects.
    #[must_use]
    pub const fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Close the underlying socket immediately, without waiting on peer ack.
    pub async fn close(&self) {
        debug!(instance_id = %self.instance_id, "closing transport");
        let _ = self.sink.lock().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::wire::{decode, encode};
    use super::*;

    #[test]
    fn wire_round_trips_chunk() {
        let message_id = Uuid::new_v4();
        let original = WireMessage::Chunk {
            message_id,
            seq: 2,
            total: 5,
            bytes: vec![1, 2, 3],
        };
        let bytes = encode(&original).expect("encodes");
        let decoded = decode(&bytes).expect("decodes");
        match decoded {
            WireMessage::Chunk {
                message_id: m,
                seq,
                total,
                bytes,
            } => {
                assert_eq!(m, message_id);
                assert_eq!(seq, 2);
                assert_eq!(total, 5);
                assert_eq!(bytes, vec![1, 2, 3]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
