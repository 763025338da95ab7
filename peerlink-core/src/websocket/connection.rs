//! WebSocket connection: a [`ConnectionCore`] plus an IO task owning the
//! socket.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use peerlink_types::{ConnectionType, DisconnectReason, PeerDescriptor};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionCore, ConnectionEvents, ConnectionId};
use crate::error::TransportError;

pub(crate) enum Command {
    Data(Bytes),
    Close(DisconnectReason),
}

pub struct WebsocketConnection {
    core: ConnectionCore,
    commands: mpsc::UnboundedSender<Command>,
    /// Held until the socket is attached.
    pending_commands: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    /// Cancelled by `destroy`: drop the socket without a close frame.
    abort: CancellationToken,
}

impl WebsocketConnection {
    pub fn new(connection_type: ConnectionType, remote: Option<PeerDescriptor>) -> (Arc<Self>, ConnectionEvents) {
        let (core, events) = ConnectionCore::new(connection_type, remote);
        let (commands, pending) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            core,
            commands,
            pending_commands: parking_lot::Mutex::new(Some(pending)),
            abort: CancellationToken::new(),
        });
        (connection, events)
    }

    /// Hand the socket to the connection and open it.
    pub(crate) fn attach<S>(self: &Arc<Self>, socket: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(commands) = self.pending_commands.lock().take() else {
            debug!("{} already has a socket", self.core.id());
            return;
        };
        if self.core.is_closed() {
            trace!("{} closed before its socket was ready", self.core.id());
            return;
        }
        let connection = self.clone();
        tokio::spawn(async move { connection.run(socket, commands).await });

        let sender = self.commands.clone();
        self.core.mark_open(|data| {
            sender
                .send(Command::Data(data))
                .map_err(|_| TransportError::SendFailed("socket task gone".into()))
        });
    }

    /// Dial or accept failed before a socket existed.
    pub(crate) fn fail(&self, reason: DisconnectReason) {
        self.core.close(reason);
    }

    async fn run<S>(self: Arc<Self>, socket: WebSocketStream<S>, mut commands: mpsc::UnboundedReceiver<Command>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = socket.split();
        let id = self.core.id();
        loop {
            tokio::select! {
                _ = self.abort.cancelled() => {
                    trace!("{} destroyed", id);
                    break;
                }
                command = commands.recv() => match command {
                    Some(Command::Data(data)) => {
                        if let Err(e) = sink.send(WsMessage::Binary(data.to_vec())).await {
                            debug!("{} write failed: {}", id, e);
                            self.core.close(DisconnectReason::TransportError);
                            break;
                        }
                    }
                    Some(Command::Close(reason)) => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: reason.as_str().into(),
                        };
                        let _ = sink.send(WsMessage::Close(Some(frame))).await;
                        let _ = sink.close().await;
                        break;
                    }
                    None => break,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Binary(data))) => self.core.emit_data(Bytes::from(data)),
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame
                            .and_then(|f| f.reason.parse::<DisconnectReason>().ok())
                            .unwrap_or(DisconnectReason::Closed);
                        trace!("{} closed by remote: {}", id, reason);
                        self.core.close(reason);
                        let _ = sink.close().await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("{} read failed: {}", id, e);
                        self.core.close(DisconnectReason::TransportError);
                        break;
                    }
                    None => {
                        self.core.close(DisconnectReason::Closed);
                        break;
                    }
                },
            }
        }
    }
}

impl Connection for WebsocketConnection {
    fn connection_id(&self) -> ConnectionId {
        self.core.id()
    }

    fn connection_type(&self) -> ConnectionType {
        self.core.connection_type()
    }

    fn remote_peer_descriptor(&self) -> Option<PeerDescriptor> {
        self.core.remote()
    }

    fn set_remote_peer_descriptor(&self, descriptor: PeerDescriptor) {
        self.core.set_remote(descriptor);
    }

    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.core.send_or_buffer(data, |data| {
            self.commands
                .send(Command::Data(data))
                .map_err(|_| TransportError::SendFailed("socket task gone".into()))
        })
    }

    fn close(&self, reason: DisconnectReason) {
        if self.core.close(reason) {
            let _ = self.commands.send(Command::Close(reason));
        }
    }

    fn destroy(&self) {
        if self.core.close(DisconnectReason::Other) {
            self.abort.cancel();
        }
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
