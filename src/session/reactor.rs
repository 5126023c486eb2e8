// src/session/reactor.rs
//! The task that owns the WebSocket

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::SessionState;
use crate::error::{CoreError, Result};
use crate::models::ConnectionStatus;

pub(crate) type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the server's close acknowledgement
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) enum Command {
    /// Write one text frame; `ack` resolves once it is on the wire
    Send {
        text: String,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Close,
}

pub(crate) async fn run(ws: Channel, mut commands: mpsc::UnboundedReceiver<Command>, state: Arc<SessionState>) {
    let (mut sink, mut stream) = ws.split();

    let final_status = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send { text, ack }) => {
                    trace!("-> {}", text);
                    let result = sink.send(WsMessage::text(text)).await.map_err(CoreError::from);
                    let failure = result.as_ref().err().map(|e| e.to_string());
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                    if let Some(e) = failure {
                        error!("Write to messaging channel failed: {}", e);
                        break ConnectionStatus::Error;
                    }
                }
                Some(Command::Close) | None => {
                    debug!("Closing messaging channel");
                    if let Err(e) = sink.send(WsMessage::Close(None)).await {
                        debug!("Close frame not sent: {}", e);
                    }
                    let drain = async {
                        while let Some(Ok(frame)) = stream.next().await {
                            if let WsMessage::Text(text) = frame {
                                state.handle_inbound(text.as_str());
                            }
                        }
                    };
                    if timeout(CLOSE_DRAIN_TIMEOUT, drain).await.is_err() {
                        debug!("Server did not acknowledge close in time");
                    }
                    break ConnectionStatus::Disconnected;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => state.handle_inbound(text.as_str()),
                Some(Ok(WsMessage::Binary(data))) => {
                    state.report_malformed(format!("unexpected binary frame of {} bytes", data.len()));
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("Messaging channel closed by server");
                    break ConnectionStatus::Disconnected;
                }
                // Ping/pong is answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Messaging channel failed: {}", e);
                    break ConnectionStatus::Error;
                }
            }
        }
    };

    // Anyone still waiting for an ack learns the channel is gone
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let Command::Send { ack: Some(ack), .. } = command {
            let _ = ack.send(Err(CoreError::Network("connection closed".to_string())));
        }
    }

    state.set_connection_status(final_status);
    debug!("Reactor stopped ({:?})", final_status);
}
