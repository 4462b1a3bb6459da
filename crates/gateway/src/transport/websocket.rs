//! WebSocket adapter over axum's upgraded socket.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use gateway_common::{Error, Frame, MessageChannel, Result, TransportKind};

/// Server end of a WebSocket connection.
pub struct WebSocketChannel {
    socket: WebSocket,
}

impl WebSocketChannel {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl MessageChannel for WebSocketChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping => Message::Ping(Bytes::new()),
            Frame::Pong => Message::Pong(Bytes::new()),
            Frame::Close => Message::Close(None),
        };
        self.socket
            .send(msg)
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        let msg = match self.socket.recv().await? {
            Ok(msg) => msg,
            Err(e) => return Some(Err(Error::Channel(e.to_string()))),
        };
        let frame = match msg {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => Frame::Text(text),
                Err(e) => return Some(Err(Error::Framing(e.to_string()))),
            },
            Message::Ping(_) => Frame::Ping,
            Message::Pong(_) => Frame::Pong,
            Message::Close(_) => Frame::Close,
        };
        Some(Ok(frame))
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}
