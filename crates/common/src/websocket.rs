//! Client-side WebSocket channel built on tokio-tungstenite.

use crate::channel::{Frame, MessageChannel, TransportKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// WebSocket connection to the gateway.
pub struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

/// Build the connect URL, appending `?token=` when a credential is given.
pub fn connect_url(base: &str, token: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(base)?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

/// Open a WebSocket channel. A `token` is sent as the `token` query parameter,
/// which makes the connection start pre-authenticated.
pub async fn connect(base: &str, token: Option<&str>) -> Result<WebSocketChannel> {
    let url = connect_url(base, token)?;
    debug!("Connecting WebSocket to {}", base);
    let (stream, response) = connect_async(url.as_str()).await?;
    debug!("WebSocket handshake complete, status: {:?}", response.status());
    Ok(WebSocketChannel { stream })
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
        self.stream.send(msg).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(Error::WebSocket(e))),
            };
            let frame = match msg {
                Message::Text(text) => Frame::Text(text.to_string()),
                Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => Frame::Text(text),
                    Err(e) => return Some(Err(Error::Framing(e.to_string()))),
                },
                Message::Ping(_) => Frame::Ping,
                Message::Pong(_) => Frame::Pong,
                Message::Close(_) => Frame::Close,
                // Raw frame, only seen when reading with raw frame access
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url_appends_token() {
        let url = connect_url("ws://127.0.0.1:8085/ws", Some("a b")).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8085/ws?token=a+b");

        let url = connect_url("ws://127.0.0.1:8085/ws", None).unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn test_connect_url_rejects_garbage() {
        assert!(connect_url("not a url", None).is_err());
    }
}
