use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream,
    WebSocketStream,
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::{decode_envelope, subscription_frame, Item};
use crate::{config::Topic, error::Error};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Owns the inbound WebSocket connection and turns its frames into items.
pub struct StreamIngestor {
    ws: WsStream,
    topic: Topic,
    next_seq: u64,
    decode_errors: u64,
}

impl StreamIngestor {
    /// Connects to the stream and subscribes to `topic`. The subscription
    /// frame is sent exactly once, right after the connection opens.
    pub async fn connect(endpoint: &str, topic: Topic) -> Result<Self, Error> {
        let span = info_span!("ingest", %endpoint, %topic);
        async move {
            debug!("opening websocket");
            let (mut ws, _response) = connect_async(endpoint).await?;
            info!("connected to stream");
            ws.send(Message::Text(subscription_frame(&topic))).await?;
            info!("subscribed to topic");
            Ok(Self {
                ws,
                topic,
                next_seq: 0,
                decode_errors: 0,
            })
        }
        .instrument(span)
        .await
    }

    /// Reads frames until one decodes into an item. Frames that don't decode
    /// are logged and dropped. The caller handles each item before asking
    /// for the next one, so nothing is buffered here.
    pub async fn next_item(&mut self) -> Result<Item, Error> {
        loop {
            let msg = match self.ws.next().await {
                Some(msg) => msg?,
                None => Err(Error::StreamClosed)?,
            };
            let frame = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("dropping binary frame that isn't UTF-8");
                        continue;
                    }
                },
                Message::Close(close) => {
                    info!(?close, "stream closed by server");
                    Err(Error::StreamClosed)?
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    continue
                }
            };
            trace!(%frame, "received frame");

            match decode_envelope(&frame, &self.topic) {
                Ok(text) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    return Ok(Item { seq, text });
                }
                Err(e) => {
                    self.decode_errors += 1;
                    warn!(errors = self.decode_errors, "dropping frame: {}", e);
                }
            }
        }
    }

    /// Frames dropped because they didn't decode.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}
