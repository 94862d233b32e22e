use anyhow::Context;
use futures::StreamExt;
use log::{error, info, warn};
use share::feed::{FeedMessage, FEED_QUEUE_CAPACITY, REQUESTED_SEQUENCE_HEADER};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, handshake::client::Request};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, NodeResult};

/// Max duration of backoff before reconnecting to the sequencer feed.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Queue of sequenced messages drained by the inbox reader.
pub type FeedReceiver = mpsc::Receiver<FeedMessage>;

/// Websocket client of an upstream sequencer feed.
///
/// Every connection asks the sequencer to replay from the first message not yet forwarded, so
/// a late start or a reconnect leaves no gap.
pub struct FeedSubscriber {
    url: String,
    next_sequence: u64,
}

impl FeedSubscriber {
    pub fn new(url: String) -> Self {
        Self {
            url,
            next_sequence: 0,
        }
    }

    fn request(&self) -> tungstenite::Result<Request> {
        let mut request = self.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(REQUESTED_SEQUENCE_HEADER, self.next_sequence.into());
        Ok(request)
    }

    async fn open(&self) -> tungstenite::Result<FeedStream> {
        let (stream, _) = connect_async(self.request()?).await?;
        Ok(stream)
    }

    /// Connect once and spawn the delivery loop. A failed first connection is fatal.
    pub async fn connect(self, cancel: CancellationToken) -> NodeResult<FeedReceiver> {
        let stream = self
            .open()
            .await
            .with_context(|| format!("unable to connect to sequencer feed {}", self.url))
            .map_err(NodeError::Connection)?;
        info!("Subscribed to sequencer feed {}", self.url);

        let (tx, rx) = mpsc::channel(FEED_QUEUE_CAPACITY);
        tokio::spawn(self.deliver(stream, tx, cancel));
        Ok(rx)
    }

    async fn deliver(
        mut self,
        mut stream: FeedStream,
        tx: mpsc::Sender<FeedMessage>,
        cancel: CancellationToken,
    ) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if !pump(&mut stream, &tx, &mut self.next_sequence, &cancel).await {
                return;
            }

            // Upstream went away, reconnect until cancelled.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                match self.open().await {
                    Ok(s) => {
                        info!(
                            "Reconnected to sequencer feed {} at message {}",
                            self.url, self.next_sequence
                        );
                        stream = s;
                        backoff = Duration::from_secs(1);
                        break;
                    }
                    Err(e) => {
                        warn!("Feed reconnect to {} failed: {}", self.url, e);
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
    }
}

/// Forward messages until the connection drops (true) or the node stops (false).
async fn pump(
    stream: &mut FeedStream,
    tx: &mpsc::Sender<FeedMessage>,
    next_sequence: &mut u64,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return false,
            next = stream.next() => next,
        };
        let data = match next {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(_))) | None => {
                info!("Sequencer feed connection closed by upstream");
                return true;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("Sequencer feed read error: {}", e);
                return true;
            }
        };
        match FeedMessage::from_json(&data) {
            // Backpressure: wait for the reader instead of dropping.
            Ok(msg) => {
                let seq = msg.sequence_number;
                if tx.send(msg).await.is_err() {
                    info!("Feed receiver is turned off");
                    return false;
                }
                *next_sequence = (*next_sequence).max(seq.saturating_add(1));
            }
            Err(e) => error!("error decoding feed message: {}", e),
        }
    }
}

/// An already closed feed queue, used when the node has no upstream feed.
pub fn idle_feed() -> FeedReceiver {
    let (_, rx) = mpsc::channel(1);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn unreachable_feed_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = FeedSubscriber::new(format!("ws://{}", addr))
            .connect(CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::Connection(_)));
    }

    #[tokio::test]
    async fn delivers_messages_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            for seq in 0..3u64 {
                let msg = FeedMessage::new(seq, vec![seq as u8]);
                ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
            }
            ws.send(Message::Text("not json".to_owned())).await.unwrap();
            ws.send(Message::Text(FeedMessage::new(3, vec![3]).to_json().unwrap()))
                .await
                .unwrap();
            // Hold the connection open until the client goes away.
            while ws.next().await.is_some() {}
        });

        let cancel = CancellationToken::new();
        let mut rx = FeedSubscriber::new(format!("ws://{}", addr))
            .connect(cancel.clone())
            .await
            .unwrap();
        for seq in 0..4u64 {
            assert_eq!(rx.recv().await.unwrap().sequence_number, seq);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn reconnect_resumes_after_last_forwarded_message() {
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (requested_tx, mut requested_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for connection in 0..2u64 {
                let (socket, _) = listener.accept().await.unwrap();
                let requested_tx = requested_tx.clone();
                let mut ws = tokio_tungstenite::accept_hdr_async(
                    socket,
                    move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let header = req.headers()[REQUESTED_SEQUENCE_HEADER].to_str().unwrap();
                        requested_tx.send(header.parse::<u64>().unwrap()).unwrap();
                        Ok(resp)
                    },
                )
                .await
                .unwrap();
                if connection == 0 {
                    for seq in 0..2u64 {
                        let msg = FeedMessage::new(seq, vec![seq as u8]);
                        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
                    }
                    ws.close(None).await.unwrap();
                } else {
                    let msg = FeedMessage::new(2, vec![2]);
                    ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
                    while ws.next().await.is_some() {}
                }
            }
        });

        let cancel = CancellationToken::new();
        let mut rx = FeedSubscriber::new(format!("ws://{}", addr))
            .connect(cancel.clone())
            .await
            .unwrap();
        for seq in 0..3u64 {
            assert_eq!(rx.recv().await.unwrap().sequence_number, seq);
        }
        assert_eq!(requested_rx.recv().await, Some(0));
        assert_eq!(requested_rx.recv().await, Some(2));
        cancel.cancel();
    }
}
