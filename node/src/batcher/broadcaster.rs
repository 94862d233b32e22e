use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use share::feed::{FeedMessage, REQUESTED_SEQUENCE_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{interval, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::mode::BroadcasterSettings;
use crate::monitor::CoreHandle;
use crate::wallet::DataSigner;

// Messages buffered per client before it is considered lagging.
const BROADCAST_BUFFER: usize = 1024;

/// A serialized feed message and the position it carries.
struct Frame {
    sequence_number: u64,
    text: String,
}

/// Builds feed frames for live broadcasts and for backlog replay.
#[derive(Clone)]
struct FeedSource {
    core: CoreHandle,
    data_signer: Option<DataSigner>,
}

impl FeedSource {
    fn frame(&self, sequence_number: u64, message: Vec<u8>) -> Result<Frame> {
        let mut msg = FeedMessage::new(sequence_number, message);
        if let Some(sign) = &self.data_signer {
            msg.signature = Some(sign(&msg.signing_payload()));
        }
        Ok(Frame {
            sequence_number,
            text: msg.to_json()?,
        })
    }
}

/// Websocket feed output of the sequencer.
///
/// A client that sends [`REQUESTED_SEQUENCE_HEADER`] on connect is first replayed every message
/// from that position out of the chain core, then follows the live stream.
pub struct Broadcaster {
    tx: broadcast::Sender<Arc<Frame>>,
    source: FeedSource,
    local_addr: SocketAddr,
}

impl Broadcaster {
    /// Bind the feed output and start accepting clients.
    pub async fn start(
        settings: BroadcasterSettings,
        core: CoreHandle,
        data_signer: Option<DataSigner>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&settings.addr)
            .await
            .with_context(|| format!("error binding feed output {}", settings.addr))?;
        let local_addr = listener.local_addr()?;

        let source = FeedSource { core, data_signer };
        let (tx, _) = broadcast::channel(BROADCAST_BUFFER);
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue.max(1));
        tokio::spawn(accept_loop(listener, queue_tx, cancel.clone()));
        tokio::spawn(dispatch_loop(
            queue_rx,
            tx.clone(),
            source.clone(),
            settings,
            cancel,
        ));

        Ok(Self {
            tx,
            source,
            local_addr,
        })
    }

    /// Push a freshly sequenced message to every connected client.
    pub fn broadcast(&self, sequence_number: u64, message: &[u8]) -> Result<()> {
        let frame = self.source.frame(sequence_number, message.to_vec())?;
        // No connected clients is not an error.
        let _ = self.tx.send(Arc::new(frame));
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    queue: mpsc::Sender<(TcpStream, SocketAddr)>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(conn) => {
                if queue.send(conn).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Feed output accept failed: {}", e),
        }
    }
}

/// Hand queued connections to at most `settings.workers` concurrent client tasks.
async fn dispatch_loop(
    mut queue: mpsc::Receiver<(TcpStream, SocketAddr)>,
    tx: broadcast::Sender<Arc<Frame>>,
    source: FeedSource,
    settings: BroadcasterSettings,
    cancel: CancellationToken,
) {
    let workers = Arc::new(Semaphore::new(settings.workers));
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            conn = queue.recv() => match conn {
                Some(conn) => conn,
                None => return,
            },
        };
        let permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        // Subscribe before the handshake so nothing sequenced during replay is missed.
        let rx = tx.subscribe();
        let source = source.clone();
        let settings = settings.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_client(stream, rx, &source, &settings, &cancel).await {
                debug!("Feed client {} disconnected: {:#}", peer, e);
            }
            drop(permit);
        });
    }
}

fn requested_sequence(request: &Request) -> Option<u64> {
    request
        .headers()
        .get(REQUESTED_SEQUENCE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

async fn send_text(
    ws: &mut WebSocketStream<TcpStream>,
    text: String,
    io_timeout: Duration,
) -> Result<()> {
    timeout(io_timeout, ws.send(Message::Text(text)))
        .await
        .context("write timed out")??;
    Ok(())
}

async fn serve_client(
    stream: TcpStream,
    mut rx: broadcast::Receiver<Arc<Frame>>,
    source: &FeedSource,
    settings: &BroadcasterSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    let io_timeout = settings.io_read_write_timeout;
    let mut requested = None;
    let handshake = accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            requested = requested_sequence(request);
            Ok(response)
        },
    );
    let mut ws = timeout(io_timeout, handshake)
        .await
        .context("handshake timed out")??;

    // Live frames below `replayed_to` were already sent from the core.
    let replayed_to = source.core.message_count()?;
    for seq in requested.unwrap_or(replayed_to)..replayed_to {
        let Some(message) = source.core.message(seq)? else {
            return Err(anyhow!("chain core is missing message {}", seq));
        };
        send_text(&mut ws, source.frame(seq, message)?.text, io_timeout).await?;
    }

    let mut ping = interval(settings.client_ping_interval);
    let mut last_seen = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = timeout(io_timeout, ws.close(None)).await;
                return Ok(());
            }
            frame = rx.recv() => match frame {
                Ok(frame) if frame.sequence_number < replayed_to => {}
                Ok(frame) => send_text(&mut ws, frame.text.clone(), io_timeout).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The client resumes from its own position on reconnect.
                    let _ = timeout(io_timeout, ws.close(None)).await;
                    return Err(anyhow!("client lagged {} messages behind", skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > settings.client_no_response_timeout {
                    error!("Feed client not responding, closing connection");
                    return Ok(());
                }
                timeout(io_timeout, ws.send(Message::Ping(Vec::new())))
                    .await
                    .context("ping timed out")??;
            }
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{BROADCASTER_IO_TIMEOUT, BROADCASTER_QUEUE, BROADCASTER_WORKERS};
    use crate::monitor::temporary_core;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    fn settings() -> BroadcasterSettings {
        BroadcasterSettings {
            addr: "127.0.0.1:0".to_owned(),
            workers: BROADCASTER_WORKERS,
            queue: BROADCASTER_QUEUE,
            io_read_write_timeout: BROADCASTER_IO_TIMEOUT,
            client_ping_interval: Duration::from_secs(5),
            client_no_response_timeout: Duration::from_secs(15),
        }
    }

    async fn next_message<S>(client: &mut S) -> FeedMessage
    where
        S: StreamExt<Item = tokio_tungstenite::tungstenite::Result<Message>> + Unpin,
    {
        loop {
            match client.next().await.unwrap().unwrap() {
                Message::Text(text) => return FeedMessage::from_json(text.as_bytes()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn wait_for_clients(broadcaster: &Broadcaster, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broadcaster.client_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn connected_clients_receive_broadcasts() {
        let cancel = CancellationToken::new();
        let (core, _) = temporary_core();
        let broadcaster = Broadcaster::start(settings(), core, None, cancel.clone())
            .await
            .unwrap();
        let (mut client, _) = connect_async(format!("ws://{}", broadcaster.local_addr()))
            .await
            .unwrap();
        wait_for_clients(&broadcaster, 1).await;

        broadcaster.broadcast(7, &[1, 2, 3]).unwrap();
        assert_eq!(next_message(&mut client).await, FeedMessage::new(7, vec![1, 2, 3]));
        cancel.cancel();
    }

    #[tokio::test]
    async fn late_client_is_replayed_from_its_requested_position() {
        let cancel = CancellationToken::new();
        let (core, _) = temporary_core();
        for message in [b"a", b"b", b"c"] {
            core.append(message).unwrap();
        }
        let broadcaster = Broadcaster::start(settings(), core.clone(), None, cancel.clone())
            .await
            .unwrap();

        let mut request = format!("ws://{}", broadcaster.local_addr())
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert(REQUESTED_SEQUENCE_HEADER, 1u64.into());
        let (mut client, _) = connect_async(request).await.unwrap();
        wait_for_clients(&broadcaster, 1).await;

        assert_eq!(next_message(&mut client).await, FeedMessage::new(1, b"b".to_vec()));
        assert_eq!(next_message(&mut client).await, FeedMessage::new(2, b"c".to_vec()));

        let seq = core.append(b"d").unwrap();
        broadcaster.broadcast(seq, b"d").unwrap();
        assert_eq!(next_message(&mut client).await, FeedMessage::new(3, b"d".to_vec()));
        cancel.cancel();
    }

    #[tokio::test]
    async fn replayed_messages_carry_the_sequencer_signature() {
        let cancel = CancellationToken::new();
        let (core, _) = temporary_core();
        core.append(b"a").unwrap();
        let signer: DataSigner = Arc::new(|payload: &[u8]| -> Vec<u8> { payload.iter().rev().copied().collect() });
        let broadcaster = Broadcaster::start(settings(), core, Some(signer), cancel.clone())
            .await
            .unwrap();

        let mut request = format!("ws://{}", broadcaster.local_addr())
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert(REQUESTED_SEQUENCE_HEADER, 0u64.into());
        let (mut client, _) = connect_async(request).await.unwrap();

        let msg = next_message(&mut client).await;
        let expected: Vec<u8> = msg.signing_payload().into_iter().rev().collect();
        assert_eq!(msg.signature, Some(expected));
        cancel.cancel();
    }

    #[tokio::test]
    async fn broadcasting_without_clients_is_fine() {
        let cancel = CancellationToken::new();
        let (core, _) = temporary_core();
        let broadcaster = Broadcaster::start(settings(), core, None, cancel.clone())
            .await
            .unwrap();
        assert!(broadcaster.broadcast(0, &[]).is_ok());
        cancel.cancel();
    }
}
