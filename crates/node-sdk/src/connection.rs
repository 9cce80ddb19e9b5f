//! Data connection: the duplex channel carrying streamed topic data.

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use nl_protocol::TopicData;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeSdkError, Result};

/// Frames buffered per direction before senders wait.
pub const CHANNEL_CAPACITY: usize = 256;

/// Contract of a data connection to the broker.
///
/// The inbound side is a lazy, unbounded stream that ends when the
/// connection is closed; a closed connection is not an error.
#[async_trait::async_trait]
pub trait DataConnection: Send + Sync + 'static {
    /// Take the inbound stream.  There is a single reader: a second call
    /// fails with [`NodeSdkError::InvalidState`].
    fn stream(&self) -> Result<BoxStream<'static, Result<TopicData>>>;

    /// Send one frame to the broker.
    async fn send(&self, data: TopicData) -> Result<()>;

    /// Close the connection.  Idempotent; ends the inbound stream.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// In-memory connection backed by a pair of mpsc channels.
pub struct ChannelConnection {
    outbound: mpsc::Sender<TopicData>,
    inbound: Mutex<Option<mpsc::Receiver<Result<TopicData>>>>,
    closed: CancellationToken,
}

/// The broker's end of a [`ChannelConnection`].
pub struct ChannelPeer {
    tx: mpsc::Sender<Result<TopicData>>,
    rx: mpsc::Receiver<TopicData>,
}

impl ChannelConnection {
    /// Create a connected client end and its broker-side peer.
    pub fn pair() -> (ChannelConnection, ChannelPeer) {
        let (to_broker, from_client) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_client, from_broker) = mpsc::channel(CHANNEL_CAPACITY);
        (
            ChannelConnection {
                outbound: to_broker,
                inbound: Mutex::new(Some(from_broker)),
                closed: CancellationToken::new(),
            },
            ChannelPeer {
                tx: to_client,
                rx: from_client,
            },
        )
    }
}

#[async_trait::async_trait]
impl DataConnection for ChannelConnection {
    fn stream(&self) -> Result<BoxStream<'static, Result<TopicData>>> {
        let rx = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| NodeSdkError::InvalidState("inbound stream already taken".into()))?;

        let frames = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(frames.take_until(self.closed.clone().cancelled_owned()).boxed())
    }

    async fn send(&self, data: TopicData) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(NodeSdkError::Connection("connection closed".into()));
        }
        self.outbound
            .send(data)
            .await
            .map_err(|_| NodeSdkError::Connection("broker end dropped".into()))
    }

    async fn disconnect(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!("data connection closed");
        }
        self.closed.cancel();
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled() && !self.outbound.is_closed()
    }
}

impl ChannelPeer {
    /// Deliver a frame (or a transport error) to the client.
    pub async fn deliver(&self, item: Result<TopicData>) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| NodeSdkError::Connection("client end dropped".into()))
    }

    /// Next frame sent by the client; `None` once the client end is dropped.
    pub async fn recv(&mut self) -> Option<TopicData> {
        self.rx.recv().await
    }

    /// Split into the raw channel halves, e.g. to move them into separate tasks.
    pub fn into_parts(self) -> (mpsc::Sender<Result<TopicData>>, mpsc::Receiver<TopicData>) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nl_protocol::TopicDataRecord;
    use serde_json::json;

    fn frame(n: i64) -> TopicData {
        TopicData::Record {
            record: TopicDataRecord::new("/t", json!(n)),
        }
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (conn, mut peer) = ChannelConnection::pair();
        assert!(conn.is_connected());

        conn.send(frame(1)).await.unwrap();
        assert_eq!(peer.recv().await, Some(frame(1)));

        let mut inbound = conn.stream().unwrap();
        peer.deliver(Ok(frame(2))).await.unwrap();
        assert_eq!(inbound.next().await.unwrap().unwrap(), frame(2));
    }

    #[tokio::test]
    async fn stream_can_be_taken_once() {
        let (conn, _peer) = ChannelConnection::pair();
        let _s = conn.stream().unwrap();
        assert!(matches!(conn.stream(), Err(NodeSdkError::InvalidState(_))));
    }

    #[tokio::test]
    async fn disconnect_ends_stream_and_refuses_sends() {
        let (conn, _peer) = ChannelConnection::pair();
        let mut inbound = conn.stream().unwrap();

        conn.disconnect().await;
        conn.disconnect().await;
        assert!(!conn.is_connected());
        assert!(inbound.next().await.is_none());
        assert!(matches!(
            conn.send(frame(1)).await,
            Err(NodeSdkError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn dropping_the_peer_ends_the_stream() {
        let (conn, peer) = ChannelConnection::pair();
        let mut inbound = conn.stream().unwrap();
        drop(peer);
        assert!(inbound.next().await.is_none());
        assert!(!conn.is_connected());
    }
}
