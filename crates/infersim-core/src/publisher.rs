use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use infersim_common::{Result, SimError};
use zeromq::{Socket, SocketSend, ZmqMessage};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Transport seam for the event sender: publish one framed batch on a topic,
/// blocking until the transport accepts it.
#[async_trait]
pub trait Publisher: Send {
    async fn publish(&mut self, topic: &str, seq: u64, payload: Vec<u8>) -> Result<()>;
}

/// ZMQ PUB socket publisher. Each batch goes out as three frames: the UTF-8
/// topic, the big-endian sequence number, and the msgpack payload.
pub struct ZmqPublisher {
    socket: zeromq::PubSocket,
}

impl ZmqPublisher {
    pub async fn connect(endpoint: &str, max_attempts: u64) -> Result<Self> {
        let mut socket = zeromq::PubSocket::new();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match socket.connect(endpoint).await {
                Ok(_) => break,
                Err(e) if attempt < max_attempts => {
                    tracing::warn!(
                        target: "kv_events",
                        endpoint,
                        attempt,
                        "zmq connect failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(SimError::Publisher(format!("connect {}: {}", endpoint, e)));
                }
            }
        }
        tracing::info!(target: "kv_events", endpoint, "kv event publisher connected");
        Ok(Self { socket })
    }
}

#[async_trait]
impl Publisher for ZmqPublisher {
    async fn publish(&mut self, topic: &str, seq: u64, payload: Vec<u8>) -> Result<()> {
        let mut message = ZmqMessage::from(Bytes::copy_from_slice(topic.as_bytes()));
        message.push_back(Bytes::copy_from_slice(&seq.to_be_bytes()));
        message.push_back(Bytes::from(payload));
        self.socket
            .send(message)
            .await
            .map_err(|e| SimError::Publisher(format!("send on {}: {}", topic, e)))
    }
}
